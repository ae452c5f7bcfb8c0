//! The four user-replaceable mapping functions that place tiles on ranks and devices.
//!
//! `Matrix` is generic over `D: Distribution` so the default block-cyclic layout costs no
//! indirection; [`DynDistribution`] is the escape hatch for callers who need to pick a
//! layout at runtime.

use slate_constants::Location;

/// A total, pure mapping from tile coordinates to placement. Implementations must not
/// depend on anything but `(row, col)` and their own fixed configuration: the core calls
/// these functions from arbitrary threads without synchronization.
pub trait Distribution: Send + Sync {
    /// Owning rank of tile `(row, col)`, in `[0, ranks())`.
    fn owner_rank(&self, row: u32, col: u32) -> u32;

    /// Preferred device for tile `(row, col)` on its owning rank, or the host when there
    /// are no devices.
    fn device(&self, row: u32, col: u32) -> Location;

    /// Row extent (in elements) of tile row `row`.
    fn row_height(&self, row: u32) -> u32;

    /// Column extent (in elements) of tile column `col`.
    fn col_width(&self, col: u32) -> u32;

    /// Total ranks across the process grid this distribution maps onto.
    fn ranks(&self) -> u32;
}

/// The default 2-D block-cyclic distribution on a `p x q` process grid with round-robin
/// device placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCyclic {
    m: u32,
    n: u32,
    nb: u32,
    mt: u32,
    nt: u32,
    p: u32,
    q: u32,
    device_count: u32,
}

impl BlockCyclic {
    pub fn new(m: u32, n: u32, nb: u32, p: u32, q: u32, device_count: u32) -> Self {
        assert!(nb > 0, "block-cyclic distribution requires nb > 0");
        assert!(p > 0 && q > 0, "block-cyclic distribution requires p, q > 0");
        let mt = slate_constants::ceil_div(m, nb);
        let nt = slate_constants::ceil_div(n, nb);
        Self {
            m,
            n,
            nb,
            mt,
            nt,
            p,
            q,
            device_count,
        }
    }

    pub const fn mt(&self) -> u32 {
        self.mt
    }

    pub const fn nt(&self) -> u32 {
        self.nt
    }

    pub const fn nb(&self) -> u32 {
        self.nb
    }
}

impl Distribution for BlockCyclic {
    fn owner_rank(&self, row: u32, col: u32) -> u32 {
        (row % self.p) + (col % self.q) * self.p
    }

    fn device(&self, row: u32, col: u32) -> Location {
        if self.device_count == 0 {
            return Location::Host;
        }
        Location::Device((col / self.q) % self.device_count)
    }

    fn row_height(&self, row: u32) -> u32 {
        if row + 1 == self.mt {
            self.m - (self.mt - 1) * self.nb
        } else {
            self.nb
        }
    }

    fn col_width(&self, col: u32) -> u32 {
        if col + 1 == self.nt {
            self.n - (self.nt - 1) * self.nb
        } else {
            self.nb
        }
    }

    fn ranks(&self) -> u32 {
        self.p * self.q
    }
}

/// Runtime-polymorphic escape hatch for callers who want to pick a layout dynamically
/// (e.g. from a configuration file) instead of monomorphizing `Matrix` per layout.
pub struct DynDistribution {
    inner: Box<dyn Distribution>,
}

impl DynDistribution {
    pub fn new(inner: impl Distribution + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl Distribution for DynDistribution {
    fn owner_rank(&self, row: u32, col: u32) -> u32 {
        self.inner.owner_rank(row, col)
    }

    fn device(&self, row: u32, col: u32) -> Location {
        self.inner.device(row, col)
    }

    fn row_height(&self, row: u32) -> u32 {
        self.inner.row_height(row)
    }

    fn col_width(&self, col: u32) -> u32 {
        self.inner.col_width(col)
    }

    fn ranks(&self) -> u32 {
        self.inner.ranks()
    }
}

/// Checks distribution totality over the full tile grid: every coordinate must map to a
/// valid rank and, when devices exist, a valid device. Intended for tests and for callers
/// installing a custom distribution who want to validate it once at startup.
pub fn check_totality(distribution: &impl Distribution, mt: u32, nt: u32, device_count: u32) -> bool {
    let ranks = distribution.ranks();
    for row in 0..mt {
        for col in 0..nt {
            let owner = distribution.owner_rank(row, col);
            if owner >= ranks {
                return false;
            }
            if let Location::Device(device) = distribution.device(row, col) {
                if device >= device_count {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_rank_is_block_cyclic_over_grid() {
        let distribution = BlockCyclic::new(16, 16, 4, 2, 2, 0);
        assert_eq!(distribution.owner_rank(0, 0), 0);
        assert_eq!(distribution.owner_rank(1, 0), 1);
        assert_eq!(distribution.owner_rank(0, 1), 2);
        assert_eq!(distribution.owner_rank(1, 1), 3);
        assert_eq!(distribution.owner_rank(2, 0), 0);
    }

    #[test]
    fn row_height_and_col_width_clip_the_last_tile() {
        // M = N = 6, nb = 4 -> MT = NT = 2, last tile is 2 wide/tall.
        let distribution = BlockCyclic::new(6, 6, 4, 1, 1, 0);
        assert_eq!(distribution.row_height(0), 4);
        assert_eq!(distribution.row_height(1), 2);
        assert_eq!(distribution.col_width(0), 4);
        assert_eq!(distribution.col_width(1), 2);
    }

    #[test]
    fn device_is_host_when_device_count_is_zero() {
        let distribution = BlockCyclic::new(8, 8, 4, 1, 1, 0);
        assert_eq!(distribution.device(0, 0), Location::Host);
    }

    #[test]
    fn device_round_robins_across_device_count() {
        let distribution = BlockCyclic::new(16, 16, 4, 1, 2, 3);
        assert_eq!(distribution.device(0, 0), Location::Device(0));
        assert_eq!(distribution.device(0, 2), Location::Device(1));
        assert_eq!(distribution.device(0, 4), Location::Device(2));
        assert_eq!(distribution.device(0, 6), Location::Device(0));
    }

    #[test]
    fn totality_holds_for_default_block_cyclic() {
        let distribution = BlockCyclic::new(16, 16, 4, 2, 2, 3);
        assert!(check_totality(&distribution, distribution.mt(), distribution.nt(), 3));
    }

    #[test]
    fn dyn_distribution_forwards_to_inner() {
        let distribution = DynDistribution::new(BlockCyclic::new(8, 8, 4, 1, 1, 0));
        assert_eq!(distribution.owner_rank(1, 1), 0);
        assert_eq!(distribution.ranks(), 1);
    }
}
