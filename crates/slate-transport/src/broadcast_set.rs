//! Computes the set of ranks a `tile_bcast` call must involve: the owner of the source
//! tile, plus the owners of every tile in the consumer ranges the caller names.

use std::ops::Range;

use slate_distribution::Distribution;

/// A rectangular range of tile coordinates whose owners are consumers of a broadcast
/// source tile.
#[derive(Debug, Clone)]
pub struct ConsumerRange {
    pub rows: Range<u32>,
    pub cols: Range<u32>,
}

/// Returns the sorted, deduplicated set of ranks that must participate in broadcasting
/// `source` to the owners of every tile named by `ranges`.
pub fn broadcast_set(distribution: &impl Distribution, source: (u32, u32), ranges: &[ConsumerRange]) -> Vec<u32> {
    let mut ranks = vec![distribution.owner_rank(source.0, source.1)];
    for range in ranges {
        for row in range.rows.clone() {
            for col in range.cols.clone() {
                ranks.push(distribution.owner_rank(row, col));
            }
        }
    }
    ranks.sort_unstable();
    ranks.dedup();
    ranks
}

/// Counts how many tiles in `ranges` this `rank` owns under `distribution`. This is the
/// life count a receiving rank registers for a broadcast tile: one outstanding use per
/// local cell that will consume it.
pub fn local_consumer_count(distribution: &impl Distribution, rank: u32, ranges: &[ConsumerRange]) -> u32 {
    let mut count = 0;
    for range in ranges {
        for row in range.rows.clone() {
            for col in range.cols.clone() {
                if distribution.owner_rank(row, col) == rank {
                    count += 1;
                }
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use slate_distribution::BlockCyclic;

    #[test]
    fn broadcast_set_includes_owner_and_consumer_ranks() {
        let distribution = BlockCyclic::new(16, 16, 4, 2, 2, 0);
        let ranges = vec![ConsumerRange { rows: 0..2, cols: 0..2 }];
        let set = broadcast_set(&distribution, (0, 0), &ranges);
        assert_eq!(set, vec![0, 1, 2, 3]);
    }

    #[test]
    fn local_consumer_count_matches_owned_cells_in_range() {
        let distribution = BlockCyclic::new(16, 16, 4, 2, 2, 0);
        let ranges = vec![ConsumerRange { rows: 0..2, cols: 0..4 }];
        let count = local_consumer_count(&distribution, 0, &ranges);
        // rank 0 owns (row, col) where row % 2 == 0 and col % 2 == 0: (0,0) and (0,2).
        assert_eq!(count, 2);
    }

    #[test]
    fn single_member_broadcast_set_is_owner_only() {
        let distribution = BlockCyclic::new(8, 8, 4, 1, 1, 0);
        let set = broadcast_set(&distribution, (0, 0), &[]);
        assert_eq!(set, vec![0]);
    }
}
