//! A single `mb x nb` column-major block, either pool-backed or aliasing external
//! ("origin") memory supplied by the caller at `Matrix::construct` time.

use std::ptr::NonNull;

use slate_constants::{Location, SlateError};

use crate::pool::PoolBlock;

#[derive(Debug)]
enum TileStorage<T> {
    Pooled(PoolBlock<T>),
    /// Aliases caller-owned memory passed into `Matrix::construct`. The pointer is not
    /// owned by the tile: it must outlive every tile built over it, which is the caller's
    /// responsibility.
    Origin { ptr: NonNull<T>, len: usize },
}

// SAFETY: an `Origin` tile is only ever constructed over memory the caller promises is
// valid for the tile's lifetime and not concurrently mutated outside the access pattern
// the matrix API enforces (single-writer per tile). The raw pointer carries no thread
// affinity of its own.
unsafe impl<T: Send> Send for TileStorage<T> {}
unsafe impl<T: Sync> Sync for TileStorage<T> {}

impl<T> TileStorage<T> {
    fn as_slice(&self) -> &[T] {
        match self {
            TileStorage::Pooled(block) => block.as_slice(),
            // SAFETY: see the Send/Sync justification above; `len` was recorded at
            // construction and the caller guarantees the memory remains valid.
            TileStorage::Origin { ptr, len } => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *len) },
        }
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        match self {
            TileStorage::Pooled(block) => block.as_mut_slice(),
            TileStorage::Origin { ptr, len } => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), *len) },
        }
    }
}

/// One `mb x nb` block of a `Matrix`, stored column-major with `stride >= mb`.
#[derive(Debug)]
pub struct Tile<T> {
    mb: u32,
    nb: u32,
    stride: u32,
    location: Location,
    storage: TileStorage<T>,
}

impl<T: Clone> Tile<T> {
    /// Builds a tile backed by a freshly acquired pool block. `pool_len` must be at least
    /// `stride * nb`; the pool guarantees this for its own fixed block size.
    pub(crate) fn from_pool_block(mb: u32, nb: u32, stride: u32, location: Location, block: PoolBlock<T>) -> Result<Self, SlateError> {
        let required = (stride as usize) * (nb as usize);
        if block.len() < required {
            return Err(SlateError::InvariantViolated(format!(
                "pool block of length {} cannot hold a tile needing stride*nb = {required}",
                block.len()
            )));
        }
        Ok(Self {
            mb,
            nb,
            stride,
            location,
            storage: TileStorage::Pooled(block),
        })
    }

    /// Builds a tile aliasing caller-supplied memory. `data` must remain valid for as long
    /// as the returned tile (and anything copied from it) is alive.
    ///
    /// # Safety
    /// The caller must guarantee `data` points to at least `stride * nb` valid, properly
    /// aligned elements of `T`, and that nothing else mutates that memory for the tile's
    /// lifetime outside of the access this tile grants.
    pub unsafe fn construct_from(mb: u32, nb: u32, stride: u32, location: Location, data: NonNull<T>, len: usize) -> Result<Self, SlateError> {
        let required = (stride as usize) * (nb as usize);
        if len < required {
            return Err(SlateError::InvariantViolated(format!(
                "origin buffer of length {len} cannot hold a tile needing stride*nb = {required}"
            )));
        }
        if stride < mb {
            return Err(SlateError::InvariantViolated(format!(
                "tile stride {stride} must be >= mb {mb}"
            )));
        }
        Ok(Self {
            mb,
            nb,
            stride,
            location,
            storage: TileStorage::Origin { ptr: data, len },
        })
    }

    pub const fn mb(&self) -> u32 {
        self.mb
    }

    pub const fn nb(&self) -> u32 {
        self.nb
    }

    pub const fn stride(&self) -> u32 {
        self.stride
    }

    pub const fn location(&self) -> Location {
        self.location
    }

    pub fn is_origin(&self) -> bool {
        matches!(self.storage, TileStorage::Origin { .. })
    }

    /// Reads the element at `(row, col)` within the tile, honoring column-major stride.
    pub fn get(&self, row: u32, col: u32) -> T {
        assert!(row < self.mb && col < self.nb, "tile index ({row}, {col}) out of range ({}, {})", self.mb, self.nb);
        let index = (col as usize) * (self.stride as usize) + (row as usize);
        self.storage.as_slice()[index].clone()
    }

    pub fn set(&mut self, row: u32, col: u32, value: T) {
        assert!(row < self.mb && col < self.nb, "tile index ({row}, {col}) out of range ({}, {})", self.mb, self.nb);
        let index = (col as usize) * (self.stride as usize) + (row as usize);
        self.storage.as_mut_slice()[index] = value;
    }

    /// Copies this tile's logical `mb x nb` contents into `dest`, which may have a
    /// different stride (e.g. a pool block's fixed stride vs. a caller's origin stride).
    pub fn copy_to(&self, dest: &mut Tile<T>) {
        assert_eq!(self.mb, dest.mb, "copy_to requires matching mb");
        assert_eq!(self.nb, dest.nb, "copy_to requires matching nb");
        for col in 0..self.nb {
            for row in 0..self.mb {
                let value = self.get(row, col);
                dest.set(row, col, value);
            }
        }
    }

    /// Blocking elementwise copy from a caller-owned column-major buffer with leading
    /// dimension `lda` into this tile's storage.
    pub fn copy_from(&mut self, external: &[T], lda: u32) {
        assert!(lda >= self.mb, "copy_from requires lda {lda} >= mb {}", self.mb);
        for col in 0..self.nb {
            for row in 0..self.mb {
                let index = (col as usize) * (lda as usize) + (row as usize);
                let value = external[index].clone();
                self.set(row, col, value);
            }
        }
    }

    /// Packs this tile's logical `mb x nb` elements into a flat column-major `Vec`,
    /// stripping any stride padding. Used to serialize a tile for broadcast or gather.
    pub fn pack(&self) -> Vec<T> {
        let mut packed = Vec::with_capacity((self.mb as usize) * (self.nb as usize));
        for col in 0..self.nb {
            for row in 0..self.mb {
                packed.push(self.get(row, col));
            }
        }
        packed
    }

    /// Inverse of [`Tile::pack`]: loads a flat column-major buffer of exactly `mb * nb`
    /// elements back into this tile's storage.
    pub fn unpack(&mut self, values: &[T]) {
        assert_eq!(
            values.len(),
            (self.mb as usize) * (self.nb as usize),
            "unpack expects exactly mb * nb elements"
        );
        let mut iter = values.iter().cloned();
        for col in 0..self.nb {
            for row in 0..self.mb {
                self.set(row, col, iter.next().expect("iterator sized to mb * nb"));
            }
        }
    }

    /// Releases a pool-backed tile's storage back to `pool`. Origin tiles are dropped
    /// without touching the pool, since they were never acquired from it.
    pub(crate) fn release_to_pool(self, pool: &crate::pool::TilePool<T>) -> Result<(), SlateError>
    where
        T: Default,
    {
        match self.storage {
            TileStorage::Pooled(block) => pool.release(block),
            TileStorage::Origin { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TilePool;

    #[test]
    fn pool_backed_tile_round_trips_values() {
        let pool: TilePool<f64> = TilePool::new(4, 0);
        let block = pool.acquire(Location::Host).expect("acquire block");
        let mut tile = Tile::from_pool_block(4, 4, 4, Location::Host, block).expect("build tile");
        tile.set(1, 2, 9.5);
        assert_eq!(tile.get(1, 2), 9.5);
        assert_eq!(tile.get(0, 0), 0.0);
    }

    #[test]
    fn origin_tile_aliases_caller_memory() {
        let mut backing = vec![0.0_f64; 16];
        let ptr = NonNull::new(backing.as_mut_ptr()).expect("non-null backing");
        let mut tile = unsafe { Tile::construct_from(4, 4, 4, Location::Host, ptr, 16) }.expect("build origin tile");
        tile.set(0, 0, 3.0);
        assert_eq!(backing[0], 3.0);
        assert!(tile.is_origin());
    }

    #[test]
    fn copy_to_handles_differing_strides() {
        let mut backing = vec![0.0_f64; 24];
        let ptr = NonNull::new(backing.as_mut_ptr()).expect("non-null backing");
        let mut source = unsafe { Tile::construct_from(4, 4, 6, Location::Host, ptr, 24) }.expect("build source");
        for col in 0..4 {
            source.set(0, col, col as f64);
        }

        let pool: TilePool<f64> = TilePool::new(4, 0);
        let block = pool.acquire(Location::Host).expect("acquire block");
        let mut dest = Tile::from_pool_block(4, 4, 4, Location::Host, block).expect("build dest");
        source.copy_to(&mut dest);

        for col in 0..4 {
            assert_eq!(dest.get(0, col), col as f64);
        }
    }

    #[test]
    fn construct_from_rejects_undersized_buffer() {
        let mut backing = vec![0.0_f64; 4];
        let ptr = NonNull::new(backing.as_mut_ptr()).expect("non-null backing");
        let error = unsafe { Tile::construct_from(4, 4, 4, Location::Host, ptr, 4) }.expect_err("too small");
        assert!(matches!(error, SlateError::InvariantViolated(_)));
    }

    #[test]
    fn copy_from_honors_external_leading_dimension() {
        let external = vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0];
        let pool: TilePool<f64> = TilePool::new(2, 0);
        let block = pool.acquire(Location::Host).expect("acquire block");
        let mut tile = Tile::from_pool_block(2, 2, 2, Location::Host, block).expect("build tile");
        tile.copy_from(&external, 3);
        assert_eq!(tile.get(0, 0), 1.0);
        assert_eq!(tile.get(1, 0), 2.0);
        assert_eq!(tile.get(0, 1), 10.0);
        assert_eq!(tile.get(1, 1), 20.0);
    }

    #[test]
    fn pack_then_unpack_round_trips() {
        let pool: TilePool<f64> = TilePool::new(2, 0);
        let block = pool.acquire(Location::Host).expect("acquire block");
        let mut tile = Tile::from_pool_block(2, 2, 2, Location::Host, block).expect("build tile");
        tile.set(0, 0, 1.0);
        tile.set(1, 0, 2.0);
        tile.set(0, 1, 3.0);
        tile.set(1, 1, 4.0);
        let packed = tile.pack();
        assert_eq!(packed, vec![1.0, 2.0, 3.0, 4.0]);

        let block = pool.acquire(Location::Host).expect("acquire second block");
        let mut other = Tile::from_pool_block(2, 2, 2, Location::Host, block).expect("build other tile");
        other.unpack(&packed);
        assert_eq!(other.get(1, 1), 4.0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn get_out_of_range_panics() {
        let pool: TilePool<f64> = TilePool::new(4, 0);
        let block = pool.acquire(Location::Host).expect("acquire block");
        let tile = Tile::from_pool_block(4, 4, 4, Location::Host, block).expect("build tile");
        let _ = tile.get(4, 0);
    }
}
