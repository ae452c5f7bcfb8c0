//! A slab allocator keyed by a single fixed block size, with one free-list per location:
//! a per-location free-list with lazy growth, one list per `Location` instead of one per
//! backend.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use slate_constants::{Location, SlateError};

/// An owned block handed out by [`TilePool::acquire`]. Carries the location it was
/// acquired at so [`TilePool::release`] can route it back to the matching free list.
#[derive(Debug)]
pub struct PoolBlock<T> {
    pub(crate) data: Vec<T>,
    pub(crate) location: Location,
}

impl<T> PoolBlock<T> {
    pub fn location(&self) -> Location {
        self.location
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct LocationFreeList<T> {
    location: Location,
    free: Mutex<Vec<Vec<T>>>,
    allocated: AtomicUsize,
}

impl<T: Clone + Default> LocationFreeList<T> {
    fn new(location: Location) -> Self {
        Self {
            location,
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    fn acquire(&self, block_len: usize, max_blocks: Option<usize>) -> Result<PoolBlock<T>, SlateError> {
        let mut free = self.free.lock().expect("tile pool free list lock poisoned");
        if let Some(data) = free.pop() {
            return Ok(PoolBlock {
                data,
                location: self.location,
            });
        }
        drop(free);

        let allocated = self.allocated.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(max_blocks) = max_blocks {
            if allocated > max_blocks {
                self.allocated.fetch_sub(1, Ordering::SeqCst);
                return Err(SlateError::AllocFailed(format!(
                    "tile pool exhausted at {} ({} blocks already allocated at {})",
                    self.location, max_blocks, self.location
                )));
            }
        }
        tracing::trace!(location = %self.location, allocated, "tile pool grew free list");
        Ok(PoolBlock {
            data: vec![T::default(); block_len],
            location: self.location,
        })
    }

    fn release(&self, block: Vec<T>) {
        self.free
            .lock()
            .expect("tile pool free list lock poisoned")
            .push(block);
    }

    fn reserve(&self, block_len: usize, count: usize) {
        let mut free = self.free.lock().expect("tile pool free list lock poisoned");
        for _ in 0..count {
            free.push(vec![T::default(); block_len]);
        }
        self.allocated.fetch_add(count, Ordering::SeqCst);
    }
}

/// One pool per `Matrix`, parameterized by the fixed block size `nb * nb` elements.
pub struct TilePool<T> {
    nb: u32,
    block_len: usize,
    max_blocks_per_location: Option<usize>,
    host: LocationFreeList<T>,
    devices: Vec<LocationFreeList<T>>,
}

impl<T: Clone + Default> TilePool<T> {
    pub fn new(nb: u32, device_count: u32) -> Self {
        Self::with_capacity_limit(nb, device_count, None)
    }

    /// Like [`TilePool::new`] but caps the number of blocks any single location may hold,
    /// so `acquire` can be made to return `AllocFailed` deterministically in tests.
    pub fn with_capacity_limit(nb: u32, device_count: u32, max_blocks_per_location: Option<usize>) -> Self {
        let block_len = (nb as usize) * (nb as usize);
        let devices = (0..device_count).map(|d| LocationFreeList::new(Location::Device(d))).collect();
        Self {
            nb,
            block_len,
            max_blocks_per_location,
            host: LocationFreeList::new(Location::Host),
            devices,
        }
    }

    pub const fn nb(&self) -> u32 {
        self.nb
    }

    pub const fn block_len(&self) -> usize {
        self.block_len
    }

    fn free_list_for(&self, location: Location) -> Result<&LocationFreeList<T>, SlateError> {
        match location {
            Location::Host => Ok(&self.host),
            Location::Device(id) => self.devices.get(id as usize).ok_or_else(|| {
                SlateError::InvalidArgument(format!("device {id} is not configured on this pool"))
            }),
        }
    }

    pub fn reserve_host(&self, count: usize) {
        self.host.reserve(self.block_len, count);
    }

    pub fn reserve_device(&self, device: u32, count: usize) -> Result<(), SlateError> {
        let list = self.free_list_for(Location::Device(device))?;
        list.reserve(self.block_len, count);
        Ok(())
    }

    pub fn acquire(&self, location: Location) -> Result<PoolBlock<T>, SlateError> {
        self.free_list_for(location)?.acquire(self.block_len, self.max_blocks_per_location)
    }

    /// Returns `block` to the free list matching the location it was acquired at.
    pub fn release(&self, block: PoolBlock<T>) -> Result<(), SlateError> {
        self.free_list_for(block.location)?.release(block.data);
        Ok(())
    }

    pub fn device_count(&self) -> u32 {
        self.devices.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_block_of_nb_squared_length() {
        let pool: TilePool<f64> = TilePool::new(4, 0);
        let block = pool.acquire(Location::Host).expect("acquire host block");
        assert_eq!(block.len(), 16);
        assert_eq!(block.location(), Location::Host);
    }

    #[test]
    fn released_block_is_reused_on_next_acquire() {
        let pool: TilePool<f64> = TilePool::new(2, 0);
        let mut first = pool.acquire(Location::Host).expect("acquire first");
        first.as_mut_slice()[0] = 7.0;
        pool.release(first).expect("release first");

        let second = pool.acquire(Location::Host).expect("acquire second");
        assert_eq!(second.as_slice()[0], 7.0);
    }

    #[test]
    fn acquire_fails_with_alloc_failed_past_capacity_limit() {
        let pool: TilePool<f64> = TilePool::with_capacity_limit(2, 0, Some(1));
        let _first = pool.acquire(Location::Host).expect("first acquire succeeds");
        let error = pool.acquire(Location::Host).expect_err("second acquire must fail");
        assert!(matches!(error, SlateError::AllocFailed(_)));
    }

    #[test]
    fn reserve_host_preallocates_blocks_without_consuming_capacity_limit() {
        let pool: TilePool<f64> = TilePool::with_capacity_limit(2, 0, Some(1));
        pool.reserve_host(1);
        let block = pool.acquire(Location::Host).expect("acquire pre-reserved block");
        assert_eq!(block.len(), 4);
    }

    #[test]
    fn acquire_unknown_device_is_invalid_argument() {
        let pool: TilePool<f64> = TilePool::new(2, 1);
        let error = pool.acquire(Location::Device(5)).expect_err("device 5 is not configured");
        assert!(matches!(error, SlateError::InvalidArgument(_)));
    }
}
