//! Maps `(row, col, location)` to a resident `Tile`. Sharded by coordinate hash so
//! concurrent inserts/lookups on disjoint tiles never contend on the same lock.

use std::collections::HashMap;
use std::sync::Mutex;

use slate_constants::{Location, SlateError};

use crate::tile::Tile;

const REGISTRY_SHARDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TileCoord {
    row: u32,
    col: u32,
    location: Location,
}

/// Sharded residency map owned by one `Matrix`. A `(row, col)` tile may be resident at
/// more than one location at once (e.g. host and a device copy staged for a kernel);
/// each `(row, col, location)` triple has its own slot.
pub struct TileRegistry<T> {
    shards: Vec<Mutex<HashMap<TileCoord, Tile<T>>>>,
}

impl<T> TileRegistry<T> {
    pub fn new() -> Self {
        Self {
            shards: (0..REGISTRY_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, row: u32, col: u32) -> usize {
        let hash = (row as usize).wrapping_mul(0x9E3779B1) ^ (col as usize);
        hash % self.shards.len()
    }

    /// Inserts `tile` at `(row, col, location)`. `InvariantViolated` if a tile is already
    /// resident there: callers must `remove` before re-inserting.
    pub fn insert(&self, row: u32, col: u32, location: Location, tile: Tile<T>) -> Result<(), SlateError> {
        let shard = self.shard_for(row, col);
        let mut map = self.shards[shard].lock().expect("tile registry shard lock poisoned");
        let coord = TileCoord { row, col, location };
        if map.contains_key(&coord) {
            return Err(SlateError::InvariantViolated(format!(
                "tile ({row}, {col}) already resident at {location}"
            )));
        }
        map.insert(coord, tile);
        Ok(())
    }

    pub fn is_resident(&self, row: u32, col: u32, location: Location) -> bool {
        let shard = self.shard_for(row, col);
        self.shards[shard]
            .lock()
            .expect("tile registry shard lock poisoned")
            .contains_key(&TileCoord { row, col, location })
    }

    pub fn any_resident(&self, row: u32, col: u32) -> Option<Location> {
        let shard = self.shard_for(row, col);
        self.shards[shard]
            .lock()
            .expect("tile registry shard lock poisoned")
            .keys()
            .find(|coord| coord.row == row && coord.col == col)
            .map(|coord| coord.location)
    }

    pub fn remove(&self, row: u32, col: u32, location: Location) -> Result<Tile<T>, SlateError> {
        let shard = self.shard_for(row, col);
        let mut map = self.shards[shard].lock().expect("tile registry shard lock poisoned");
        map.remove(&TileCoord { row, col, location }).ok_or_else(|| {
            SlateError::NotResident { row, col, location }
        })
    }

    pub fn with_tile<R>(&self, row: u32, col: u32, location: Location, f: impl FnOnce(&Tile<T>) -> R) -> Result<R, SlateError> {
        let shard = self.shard_for(row, col);
        let map = self.shards[shard].lock().expect("tile registry shard lock poisoned");
        let tile = map.get(&TileCoord { row, col, location }).ok_or(SlateError::NotResident { row, col, location })?;
        Ok(f(tile))
    }

    pub fn with_tile_mut<R>(&self, row: u32, col: u32, location: Location, f: impl FnOnce(&mut Tile<T>) -> R) -> Result<R, SlateError> {
        let shard = self.shard_for(row, col);
        let mut map = self.shards[shard].lock().expect("tile registry shard lock poisoned");
        let tile = map.get_mut(&TileCoord { row, col, location }).ok_or(SlateError::NotResident { row, col, location })?;
        Ok(f(tile))
    }

    /// Total number of resident tile slots across all locations, used by tests and by
    /// `Matrix::max_local_tiles` bookkeeping.
    pub fn resident_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().expect("tile registry shard lock poisoned").len()).sum()
    }

    pub fn locations_for(&self, row: u32, col: u32) -> Vec<Location> {
        let shard = self.shard_for(row, col);
        self.shards[shard]
            .lock()
            .expect("tile registry shard lock poisoned")
            .keys()
            .filter(|coord| coord.row == row && coord.col == col)
            .map(|coord| coord.location)
            .collect()
    }
}

impl<T> Default for TileRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TilePool;

    fn sample_tile(pool: &TilePool<f64>, location: Location) -> Tile<f64> {
        let block = pool.acquire(location).expect("acquire block");
        Tile::from_pool_block(4, 4, 4, location, block).expect("build tile")
    }

    #[test]
    fn insert_then_remove_round_trips() {
        let pool: TilePool<f64> = TilePool::new(4, 0);
        let registry: TileRegistry<f64> = TileRegistry::new();
        registry.insert(0, 0, Location::Host, sample_tile(&pool, Location::Host)).expect("insert");
        assert!(registry.is_resident(0, 0, Location::Host));
        registry.remove(0, 0, Location::Host).expect("remove");
        assert!(!registry.is_resident(0, 0, Location::Host));
    }

    #[test]
    fn duplicate_insert_is_invariant_violated() {
        let pool: TilePool<f64> = TilePool::new(4, 0);
        let registry: TileRegistry<f64> = TileRegistry::new();
        registry.insert(0, 0, Location::Host, sample_tile(&pool, Location::Host)).expect("first insert");
        let error = registry
            .insert(0, 0, Location::Host, sample_tile(&pool, Location::Host))
            .expect_err("duplicate insert must fail");
        assert!(matches!(error, SlateError::InvariantViolated(_)));
    }

    #[test]
    fn remove_missing_tile_is_not_resident() {
        let registry: TileRegistry<f64> = TileRegistry::new();
        let error = registry.remove(2, 2, Location::Host).expect_err("missing tile must error");
        assert!(matches!(error, SlateError::NotResident { row: 2, col: 2, .. }));
    }

    #[test]
    fn a_tile_can_be_resident_at_host_and_device_simultaneously() {
        let pool: TilePool<f64> = TilePool::new(4, 1);
        let registry: TileRegistry<f64> = TileRegistry::new();
        registry.insert(0, 0, Location::Host, sample_tile(&pool, Location::Host)).expect("insert host");
        registry.insert(0, 0, Location::Device(0), sample_tile(&pool, Location::Device(0))).expect("insert device");
        let mut locations = registry.locations_for(0, 0);
        locations.sort_by_key(|l| matches!(l, Location::Device(_)));
        assert_eq!(locations.len(), 2);
    }

    #[test]
    fn with_tile_mut_allows_in_place_updates() {
        let pool: TilePool<f64> = TilePool::new(4, 0);
        let registry: TileRegistry<f64> = TileRegistry::new();
        registry.insert(0, 0, Location::Host, sample_tile(&pool, Location::Host)).expect("insert");
        registry.with_tile_mut(0, 0, Location::Host, |tile| tile.set(0, 0, 42.0)).expect("mutate");
        let value = registry.with_tile(0, 0, Location::Host, |tile| tile.get(0, 0)).expect("read");
        assert_eq!(value, 42.0);
    }

    #[test]
    fn resident_count_tracks_inserts_and_removes() {
        let pool: TilePool<f64> = TilePool::new(4, 0);
        let registry: TileRegistry<f64> = TileRegistry::new();
        registry.insert(0, 0, Location::Host, sample_tile(&pool, Location::Host)).expect("insert a");
        registry.insert(0, 1, Location::Host, sample_tile(&pool, Location::Host)).expect("insert b");
        assert_eq!(registry.resident_count(), 2);
        registry.remove(0, 0, Location::Host).expect("remove a");
        assert_eq!(registry.resident_count(), 1);
    }
}
