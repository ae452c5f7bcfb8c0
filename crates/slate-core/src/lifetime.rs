//! Reference counting for broadcast tiles: a receiving rank must not reclaim a tile it
//! holds only as a temporary copy until every local task that was given access to it has
//! ticked its use down.

use std::collections::HashMap;
use std::sync::Mutex;

/// Tracks outstanding local uses of broadcast-received tiles, keyed by tile coordinate.
/// A fresh entry starts at the life count the broadcast announced; `tick` decrements it
/// and reports whether the tile has reached zero uses and may be reclaimed.
#[derive(Default)]
pub struct LifetimeTracker {
    counts: Mutex<HashMap<(u32, u32), u32>>,
}

impl LifetimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `life` outstanding uses for `(row, col)`. Panics if the tile is already
    /// tracked: a second registration without an intervening reclaim means a broadcast
    /// landed on a tile that was never ticked to zero, which is a caller bug.
    pub fn register(&self, row: u32, col: u32, life: u32) {
        let mut counts = self.counts.lock().expect("lifetime tracker lock poisoned");
        let previous = counts.insert((row, col), life);
        assert!(
            previous.is_none(),
            "lifetime already tracked for tile ({row}, {col}); previous registration was never reclaimed"
        );
    }

    /// Decrements the outstanding use count for `(row, col)` by one and returns `true` if
    /// this was the last outstanding use (the tile may now be reclaimed). Panics if the
    /// tile is not tracked: an entry is removed the moment it reaches zero, so ticking an
    /// already-exhausted tile is indistinguishable from ticking one that was never
    /// registered, and both indicate an over-release surfaced as a fatal assertion rather
    /// than silent data corruption.
    pub fn tick(&self, row: u32, col: u32) -> bool {
        let mut counts = self.counts.lock().expect("lifetime tracker lock poisoned");
        let count = counts
            .get_mut(&(row, col))
            .unwrap_or_else(|| panic!("tick on untracked tile ({row}, {col})"));
        *count -= 1;
        let exhausted = *count == 0;
        if exhausted {
            counts.remove(&(row, col));
        }
        exhausted
    }

    pub fn outstanding(&self, row: u32, col: u32) -> Option<u32> {
        self.counts.lock().expect("lifetime tracker lock poisoned").get(&(row, col)).copied()
    }

    pub fn is_tracked(&self, row: u32, col: u32) -> bool {
        self.counts.lock().expect("lifetime tracker lock poisoned").contains_key(&(row, col))
    }
}
