//! The `VictimOracle` capability: given a device's evictable handles, choose
//! one to swap out. The access-history / ranking logic is treated as an
//! external collaborator; this module defines its trait plus an LRU-based
//! default.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::handle::Handle;

/// Extra context `SwapOut` hands the oracle so it can prefer a same-size
/// victim via `divided`, to minimize fragmentation.
pub struct VictimHint<'a> {
    pub size_hint: usize,
    pub divided: &'a BTreeMap<usize, HashSet<Handle>>,
}

/// Chooses which swappable handle to evict. Implementations must not block
/// or allocate in a way that could deadlock against `SwapEngine`'s table
/// lock — `SwapOut` calls this while holding the writer lock.
pub trait VictimOracle: Send + Sync {
    fn decide_victim(
        &self,
        swappable: &HashSet<Handle>,
        device: i32,
        hint: &VictimHint<'_>,
    ) -> Option<Handle>;

    /// Called whenever a handle becomes a fresh eviction candidate or is
    /// otherwise "touched" (allocated, unlocked). Default no-op for oracles
    /// that don't track recency.
    fn on_touch(&self, _handle: Handle) {}

    /// Called when a handle leaves the table entirely (`FreeAddr`/`DelAddr`).
    fn on_remove(&self, _handle: Handle) {}
}

/// Least-recently-touched victim selection, same-size-first.
///
/// A `VecDeque` reordered on every touch, scanned oldest-first for a
/// swappable candidate; the scan is additionally biased towards handles
/// matching the requested size via the `divided` index handed in through
/// [`VictimHint`], to reduce churn from re-splitting differently sized
/// blocks.
#[derive(Default)]
pub struct LruOracle {
    order: Mutex<VecDeque<Handle>>,
}

impl LruOracle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VictimOracle for LruOracle {
    fn decide_victim(
        &self,
        swappable: &HashSet<Handle>,
        _device: i32,
        hint: &VictimHint<'_>,
    ) -> Option<Handle> {
        let order = self.order.lock().unwrap();

        if let Some(same_size) = hint.divided.get(&hint.size_hint) {
            if let Some(victim) = order
                .iter()
                .find(|h| same_size.contains(h) && swappable.contains(h))
            {
                return Some(*victim);
            }
        }

        order.iter().find(|h| swappable.contains(h)).copied()
    }

    fn on_touch(&self, handle: Handle) {
        let mut order = self.order.lock().unwrap();
        order.retain(|&h| h != handle);
        order.push_back(handle);
    }

    fn on_remove(&self, handle: Handle) {
        let mut order = self.order.lock().unwrap();
        order.retain(|&h| h != handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_oldest_touched() {
        let oracle = LruOracle::new();
        oracle.on_touch(1);
        oracle.on_touch(2);
        oracle.on_touch(3);

        let swappable: HashSet<Handle> = [1, 2, 3].into_iter().collect();
        let divided = BTreeMap::new();
        let hint = VictimHint {
            size_hint: 64,
            divided: &divided,
        };
        assert_eq!(oracle.decide_victim(&swappable, 0, &hint), Some(1));
    }

    #[test]
    fn same_size_preferred_over_older() {
        let oracle = LruOracle::new();
        oracle.on_touch(1);
        oracle.on_touch(2);

        let swappable: HashSet<Handle> = [1, 2].into_iter().collect();
        let mut divided = BTreeMap::new();
        divided.insert(64usize, [2].into_iter().collect::<HashSet<Handle>>());
        let hint = VictimHint {
            size_hint: 64,
            divided: &divided,
        };
        // 1 is older, but 2 matches the requested size.
        assert_eq!(oracle.decide_victim(&swappable, 0, &hint), Some(2));
    }

    #[test]
    fn removed_handle_never_returned() {
        let oracle = LruOracle::new();
        oracle.on_touch(1);
        oracle.on_remove(1);

        let swappable: HashSet<Handle> = HashSet::new();
        let divided = BTreeMap::new();
        let hint = VictimHint {
            size_hint: 1,
            divided: &divided,
        };
        assert_eq!(oracle.decide_victim(&swappable, 0, &hint), None);
    }
}
