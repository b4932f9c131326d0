//! The swap engine: a handle-indexed address table guarded by a single
//! reader/writer lock, arbitrating device allocations against a
//! victim-selection policy and device↔host DMA.
//!
//! Every table access here takes the *writer* side of the lock, even the
//! ones that only inspect a flag. The type is `RwLock` to leave room for a
//! read-mostly fast path later, but nothing below exercises it yet — there
//! is no contended read-only workload this engine serves today that would
//! justify the added complexity of tracking which accesses are truly
//! read-only.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use crate::allocator::{Allocator, Stream};
use crate::config::SwapConfig;
use crate::handle::{DevPtr, GetAddrMode, Handle, SwapInfo};
use crate::victim::VictimOracle;

#[derive(Default)]
struct Tables {
    swap_info: HashMap<Handle, SwapInfo>,
    swappable: HashMap<i32, HashSet<Handle>>,
    divided: HashMap<i32, BTreeMap<usize, HashSet<Handle>>>,
}

/// Diagnostics counters, exposed as plain integers rather than routed
/// through a separate history object, since that object is itself the
/// external `VictimOracle`'s concern, not the swap engine's.
#[derive(Default)]
pub struct EngineStats {
    pub num_swap_in: AtomicU64,
    pub num_swap_out: AtomicU64,
    pub swap_in_total_bytes: AtomicU64,
    pub swap_out_total_bytes: AtomicU64,
    pub num_get_addr: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct EngineStatsSnapshot {
    pub num_swap_in: u64,
    pub num_swap_out: u64,
    pub swap_in_total_bytes: u64,
    pub swap_out_total_bytes: u64,
    pub num_get_addr: u64,
}

impl EngineStats {
    fn record_swap_in(&self, bytes: usize) {
        self.num_swap_in.fetch_add(1, Ordering::Relaxed);
        self.swap_in_total_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_swap_out(&self, bytes: usize) {
        self.num_swap_out.fetch_add(1, Ordering::Relaxed);
        self.swap_out_total_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            num_swap_in: self.num_swap_in.load(Ordering::Relaxed),
            num_swap_out: self.num_swap_out.load(Ordering::Relaxed),
            swap_in_total_bytes: self.swap_in_total_bytes.load(Ordering::Relaxed),
            swap_out_total_bytes: self.swap_out_total_bytes.load(Ordering::Relaxed),
            num_get_addr: self.num_get_addr.load(Ordering::Relaxed),
        }
    }
}

/// A single handle's table entry, as returned by [`SwapEngine::debug_dump`].
#[derive(Debug, Clone, Copy)]
pub struct HandleSummary {
    pub handle: Handle,
    pub size: usize,
    pub swap_count: u64,
    pub device_id: i32,
    pub swapped_in: bool,
}

/// The swap engine. One instance is shared (via `Arc`) between the executor
/// threads, the prefetcher, and `DptrManager`.
pub struct SwapEngine<A: Allocator, O: VictimOracle> {
    allocator: Arc<A>,
    oracle: Arc<O>,
    config: SwapConfig,
    tables: RwLock<Tables>,
    stats: EngineStats,
    /// Backing reused by every handle's pinned-host allocation when
    /// `infinite_cpu_memory` is set, instead of allocating one pinned buffer
    /// per handle.
    shared_host_buffer: Mutex<Vec<u8>>,
    /// Wakes every `GetAddr(NORMAL)` waiter whenever any handle transitions
    /// to resident.
    arrival_gate: (Mutex<()>, Condvar),
}

impl<A: Allocator, O: VictimOracle> SwapEngine<A, O> {
    pub fn new(allocator: Arc<A>, oracle: Arc<O>, config: SwapConfig) -> Self {
        SwapEngine {
            allocator,
            oracle,
            config,
            tables: RwLock::new(Tables::default()),
            stats: EngineStats::default(),
            shared_host_buffer: Mutex::new(Vec::new()),
            arrival_gate: (Mutex::new(()), Condvar::new()),
        }
    }

    pub fn config(&self) -> &SwapConfig {
        &self.config
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// A human-readable table dump for offline analysis.
    pub fn debug_dump(&self) -> Vec<HandleSummary> {
        let tables = self.tables.write().unwrap();
        let mut out: Vec<_> = tables
            .swap_info
            .values()
            .map(|info| HandleSummary {
                handle: info.handle_id,
                size: info.size,
                swap_count: info.swap_count,
                device_id: info.device_id,
                swapped_in: info.swapped_in,
            })
            .collect();
        out.sort_by_key(|h| h.handle);
        out
    }

    pub fn is_resident(&self, handle: Handle) -> bool {
        let tables = self.tables.write().unwrap();
        tables
            .swap_info
            .get(&handle)
            .map(|info| info.swapped_in)
            .unwrap_or(false)
    }

    pub fn is_swappable(&self, device: i32, handle: Handle) -> bool {
        let tables = self.tables.write().unwrap();
        tables
            .swappable
            .get(&device)
            .map(|set| set.contains(&handle))
            .unwrap_or(false)
    }

    fn lazily_allocate_cpu_backing(&self, size: usize) -> Vec<u8> {
        if self.config.infinite_cpu_memory {
            let mut shared = self.shared_host_buffer.lock().unwrap();
            if shared.len() < size {
                shared.resize(size, 0);
            }
            shared[..size].to_vec()
        } else {
            vec![0u8; size]
        }
    }

    /// `SetAddr`. `is_pre = true` creates a fresh record and is fatal if one
    /// already exists for `handle`; `is_pre = false` updates `dptr` on an
    /// existing record.
    pub fn set_addr(&self, handle: Handle, dptr: DevPtr, size: usize, device: i32, is_pre: bool) {
        if device >= 0 && is_pre {
            tracing::trace!(handle, device, size, "SET_ADDR");
        }
        let mut tables = self.tables.write().unwrap();
        if is_pre {
            if tables.swap_info.contains_key(&handle) {
                panic!(
                    "{}",
                    crate::error::OdSwapError::DoubleCreate(handle)
                );
            }
            tables
                .swap_info
                .insert(handle, SwapInfo::new(handle, dptr, size, device));
            drop(tables);
            self.oracle.on_touch(handle);
        } else {
            let info = tables
                .swap_info
                .get_mut(&handle)
                .unwrap_or_else(|| panic!("SetAddr(pre=false): unknown handle {handle}"));
            info.dptr = dptr;
        }
    }

    /// `FreeAddr`: removes `handle` and additionally frees its device
    /// buffer through the allocator.
    pub fn free_addr(&self, handle: Handle) {
        self.remove_addr(handle, true);
    }

    /// `DelAddr`: removes `handle` without touching device memory (used
    /// when the device buffer was never materialized, e.g. temporaries).
    pub fn del_addr(&self, handle: Handle) {
        self.remove_addr(handle, false);
    }

    fn remove_addr(&self, handle: Handle, free_device_buffer: bool) {
        let info = {
            let mut tables = self.tables.write().unwrap();
            let info = tables
                .swap_info
                .remove(&handle)
                .unwrap_or_else(|| panic!("remove_addr: unknown handle {handle}"));
            if !info.is_host_only() {
                if let Some(set) = tables.swappable.get_mut(&info.device_id) {
                    set.remove(&handle);
                }
                if let Some(map) = tables.divided.get_mut(&info.device_id) {
                    if let Some(set) = map.get_mut(&info.size) {
                        set.remove(&handle);
                    }
                }
                tracing::trace!(handle, device = info.device_id, "DEL_ADDR");
            }
            info
        };

        self.oracle.on_remove(handle);

        if free_device_buffer && info.swapped_in {
            self.allocator.free(info.device_id, info.dptr, info.size);
        }
        // `info.cpu_address` (a `Vec<u8>`) is dropped here, releasing the
        // pinned-host backing, unless `infinite_cpu_memory` is set — in
        // which case it was a snapshot of the shared buffer, not a
        // distinct pinned allocation, so there is nothing extra to free.
    }

    /// `GetAddr`. Resolves `handle` to its resident device pointer, swapping
    /// it in first if necessary per `mode`.
    ///
    /// Returns `Err(OutOfSwappable)` when a `SwapIn` fails to make room;
    /// every other error variant is a fatal logic bug and panics instead
    /// (see `error.rs`).
    pub fn get_addr(
        &self,
        handle: Handle,
        mode: GetAddrMode,
    ) -> Result<DevPtr, crate::error::OdSwapError> {
        if mode == GetAddrMode::Normal {
            tracing::trace!(handle, "GET_ADDR");
            self.stats.num_get_addr.fetch_add(1, Ordering::Relaxed);
        }

        let (device, resident) = {
            let tables = self.tables.write().unwrap();
            let info = tables
                .swap_info
                .get(&handle)
                .ok_or(crate::error::OdSwapError::UnknownHandle(handle))?;
            (info.device_id, info.swapped_in)
        };

        if !resident {
            match mode {
                GetAddrMode::Alloc | GetAddrMode::Prefetch => {
                    if !self.swap_in(handle, self.config.swap_async) {
                        return Err(crate::error::OdSwapError::OutOfSwappable {
                            device,
                            required_bytes: {
                                let tables = self.tables.write().unwrap();
                                tables.swap_info.get(&handle).map(|i| i.size).unwrap_or(0)
                            },
                        });
                    }
                }
                GetAddrMode::Normal => self.wait_for_arrival(handle),
            }
        }

        let dptr = {
            let mut tables = self.tables.write().unwrap();
            let info = tables.swap_info.get_mut(&handle).expect("handle vanished");
            debug_assert!(info.swapped_in, "GetAddr: handle {handle} not resident after admission");

            if mode == GetAddrMode::Prefetch {
                info.lock_count += 1;
            }

            let dev = info.device_id;
            let sz = info.size;
            if let Some(set) = tables.swappable.get_mut(&dev) {
                set.remove(&handle);
            }
            if let Some(map) = tables.divided.get_mut(&dev) {
                if let Some(set) = map.get_mut(&sz) {
                    set.remove(&handle);
                }
            }
            tables.swap_info.get(&handle).unwrap().dptr
        };

        Ok(dptr)
    }

    fn wait_for_arrival(&self, handle: Handle) {
        {
            let mut tables = self.tables.write().unwrap();
            if let Some(info) = tables.swap_info.get_mut(&handle) {
                info.is_waiting = true;
            }
        }
        loop {
            let resident = {
                let tables = self.tables.write().unwrap();
                tables
                    .swap_info
                    .get(&handle)
                    .map(|i| i.swapped_in)
                    .unwrap_or(false)
            };
            if resident {
                break;
            }
            let guard = self.arrival_gate.0.lock().unwrap();
            let _ = self
                .arrival_gate
                .1
                .wait_timeout(guard, Duration::from_millis(5))
                .unwrap();
        }
        let mut tables = self.tables.write().unwrap();
        if let Some(info) = tables.swap_info.get_mut(&handle) {
            info.is_waiting = false;
        }
    }

    /// `StartComputing`: pin every handle in `handles` (reentrant).
    pub fn start_computing(&self, handles: &HashSet<Handle>) {
        let mut tables = self.tables.write().unwrap();
        for &h in handles {
            let (device, size, newly_locked) = {
                let info = tables
                    .swap_info
                    .get_mut(&h)
                    .unwrap_or_else(|| panic!("StartComputing: unknown handle {h}"));
                info.lock_count += 1;
                (info.device_id, info.size, info.lock_count == 1)
            };
            if newly_locked {
                if let Some(set) = tables.swappable.get_mut(&device) {
                    set.remove(&h);
                }
                if let Some(map) = tables.divided.get_mut(&device) {
                    if let Some(set) = map.get_mut(&size) {
                        set.remove(&h);
                    }
                }
            }
        }
    }

    /// `StopComputing`: unpin every handle in `handles`; a handle reaching
    /// zero locks becomes swappable again. Fatal if a handle was not locked
    /// at all.
    pub fn stop_computing(&self, handles: &HashSet<Handle>) {
        let mut tables = self.tables.write().unwrap();
        for &h in handles {
            let (device, size, now_unlocked) = {
                let info = tables
                    .swap_info
                    .get_mut(&h)
                    .unwrap_or_else(|| panic!("StopComputing: unknown handle {h}"));
                if info.lock_count == 0 {
                    panic!("{}", crate::error::OdSwapError::UnlockedStop(h));
                }
                info.lock_count -= 1;
                (info.device_id, info.size, info.lock_count == 0)
            };
            if now_unlocked {
                tables.swappable.entry(device).or_default().insert(h);
                tables
                    .divided
                    .entry(device)
                    .or_default()
                    .entry(size)
                    .or_default()
                    .insert(h);
                self.oracle.on_touch(h);
            }
        }
    }

    fn pick_victim(&self, tables: &Tables, device: i32, required_bytes: usize) -> Option<Handle> {
        let swappable = tables.swappable.get(&device)?;
        if swappable.is_empty() {
            return None;
        }
        let empty = BTreeMap::new();
        let divided = tables.divided.get(&device).unwrap_or(&empty);
        let hint = crate::victim::VictimHint {
            size_hint: required_bytes,
            divided,
        };
        self.oracle.decide_victim(swappable, device, &hint)
    }

    /// `SwapOut`: evict handles on `device` until `required_bytes` fit, or
    /// there is nothing left to evict.
    pub fn swap_out(&self, required_bytes: usize, device: i32, async_mode: bool) -> bool {
        loop {
            if self.allocator.try_allocate(device, required_bytes) {
                return true;
            }

            let (victim, size, dptr, mut cpu_buf);
            {
                let mut tables = self.tables.write().unwrap();
                let Some(v) = self.pick_victim(&tables, device, required_bytes) else {
                    return false;
                };
                victim = v;

                let info = tables
                    .swap_info
                    .get_mut(&victim)
                    .expect("victim handle missing its SwapInfo record");
                assert!(info.swapped_in, "victim {victim} selected while not resident");
                let already = info.is_swapping.test_and_set();
                assert!(
                    !already,
                    "invariant violated: concurrent swap-out on handle {victim}"
                );
                info.swap_count += 1;
                size = info.size;
                dptr = info.dptr;
                if !self.config.infinite_memory && info.cpu_address.is_none() {
                    info.cpu_address = Some(self.lazily_allocate_cpu_backing(size));
                }
                cpu_buf = info.cpu_address.take();
                info.swapped_in = false;

                if let Some(set) = tables.swappable.get_mut(&device) {
                    set.remove(&victim);
                }
                if let Some(map) = tables.divided.get_mut(&device) {
                    if let Some(set) = map.get_mut(&size) {
                        set.remove(&victim);
                    }
                }
            }
            // Writer lock released: perform the DMA without blocking other
            // bookkeeping.
            if !self.config.infinite_memory {
                let buf = cpu_buf
                    .as_mut()
                    .expect("cpu_address must be allocated unless infinite_memory");
                let stream = Stream { device, out: true };
                if async_mode {
                    self.allocator.memcpy_d2h_async(device, buf, dptr, stream);
                    self.allocator.stream_synchronize(device, stream);
                } else {
                    self.allocator.memcpy_d2h(device, buf, dptr);
                }
            }
            self.allocator.free(device, dptr, size);
            self.stats.record_swap_out(size);

            let mut tables = self.tables.write().unwrap();
            let info = tables
                .swap_info
                .get_mut(&victim)
                .expect("victim disappeared mid swap-out");
            info.cpu_address = cpu_buf;
            info.is_swapping.clear();
            tracing::debug!(handle = victim, device, size, "swap_out complete");
        }
    }

    /// `SwapIn`: materialize `handle` on its device, evicting others via
    /// `SwapOut` if needed.
    pub fn swap_in(&self, handle: Handle, async_mode: bool) -> bool {
        loop {
            let acquired = {
                let tables = self.tables.write().unwrap();
                let info = tables
                    .swap_info
                    .get(&handle)
                    .unwrap_or_else(|| panic!("SwapIn: unknown handle {handle}"));
                !info.is_swapping.test_and_set()
            };
            if acquired {
                break;
            }
            std::thread::sleep(Duration::from_micros(10));
        }

        let (resident, size, device) = {
            let tables = self.tables.write().unwrap();
            let info = tables.swap_info.get(&handle).unwrap();
            (info.swapped_in, info.size, info.device_id)
        };

        if resident {
            self.clear_swapping(handle);
            return true;
        }

        if !self.swap_out(size, device, async_mode) {
            self.clear_swapping(handle);
            return false;
        }

        let new_ptr = self
            .allocator
            .malloc(device, size)
            .unwrap_or_else(|_| {
                panic!(
                    "{}",
                    crate::error::OdSwapError::AllocatorFailure { device, size }
                )
            });

        let cpu_snapshot = {
            let tables = self.tables.write().unwrap();
            tables.swap_info.get(&handle).unwrap().cpu_address.clone()
        };

        if !self.config.infinite_memory {
            let buf = cpu_snapshot
                .as_deref()
                .expect("cpu_address missing for a handle being swapped in");
            let stream = Stream { device, out: false };
            if async_mode {
                self.allocator.memcpy_h2d_async(device, new_ptr, buf, stream);
                self.allocator.stream_synchronize(device, stream);
            } else {
                self.allocator.memcpy_h2d(device, new_ptr, buf);
            }
        }

        {
            let mut tables = self.tables.write().unwrap();
            let info = tables.swap_info.get_mut(&handle).unwrap();
            info.dptr = new_ptr;
            info.swapped_in = true;
        }
        self.oracle.on_touch(handle);
        self.clear_swapping(handle);
        self.stats.record_swap_in(size);
        self.arrival_gate.1.notify_all();
        tracing::debug!(handle, device, size, "swap_in complete");
        true
    }

    fn clear_swapping(&self, handle: Handle) {
        let tables = self.tables.write().unwrap();
        if let Some(info) = tables.swap_info.get(&handle) {
            info.is_swapping.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SimAllocator;
    use crate::victim::LruOracle;

    fn engine(capacity: usize) -> SwapEngine<SimAllocator, LruOracle> {
        SwapEngine::new(
            Arc::new(SimAllocator::single(0, capacity)),
            Arc::new(LruOracle::new()),
            SwapConfig {
                swap_async: false,
                ..SwapConfig::default()
            },
        )
    }

    fn create(eng: &SwapEngine<SimAllocator, LruOracle>, handle: Handle, size: usize) {
        eng.swap_out(size, 0, false);
        let ptr = eng
            .allocator
            .malloc(0, size)
            .expect("room for initial create");
        eng.set_addr(handle, ptr, size, 0, true);
        let set = [handle].into_iter().collect::<HashSet<_>>();
        eng.start_computing(&set);
        eng.stop_computing(&set);
    }

    // S1 — basic eviction.
    #[test]
    fn s1_basic_eviction() {
        let eng = engine(100);
        create(&eng, 1, 60);
        create(&eng, 2, 60);

        let summaries = eng.debug_dump();
        let h1 = summaries.iter().find(|s| s.handle == 1).unwrap();
        let h2 = summaries.iter().find(|s| s.handle == 2).unwrap();
        assert_eq!(h1.swap_count, 1);
        assert!(!h1.swapped_in);
        assert!(h2.swapped_in);
    }

    // S2 — victim starvation.
    #[test]
    fn s2_victim_starvation() {
        let eng = engine(120);
        create(&eng, 1, 60);
        create(&eng, 2, 60);
        eng.start_computing(&[1, 2].into_iter().collect());

        let ok = eng.swap_out(60, 0, false);
        assert!(!ok);
        assert!(eng.is_resident(1));
        assert!(eng.is_resident(2));
    }

    #[test]
    fn set_addr_double_create_is_fatal() {
        let eng = engine(1000);
        let ptr = eng.allocator.malloc(0, 100).unwrap();
        eng.set_addr(1, ptr, 100, 0, true);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            eng.set_addr(1, ptr, 100, 0, true);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn stop_computing_on_unlocked_handle_is_fatal() {
        let eng = engine(1000);
        let ptr = eng.allocator.malloc(0, 100).unwrap();
        eng.set_addr(1, ptr, 100, 0, true);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            eng.stop_computing(&[1].into_iter().collect());
        }));
        assert!(result.is_err());
    }

    #[test]
    fn start_stop_computing_is_a_noop_on_resident_set() {
        let eng = engine(1000);
        create(&eng, 1, 100);
        assert!(eng.is_swappable(0, 1));
        let set = [1].into_iter().collect::<HashSet<_>>();
        eng.start_computing(&set);
        assert!(!eng.is_swappable(0, 1));
        eng.stop_computing(&set);
        assert!(eng.is_swappable(0, 1));
    }

    #[test]
    fn round_trip_preserves_payload() {
        let eng = engine(60);
        let payload = vec![9u8; 60];
        let ptr = eng.allocator.malloc(0, 60).unwrap();
        eng.allocator.memcpy_h2d(0, ptr, &payload);
        eng.set_addr(1, ptr, 60, 0, true);
        let set = [1].into_iter().collect::<HashSet<_>>();
        eng.start_computing(&set);
        eng.stop_computing(&set);

        assert!(eng.swap_out(60, 0, false));
        assert!(!eng.is_resident(1));
        assert!(eng.swap_in(1, false));

        let new_ptr = eng.get_addr(1, GetAddrMode::Alloc).expect("resident now");
        let mut back = vec![0u8; 60];
        eng.allocator.memcpy_d2h(0, &mut back, new_ptr);
        assert_eq!(payload, back);
    }

    #[test]
    fn get_addr_removes_from_swappable() {
        let eng = engine(200);
        create(&eng, 1, 60);
        assert!(eng.is_swappable(0, 1));
        let _ = eng.get_addr(1, GetAddrMode::Alloc).unwrap();
        assert!(!eng.is_swappable(0, 1));
    }
}
