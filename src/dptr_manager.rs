//! The on-demand dptr manager: the façade a graph executor drives through
//! `Alloc`/`Free`/`GetDptr`/`SetDptr` and the `NotifyBegin`/`NotifyDone`
//! node-execution callbacks, arbitrating between three distinct iteration
//! phases on top of a single [`SwapEngine`].
//!
//! Iteration 0 (binding/preparation) assigns every handle a symbolic
//! placeholder pointer and answers every `GetDptr` with one shared "fake"
//! device buffer, so graph construction never actually touches real device
//! memory. Iteration 1 (trace capture) replays the same graph, this time
//! recording which handles each node touches; this is also when the
//! prefetch replay sequence is built, one entry per node. From iteration 2
//! onward the manager makes real allocations and defers to the swap engine,
//! starting the prefetcher near the end of iteration 2 and relying on its
//! backpressure signal for iteration 3 onward.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::allocator::Allocator;
use crate::config::SwapConfig;
use crate::handle::{DevPtr, GetAddrMode, Handle, HOST_ONLY_DEVICE};
use crate::prefetcher::{IterationCounter, Prefetcher};
use crate::swap_engine::SwapEngine;
use crate::victim::VictimOracle;

pub type NodeId = u64;

/// A single entry in the node-execution history: which node, and its
/// human-readable name (as reported by the graph executor).
pub type NodeKey = (NodeId, String);

pub struct DptrManager<A: Allocator + 'static, O: VictimOracle + 'static> {
    engine: Arc<SwapEngine<A, O>>,
    prefetcher: Arc<Prefetcher<A, O>>,
    iteration: IterationCounter,
    device_id: i32,
    temp_bytes: usize,
    temp_memory: Mutex<DevPtr>,
    temp_handles: Mutex<HashSet<Handle>>,
    unalloced: Mutex<HashSet<Handle>>,
    dptr_size: Mutex<HashMap<Handle, usize>>,
    dptr_mapping: Mutex<HashMap<Handle, DevPtr>>,
    dptr_dev_id: Mutex<HashMap<Handle, i32>>,
    node_history: Mutex<Vec<NodeKey>>,
    node_handles: Mutex<HashMap<NodeKey, HashSet<Handle>>>,
    cur_node: Mutex<Option<NodeKey>>,
    cur_nid_idx: Mutex<usize>,
    fake_memory: Mutex<Option<(DevPtr, usize)>>,
}

impl<A, O> DptrManager<A, O>
where
    A: Allocator + 'static,
    O: VictimOracle + 'static,
{
    pub fn new(engine: Arc<SwapEngine<A, O>>, config: &SwapConfig, device_id: i32) -> Self {
        let iteration: IterationCounter = Arc::new(AtomicU64::new(0));
        let prefetcher = Arc::new(Prefetcher::new(
            Arc::clone(&engine),
            Arc::clone(&iteration),
            config.num_loop,
        ));
        let temp_bytes = config.temp_bytes();
        // Claimed up front, before `start_binding` ever probes available
        // memory, so the fake-memory claim never starves the scratch buffer.
        let temp_memory = engine
            .allocator()
            .malloc(device_id, temp_bytes)
            .unwrap_or_else(|_| panic!("failed to allocate {temp_bytes} scratch bytes"));
        DptrManager {
            engine,
            prefetcher,
            iteration,
            device_id,
            temp_bytes,
            temp_memory: Mutex::new(temp_memory),
            temp_handles: Mutex::new(HashSet::new()),
            unalloced: Mutex::new(HashSet::new()),
            dptr_size: Mutex::new(HashMap::new()),
            dptr_mapping: Mutex::new(HashMap::new()),
            dptr_dev_id: Mutex::new(HashMap::new()),
            node_history: Mutex::new(Vec::new()),
            node_handles: Mutex::new(HashMap::new()),
            cur_node: Mutex::new(None),
            cur_nid_idx: Mutex::new(0),
            fake_memory: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<SwapEngine<A, O>> {
        &self.engine
    }

    fn iteration_idx(&self) -> u64 {
        self.iteration.load(Ordering::SeqCst)
    }

    /// `Alloc`: reserves bookkeeping for a new handle. Iteration 0 assigns a
    /// symbolic placeholder; iteration 1 hands out space in the scratch
    /// buffer; any later iteration is fatal for a non-temporary handle,
    /// since by then every real handle should already have a device
    /// pointer from iteration 0's `SetDptr` calls.
    pub fn alloc(&self, id: Handle, size: usize) -> DevPtr {
        match self.iteration_idx() {
            0 => {
                let ptr = DevPtr::Symbolic(id);
                self.dptr_size.lock().unwrap().insert(id, size);
                self.unalloced.lock().unwrap().insert(id);
                self.set_dptr(id, ptr, self.device_id);
                ptr
            }
            1 => {
                assert!(
                    size <= self.temp_bytes,
                    "temporary memory too small: need {size}, have {}",
                    self.temp_bytes
                );
                self.temp_handles.lock().unwrap().insert(id);
                self.temp_dptr()
            }
            idx => panic!("Alloc called for non-temporary handle {id} in iteration {idx}"),
        }
    }

    fn temp_dptr(&self) -> DevPtr {
        *self.temp_memory.lock().unwrap()
    }

    /// `Free`: releases a handle's bookkeeping. Temporary handles (iteration
    /// 1 scratch usage) are not tracked by the swap engine at all and are a
    /// silent no-op, matching their `Alloc` never having gone through
    /// `SetDptr`.
    pub fn free(&self, id: Handle) -> Option<DevPtr> {
        if self.temp_handles.lock().unwrap().contains(&id) {
            return None;
        }
        let ptr = self
            .dptr_mapping
            .lock()
            .unwrap()
            .remove(&id)
            .unwrap_or_else(|| panic!("Free: unknown handle {id}"));
        self.engine.del_addr(id);
        Some(ptr)
    }

    /// `StartBinding`: probes available device memory and claims the
    /// largest chunk the allocator will grant, standing in for every real
    /// tensor during graph construction so iteration 0 never contends for
    /// device memory with anything else.
    pub fn start_binding(&self) {
        let (total, mut avail) = self.engine.allocator().mem_get_info(self.device_id);
        tracing::debug!(total, avail, "start_binding: probing device memory");
        const DELTA: usize = 1_000_000_000;
        while avail > 0 && !self.engine.allocator().try_allocate(self.device_id, avail) {
            avail = avail.saturating_sub(DELTA);
        }
        let ptr = self
            .engine
            .allocator()
            .malloc(self.device_id, avail)
            .unwrap_or_else(|_| panic!("fake-memory allocation of {avail} bytes failed"));
        *self.fake_memory.lock().unwrap() = Some((ptr, avail));
        tracing::info!(bytes = avail, "start_binding: allocated fake memory");
    }

    pub fn stop_binding(&self) {
        tracing::debug!("stop_binding");
    }

    pub fn start_iteration(&self) -> u64 {
        let new_idx = self.iteration.fetch_add(1, Ordering::SeqCst) + 1;
        *self.cur_nid_idx.lock().unwrap() = 0;
        tracing::info!(iteration = new_idx, "start_iteration");
        new_idx
    }

    pub fn stop_iteration(&self) {
        let idx = self.iteration_idx();
        if idx == 1 {
            if let Some((ptr, size)) = self.fake_memory.lock().unwrap().take() {
                self.engine.allocator().free(self.device_id, ptr, size);
                tracing::info!("stop_iteration: fake memory freed");
            }
        }
        tracing::info!(
            iteration = idx,
            node_history_len = self.node_history.lock().unwrap().len(),
            "stop_iteration"
        );
    }

    pub fn statistics(&self) {
        let stats = self.engine.stats();
        tracing::info!(
            num_swap_in = stats.num_swap_in,
            num_swap_out = stats.num_swap_out,
            swap_in_bytes = stats.swap_in_total_bytes,
            swap_out_bytes = stats.swap_out_total_bytes,
            num_get_addr = stats.num_get_addr,
            "statistics"
        );
    }

    /// `RegisterEntry`: a hook for the executor to describe a scheduling
    /// decision. Unused by this engine — kept as a stub so the façade's
    /// call sites don't need a feature check.
    pub fn register_entry(&self, _nid: NodeId, _handle: Handle) {}

    pub fn finish(&self) {
        self.prefetcher.join();
    }

    /// `NotifyBegin`: the executor is about to run node `nid`.
    pub fn notify_begin(&self, nid: NodeId, name: impl Into<String>) {
        let idx = self.iteration_idx();
        let key = (nid, name.into());
        *self.cur_node.lock().unwrap() = Some(key.clone());

        if idx == 1 {
            self.node_history.lock().unwrap().push(key.clone());
        }
        if idx == 2 {
            let handles = self
                .node_handles
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .unwrap_or_default();
            self.engine.start_computing(&handles);
        }
        if idx >= 2 {
            let cur = *self.cur_nid_idx.lock().unwrap();
            let history = self.node_history.lock().unwrap();
            if let Some(expected) = history.get(cur) {
                tracing::trace!(
                    cur_nid_idx = cur,
                    expected_node = expected.0,
                    expected_name = %expected.1,
                    "notify_begin"
                );
            }
        }
    }

    /// `NotifyDone`: the executor just finished node `nid`.
    pub fn notify_done(&self, _nid: NodeId) {
        let idx = self.iteration_idx();
        let key = self
            .cur_node
            .lock()
            .unwrap()
            .clone()
            .expect("NotifyDone called before NotifyBegin");
        let handles = self
            .node_handles
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default();

        if idx == 1 {
            self.prefetcher.push_handles_to_prefetch(&handles);
        }
        if idx >= 2 {
            let cur = *self.cur_nid_idx.lock().unwrap();
            let history_len = self.node_history.lock().unwrap().len();
            assert!(cur < history_len, "NotifyDone past the recorded node history");
            self.engine.stop_computing(&handles);
            if idx >= 3 {
                self.prefetcher.signal_continue();
            } else if history_len >= 2 && cur == history_len - 2 {
                tracing::info!("notify_done: starting prefetcher");
                self.prefetcher.start();
            }
        }
        *self.cur_nid_idx.lock().unwrap() += 1;
    }

    /// `GetDptr`: resolves `id` to a device pointer for the current
    /// iteration phase.
    pub fn get_dptr(&self, id: Handle) -> DevPtr {
        if self.temp_handles.lock().unwrap().contains(&id) {
            return self.temp_dptr();
        }

        match self.iteration_idx() {
            0 => self
                .fake_memory
                .lock()
                .unwrap()
                .map(|(ptr, _)| ptr)
                .expect("GetDptr called in iteration 0 before start_binding"),
            1 => {
                let dev = *self
                    .dptr_dev_id
                    .lock()
                    .unwrap()
                    .get(&id)
                    .unwrap_or_else(|| panic!("{id} was never SetDptr'd"));
                assert_ne!(dev, HOST_ONLY_DEVICE, "{id} is allocated for CPU only");
                let key = self
                    .cur_node
                    .lock()
                    .unwrap()
                    .clone()
                    .expect("GetDptr called before NotifyBegin");
                self.node_handles
                    .lock()
                    .unwrap()
                    .entry(key)
                    .or_default()
                    .insert(id);
                self.fake_memory
                    .lock()
                    .unwrap()
                    .map(|(ptr, _)| ptr)
                    .expect("fake memory missing during trace-capture")
            }
            2 => {
                let newly_resident = self.unalloced.lock().unwrap().remove(&id);
                if newly_resident {
                    let dev = *self
                        .dptr_dev_id
                        .lock()
                        .unwrap()
                        .get(&id)
                        .unwrap_or_else(|| panic!("{id} was never SetDptr'd"));
                    assert_ne!(dev, HOST_ONLY_DEVICE, "{id} is allocated for CPU only");
                    let size = *self.dptr_size.lock().unwrap().get(&id).unwrap();
                    let new_ptr = self.alloc_device(size);
                    self.dptr_mapping.lock().unwrap().insert(id, new_ptr);
                    self.engine.set_addr(id, new_ptr, size, self.device_id, false);
                    new_ptr
                } else {
                    let new_ptr = self
                        .engine
                        .get_addr(id, GetAddrMode::Alloc)
                        .unwrap_or_else(|e| panic!("GetDptr: {e}"));
                    self.dptr_mapping.lock().unwrap().insert(id, new_ptr);
                    new_ptr
                }
            }
            _ => {
                let new_ptr = self
                    .engine
                    .get_addr(id, GetAddrMode::Normal)
                    .unwrap_or_else(|e| panic!("GetDptr: {e}"));
                self.dptr_mapping.lock().unwrap().insert(id, new_ptr);
                new_ptr
            }
        }
    }

    fn alloc_device(&self, size: usize) -> DevPtr {
        self.engine.swap_out(size, self.device_id, false);
        self.engine
            .allocator()
            .malloc(self.device_id, size)
            .unwrap_or_else(|_| panic!("allocator Malloc failed for {size} bytes after SwapOut"))
    }

    /// `SetDptr`: records `id`'s device pointer directly, creating its
    /// `SwapInfo` record. Only ever called during iteration 0.
    pub fn set_dptr(&self, id: Handle, ptr: DevPtr, dev_id: i32) {
        if let Some((fake_ptr, _)) = *self.fake_memory.lock().unwrap() {
            assert_ne!(ptr, fake_ptr, "fake memory reassigned to a real handle");
        }
        let size = if dev_id != HOST_ONLY_DEVICE {
            *self
                .dptr_size
                .lock()
                .unwrap()
                .get(&id)
                .expect("missing recorded size for SetDptr")
        } else {
            0
        };
        self.dptr_dev_id.lock().unwrap().insert(id, dev_id);
        self.dptr_mapping.lock().unwrap().insert(id, ptr);
        self.engine.set_addr(id, ptr, size, dev_id, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SimAllocator;
    use crate::victim::LruOracle;

    fn manager(capacity: usize, temp_bytes: usize) -> DptrManager<SimAllocator, LruOracle> {
        let gib = 1024.0 * 1024.0 * 1024.0;
        let config = SwapConfig {
            swap_async: false,
            num_loop: 2,
            gpu_temp_ratio: temp_bytes as f64 / gib,
            ..SwapConfig::default()
        };
        let engine = Arc::new(SwapEngine::new(
            Arc::new(SimAllocator::single(0, capacity)),
            Arc::new(LruOracle::new()),
            config.clone(),
        ));
        DptrManager::new(engine, &config, 0)
    }

    // S6 — double-create rejection: iteration 0's Alloc always assigns a
    // fresh symbolic pointer, so allocating the same handle twice is fatal.
    #[test]
    fn double_alloc_in_iteration_zero_is_fatal() {
        let mgr = manager(1000, 64);
        mgr.start_binding();
        mgr.alloc(1, 64);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            mgr.alloc(1, 64);
        }));
        assert!(result.is_err());
    }

    // S5 — three-iteration run: iteration 0 is symbolic, iteration 1
    // records history and builds the prefetch sequence, iteration 2
    // performs the first real allocations.
    #[test]
    fn iteration_zero_and_one_never_touch_real_memory() {
        let mgr = manager(16, 8); // too small for any real tensor
        mgr.start_binding();
        let assigned = mgr.alloc(1, 1_000_000);
        assert_eq!(assigned, DevPtr::Symbolic(1));
        // GetDptr during iteration 0 always answers with the fake buffer,
        // never the handle's own symbolic placeholder.
        assert_ne!(mgr.get_dptr(1), DevPtr::Symbolic(1));
        mgr.stop_binding();

        mgr.start_iteration(); // -> 1
        mgr.notify_begin(0, "op0");
        let _ = mgr.get_dptr(1);
        mgr.notify_done(0);
        mgr.stop_iteration();

        assert_eq!(mgr.node_history.lock().unwrap().len(), 1);
        assert!(!mgr.node_handles.lock().unwrap().is_empty());
    }

    #[test]
    fn temporary_handles_share_one_scratch_buffer() {
        let mgr = manager(1000, 128);
        mgr.start_binding();
        mgr.stop_binding();
        mgr.start_iteration(); // -> 1
        let a = mgr.alloc(10, 64);
        let b = mgr.alloc(11, 64);
        assert_eq!(a, b);
        assert!(mgr.free(10).is_none());
    }
}
