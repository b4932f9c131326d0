//! The prefetcher: a background thread that replays the handle-access
//! sequence recorded during trace-capture, swapping each handle in ahead of
//! when the computation actually needs it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::allocator::Allocator;
use crate::handle::{GetAddrMode, Handle};
use crate::rendezvous::Semaphore;
use crate::swap_engine::SwapEngine;
use crate::victim::VictimOracle;

/// Shared with `DptrManager`: the current iteration index, incremented once
/// per `start_iteration()` call.
pub type IterationCounter = Arc<AtomicU64>;

/// Replays `prefetch_sequence` — one `Vec<Handle>` per computation node,
/// recorded in the order nodes finished during trace-capture — against the
/// engine, one node at a time.
pub struct Prefetcher<A: Allocator + 'static, O: VictimOracle + 'static> {
    engine: Arc<SwapEngine<A, O>>,
    sequence: Mutex<Vec<Vec<Handle>>>,
    cursor: Mutex<(usize, usize)>,
    sem: Semaphore,
    num_loop: u64,
    iteration: IterationCounter,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<A, O> Prefetcher<A, O>
where
    A: Allocator + 'static,
    O: VictimOracle + 'static,
{
    pub fn new(engine: Arc<SwapEngine<A, O>>, iteration: IterationCounter, num_loop: u64) -> Self {
        Prefetcher {
            engine,
            sequence: Mutex::new(Vec::new()),
            cursor: Mutex::new((0, 0)),
            sem: Semaphore::new(1),
            num_loop,
            iteration,
            worker: Mutex::new(None),
        }
    }

    /// Appends one node's handle set as the next entry in the replay
    /// sequence. Called once per node during trace-capture.
    pub fn push_handles_to_prefetch(&self, handles: &HashSet<Handle>) {
        let mut seq = self.sequence.lock().unwrap();
        seq.push(handles.iter().copied().collect());
    }

    /// Wakes the prefetcher if it is backed off waiting for room.
    pub fn signal_continue(&self) {
        tracing::trace!("prefetch: signal_continue");
        self.sem.post();
    }

    /// Spawns the background replay thread. Must be called after at least
    /// one sequence entry has been pushed.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let join = thread::Builder::new()
            .name("odswap_prefetcher".into())
            .spawn(move || this.run())
            .expect("failed to spawn prefetcher thread");
        *self.worker.lock().unwrap() = Some(join);
    }

    /// Blocks until the replay thread exits (reached the last node of the
    /// configured final iteration).
    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn run(&self) {
        tracing::info!("prefetch: started");
        loop {
            let target = {
                let cursor = self.cursor.lock().unwrap();
                let seq = self.sequence.lock().unwrap();
                seq[cursor.0][cursor.1]
            };
            tracing::trace!(handle = target, "prefetch: attempting");
            match self.engine.get_addr(target, GetAddrMode::Prefetch) {
                Ok(_) => {
                    tracing::trace!(handle = target, "prefetch: success");
                    if self.advance() {
                        break;
                    }
                }
                Err(_) => {
                    tracing::trace!(handle = target, "prefetch: no room, backing off");
                    self.sem.wait();
                }
            }
        }
        tracing::info!("prefetch: stopped");
    }

    /// Advances the cursor past the handle just admitted. Returns `true`
    /// once the end of the sequence is reached during the configured final
    /// iteration.
    fn advance(&self) -> bool {
        let mut cursor = self.cursor.lock().unwrap();
        let seq = self.sequence.lock().unwrap();
        cursor.1 += 1;
        if cursor.1 == seq[cursor.0].len() {
            cursor.1 = 0;
            cursor.0 += 1;
            if cursor.0 == seq.len() {
                if self.iteration.load(Ordering::SeqCst) == self.num_loop {
                    return true;
                }
                cursor.0 = 0;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SimAllocator;
    use crate::config::SwapConfig;
    use crate::victim::LruOracle;
    use std::time::Duration;

    fn create(eng: &SwapEngine<SimAllocator, LruOracle>, handle: Handle, size: usize) {
        let ptr = eng.allocator().malloc(0, size).unwrap();
        eng.set_addr(handle, ptr, size, 0, true);
        let set = [handle].into_iter().collect::<HashSet<_>>();
        eng.start_computing(&set);
        eng.stop_computing(&set);
    }

    // S4/S5 — prefetch backpressure: h2 is evicted and the device is then
    // filled with three locked handles (h1, h3, h4), leaving nothing
    // swappable. The prefetcher must block on a cache miss and resume only
    // once `signal_continue` follows a `StopComputing` that frees a victim.
    #[test]
    fn backpressure_resumes_after_signal_continue() {
        let engine = Arc::new(SwapEngine::new(
            Arc::new(SimAllocator::single(0, 60)),
            Arc::new(LruOracle::new()),
            SwapConfig {
                swap_async: false,
                ..SwapConfig::default()
            },
        ));
        create(&engine, 1, 20);
        create(&engine, 2, 20);
        create(&engine, 3, 20);

        let locked = [1, 3].into_iter().collect::<HashSet<_>>();
        engine.start_computing(&locked);
        assert!(engine.swap_out(20, 0, false));
        assert!(!engine.is_resident(2));

        let ptr4 = engine.allocator().malloc(0, 20).unwrap();
        engine.set_addr(4, ptr4, 20, 0, true);
        engine.start_computing(&[4].into_iter().collect());

        let prefetcher = Arc::new(Prefetcher::new(
            Arc::clone(&engine),
            Arc::new(AtomicU64::new(0)),
            0,
        ));
        prefetcher.push_handles_to_prefetch(&[2].into_iter().collect());
        prefetcher.start();

        thread::sleep(Duration::from_millis(30));
        assert!(!engine.is_resident(2), "h2 must stay blocked with nothing swappable");

        engine.stop_computing(&[1].into_iter().collect());
        prefetcher.signal_continue();
        prefetcher.join();

        assert!(engine.is_resident(2));
        assert!(!engine.is_resident(1), "h1 should have been evicted to admit h2");
    }
}
