use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide unique identifier for a logical tensor. Stable across swaps,
/// never reused.
pub type Handle = u64;

/// Host-only sentinel for [`SwapInfo::device_id`] — never swapped.
pub const HOST_ONLY_DEVICE: i32 = -1;

/// A device pointer, or the symbolic placeholder a handle is assigned during
/// iteration 0, before any buffer has been materialized. Kept as a distinct
/// variant rather than aliasing the handle id into pointer space, so the
/// type system rejects an accidental dereference of a pre-materialization
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevPtr {
    /// A real, resident device address.
    Real(usize),
    /// Iteration-0 placeholder: stands in for `handle_id` as an opaque key.
    /// Must never be dereferenced.
    Symbolic(Handle),
}

impl DevPtr {
    pub fn is_symbolic(&self) -> bool {
        matches!(self, DevPtr::Symbolic(_))
    }
}

/// Selects which branch of `GetAddr` applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetAddrMode {
    /// Ordinary steady-state consumer read: block on a miss.
    Normal,
    /// Iteration-2 just-in-time materialization: swap in on a miss.
    Alloc,
    /// Prefetcher replay: swap in on a miss and pin the handle.
    Prefetch,
}

/// Per-handle spin-style mutual exclusion flag: at most one in-flight swap
/// per handle, tested and set without holding the table lock across the
/// wait. An `AtomicBool` test-and-set gives callers a non-blocking
/// `try_acquire`; `SwapEngine` backs off with a short sleep on contention.
#[derive(Debug, Default)]
pub struct SwappingFlag(AtomicBool);

impl SwappingFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Test-and-set. Returns `true` if the flag was already held.
    pub fn test_and_set(&self) -> bool {
        self.0.swap(true, Ordering::AcqRel)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The per-handle record tracked by the swap engine's handle table.
#[derive(Debug)]
pub struct SwapInfo {
    pub handle_id: Handle,
    pub swapped_in: bool,
    pub device_id: i32,
    pub dptr: DevPtr,
    /// Pinned-host backing, lazily allocated on first eviction. `None` until
    /// the handle has been swapped out at least once.
    pub cpu_address: Option<Vec<u8>>,
    pub size: usize,
    pub swap_count: u64,
    pub is_swapping: SwappingFlag,
    pub is_waiting: bool,
    /// Reentrant pin counter. Kept inline on the record rather than a
    /// separate side table for simplicity; `SwapEngine` is the sole mutator.
    pub lock_count: u32,
}

impl SwapInfo {
    pub fn new(handle_id: Handle, dptr: DevPtr, size: usize, device_id: i32) -> Self {
        SwapInfo {
            handle_id,
            swapped_in: true,
            device_id,
            dptr,
            cpu_address: None,
            size,
            swap_count: 0,
            is_swapping: SwappingFlag::new(),
            is_waiting: false,
            lock_count: 0,
        }
    }

    pub fn is_host_only(&self) -> bool {
        self.device_id == HOST_ONLY_DEVICE
    }
}
