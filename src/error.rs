use crate::handle::Handle;

/// Errors the swap subsystem can surface to a caller.
///
/// Only [`OdSwapError::OutOfSwappable`] is a condition callers are expected
/// to recover from (by making progress elsewhere and retrying). Every other
/// variant indicates a logic bug in the surrounding engine — a handle used
/// out of protocol, or memory pressure that should have been impossible
/// after eviction — and callers should treat them as fatal, not retry them.
#[derive(thiserror::Error, Debug)]
pub enum OdSwapError {
    #[error("no swappable handle available on device {device} to satisfy {required_bytes} bytes")]
    OutOfSwappable { device: i32, required_bytes: usize },

    #[error("handle {0} already has a SwapInfo record (double SetAddr(pre=true))")]
    DoubleCreate(Handle),

    #[error("handle {0} has no SwapInfo record")]
    UnknownHandle(Handle),

    #[error("StopComputing called on handle {0} with lock_count already zero")]
    UnlockedStop(Handle),

    #[error("allocator failed to materialize {size} bytes on device {device} after eviction made room")]
    AllocatorFailure { device: i32, size: usize },

    #[error("unknown memory pool type: {0}")]
    UnknownPoolType(String),
}
