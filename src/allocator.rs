//! The `Allocator` capability: raw device alloc/free and DMA primitives.
//!
//! The raw device allocator is treated as an external collaborator assumed
//! available to the process. This module defines that capability as a trait
//! so [`crate::swap_engine::SwapEngine`] can be driven against a real GPU
//! backend in production and against [`SimAllocator`] in tests and the demo
//! binary. `SimAllocator` uses `candle_core` tensors as the physical backing
//! store for "device" bytes, so a swap round-trip actually preserves payload
//! contents instead of merely bookkeeping sizes.

use std::collections::HashMap;
use std::sync::Mutex;

use candle_core::{DType, Device as CandleDevice, Tensor};

use crate::error::OdSwapError;
use crate::handle::DevPtr;

/// One of the two device-private DMA streams allocated per device, one for
/// outbound (device-to-host) traffic and one for inbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream {
    pub device: i32,
    pub out: bool,
}

/// Raw device allocation and DMA primitives.
///
/// Implementors must be safe to call from the executor threads, the
/// prefetcher thread, and `SwapEngine` itself concurrently; `SwapEngine`
/// never holds its own table lock while calling into an `Allocator`.
pub trait Allocator: Send + Sync {
    /// Allocate `size` bytes on `device`. Fails only if the device truly has
    /// no room; `SwapOut` is expected to have already made room before this
    /// is called, so a failure here is classified as fatal by
    /// [`crate::error::OdSwapError::AllocatorFailure`] at the call site.
    fn malloc(&self, device: i32, size: usize) -> Result<DevPtr, OdSwapError>;

    /// Release a previously-`malloc`'d allocation.
    fn free(&self, device: i32, ptr: DevPtr, size: usize);

    /// Synchronous device-to-host copy.
    fn memcpy_d2h(&self, device: i32, dst: &mut [u8], src: DevPtr);

    /// Synchronous host-to-device copy.
    fn memcpy_h2d(&self, device: i32, dst: DevPtr, src: &[u8]);

    /// Asynchronous device-to-host copy, queued on `stream`.
    fn memcpy_d2h_async(&self, device: i32, dst: &mut [u8], src: DevPtr, stream: Stream) {
        self.memcpy_d2h(device, dst, src);
    }

    /// Asynchronous host-to-device copy, queued on `stream`.
    fn memcpy_h2d_async(&self, device: i32, dst: DevPtr, src: &[u8], stream: Stream) {
        self.memcpy_h2d(device, dst, src);
    }

    /// Block until every operation queued on `stream` has completed.
    fn stream_synchronize(&self, device: i32, stream: Stream);

    /// `(total_bytes, available_bytes)` for `device`.
    fn mem_get_info(&self, device: i32) -> (usize, usize);

    /// Non-mutating check: would `malloc(device, size)` succeed right now?
    fn try_allocate(&self, device: i32, size: usize) -> bool;
}

struct DeviceState {
    capacity: usize,
    used: usize,
    blocks: HashMap<usize, Tensor>,
    next_addr: usize,
}

impl DeviceState {
    fn new(capacity: usize) -> Self {
        DeviceState {
            capacity,
            used: 0,
            blocks: HashMap::new(),
            next_addr: 1,
        }
    }
}

/// In-process device-memory simulator used by tests and the demo binary.
///
/// Backs each "device" allocation with a `candle_core` `U8` tensor on the
/// CPU device, sized exactly to the handle's payload rather than a fixed
/// page.
pub struct SimAllocator {
    devices: Mutex<HashMap<i32, DeviceState>>,
}

impl SimAllocator {
    /// Build a simulator where each listed `(device_id, capacity_bytes)`
    /// pair gets its own independent budget.
    pub fn new(capacities: impl IntoIterator<Item = (i32, usize)>) -> Self {
        let devices = capacities
            .into_iter()
            .map(|(dev, cap)| (dev, DeviceState::new(cap)))
            .collect();
        SimAllocator {
            devices: Mutex::new(devices),
        }
    }

    /// Single-device convenience constructor.
    pub fn single(device: i32, capacity_bytes: usize) -> Self {
        Self::new([(device, capacity_bytes)])
    }
}

impl Allocator for SimAllocator {
    fn malloc(&self, device: i32, size: usize) -> Result<DevPtr, OdSwapError> {
        let mut devices = self.devices.lock().unwrap();
        let state = devices
            .get_mut(&device)
            .unwrap_or_else(|| panic!("SimAllocator: unknown device {device}"));
        if state.used + size > state.capacity {
            return Err(OdSwapError::AllocatorFailure { device, size });
        }
        let tensor = Tensor::zeros((size,), DType::U8, &CandleDevice::Cpu)
            .map_err(|_| OdSwapError::AllocatorFailure { device, size })?;
        let addr = state.next_addr;
        state.next_addr += 1;
        state.blocks.insert(addr, tensor);
        state.used += size;
        tracing::trace!(device, addr, size, "malloc");
        Ok(DevPtr::Real(addr))
    }

    fn free(&self, device: i32, ptr: DevPtr, size: usize) {
        let DevPtr::Real(addr) = ptr else {
            panic!("SimAllocator::free called on a symbolic pointer");
        };
        let mut devices = self.devices.lock().unwrap();
        let state = devices
            .get_mut(&device)
            .unwrap_or_else(|| panic!("SimAllocator: unknown device {device}"));
        if state.blocks.remove(&addr).is_some() {
            state.used = state.used.saturating_sub(size);
        }
        tracing::trace!(device, addr, size, "free");
    }

    fn memcpy_d2h(&self, device: i32, dst: &mut [u8], src: DevPtr) {
        let DevPtr::Real(addr) = src else {
            panic!("SimAllocator::memcpy_d2h called on a symbolic pointer");
        };
        let devices = self.devices.lock().unwrap();
        let state = devices
            .get(&device)
            .unwrap_or_else(|| panic!("SimAllocator: unknown device {device}"));
        let tensor = state
            .blocks
            .get(&addr)
            .unwrap_or_else(|| panic!("SimAllocator: dangling device address {addr}"));
        let bytes = tensor.to_vec1::<u8>().expect("U8 tensor to_vec1");
        dst.copy_from_slice(&bytes[..dst.len()]);
    }

    fn memcpy_h2d(&self, device: i32, dst: DevPtr, src: &[u8]) {
        let DevPtr::Real(addr) = dst else {
            panic!("SimAllocator::memcpy_h2d called on a symbolic pointer");
        };
        let tensor = Tensor::from_slice(src, (src.len(),), &CandleDevice::Cpu)
            .expect("from_slice U8");
        let mut devices = self.devices.lock().unwrap();
        let state = devices
            .get_mut(&device)
            .unwrap_or_else(|| panic!("SimAllocator: unknown device {device}"));
        state.blocks.insert(addr, tensor);
    }

    fn stream_synchronize(&self, device: i32, stream: Stream) {
        tracing::trace!(device, out = stream.out, "stream_synchronize");
    }

    fn mem_get_info(&self, device: i32) -> (usize, usize) {
        let devices = self.devices.lock().unwrap();
        let state = devices
            .get(&device)
            .unwrap_or_else(|| panic!("SimAllocator: unknown device {device}"));
        (state.capacity, state.capacity - state.used)
    }

    fn try_allocate(&self, device: i32, size: usize) -> bool {
        let devices = self.devices.lock().unwrap();
        let state = devices
            .get(&device)
            .unwrap_or_else(|| panic!("SimAllocator: unknown device {device}"));
        state.used + size <= state.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_and_round_trip() {
        let alloc = SimAllocator::single(0, 1024);
        let ptr = alloc.malloc(0, 64).expect("malloc");
        let payload = vec![7u8; 64];
        alloc.memcpy_h2d(0, ptr, &payload);
        let mut back = vec![0u8; 64];
        alloc.memcpy_d2h(0, &mut back, ptr);
        assert_eq!(payload, back);
    }

    #[test]
    fn try_allocate_respects_capacity() {
        let alloc = SimAllocator::single(0, 100);
        assert!(alloc.try_allocate(0, 100));
        assert!(!alloc.try_allocate(0, 101));
        let _ptr = alloc.malloc(0, 60).expect("malloc");
        assert!(!alloc.try_allocate(0, 50));
        assert!(alloc.try_allocate(0, 40));
    }

    #[test]
    fn malloc_fails_over_capacity() {
        let alloc = SimAllocator::single(0, 10);
        let err = alloc.malloc(0, 20).expect_err("should not fit");
        assert!(matches!(err, OdSwapError::AllocatorFailure { .. }));
    }
}
