//! On-demand GPU tensor swapping.
//!
//! A handle table (see [`handle`]) tracks every tensor known to the engine
//! and whether it currently lives on-device or has been evicted to host
//! memory. [`swap_engine::SwapEngine`] owns that table and the victim
//! selection and DMA machinery; [`prefetcher::Prefetcher`] replays a recorded
//! per-node access sequence in the background to hide swap-in latency behind
//! computation; [`dptr_manager::DptrManager`] is the façade a graph executor
//! actually drives, arbitrating between the binding, trace-capture and
//! steady-state iteration phases on top of one `SwapEngine`.
//!
//! [`allocator::Allocator`] is the seam to the underlying device: production
//! code implements it against a real GPU runtime, tests and
//! [`allocator::SimAllocator`] use `candle_core` tensors as the simulated
//! backing store.

pub mod allocator;
pub mod config;
pub mod dptr_manager;
pub mod error;
pub mod factory;
pub mod handle;
pub mod prefetcher;
pub mod rendezvous;
pub mod swap_engine;
pub mod victim;

pub use allocator::{Allocator, SimAllocator};
pub use config::{PoolType, SwapConfig};
pub use dptr_manager::DptrManager;
pub use error::OdSwapError;
pub use factory::build_dptr_manager;
pub use handle::{DevPtr, GetAddrMode, Handle};
pub use prefetcher::Prefetcher;
pub use swap_engine::SwapEngine;
pub use victim::{LruOracle, VictimOracle};
