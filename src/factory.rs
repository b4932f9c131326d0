//! Builds a [`DptrManager`] for a given [`PoolType`].
//!
//! `Naive`, `Round`, and `SwapOnDemand` all resolve to the same on-demand
//! manager — this crate implements only that one strategy. `SwapAdv` (the
//! swap-advisor variant, which plans eviction ahead of time from a profiled
//! graph rather than reacting to misses) has no implementation here and is
//! rejected rather than silently falling back.

use std::sync::Arc;

use crate::allocator::Allocator;
use crate::config::{PoolType, SwapConfig};
use crate::dptr_manager::DptrManager;
use crate::error::OdSwapError;
use crate::swap_engine::SwapEngine;
use crate::victim::VictimOracle;

pub fn build_dptr_manager<A, O>(
    engine: Arc<SwapEngine<A, O>>,
    config: &SwapConfig,
    device_id: i32,
) -> Result<DptrManager<A, O>, OdSwapError>
where
    A: Allocator + 'static,
    O: VictimOracle + 'static,
{
    match config.pool_type {
        PoolType::Naive | PoolType::Round | PoolType::SwapOnDemand => {
            Ok(DptrManager::new(engine, config, device_id))
        }
        PoolType::SwapAdv => Err(OdSwapError::UnknownPoolType("SwapAdv".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SimAllocator;
    use crate::victim::LruOracle;

    fn engine(config: &SwapConfig) -> Arc<SwapEngine<SimAllocator, LruOracle>> {
        Arc::new(SwapEngine::new(
            Arc::new(SimAllocator::single(0, 1_000_000)),
            Arc::new(LruOracle::new()),
            config.clone(),
        ))
    }

    #[test]
    fn swap_on_demand_builds_a_manager() {
        let config = SwapConfig {
            pool_type: PoolType::SwapOnDemand,
            gpu_temp_ratio: 64.0 / (1024.0 * 1024.0 * 1024.0),
            ..SwapConfig::default()
        };
        let eng = engine(&config);
        assert!(build_dptr_manager(eng, &config, 0).is_ok());
    }

    #[test]
    fn swap_adv_is_rejected() {
        let config = SwapConfig {
            pool_type: PoolType::SwapAdv,
            gpu_temp_ratio: 64.0 / (1024.0 * 1024.0 * 1024.0),
            ..SwapConfig::default()
        };
        let eng = engine(&config);
        let err = build_dptr_manager(eng, &config, 0).expect_err("SwapAdv is unimplemented");
        assert!(matches!(err, OdSwapError::UnknownPoolType(_)));
    }
}
