//! Configuration layer.
//!
//! Defaults are layered: built-in defaults, then an optional TOML file, then
//! environment-variable overrides — the environment always wins. The file
//! layer sits under the env overrides so a checked-in config can set
//! reasonable defaults for a deployment while still letting an operator
//! override a single knob at launch.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::OdSwapError;

/// Which `DptrManager` variant [`crate::factory::DptrManagerFactory`]
/// should build (`MXNET_GPU_MEM_POOL_TYPE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolType {
    Naive,
    Round,
    SwapAdv,
    SwapOnDemand,
}

impl PoolType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Naive" => Some(PoolType::Naive),
            "Round" => Some(PoolType::Round),
            "SwapAdv" => Some(PoolType::SwapAdv),
            "SwapOnDemand" => Some(PoolType::SwapOnDemand),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    /// `MXNET_SWAP_ASYNC` — use async DMA + per-device streams.
    pub swap_async: bool,
    /// `MXNET_INFINITE_MEMORY` — diagnostic: skip DMAs entirely.
    pub infinite_memory: bool,
    /// `MXNET_INFINITE_CPU_MEMORY` — diagnostic: pre-allocate pinned host
    /// memory once and reuse it for every evicted handle.
    pub infinite_cpu_memory: bool,
    /// `MXNET_GPU_TEMP_RATIO` — temporary buffer size, in GiB.
    pub gpu_temp_ratio: f64,
    /// `MXNET_NUM_LOOP` — iterations before the prefetcher exits.
    pub num_loop: u64,
    /// `MXNET_GPU_MEM_POOL_TYPE` — manager variant selector.
    pub pool_type: PoolType,
}

impl Default for SwapConfig {
    fn default() -> Self {
        SwapConfig {
            swap_async: true,
            infinite_memory: false,
            infinite_cpu_memory: false,
            gpu_temp_ratio: 3.0,
            num_loop: 10,
            pool_type: PoolType::Naive,
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SwapConfig {
    /// Built-in defaults overridden by environment variables only.
    ///
    /// Fatal (`Err(OdSwapError::UnknownPoolType)`) if `MXNET_GPU_MEM_POOL_TYPE`
    /// is set to an unrecognized value — an unknown pool type is a startup
    /// misconfiguration, not something to silently fall back from.
    pub fn from_env() -> Result<Self, OdSwapError> {
        let base = SwapConfig::default();
        Self::apply_env(base)
    }

    /// Built-in defaults, overridden by a TOML file (if it exists), then by
    /// environment variables.
    pub fn load_with_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let base = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read config file {path:?}: {e}"))?;
            toml::from_str(&text)
                .map_err(|e| format!("failed to parse config file {path:?}: {e}"))?
        } else {
            SwapConfig::default()
        };
        Self::apply_env(base).map_err(|e| e.to_string())
    }

    fn apply_env(mut cfg: SwapConfig) -> Result<Self, OdSwapError> {
        cfg.swap_async = env_bool("MXNET_SWAP_ASYNC", cfg.swap_async);
        cfg.infinite_memory = env_bool("MXNET_INFINITE_MEMORY", cfg.infinite_memory);
        cfg.infinite_cpu_memory = env_bool("MXNET_INFINITE_CPU_MEMORY", cfg.infinite_cpu_memory);
        cfg.gpu_temp_ratio = env_parsed("MXNET_GPU_TEMP_RATIO", cfg.gpu_temp_ratio);
        cfg.num_loop = env_parsed("MXNET_NUM_LOOP", cfg.num_loop);
        if let Ok(raw) = std::env::var("MXNET_GPU_MEM_POOL_TYPE") {
            cfg.pool_type = PoolType::parse(&raw).ok_or(OdSwapError::UnknownPoolType(raw))?;
        }
        Ok(cfg)
    }

    /// Bytes of scratch temporary-buffer memory this config implies.
    pub fn temp_bytes(&self) -> usize {
        (self.gpu_temp_ratio * 1024.0 * 1024.0 * 1024.0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = SwapConfig::default();
        assert!(cfg.swap_async);
        assert!(!cfg.infinite_memory);
        assert!(!cfg.infinite_cpu_memory);
        assert_eq!(cfg.gpu_temp_ratio, 3.0);
        assert_eq!(cfg.num_loop, 10);
        assert_eq!(cfg.pool_type, PoolType::Naive);
    }

    #[test]
    fn unknown_pool_type_in_env_is_fatal() {
        // SAFETY: test runs single-threaded with respect to this var.
        std::env::set_var("MXNET_GPU_MEM_POOL_TYPE", "NotARealPool");
        let result = SwapConfig::from_env();
        std::env::remove_var("MXNET_GPU_MEM_POOL_TYPE");
        assert!(matches!(result, Err(OdSwapError::UnknownPoolType(_))));
    }
}
