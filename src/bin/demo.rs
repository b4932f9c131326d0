//! Drives a `DptrManager` through a small graph across the binding,
//! trace-capture and two steady-state iterations, against a `SimAllocator`.

use std::sync::Arc;

use anyhow::{Context, Result};

use odswap_core::{build_dptr_manager, config::SwapConfig, DptrManager, LruOracle, SimAllocator, SwapEngine};

fn build_manager(device_bytes: usize) -> Result<DptrManager<SimAllocator, LruOracle>> {
    // MXNET_GPU_TEMP_RATIO's 3 GiB default assumes a real GPU; scaled down
    // here so the toy SimAllocator capacity below can actually hold it.
    let mut config = SwapConfig::from_env()?;
    if std::env::var("MXNET_GPU_TEMP_RATIO").is_err() {
        config.gpu_temp_ratio = 512.0 / (1024.0 * 1024.0 * 1024.0);
    }
    let engine = Arc::new(SwapEngine::new(
        Arc::new(SimAllocator::single(0, device_bytes)),
        Arc::new(LruOracle::new()),
        config.clone(),
    ));
    build_dptr_manager(engine, &config, 0).context("building dptr manager")
}

/// A three-node chain graph: op0 produces h1, op1 produces h2 from h1, op2
/// consumes both. During trace-capture (iteration 1) op1 also reserves a
/// scratch handle from the temporary buffer, freed before the node ends.
fn run_graph(mgr: &DptrManager<SimAllocator, LruOracle>, iteration: &str, trace_capture: bool) {
    mgr.notify_begin(0, "op0");
    let _ = mgr.get_dptr(1);
    mgr.notify_done(0);

    mgr.notify_begin(1, "op1");
    let _ = mgr.get_dptr(1);
    let _ = mgr.get_dptr(2);
    if trace_capture {
        mgr.alloc(100, 64);
        mgr.free(100);
    }
    mgr.notify_done(1);

    mgr.notify_begin(2, "op2");
    let _ = mgr.get_dptr(1);
    let _ = mgr.get_dptr(2);
    mgr.notify_done(2);

    tracing::info!(iteration, "graph pass complete");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mgr = build_manager(4096)?;

    // Iteration 0: preparation. Every handle gets a symbolic placeholder and
    // GetDptr answers from the shared fake buffer.
    mgr.start_binding();
    mgr.alloc(1, 256);
    mgr.alloc(2, 256);
    mgr.stop_binding();

    // Iteration 1: trace capture, also builds the prefetch replay sequence.
    mgr.start_iteration();
    run_graph(&mgr, "trace-capture", true);
    mgr.stop_iteration();

    // Iteration 2: first real allocations; the prefetcher starts near the
    // end of this pass.
    mgr.start_iteration();
    run_graph(&mgr, "first-real-pass", false);
    mgr.stop_iteration();

    // Iteration 3: steady state, backed by the prefetcher.
    mgr.start_iteration();
    run_graph(&mgr, "steady-state", false);
    mgr.stop_iteration();

    mgr.statistics();
    let snapshot = mgr.engine().stats();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    mgr.finish();

    Ok(())
}
