//! Workers poll a shared stop flag; a persistent counter records how many
//! iterations ran across all runs of the example.
//!
//! Start it in several terminals: later instances attach to the flag the
//! first one created. Stop them all from anywhere with
//! `shvar_monitor --segment shvar_example set stopRunning true`.

use shvar::config::RegistryConfig;
use shvar_registry::{Registry, SharedVar, ShmResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

fn main() -> ShmResult<()> {
    shvar_registry::init_tracing();

    let mut config = RegistryConfig::named("shvar_example");
    config.apply_env_overrides()?;
    let registry = Registry::open(&config)?;

    let stop = SharedVar::<AtomicBool>::builder("stopRunning")
        .description("Set to stop every example worker")
        .open(&registry)?;
    let iterations = SharedVar::<AtomicU64>::builder("exampleIterations")
        .description("Total loop iterations, all runs")
        .persistent(true)
        .open(&registry)?;

    info!(
        "stopRunning={} (created here: {}), exampleIterations={}",
        stop,
        stop.is_owner(),
        iterations
    );

    while !stop.load(Ordering::Acquire) {
        let n = iterations.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 50 == 0 {
            info!("{} iterations so far", n);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("Stop requested after {} iterations", iterations);
    Ok(())
}
