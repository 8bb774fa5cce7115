//! Background maintenance: reclaim retired value buffers, reap idle iterators
//!
//! Writers retire replaced buffers instead of freeing them; a buffer becomes
//! reusable only after every epoch operation that could have observed it has
//! ended. The maintenance thread drives that reclamation on a fixed cadence
//! so memory is recovered even when write traffic stops, and drops range
//! iterators that were abandoned without `close_scan`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::engine::RadixTreeEngine;
use crate::error::{EngineError, EngineResult};

/// Handle to a running maintenance thread.
/// Dropping this handle signals the thread to stop.
pub struct MaintenanceHandle {
    shutdown: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Request shutdown and wait for the thread to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Check if the maintenance thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Maintenance passes completed so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the maintenance thread for `engine`.
///
/// Every `cadence` the thread runs [`RadixTreeEngine::maintenance`]. A final
/// pass runs on shutdown.
pub fn start_maintenance(
    engine: Arc<RadixTreeEngine>,
    cadence: Duration,
) -> EngineResult<MaintenanceHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let cycles = Arc::new(AtomicU64::new(0));
    let shutdown_clone = Arc::clone(&shutdown);
    let cycles_clone = Arc::clone(&cycles);

    let thread = thread::Builder::new()
        .name("famstore-maintenance".to_string())
        .spawn(move || maintenance_loop(engine, cadence, shutdown_clone, cycles_clone))
        .map_err(|e| EngineError::Spawn { message: e.to_string() })?;

    Ok(MaintenanceHandle {
        shutdown,
        cycles,
        thread: Some(thread),
    })
}

fn maintenance_loop(
    engine: Arc<RadixTreeEngine>,
    cadence: Duration,
    shutdown: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
) {
    let poll = cadence.min(Duration::from_millis(50));
    info!(pool = %engine.config().pool_id, ?cadence, "maintenance thread started");

    loop {
        // Sleep for the cadence, checking shutdown periodically
        let wake_time = Instant::now() + cadence;
        while Instant::now() < wake_time {
            if shutdown.load(Ordering::Acquire) {
                run_pass(&engine, &cycles);
                info!(cycles = cycles.load(Ordering::Relaxed), "maintenance thread stopped");
                return;
            }
            thread::sleep(poll);
        }
        run_pass(&engine, &cycles);
    }
}

fn run_pass(engine: &RadixTreeEngine, cycles: &AtomicU64) {
    let report = engine.maintenance();
    cycles.fetch_add(1, Ordering::Relaxed);
    if report.reclaimed_blocks > 0 || report.reaped_iterators > 0 {
        debug!(
            reclaimed = report.reclaimed_blocks,
            reaped = report.reaped_iterators,
            "maintenance pass"
        );
    }
}
