//! Graceful shutdown
//!
//! SIGINT/SIGTERM force-destroy the device through a second handle on
//! `/dev/ggctl`. The kernel then fails the blocked `START` with `ECANCELED`
//! and the dispatch loop exits down the revocation path. A second signal
//! exits immediately.

use gatebd::gate::{destroy_unit, ControlChannel, GateCtl};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Install the SIGINT/SIGTERM handler for `unit`.
///
/// The returned flag is set once the operator asked for shutdown.
pub fn install_shutdown_handler(mut ctl: GateCtl, unit: i32) -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();

    ctrlc::set_handler(move || {
        if !handle_signal(&mut ctl, unit, &flag) {
            warn!("Received second interrupt, forcing exit");
            std::process::exit(1);
        }
    })?;

    Ok(stop)
}

/// Returns false on a repeated signal.
fn handle_signal<C: ControlChannel>(ctl: &mut C, unit: i32, stop: &AtomicBool) -> bool {
    if stop.swap(true, Ordering::SeqCst) {
        return false;
    }

    info!(unit, "Received shutdown signal, destroying device");
    if let Err(e) = destroy_unit(ctl, unit, true) {
        warn!(unit, error = %e, "Failed to destroy device");
    }
    true
}
