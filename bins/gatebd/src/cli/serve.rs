//! Serve command - creates the device and runs it until it goes away

use super::{format_size, Cli};
use crate::cleanup::install_shutdown_handler;
use anyhow::Result;
use gatebd::gate::{clamp_timeout, load_gate_module, DeviceSession, GateCtl, SessionConfig};
use gatebd::provider::{load_manifest, ProviderAdapter};
use std::sync::atomic::Ordering;
use tracing::info;

/// Returns `Ok` only when the device was destroyed at the operator's
/// request.
pub fn run(cli: &Cli) -> Result<()> {
    load_gate_module()?;

    let mut ctl = GateCtl::new();
    ctl.open()?;

    let provider = load_manifest(&cli.manifest, &cli.args)?;
    let mut adapter = ProviderAdapter::bind(provider)?;

    let config = SessionConfig {
        accmode: cli.access.into(),
        timeout: clamp_timeout(cli.timeout),
        unit_hint: cli.unit,
    };
    let signal_ctl = ctl.try_clone()?;

    let mut session = DeviceSession::new(ctl, config);
    let unit = session.create(&adapter)?;

    if cli.unit < 0 {
        if let Some(path) = session.device_path() {
            println!("{path}");
        }
    }

    let stop = install_shutdown_handler(signal_ctl, unit)?;

    if let Some(geometry) = session.geometry() {
        info!(
            unit,
            size = %format_size(geometry.mediasize),
            sectorsize = geometry.sectorsize,
            access = %config.accmode,
            timeout = geometry.timeout,
            "Serving device"
        );
    }

    let err = match session.run(&mut adapter) {
        Err(e) => e,
        Ok(never) => match never {},
    };

    if err.is_revoked() && stop.load(Ordering::SeqCst) {
        info!(unit, "Device destroyed on request");
        return Ok(());
    }
    Err(err.into())
}
