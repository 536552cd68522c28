//! Device session
//!
//! Owns the control channel and the identity of one GEOM Gate device.
//! Lifecycle: `Unconfigured -> Created -> Running -> Terminated`.

use crate::gate::ctrl::{destroy_unit, ControlChannel, ControlCommand, CtrlError};
use crate::gate::dispatch::{DispatchError, DispatchLoop};
use crate::gate::sys::{
    GCtlCreate, G_GATE_DEV_FMT, G_GATE_FLAG_READONLY, G_GATE_FLAG_READWRITE,
    G_GATE_FLAG_WRITEONLY, G_GATE_UNIT_AUTO, G_GATE_USERFLAGS,
};
use crate::provider::{Attr, AttrError, ProviderAdapter};
use std::convert::Infallible;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Request timeout used when none (or a non-positive one) is given
pub const DEFAULT_TIMEOUT: u32 = 30;
/// Timeouts above [`TIMEOUT_LIMIT`] are replaced by this
pub const CLAMPED_TIMEOUT: u32 = 500;
pub const TIMEOUT_LIMIT: i64 = 1000;

/// Normalize a user-supplied request timeout in seconds.
pub fn clamp_timeout(secs: i64) -> u32 {
    if secs < 1 {
        DEFAULT_TIMEOUT
    } else if secs > TIMEOUT_LIMIT {
        CLAMPED_TIMEOUT
    } else {
        secs as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl AccessMode {
    pub fn flags(self) -> u32 {
        match self {
            AccessMode::ReadWrite => G_GATE_FLAG_READWRITE,
            AccessMode::ReadOnly => G_GATE_FLAG_READONLY,
            AccessMode::WriteOnly => G_GATE_FLAG_WRITEONLY,
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessMode::ReadWrite => "rw",
            AccessMode::ReadOnly => "ro",
            AccessMode::WriteOnly => "wo",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub accmode: AccessMode,
    /// Seconds, already clamped
    pub timeout: u32,
    /// Requested unit; negative means let the kernel choose
    pub unit_hint: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            accmode: AccessMode::default(),
            timeout: DEFAULT_TIMEOUT,
            unit_hint: G_GATE_UNIT_AUTO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconfigured,
    Created,
    Running,
    Terminated,
}

/// What was sent to the kernel with `CREATE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub mediasize: u64,
    pub sectorsize: u32,
    /// Flags as sent, including the access mode
    pub flags: u32,
    pub timeout: u32,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Attr(#[from] AttrError),

    #[error("flags and access-mode are mismatch (flags={flags:#x}, access-mode={:#x})", .accmode.flags())]
    AccessModeConflict { flags: u32, accmode: AccessMode },

    #[error(transparent)]
    Ctrl(#[from] CtrlError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("device session is {0:?}")]
    InvalidState(SessionState),
}

impl SessionError {
    /// Returns true if the session ended because the device was destroyed.
    #[inline]
    pub fn is_revoked(&self) -> bool {
        matches!(self, Self::Dispatch(e) if e.is_revoked())
    }
}

pub struct DeviceSession<C: ControlChannel> {
    ctl: C,
    config: SessionConfig,
    state: SessionState,
    unit: Option<i32>,
    geometry: Option<DeviceGeometry>,
}

impl<C: ControlChannel> DeviceSession<C> {
    pub fn new(ctl: C, config: SessionConfig) -> Self {
        Self {
            ctl,
            config,
            state: SessionState::Unconfigured,
            unit: None,
            geometry: None,
        }
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Kernel-assigned unit, once created
    #[inline]
    pub fn unit(&self) -> Option<i32> {
        self.unit
    }

    #[inline]
    pub fn geometry(&self) -> Option<DeviceGeometry> {
        self.geometry
    }

    /// `/dev/ggate<N>`, once created
    pub fn device_path(&self) -> Option<String> {
        self.unit.map(|unit| format!("{G_GATE_DEV_FMT}{unit}"))
    }

    /// Register the device with the kernel.
    ///
    /// Every attribute is read and validated before `CREATE` is posted, so a
    /// rejected provider leaves no trace in the kernel.
    pub fn create(&mut self, provider: &ProviderAdapter) -> Result<i32, SessionError> {
        if self.state != SessionState::Unconfigured {
            return Err(SessionError::InvalidState(self.state));
        }
        provider.require_capabilities()?;

        let mediasize = provider.get_u64(Attr::Mediasize, None)?;
        let sectorsize = provider.get_u32(Attr::Sectorsize, None)?;
        let flags = provider.get_u32(Attr::Flags, Some(0))?;
        let readoffset = provider.get_u64(Attr::Readoffset, Some(0))?;
        // Reserved: only logged, never sent
        let maxcount = provider.get_u32(Attr::Maxcount, Some(0)).ok();

        let accmode = self.config.accmode;
        if (flags | accmode.flags()) & G_GATE_USERFLAGS != accmode.flags() {
            return Err(SessionError::AccessModeConflict { flags, accmode });
        }

        let mut req = GCtlCreate {
            mediasize: i64::try_from(mediasize).map_err(|_| AttrError::AttributeRange {
                attr: Attr::Mediasize,
                value: -1,
            })?,
            sectorsize,
            flags: flags | accmode.flags(),
            timeout: self.config.timeout,
            readoffset: i64::try_from(readoffset).map_err(|_| AttrError::AttributeRange {
                attr: Attr::Readoffset,
                value: -1,
            })?,
            unit: if self.config.unit_hint < 0 {
                G_GATE_UNIT_AUTO
            } else {
                self.config.unit_hint
            },
            ..Default::default()
        };
        provider.get_string(Attr::Name, &mut req.name)?;
        provider.get_string(Attr::Info, &mut req.info)?;
        provider.get_string(Attr::Readprov, &mut req.readprov)?;

        debug!(request = ?req, ?maxcount, "Posting G_GATE_CMD_CREATE");
        self.ctl.post(ControlCommand::Create(&mut req))?;

        let geometry = DeviceGeometry {
            mediasize,
            sectorsize,
            flags: req.flags,
            timeout: req.timeout,
        };
        self.unit = Some(req.unit);
        self.geometry = Some(geometry);
        self.state = SessionState::Created;

        info!(
            unit = req.unit,
            mediasize,
            sectorsize,
            flags = req.flags,
            timeout = req.timeout,
            "Device created"
        );
        Ok(req.unit)
    }

    /// Serve I/O until the device is gone. Only ever returns an error.
    ///
    /// When the loop fails for any reason other than revocation the device
    /// is destroyed before returning.
    pub fn run(&mut self, provider: &mut ProviderAdapter) -> Result<Infallible, SessionError> {
        let unit = match (self.state, self.unit) {
            (SessionState::Created, Some(unit)) => unit,
            (state, _) => return Err(SessionError::InvalidState(state)),
        };
        self.state = SessionState::Running;

        let err = match DispatchLoop::new(&mut self.ctl, provider, unit).run() {
            Err(e) => e,
            Ok(never) => match never {},
        };

        if err.is_revoked() {
            self.state = SessionState::Terminated;
        } else if let Err(e) = self.shutdown() {
            warn!(unit, error = %e, "Failed to destroy device");
        }
        Err(err.into())
    }

    /// Best-effort forced `DESTROY` of a live device. No-op otherwise.
    pub fn shutdown(&mut self) -> Result<(), SessionError> {
        let live = matches!(self.state, SessionState::Created | SessionState::Running);
        self.state = SessionState::Terminated;

        match self.unit {
            Some(unit) if live => {
                destroy_unit(&mut self.ctl, unit, true)?;
                info!(unit, "Device destroyed");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl<C: ControlChannel> Drop for DeviceSession<C> {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Created | SessionState::Running) {
            if let Err(e) = self.shutdown() {
                warn!(unit = ?self.unit, error = %e, "Failed to destroy device on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::ctrl::{KernelEvent, MockGateCtl};
    use crate::gate::sys::{c_field, G_GATE_INFOSIZE, NAME_MAX};
    use crate::provider::{Capabilities, IoReply, MemoryProvider, Provider, ProviderAttrs};
    use nix::libc;

    fn memory(attrs: ProviderAttrs) -> ProviderAdapter {
        let attrs = ProviderAttrs {
            mediasize: attrs.mediasize.or(Some(1 << 20)),
            ..attrs
        };
        ProviderAdapter::bind(Box::new(MemoryProvider::new(attrs).unwrap())).unwrap()
    }

    fn config(accmode: AccessMode) -> SessionConfig {
        SessionConfig {
            accmode,
            ..Default::default()
        }
    }

    /// Answers everything but the mediasize
    struct Sizeless;

    impl Provider for Sizeless {
        fn capabilities(&self) -> Capabilities {
            Capabilities::REQUIRED
        }

        fn mediasize(&self) -> Option<i64> {
            None
        }

        fn sectorsize(&self) -> Option<i64> {
            Some(512)
        }

        fn readat(&mut self, _: u64, _: usize, _: &mut Vec<u8>) -> IoReply {
            Ok(None)
        }

        fn writeat(&mut self, _: u64, _: &[u8]) -> IoReply {
            Ok(None)
        }

        fn deleteat(&mut self, _: u64, _: usize) -> IoReply {
            Ok(None)
        }
    }

    /// Sized provider whose maxcount does not fit the kernel field
    struct Overcount;

    impl Provider for Overcount {
        fn capabilities(&self) -> Capabilities {
            Capabilities::REQUIRED
        }

        fn mediasize(&self) -> Option<i64> {
            Some(1 << 20)
        }

        fn sectorsize(&self) -> Option<i64> {
            Some(512)
        }

        fn maxcount(&self) -> Option<i64> {
            Some(-1)
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    #[test]
    fn test_clamp_timeout() {
        assert_eq!(clamp_timeout(0), 30);
        assert_eq!(clamp_timeout(-7), 30);
        assert_eq!(clamp_timeout(1), 1);
        assert_eq!(clamp_timeout(1000), 1000);
        assert_eq!(clamp_timeout(1001), 500);
    }

    #[test]
    fn test_access_mode_flags() {
        assert_eq!(AccessMode::default(), AccessMode::ReadWrite);
        assert_eq!(AccessMode::ReadWrite.flags(), 0);
        assert_eq!(AccessMode::ReadOnly.flags(), 1);
        assert_eq!(AccessMode::WriteOnly.flags(), 2);
        assert_eq!(AccessMode::WriteOnly.to_string(), "wo");
    }

    // ========================================================================
    // Create
    // ========================================================================

    #[test]
    fn test_create_auto_unit() {
        let mut ctl = MockGateCtl::default();
        ctl.next_unit = 5;
        let adapter = memory(ProviderAttrs {
            name: Some("scratch".into()),
            info: Some("memory disk".into()),
            ..Default::default()
        });

        let mut session = DeviceSession::new(&mut ctl, SessionConfig::default());
        assert_eq!(session.create(&adapter).unwrap(), 5);
        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(session.unit(), Some(5));
        assert_eq!(session.device_path().as_deref(), Some("/dev/ggate5"));
        assert_eq!(
            session.geometry(),
            Some(DeviceGeometry { mediasize: 1 << 20, sectorsize: 512, flags: 0, timeout: 30 })
        );
        session.shutdown().unwrap();
        drop(session);

        let req = ctl.created.unwrap();
        assert_eq!(req.unit, 5);
        assert_eq!(req.mediasize, 1 << 20);
        assert_eq!(req.sectorsize, 512);
        assert_eq!(c_field(&req.name), "scratch");
        assert_eq!(c_field(&req.info), "memory disk");
        assert_eq!(c_field(&req.readprov), "");
        assert_eq!(req.maxcount, 0);
    }

    #[test]
    fn test_create_pinned_and_negative_hint() {
        let adapter = memory(ProviderAttrs::default());

        let mut ctl = MockGateCtl::default();
        let cfg = SessionConfig { unit_hint: 7, ..Default::default() };
        DeviceSession::new(&mut ctl, cfg).create(&adapter).unwrap();
        assert_eq!(ctl.created.unwrap().unit, 7);

        let mut ctl = MockGateCtl::default();
        ctl.next_unit = 2;
        let cfg = SessionConfig { unit_hint: -5, ..Default::default() };
        DeviceSession::new(&mut ctl, cfg).create(&adapter).unwrap();
        assert_eq!(ctl.created.unwrap().unit, 2);
    }

    #[test]
    fn test_create_sends_access_mode_and_timeout() {
        let adapter = memory(ProviderAttrs::default());
        let mut ctl = MockGateCtl::default();
        let cfg = SessionConfig {
            accmode: AccessMode::ReadOnly,
            timeout: clamp_timeout(5000),
            ..Default::default()
        };
        DeviceSession::new(&mut ctl, cfg).create(&adapter).unwrap();

        let req = ctl.created.unwrap();
        assert_eq!(req.flags, G_GATE_FLAG_READONLY);
        assert_eq!(req.timeout, 500);
    }

    #[test]
    fn test_create_matching_provider_flags() {
        let ro = memory(ProviderAttrs { flags: Some(G_GATE_FLAG_READONLY), ..Default::default() });
        let mut ctl = MockGateCtl::default();
        DeviceSession::new(&mut ctl, config(AccessMode::ReadOnly)).create(&ro).unwrap();
        assert_eq!(ctl.created.unwrap().flags, G_GATE_FLAG_READONLY);

        let rw = memory(ProviderAttrs { flags: Some(0), ..Default::default() });
        let mut ctl = MockGateCtl::default();
        DeviceSession::new(&mut ctl, config(AccessMode::WriteOnly)).create(&rw).unwrap();
        assert_eq!(ctl.created.unwrap().flags, G_GATE_FLAG_WRITEONLY);
    }

    #[test]
    fn test_create_access_mode_conflict() {
        let ro = memory(ProviderAttrs { flags: Some(G_GATE_FLAG_READONLY), ..Default::default() });
        let mut ctl = MockGateCtl::default();

        let mut session = DeviceSession::new(&mut ctl, config(AccessMode::ReadWrite));
        let err = session.create(&ro).unwrap_err();
        assert!(matches!(err, SessionError::AccessModeConflict { flags: 1, accmode: AccessMode::ReadWrite }));
        assert_eq!(err.to_string(), "flags and access-mode are mismatch (flags=0x1, access-mode=0x0)");
        assert_eq!(session.state(), SessionState::Unconfigured);
        drop(session);

        assert!(ctl.posted.is_empty());
    }

    #[test]
    fn test_create_access_mode_conflict_other_modes() {
        let wo = memory(ProviderAttrs { flags: Some(G_GATE_FLAG_WRITEONLY), ..Default::default() });
        let ro = memory(ProviderAttrs { flags: Some(G_GATE_FLAG_READONLY), ..Default::default() });
        let mut ctl = MockGateCtl::default();

        let err = DeviceSession::new(&mut ctl, config(AccessMode::ReadOnly)).create(&wo).unwrap_err();
        assert!(matches!(err, SessionError::AccessModeConflict { flags: 2, accmode: AccessMode::ReadOnly }));
        assert_eq!(err.to_string(), "flags and access-mode are mismatch (flags=0x2, access-mode=0x1)");

        let err = DeviceSession::new(&mut ctl, config(AccessMode::WriteOnly)).create(&ro).unwrap_err();
        assert!(matches!(err, SessionError::AccessModeConflict { flags: 1, accmode: AccessMode::WriteOnly }));

        assert!(ctl.posted.is_empty());
    }

    #[test]
    fn test_create_ignores_out_of_range_maxcount() {
        let adapter = ProviderAdapter::bind(Box::new(Overcount)).unwrap();
        let mut ctl = MockGateCtl::default();

        DeviceSession::new(&mut ctl, SessionConfig::default()).create(&adapter).unwrap();
        let req = ctl.created.unwrap();
        assert_eq!(req.maxcount, 0);
        assert_eq!(req.mediasize, 1 << 20);
    }

    #[test]
    fn test_create_missing_mediasize() {
        let adapter = ProviderAdapter::bind(Box::new(Sizeless)).unwrap();
        let mut ctl = MockGateCtl::default();

        let err = DeviceSession::new(&mut ctl, SessionConfig::default())
            .create(&adapter)
            .unwrap_err();
        assert!(matches!(err, SessionError::Attr(AttrError::MissingAttribute(Attr::Mediasize))));
        assert!(ctl.posted.is_empty());
    }

    #[test]
    fn test_create_name_too_long() {
        let adapter = memory(ProviderAttrs { name: Some("x".repeat(NAME_MAX)), ..Default::default() });
        let mut ctl = MockGateCtl::default();

        let err = DeviceSession::new(&mut ctl, SessionConfig::default())
            .create(&adapter)
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Attr(AttrError::AttributeTooLong { attr: Attr::Name, max: 254, actual: 255 })
        ));
        assert!(ctl.posted.is_empty());
    }

    #[test]
    fn test_create_info_at_limit() {
        let adapter = memory(ProviderAttrs {
            info: Some("i".repeat(G_GATE_INFOSIZE - 1)),
            ..Default::default()
        });
        let mut ctl = MockGateCtl::default();
        DeviceSession::new(&mut ctl, SessionConfig::default()).create(&adapter).unwrap();
        assert_eq!(c_field(&ctl.created.unwrap().info).len(), G_GATE_INFOSIZE - 1);
    }

    #[test]
    fn test_create_rejected_by_kernel() {
        let adapter = memory(ProviderAttrs::default());
        let mut ctl = MockGateCtl::default();
        ctl.reject_create = Some(libc::EEXIST);

        let mut session = DeviceSession::new(&mut ctl, SessionConfig::default());
        let err = session.create(&adapter).unwrap_err();
        assert!(matches!(err, SessionError::Ctrl(_)));
        assert_eq!(session.state(), SessionState::Unconfigured);
        drop(session);

        // Nothing to destroy
        assert_eq!(ctl.posted, ["G_GATE_CMD_CREATE"]);
    }

    #[test]
    fn test_create_twice_is_invalid() {
        let adapter = memory(ProviderAttrs::default());
        let mut ctl = MockGateCtl::default();
        let mut session = DeviceSession::new(&mut ctl, SessionConfig::default());
        session.create(&adapter).unwrap();
        assert!(matches!(
            session.create(&adapter),
            Err(SessionError::InvalidState(SessionState::Created))
        ));
    }

    // ========================================================================
    // Run / shutdown
    // ========================================================================

    #[test]
    fn test_run_before_create_is_invalid() {
        let mut adapter = memory(ProviderAttrs::default());
        let mut ctl = MockGateCtl::default();
        let mut session = DeviceSession::new(&mut ctl, SessionConfig::default());
        let err = session.run(&mut adapter).unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(SessionState::Unconfigured)));
    }

    #[test]
    fn test_run_until_revoked() {
        let mut adapter = memory(ProviderAttrs::default());
        let mut ctl = MockGateCtl::new([KernelEvent::write(0, vec![3; 512]), KernelEvent::read(0, 512)]);

        let mut session = DeviceSession::new(&mut ctl, SessionConfig::default());
        session.create(&adapter).unwrap();
        let err = session.run(&mut adapter).unwrap_err();
        assert!(err.is_revoked());
        assert_eq!(session.state(), SessionState::Terminated);
        drop(session);

        assert!(ctl.destroyed.is_empty());
        assert_eq!(ctl.completions[1].data, vec![3; 512]);
    }

    #[test]
    fn test_run_kernel_failure_destroys_device() {
        let mut adapter = memory(ProviderAttrs::default());
        let mut ctl = MockGateCtl::new([KernelEvent::Error(libc::EIO)]);
        ctl.next_unit = 4;

        let mut session = DeviceSession::new(&mut ctl, SessionConfig::default());
        session.create(&adapter).unwrap();
        let err = session.run(&mut adapter).unwrap_err();
        assert!(!err.is_revoked());
        assert!(matches!(err, SessionError::Dispatch(DispatchError::KernelIoError { .. })));
        assert_eq!(session.state(), SessionState::Terminated);
        drop(session);

        assert_eq!(ctl.destroyed, [(4, 1)]);
    }

    #[test]
    fn test_drop_destroys_created_device() {
        let adapter = memory(ProviderAttrs::default());
        let mut ctl = MockGateCtl::default();
        ctl.next_unit = 9;
        {
            let mut session = DeviceSession::new(&mut ctl, SessionConfig::default());
            session.create(&adapter).unwrap();
        }
        assert_eq!(ctl.destroyed, [(9, 1)]);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let adapter = memory(ProviderAttrs::default());
        let mut ctl = MockGateCtl::default();
        let mut session = DeviceSession::new(&mut ctl, SessionConfig::default());
        session.create(&adapter).unwrap();
        session.shutdown().unwrap();
        session.shutdown().unwrap();
        drop(session);
        assert_eq!(ctl.destroyed.len(), 1);
    }
}
