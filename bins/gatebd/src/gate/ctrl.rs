//! GEOM Gate control channel
//!
//! All device management goes through ioctls on `/dev/ggctl`. The
//! [`ControlChannel`] trait is the seam between the session/dispatch logic
//! and the kernel so both can be exercised against a scripted kernel.

use crate::gate::sys::{self, GCtlCreate, GCtlDestroy, GCtlIo, G_GATE_CTL_PATH};
use nix::libc;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CtrlError {
    #[error("cannot open {path}")]
    ChannelUnavailable {
        path: &'static str,
        source: io::Error,
    },

    #[error("kldload({module}) failed")]
    ModuleLoad {
        module: &'static str,
        source: io::Error,
    },

    #[error("ioctl({command}) failed")]
    KernelRejected {
        command: &'static str,
        source: io::Error,
    },

    #[error("control channel is not open")]
    NotOpen,
}

impl CtrlError {
    /// Kernel errno carried by this error, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::ChannelUnavailable { source, .. }
            | Self::ModuleLoad { source, .. }
            | Self::KernelRejected { source, .. } => source.raw_os_error(),
            Self::NotOpen => None,
        }
    }

    /// Returns true if the call was interrupted and may simply be reissued.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::KernelRejected { source, .. }
                if matches!(source.raw_os_error(), Some(libc::EINTR) | Some(libc::EAGAIN))
        )
    }

    /// Returns true if the kernel no longer knows the unit.
    #[inline]
    pub fn is_device_gone(&self) -> bool {
        matches!(self, Self::KernelRejected { source, .. } if source.raw_os_error() == Some(libc::ENXIO))
    }

    /// Convert to negative errno for POSIX compatibility.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::ChannelUnavailable { source, .. } => -source.raw_os_error().unwrap_or(libc::ENODEV),
            Self::ModuleLoad { source, .. } => -source.raw_os_error().unwrap_or(libc::ENOENT),
            Self::KernelRejected { source, .. } => -source.raw_os_error().unwrap_or(libc::EIO),
            Self::NotOpen => -libc::EBADF,
        }
    }
}

/// One control request together with its in/out payload
#[derive(Debug)]
pub enum ControlCommand<'a> {
    Create(&'a mut GCtlCreate),
    Destroy(&'a mut GCtlDestroy),
    /// Block until the kernel hands over the next request
    Start(&'a mut GCtlIo),
    /// Report the outcome of a request obtained through `Start`
    Done(&'a mut GCtlIo),
}

impl ControlCommand<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "G_GATE_CMD_CREATE",
            Self::Destroy(_) => "G_GATE_CMD_DESTROY",
            Self::Start(_) => "G_GATE_CMD_START",
            Self::Done(_) => "G_GATE_CMD_DONE",
        }
    }
}

/// Transport for GEOM Gate control commands
pub trait ControlChannel {
    /// Issue a single command and block until the kernel answers.
    ///
    /// Fails with [`CtrlError::KernelRejected`] on any non-zero ioctl result.
    fn post(&mut self, command: ControlCommand<'_>) -> Result<(), CtrlError>;
}

impl<C: ControlChannel + ?Sized> ControlChannel for &mut C {
    fn post(&mut self, command: ControlCommand<'_>) -> Result<(), CtrlError> {
        (**self).post(command)
    }
}

/// Ask the kernel to tear down `unit`.
///
/// With `force` the device is destroyed even while it is open; a `START`
/// blocked on it then returns `ECANCELED`.
pub fn destroy_unit<C: ControlChannel + ?Sized>(
    ctl: &mut C,
    unit: i32,
    force: bool,
) -> Result<(), CtrlError> {
    let mut req = GCtlDestroy::new(unit, force);
    ctl.post(ControlCommand::Destroy(&mut req))
}

/// Handle on `/dev/ggctl`
#[derive(Debug, Default)]
pub struct GateCtl {
    fd: Option<OwnedFd>,
}

impl GateCtl {
    pub fn new() -> Self {
        Self { fd: None }
    }

    /// Open the control device. Calling this on an open handle is a no-op.
    pub fn open(&mut self) -> Result<(), CtrlError> {
        if self.fd.is_some() {
            return Ok(());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(G_GATE_CTL_PATH)
            .map_err(|source| CtrlError::ChannelUnavailable {
                path: G_GATE_CTL_PATH,
                source,
            })?;
        self.fd = Some(OwnedFd::from(file));

        debug!(path = G_GATE_CTL_PATH, "Control device opened");
        Ok(())
    }

    /// Release the handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.fd.take().is_some() {
            debug!(path = G_GATE_CTL_PATH, "Control device closed");
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Duplicate the descriptor, e.g. for a signal handler that has to post
    /// `DESTROY` while the main thread is blocked in `START`.
    pub fn try_clone(&self) -> Result<Self, CtrlError> {
        let fd = self.fd.as_ref().ok_or(CtrlError::NotOpen)?;
        let fd = fd.try_clone().map_err(|source| CtrlError::ChannelUnavailable {
            path: G_GATE_CTL_PATH,
            source,
        })?;
        Ok(Self { fd: Some(fd) })
    }
}

impl ControlChannel for GateCtl {
    fn post(&mut self, command: ControlCommand<'_>) -> Result<(), CtrlError> {
        let fd = self.fd.as_ref().ok_or(CtrlError::NotOpen)?.as_raw_fd();
        let name = command.name();

        // SAFETY: every payload is a live, exclusively borrowed repr(C)
        // structure matching the kernel's definition for that command.
        let result = unsafe {
            match command {
                ControlCommand::Create(req) => sys::gate_cmd_create(fd, req),
                ControlCommand::Destroy(req) => sys::gate_cmd_destroy(fd, req),
                ControlCommand::Start(io) => sys::gate_cmd_start(fd, io),
                ControlCommand::Done(io) => sys::gate_cmd_done(fd, io),
            }
        };

        result.map(drop).map_err(|errno| CtrlError::KernelRejected {
            command: name,
            source: io::Error::from(errno),
        })
    }
}

/// Make sure the `geom_gate` class is present in the kernel.
///
/// `EEXIST` means it is already loaded. `EPERM` is tolerated when the module
/// can be found anyway (unprivileged users may not load modules).
#[cfg(target_os = "freebsd")]
pub fn load_gate_module() -> Result<(), CtrlError> {
    use nix::libc::{c_char, c_int};

    extern "C" {
        fn kldload(file: *const c_char) -> c_int;
        fn kldfind(file: *const c_char) -> c_int;
    }

    let module = c"geom_gate";
    // SAFETY: `module` is a valid NUL-terminated string.
    if unsafe { kldload(module.as_ptr()) } >= 0 {
        tracing::info!(module = sys::G_GATE_MOD_NAME, "Kernel module loaded");
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EEXIST) => Ok(()),
        // SAFETY: as above.
        Some(libc::EPERM) if unsafe { kldfind(module.as_ptr()) } >= 0 => Ok(()),
        _ => Err(CtrlError::ModuleLoad {
            module: sys::G_GATE_MOD_NAME,
            source: err,
        }),
    }
}

#[cfg(not(target_os = "freebsd"))]
pub fn load_gate_module() -> Result<(), CtrlError> {
    debug!(module = sys::G_GATE_MOD_NAME, "Not on FreeBSD, skipping kldload");
    Ok(())
}

// ============================================================================
// Mock infrastructure for testing without kernel access
// ============================================================================

/// What the scripted kernel answers to the next `START`
#[cfg(test)]
#[derive(Debug, Clone)]
pub enum KernelEvent {
    Request {
        cmd: u32,
        offset: i64,
        length: i64,
        payload: Vec<u8>,
    },
    /// Report `gctl_error` without a request
    Error(i32),
    /// Fail the ioctl itself
    Reject(i32),
}

#[cfg(test)]
impl KernelEvent {
    pub fn read(offset: i64, length: i64) -> Self {
        Self::Request { cmd: sys::BIO_READ, offset, length, payload: Vec::new() }
    }

    pub fn write(offset: i64, payload: Vec<u8>) -> Self {
        Self::Request { cmd: sys::BIO_WRITE, offset, length: payload.len() as i64, payload }
    }

    pub fn delete(offset: i64, length: i64) -> Self {
        Self::Request { cmd: sys::BIO_DELETE, offset, length, payload: Vec::new() }
    }
}

/// A `DONE` as seen by the scripted kernel
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub seq: usize,
    pub cmd: u32,
    pub offset: i64,
    pub length: i64,
    pub error: i32,
    pub data: Vec<u8>,
}

/// Scripted kernel for testing
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockGateCtl {
    pub events: std::collections::VecDeque<KernelEvent>,
    pub posted: Vec<&'static str>,
    pub created: Option<GCtlCreate>,
    pub destroyed: Vec<(i32, i32)>,
    pub completions: Vec<Completion>,
    pub start_capacities: Vec<i64>,
    /// Unit handed out for `G_GATE_UNIT_AUTO`
    pub next_unit: i32,
    pub reject_create: Option<i32>,
    seq: usize,
}

#[cfg(test)]
impl MockGateCtl {
    pub fn new(events: impl IntoIterator<Item = KernelEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
            ..Default::default()
        }
    }

    fn start(&mut self, io: &mut GCtlIo) -> Result<(), CtrlError> {
        self.start_capacities.push(io.length);

        match self.events.pop_front() {
            // Script exhausted: behave like a destroyed device
            None => io.error = libc::ECANCELED,
            Some(KernelEvent::Error(code)) => io.error = code,
            Some(KernelEvent::Reject(code)) => {
                return Err(CtrlError::KernelRejected {
                    command: "G_GATE_CMD_START",
                    source: io::Error::from_raw_os_error(code),
                })
            }
            Some(KernelEvent::Request { cmd, offset, length, payload }) => {
                io.cmd = cmd;
                if cmd == sys::BIO_WRITE && length > io.length {
                    // The request stays queued until a large enough buffer shows up
                    io.length = length;
                    io.error = libc::ENOMEM;
                    self.events.push_front(KernelEvent::Request { cmd, offset, length, payload });
                    return Ok(());
                }

                self.seq += 1;
                io.seq = self.seq;
                io.offset = offset;
                io.length = length;
                io.error = 0;
                if cmd == sys::BIO_WRITE && !payload.is_empty() {
                    let dst = unsafe {
                        std::slice::from_raw_parts_mut(io.data as *mut u8, payload.len())
                    };
                    dst.copy_from_slice(&payload);
                }
            }
        }
        Ok(())
    }

    fn done(&mut self, io: &GCtlIo) {
        let data = if io.data.is_null() || io.length <= 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(io.data as *const u8, io.length as usize) }.to_vec()
        };
        self.completions.push(Completion {
            seq: io.seq,
            cmd: io.cmd,
            offset: io.offset,
            length: io.length,
            error: io.error,
            data,
        });
    }
}

#[cfg(test)]
impl ControlChannel for MockGateCtl {
    fn post(&mut self, command: ControlCommand<'_>) -> Result<(), CtrlError> {
        self.posted.push(command.name());

        match command {
            ControlCommand::Create(req) => {
                if let Some(code) = self.reject_create {
                    return Err(CtrlError::KernelRejected {
                        command: "G_GATE_CMD_CREATE",
                        source: io::Error::from_raw_os_error(code),
                    });
                }
                if req.unit == sys::G_GATE_UNIT_AUTO {
                    req.unit = self.next_unit;
                }
                self.created = Some(*req);
            }
            ControlCommand::Destroy(req) => self.destroyed.push((req.unit, req.force)),
            ControlCommand::Start(io) => self.start(io)?,
            ControlCommand::Done(io) => self.done(io),
        }
        Ok(())
    }
}
