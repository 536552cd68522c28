//! I/O dispatch loop
//!
//! One request at a time: `START` blocks until the kernel has work, the
//! request goes to the provider, `DONE` reports the outcome. The working
//! buffer is the only memory the kernel ever sees.

use crate::gate::ctrl::{ControlChannel, ControlCommand, CtrlError};
use crate::gate::io::{BioCmd, IoRequest, StartStatus, WorkingBuffer};
use crate::gate::sys::GCtlIo;
use crate::provider::{IoCall, ProviderAdapter};
use nix::errno::Errno;
use nix::libc;
use std::convert::Infallible;
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("ggate{unit} was destroyed ({})", strerror(.code))]
    DeviceRevoked { unit: i32, code: i32 },

    #[error("G_GATE_CMD_START: {}", strerror(.code))]
    KernelIoError { code: i32 },

    #[error(transparent)]
    Ctrl(#[from] CtrlError),
}

fn strerror(code: &i32) -> &'static str {
    Errno::from_raw(*code).desc()
}

impl DispatchError {
    /// Returns true if the loop ended because the device went away.
    #[inline]
    pub fn is_revoked(&self) -> bool {
        matches!(self, Self::DeviceRevoked { .. })
    }

    /// Convert to negative errno for POSIX compatibility.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::DeviceRevoked { code, .. } | Self::KernelIoError { code } => -code,
            Self::Ctrl(e) => e.to_errno(),
        }
    }
}

/// Per-loop request counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub unsupported: u64,
    /// Requests completed with a non-zero error
    pub failed: u64,
    pub buffer_grows: u64,
}

pub struct DispatchLoop<'a, C: ControlChannel + ?Sized> {
    ctl: &'a mut C,
    provider: &'a mut ProviderAdapter,
    unit: i32,
    buffer: WorkingBuffer,
    io: GCtlIo,
    stats: DispatchStats,
}

impl<'a, C: ControlChannel + ?Sized> DispatchLoop<'a, C> {
    pub fn new(ctl: &'a mut C, provider: &'a mut ProviderAdapter, unit: i32) -> Self {
        Self {
            ctl,
            provider,
            unit,
            buffer: WorkingBuffer::default(),
            io: GCtlIo::new(unit),
            stats: DispatchStats::default(),
        }
    }

    #[inline]
    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    #[inline]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Serve requests until the device goes away or the kernel fails.
    ///
    /// Runs the provider's cleanup hook before returning.
    pub fn run(&mut self) -> Result<Infallible, DispatchError> {
        info!(unit = self.unit, "Dispatch loop started");

        loop {
            if let Err(e) = self.step() {
                self.provider.try_cleanup();
                let s = self.stats;
                if e.is_revoked() {
                    info!(unit = self.unit, reads = s.reads, writes = s.writes, deletes = s.deletes,
                          failed = s.failed, "Dispatch loop stopped: device revoked");
                } else {
                    debug!(unit = self.unit, error = %e, reads = s.reads, writes = s.writes,
                          deletes = s.deletes, failed = s.failed, "Dispatch loop failed");
                }
                return Err(e);
            }
        }
    }

    /// Serve exactly one request.
    pub fn step(&mut self) -> Result<IoRequest, DispatchError> {
        let req = self.acquire()?;
        let error = self.dispatch(&req);
        self.complete(&req, error)?;
        Ok(req)
    }

    /// Block in `START` until a request fits in the working buffer.
    fn acquire(&mut self) -> Result<IoRequest, DispatchError> {
        loop {
            let (data, capacity) = self.buffer.offer();
            self.io = GCtlIo::new(self.unit);
            self.io.data = data;
            self.io.length = capacity;

            match self.ctl.post(ControlCommand::Start(&mut self.io)) {
                Ok(()) => {}
                Err(e) if e.is_retriable() => {
                    trace!(unit = self.unit, "G_GATE_CMD_START interrupted, retrying");
                    continue;
                }
                Err(e) if e.is_device_gone() => {
                    return Err(DispatchError::DeviceRevoked {
                        unit: self.unit,
                        code: libc::ENXIO,
                    })
                }
                Err(e) => return Err(e.into()),
            }

            debug!(
                unit = self.unit,
                seq = self.io.seq,
                cmd = self.io.cmd,
                error = self.io.error,
                offset = self.io.offset,
                length = self.io.length,
                "G_GATE_CMD_START"
            );

            match StartStatus::from_ctl(&self.io) {
                StartStatus::Ready => return Ok(IoRequest::from_ctl(&self.io)),
                StartStatus::NeedBuffer(required) => match usize::try_from(required) {
                    // The request stays queued in the kernel; retry with a bigger buffer
                    Ok(required) if required as i64 > capacity => {
                        debug!(from = capacity, to = required, "Growing working buffer");
                        self.buffer.ensure_capacity(required);
                        self.stats.buffer_grows += 1;
                    }
                    _ => return Err(DispatchError::KernelIoError { code: libc::ENOMEM }),
                },
                StartStatus::Revoked(code) => {
                    return Err(DispatchError::DeviceRevoked {
                        unit: self.unit,
                        code,
                    })
                }
                StartStatus::Failed(code) => return Err(DispatchError::KernelIoError { code }),
            }
        }
    }

    /// Hand the request to the provider and return the errno for `DONE`.
    fn dispatch(&mut self, req: &IoRequest) -> i32 {
        let error = match req.cmd {
            BioCmd::Read => {
                self.stats.reads += 1;
                let capacity = self.buffer.capacity().max(req.length);
                self.buffer.ensure_capacity(capacity);
                self.buffer.clear();
                let error = self.provider.invoke_io(IoCall::Read {
                    offset: req.offset,
                    length: req.length,
                    buf: self.buffer.as_vec_mut(),
                });
                // Short reads are zero-filled, long ones truncated. The
                // provider may have replaced the vector; restore capacity.
                self.buffer.set_len(req.length);
                self.buffer.ensure_capacity(capacity);
                error
            }
            BioCmd::Write => {
                self.stats.writes += 1;
                self.buffer.set_len(req.length);
                self.provider.invoke_io(IoCall::Write {
                    offset: req.offset,
                    buf: self.buffer.as_slice(),
                })
            }
            BioCmd::Delete => {
                self.stats.deletes += 1;
                self.provider.invoke_io(IoCall::Delete {
                    offset: req.offset,
                    length: req.length,
                })
            }
            BioCmd::Unknown(cmd) => {
                self.stats.unsupported += 1;
                debug!(unit = self.unit, seq = req.seq, cmd, "Unsupported bio command");
                libc::EOPNOTSUPP
            }
        };

        if error != 0 {
            self.stats.failed += 1;
        }
        error
    }

    fn complete(&mut self, req: &IoRequest, error: i32) -> Result<(), DispatchError> {
        self.io.data = self.buffer.as_mut_ptr();
        self.io.length = req.length as i64;
        self.io.error = error;

        trace!(unit = self.unit, seq = req.seq, error, length = req.length, "G_GATE_CMD_DONE");

        match self.ctl.post(ControlCommand::Done(&mut self.io)) {
            Ok(()) => Ok(()),
            Err(e) if e.is_device_gone() => Err(DispatchError::DeviceRevoked {
                unit: self.unit,
                code: libc::ENXIO,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::ctrl::{KernelEvent, MockGateCtl};
    use crate::gate::io::INITIAL_BUFFER_SIZE;
    use crate::gate::sys::{BIO_FLUSH, BIO_READ};
    use crate::provider::{Capabilities, IoReply, Provider};
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    struct Log {
        reads: Vec<(u64, usize)>,
        writes: Vec<(u64, Vec<u8>)>,
        deletes: Vec<(u64, usize)>,
        cleanups: usize,
    }

    /// Provider that records every call
    struct Recorder {
        log: Rc<RefCell<Log>>,
        /// Bytes of 0xAA returned per read, capped at the request length
        read_fill: usize,
        panic_on_write: bool,
    }

    impl Provider for Recorder {
        fn capabilities(&self) -> Capabilities {
            Capabilities::REQUIRED | Capabilities::CLEANUP
        }

        fn mediasize(&self) -> Option<i64> {
            Some(1 << 20)
        }

        fn sectorsize(&self) -> Option<i64> {
            Some(512)
        }

        fn readat(&mut self, offset: u64, length: usize, buf: &mut Vec<u8>) -> IoReply {
            self.log.borrow_mut().reads.push((offset, length));
            buf.extend(std::iter::repeat(0xAA).take(self.read_fill.min(length)));
            Ok(None)
        }

        fn writeat(&mut self, offset: u64, buf: &[u8]) -> IoReply {
            if self.panic_on_write {
                panic!("write path exploded");
            }
            self.log.borrow_mut().writes.push((offset, buf.to_vec()));
            Ok(None)
        }

        fn deleteat(&mut self, offset: u64, length: usize) -> IoReply {
            self.log.borrow_mut().deletes.push((offset, length));
            Ok(Some(libc::EOPNOTSUPP as i64))
        }

        fn cleanup(&mut self) -> anyhow::Result<()> {
            self.log.borrow_mut().cleanups += 1;
            Ok(())
        }
    }

    fn recorder(read_fill: usize, panic_on_write: bool) -> (ProviderAdapter, Rc<RefCell<Log>>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let provider = Recorder {
            log: log.clone(),
            read_fill,
            panic_on_write,
        };
        (ProviderAdapter::bind(Box::new(provider)).unwrap(), log)
    }

    fn run(ctl: &mut MockGateCtl, adapter: &mut ProviderAdapter) -> (DispatchError, DispatchStats) {
        let mut dl = DispatchLoop::new(ctl, adapter, 0);
        let err = dl.run().unwrap_err();
        (err, dl.stats())
    }

    // ========================================================================
    // Data path
    // ========================================================================

    #[test]
    fn test_short_read_is_zero_filled() {
        let mut ctl = MockGateCtl::new([KernelEvent::read(0, 512)]);
        let (mut adapter, log) = recorder(100, false);

        let (err, stats) = run(&mut ctl, &mut adapter);
        assert!(err.is_revoked());
        assert_eq!(stats.reads, 1);

        assert_eq!(log.borrow().reads, [(0, 512)]);
        let done = &ctl.completions[0];
        assert_eq!(done.error, 0);
        assert_eq!(done.length, 512);
        assert_eq!(done.cmd, BIO_READ);
        assert!(done.data[..100].iter().all(|&b| b == 0xAA));
        assert!(done.data[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_larger_than_initial_buffer() {
        let length = 4 * INITIAL_BUFFER_SIZE as i64;
        let mut ctl = MockGateCtl::new([KernelEvent::read(8192, length)]);
        let (mut adapter, _log) = recorder(usize::MAX, false);

        let mut dl = DispatchLoop::new(&mut ctl, &mut adapter, 0);
        dl.step().unwrap();
        assert!(dl.buffer_capacity() >= length as usize);
        drop(dl);

        let done = &ctl.completions[0];
        assert_eq!(done.data.len(), length as usize);
        assert!(done.data.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_write_sees_exact_length() {
        let payload: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        let mut ctl = MockGateCtl::new([KernelEvent::write(4096, payload.clone())]);
        let (mut adapter, log) = recorder(0, false);

        let (_, stats) = run(&mut ctl, &mut adapter);
        assert_eq!(stats.writes, 1);
        assert_eq!(log.borrow().writes, [(4096, payload)]);
        assert_eq!(ctl.completions[0].error, 0);
        assert_eq!(ctl.completions[0].length, 1024);
    }

    #[test]
    fn test_delete_reports_provider_errno() {
        let mut ctl = MockGateCtl::new([KernelEvent::delete(512, 4096)]);
        let (mut adapter, log) = recorder(0, false);

        run(&mut ctl, &mut adapter);
        assert_eq!(log.borrow().deletes, [(512, 4096)]);
        assert_eq!(ctl.completions[0].error, libc::EOPNOTSUPP);
    }

    #[test]
    fn test_unknown_command_skips_provider() {
        let mut ctl = MockGateCtl::new([KernelEvent::Request {
            cmd: BIO_FLUSH,
            offset: 0,
            length: 0,
            payload: Vec::new(),
        }]);
        let (mut adapter, log) = recorder(0, false);

        let (_, stats) = run(&mut ctl, &mut adapter);
        assert_eq!(stats.unsupported, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(ctl.completions[0].error, libc::EOPNOTSUPP);
        let log = log.borrow();
        assert!(log.reads.is_empty() && log.writes.is_empty() && log.deletes.is_empty());
    }

    #[test]
    fn test_provider_panic_is_eio_and_loop_continues() {
        let mut ctl = MockGateCtl::new([
            KernelEvent::write(0, vec![1; 512]),
            KernelEvent::read(0, 512),
        ]);
        let (mut adapter, log) = recorder(512, true);

        let (err, stats) = run(&mut ctl, &mut adapter);
        assert!(err.is_revoked());
        assert_eq!(ctl.completions.len(), 2);
        assert_eq!(ctl.completions[0].error, libc::EIO);
        assert_eq!(ctl.completions[1].error, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(log.borrow().reads.len(), 1);
    }

    // ========================================================================
    // Buffer growth
    // ========================================================================

    #[test]
    fn test_enomem_grows_buffer_without_provider_call() {
        let big = 64 * 1024;
        let mut ctl = MockGateCtl::new([KernelEvent::write(0, vec![9; big])]);
        let (mut adapter, log) = recorder(0, false);

        let (_, stats) = run(&mut ctl, &mut adapter);
        assert_eq!(stats.buffer_grows, 1);
        assert_eq!(ctl.start_capacities[0], INITIAL_BUFFER_SIZE as i64);
        assert!(ctl.start_capacities[1] >= big as i64);

        let log = log.borrow();
        assert_eq!(log.writes.len(), 1);
        assert_eq!(log.writes[0].1.len(), big);
        // Exactly one DONE, for the delivered request
        assert_eq!(ctl.completions.len(), 1);
    }

    #[test]
    fn test_enomem_without_growth_is_fatal() {
        let mut ctl = MockGateCtl::new([KernelEvent::Error(libc::ENOMEM)]);
        let (mut adapter, log) = recorder(0, false);

        let (err, _) = run(&mut ctl, &mut adapter);
        assert!(matches!(err, DispatchError::KernelIoError { code } if code == libc::ENOMEM));
        assert_eq!(log.borrow().cleanups, 1);
    }

    /// Provider that hands back a freshly allocated vector on every read
    struct Replacer;

    impl Provider for Replacer {
        fn capabilities(&self) -> Capabilities {
            Capabilities::REQUIRED
        }

        fn mediasize(&self) -> Option<i64> {
            Some(1 << 20)
        }

        fn sectorsize(&self) -> Option<i64> {
            Some(512)
        }

        fn readat(&mut self, _offset: u64, length: usize, buf: &mut Vec<u8>) -> IoReply {
            *buf = vec![0x5A; length];
            buf.shrink_to_fit();
            Ok(None)
        }
    }

    #[test]
    fn test_buffer_capacity_survives_replaced_vector() {
        let mut ctl = MockGateCtl::new([KernelEvent::read(0, 512), KernelEvent::read(512, 512)]);
        let mut adapter = ProviderAdapter::bind(Box::new(Replacer)).unwrap();

        let mut dl = DispatchLoop::new(&mut ctl, &mut adapter, 0);
        let before = dl.buffer_capacity();
        dl.step().unwrap();
        assert!(dl.buffer_capacity() >= before);
        dl.step().unwrap();
        assert!(dl.buffer_capacity() >= before);
        drop(dl);

        assert_eq!(ctl.start_capacities.len(), 2);
        assert!(ctl.start_capacities[1] >= ctl.start_capacities[0]);
        assert!(ctl.completions.iter().all(|c| c.error == 0 && c.data == [0x5A; 512]));
    }

    // ========================================================================
    // Termination
    // ========================================================================

    #[test]
    fn test_revocation_runs_cleanup() {
        let mut ctl = MockGateCtl::new([KernelEvent::Error(libc::ECANCELED)]);
        let (mut adapter, log) = recorder(0, false);

        let mut dl = DispatchLoop::new(&mut ctl, &mut adapter, 3);
        let err = dl.run().unwrap_err();
        assert!(matches!(err, DispatchError::DeviceRevoked { unit: 3, code } if code == libc::ECANCELED));
        assert_eq!(err.to_errno(), -libc::ECANCELED);
        assert_eq!(log.borrow().cleanups, 1);
    }

    #[test]
    fn test_kernel_error_runs_cleanup() {
        let mut ctl = MockGateCtl::new([KernelEvent::Error(libc::EIO)]);
        let (mut adapter, log) = recorder(0, false);

        let (err, _) = run(&mut ctl, &mut adapter);
        assert!(matches!(err, DispatchError::KernelIoError { code } if code == libc::EIO));
        assert!(!err.is_revoked());
        assert_eq!(log.borrow().cleanups, 1);
    }

    #[test]
    fn test_start_interrupted_is_retried() {
        let mut ctl = MockGateCtl::new([KernelEvent::Reject(libc::EINTR), KernelEvent::read(0, 512)]);
        let (mut adapter, log) = recorder(0, false);

        run(&mut ctl, &mut adapter);
        assert_eq!(log.borrow().reads.len(), 1);
        assert_eq!(ctl.completions.len(), 1);
    }

    #[test]
    fn test_start_enxio_is_revocation() {
        let mut ctl = MockGateCtl::new([KernelEvent::Reject(libc::ENXIO)]);
        let (mut adapter, log) = recorder(0, false);

        let (err, _) = run(&mut ctl, &mut adapter);
        assert!(err.is_revoked());
        assert_eq!(log.borrow().cleanups, 1);
    }

    #[test]
    fn test_start_rejected_is_channel_error() {
        let mut ctl = MockGateCtl::new([KernelEvent::Reject(libc::EINVAL)]);
        let (mut adapter, log) = recorder(0, false);

        let (err, _) = run(&mut ctl, &mut adapter);
        assert!(matches!(err, DispatchError::Ctrl(_)));
        assert_eq!(err.to_errno(), -libc::EINVAL);
        assert_eq!(log.borrow().cleanups, 1);
    }

    #[test]
    fn test_dispatch_error_display() {
        let err = DispatchError::KernelIoError { code: libc::EIO };
        assert!(err.to_string().starts_with("G_GATE_CMD_START: "));
        let err = DispatchError::Ctrl(CtrlError::KernelRejected {
            command: "G_GATE_CMD_DONE",
            source: io::Error::from_raw_os_error(libc::EINVAL),
        });
        assert!(err.to_string().contains("G_GATE_CMD_DONE"));
    }
}
