//! GEOM Gate data path types
//!
//! Decodes what `G_GATE_CMD_START` hands back and owns the single buffer the
//! kernel copies request data into and response data out of.

use crate::gate::sys::*;
use nix::libc;

/// Capacity offered to the kernel before any request has been seen
pub const INITIAL_BUFFER_SIZE: usize = 16 * 1024;

/// bio command carried by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioCmd {
    Read,
    Write,
    Delete,
    Unknown(u32),
}

impl From<u32> for BioCmd {
    fn from(cmd: u32) -> Self {
        match cmd {
            BIO_READ => BioCmd::Read,
            BIO_WRITE => BioCmd::Write,
            BIO_DELETE => BioCmd::Delete,
            _ => BioCmd::Unknown(cmd),
        }
    }
}

impl BioCmd {
    #[inline]
    pub fn to_raw(self) -> u32 {
        match self {
            BioCmd::Read => BIO_READ,
            BioCmd::Write => BIO_WRITE,
            BioCmd::Delete => BIO_DELETE,
            BioCmd::Unknown(cmd) => cmd,
        }
    }
}

/// One request obtained through `G_GATE_CMD_START`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub seq: usize,
    pub cmd: BioCmd,
    /// Byte offset into the provider
    pub offset: u64,
    /// Byte length, authoritative for both reads and writes
    pub length: usize,
}

impl IoRequest {
    /// Parse from a successful `START` reply.
    ///
    /// Negative offsets or lengths never come from a sane kernel; they are
    /// clamped to zero rather than wrapped.
    pub fn from_ctl(io: &GCtlIo) -> Self {
        Self {
            seq: io.seq,
            cmd: BioCmd::from(io.cmd),
            offset: io.offset.max(0) as u64,
            length: io.length.max(0) as usize,
        }
    }
}

/// How `START` classified the next request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    /// A request is ready for dispatch
    Ready,
    /// The pending request needs a buffer of this many bytes
    NeedBuffer(i64),
    /// The device was destroyed or the request cancelled
    Revoked(i32),
    /// Any other kernel error
    Failed(i32),
}

impl StartStatus {
    pub fn from_ctl(io: &GCtlIo) -> Self {
        match io.error {
            0 => StartStatus::Ready,
            libc::ENOMEM => StartStatus::NeedBuffer(io.length),
            libc::ECANCELED | libc::ENXIO => StartStatus::Revoked(io.error),
            code => StartStatus::Failed(code),
        }
    }
}

/// Growable buffer shared with the kernel across iterations.
///
/// The whole allocation is handed to `START`, so every byte up to the
/// capacity is kept initialised. The logical length is whatever the current
/// request says it is. Capacity only ever grows.
#[derive(Debug)]
pub struct WorkingBuffer {
    data: Vec<u8>,
}

impl Default for WorkingBuffer {
    fn default() -> Self {
        Self::with_capacity(INITIAL_BUFFER_SIZE)
    }
}

impl WorkingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { data: vec![0; capacity] }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Grow so at least `capacity` bytes are available. Never shrinks.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if self.data.capacity() < capacity {
            self.data.reserve_exact(capacity - self.data.len());
        }
    }

    /// Set the logical length, zero-filling anything not yet written.
    pub fn set_len(&mut self, len: usize) {
        self.ensure_capacity(len);
        if len <= self.data.len() {
            self.data.truncate(len);
        } else {
            self.data.resize(len, 0);
        }
    }

    /// Expose the whole allocation to the kernel.
    ///
    /// Returns the pointer and the capacity to put in `gctl_data` /
    /// `gctl_length`. After this call the logical length equals the
    /// capacity.
    pub fn offer(&mut self) -> (*mut libc::c_void, i64) {
        let capacity = self.data.capacity();
        self.data.resize(capacity, 0);
        (self.data.as_mut_ptr().cast(), capacity as i64)
    }

    /// Pointer for `DONE`
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.data.as_mut_ptr().cast()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The backing vector, for providers that append read data
    #[inline]
    pub fn as_vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }
}
