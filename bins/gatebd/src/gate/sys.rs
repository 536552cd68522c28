//! Raw GEOM Gate kernel interface definitions
//!
//! Mirrors FreeBSD `sys/geom/gate/g_gate.h` (protocol version 3) and the
//! `bio` command numbers from `sys/bio.h`. Every control command is an ioctl
//! on `/dev/ggctl`; the request structures below are passed by pointer.

use nix::libc::{c_int, c_uint, c_void};

// ============================================================================
// Names and limits
// ============================================================================

pub const G_GATE_CTL_PATH: &str = "/dev/ggctl";
pub const G_GATE_PROVIDER_NAME: &str = "ggate";
pub const G_GATE_MOD_NAME: &str = "geom_gate";
pub const G_GATE_DEV_FMT: &str = "/dev/ggate";

pub const G_GATE_VERSION: c_uint = 3;

/// `NAME_MAX` on FreeBSD
pub const NAME_MAX: usize = 255;
pub const G_GATE_INFOSIZE: usize = 2048;

/// Unit number that asks the kernel to pick a free unit
pub const G_GATE_UNIT_AUTO: c_int = -1;

// ============================================================================
// Device flags
// ============================================================================

pub const G_GATE_FLAG_READWRITE: u32 = 0x0000;
pub const G_GATE_FLAG_READONLY: u32 = 0x0001;
pub const G_GATE_FLAG_WRITEONLY: u32 = 0x0002;
pub const G_GATE_USERFLAGS: u32 = G_GATE_FLAG_READONLY | G_GATE_FLAG_WRITEONLY;

// ============================================================================
// bio commands delivered through G_GATE_CMD_START
// ============================================================================

pub const BIO_READ: c_uint = 0x01;
pub const BIO_WRITE: c_uint = 0x02;
pub const BIO_DELETE: c_uint = 0x03;
pub const BIO_FLUSH: c_uint = 0x05;

// ============================================================================
// Control command numbers (ioctl group 'm')
// ============================================================================

pub const G_GATE_IOC_MAGIC: u8 = b'm';

pub const G_GATE_CMD_CREATE: u8 = 0;
pub const G_GATE_CMD_DESTROY: u8 = 2;
pub const G_GATE_CMD_START: u8 = 4;
pub const G_GATE_CMD_DONE: u8 = 5;

nix::ioctl_readwrite!(gate_cmd_create, G_GATE_IOC_MAGIC, G_GATE_CMD_CREATE, GCtlCreate);
nix::ioctl_readwrite!(gate_cmd_destroy, G_GATE_IOC_MAGIC, G_GATE_CMD_DESTROY, GCtlDestroy);
nix::ioctl_readwrite!(gate_cmd_start, G_GATE_IOC_MAGIC, G_GATE_CMD_START, GCtlIo);
nix::ioctl_readwrite!(gate_cmd_done, G_GATE_IOC_MAGIC, G_GATE_CMD_DONE, GCtlIo);

// ============================================================================
// Kernel Structures
// ============================================================================

/// `struct g_gate_ctl_create`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GCtlCreate {
    pub version: c_uint,
    pub mediasize: i64,
    pub sectorsize: c_uint,
    pub flags: c_uint,
    pub maxcount: c_uint,
    pub timeout: c_uint,
    pub name: [u8; NAME_MAX],
    pub info: [u8; G_GATE_INFOSIZE],
    pub readprov: [u8; NAME_MAX],
    pub readoffset: i64,
    /// in: requested unit or `G_GATE_UNIT_AUTO`; out: assigned unit
    pub unit: c_int,
}

impl Default for GCtlCreate {
    fn default() -> Self {
        Self {
            version: G_GATE_VERSION,
            mediasize: 0,
            sectorsize: 0,
            flags: 0,
            maxcount: 0,
            timeout: 0,
            name: [0; NAME_MAX],
            info: [0; G_GATE_INFOSIZE],
            readprov: [0; NAME_MAX],
            readoffset: 0,
            unit: G_GATE_UNIT_AUTO,
        }
    }
}

impl std::fmt::Debug for GCtlCreate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GCtlCreate")
            .field("version", &self.version)
            .field("mediasize", &self.mediasize)
            .field("sectorsize", &self.sectorsize)
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("maxcount", &self.maxcount)
            .field("timeout", &self.timeout)
            .field("name", &c_field(&self.name))
            .field("info", &c_field(&self.info))
            .field("readprov", &c_field(&self.readprov))
            .field("readoffset", &self.readoffset)
            .field("unit", &self.unit)
            .finish()
    }
}

/// `struct g_gate_ctl_destroy`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GCtlDestroy {
    pub version: c_uint,
    pub unit: c_int,
    pub force: c_int,
    pub name: [u8; NAME_MAX],
}

impl GCtlDestroy {
    pub fn new(unit: c_int, force: bool) -> Self {
        Self {
            version: G_GATE_VERSION,
            unit,
            force: force as c_int,
            name: [0; NAME_MAX],
        }
    }
}

impl std::fmt::Debug for GCtlDestroy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GCtlDestroy")
            .field("unit", &self.unit)
            .field("force", &self.force)
            .finish()
    }
}

/// `struct g_gate_ctl_io`, shared by `G_GATE_CMD_START` and `G_GATE_CMD_DONE`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GCtlIo {
    pub version: c_uint,
    pub unit: c_int,
    pub seq: usize,
    pub cmd: c_uint,
    pub offset: i64,
    pub length: i64,
    pub data: *mut c_void,
    pub error: c_int,
}

impl GCtlIo {
    pub fn new(unit: c_int) -> Self {
        Self {
            version: G_GATE_VERSION,
            unit,
            seq: 0,
            cmd: 0,
            offset: 0,
            length: 0,
            data: std::ptr::null_mut(),
            error: 0,
        }
    }
}

impl Default for GCtlIo {
    fn default() -> Self {
        Self::new(G_GATE_UNIT_AUTO)
    }
}

/// Copy `value` into a NUL-terminated fixed-size field.
///
/// Returns `false` (leaving the field untouched) when `value` plus the
/// terminator does not fit.
pub fn set_c_field(field: &mut [u8], value: &[u8]) -> bool {
    if value.len() >= field.len() {
        return false;
    }
    field[..value.len()].copy_from_slice(value);
    field[value.len()] = 0;
    true
}

/// View a NUL-terminated fixed-size field as text.
pub fn c_field(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
