//! FreeBSD GEOM Gate device handling
//!
//! Direct kernel interface using only:
//! - nix ioctls on `/dev/ggctl`
//! - one synchronous request loop per device

pub mod ctrl;
pub mod dispatch;
pub mod io;
pub mod session;
pub mod sys;

pub use ctrl::{destroy_unit, load_gate_module, ControlChannel, ControlCommand, CtrlError, GateCtl};
#[cfg(test)]
pub use ctrl::{Completion, KernelEvent, MockGateCtl};
pub use dispatch::{DispatchError, DispatchLoop, DispatchStats};
pub use io::{BioCmd, IoRequest, StartStatus, WorkingBuffer, INITIAL_BUFFER_SIZE};
pub use session::{
    clamp_timeout, AccessMode, DeviceGeometry, DeviceSession, SessionConfig, SessionError,
    SessionState,
};
