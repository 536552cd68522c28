//! gatebd - user-space block devices on FreeBSD GEOM Gate
//!
//! The kernel exposes `/dev/ggate<N>` and queues every bio it receives;
//! gatebd pulls the requests off `/dev/ggctl` one at a time and forwards
//! them to a [`Provider`].
//!
//! # Example
//!
//! ```no_run
//! use gatebd::gate::{AccessMode, DeviceSession, GateCtl, SessionConfig};
//! use gatebd::provider::{MemoryProvider, ProviderAdapter, ProviderAttrs};
//!
//! let provider = MemoryProvider::new(ProviderAttrs {
//!     mediasize: Some(64 << 20),
//!     ..Default::default()
//! })?;
//! let mut adapter = ProviderAdapter::bind(Box::new(provider))?;
//!
//! let mut ctl = GateCtl::new();
//! ctl.open()?;
//!
//! let config = SessionConfig { accmode: AccessMode::ReadWrite, ..Default::default() };
//! let mut session = DeviceSession::new(ctl, config);
//! session.create(&adapter)?;
//! println!("{}", session.device_path().unwrap_or_default());
//!
//! // Blocks until the device is destroyed
//! let err = session.run(&mut adapter).unwrap_err();
//! assert!(err.is_revoked());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod gate;
pub mod provider;

pub use gate::{DeviceSession, GateCtl, SessionConfig, SessionError};
pub use provider::{Capabilities, IoReply, Provider, ProviderAdapter};
