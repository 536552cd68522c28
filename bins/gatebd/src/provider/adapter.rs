//! Provider adapter
//!
//! Wraps a [`Provider`] and gives the session and dispatch loop normalized
//! answers: typed, range-checked attributes and plain errno status codes for
//! I/O. Nothing a provider does (error, bogus status, panic) escapes past
//! [`ProviderAdapter::invoke_io`].

use super::{Capabilities, IoReply, Provider};
use crate::gate::sys::set_c_field;
use nix::libc;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Provider attribute names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
    Mediasize,
    Sectorsize,
    Flags,
    Name,
    Info,
    Readprov,
    Readoffset,
    Maxcount,
}

impl Attr {
    pub fn name(self) -> &'static str {
        match self {
            Attr::Mediasize => "mediasize",
            Attr::Sectorsize => "sectorsize",
            Attr::Flags => "flags",
            Attr::Name => "name",
            Attr::Info => "info",
            Attr::Readprov => "readprov",
            Attr::Readoffset => "readoffset",
            Attr::Maxcount => "maxcount",
        }
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
pub enum AttrError {
    #[error("provider {provider} must implement #{}", .missing.join(", #"))]
    UnsupportedProvider {
        provider: String,
        missing: Vec<String>,
    },

    #[error("provider does not answer #{0}")]
    MissingAttribute(Attr),

    #[error("{attr}: negative or too huge - {value}")]
    AttributeRange { attr: Attr, value: i64 },

    #[error("{attr}: string size is too long (expect {max}, but actual {actual})")]
    AttributeTooLong {
        attr: Attr,
        max: usize,
        actual: usize,
    },
}

/// A provider I/O call with its arguments
#[derive(Debug)]
pub enum IoCall<'a> {
    Read {
        offset: u64,
        length: usize,
        buf: &'a mut Vec<u8>,
    },
    Write {
        offset: u64,
        buf: &'a [u8],
    },
    Delete {
        offset: u64,
        length: usize,
    },
}

impl IoCall<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            IoCall::Read { .. } => "readat",
            IoCall::Write { .. } => "writeat",
            IoCall::Delete { .. } => "deleteat",
        }
    }

    fn capability(&self) -> Capabilities {
        match self {
            IoCall::Read { .. } => Capabilities::READAT,
            IoCall::Write { .. } => Capabilities::WRITEAT,
            IoCall::Delete { .. } => Capabilities::DELETEAT,
        }
    }
}

pub struct ProviderAdapter {
    provider: Box<dyn Provider>,
    caps: Capabilities,
    cleaned_up: bool,
}

impl fmt::Debug for ProviderAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderAdapter")
            .field("caps", &self.caps)
            .field("cleaned_up", &self.cleaned_up)
            .finish_non_exhaustive()
    }
}

impl ProviderAdapter {
    /// Bind a provider, rejecting it if a mandatory capability is missing.
    pub fn bind(provider: Box<dyn Provider>) -> Result<Self, AttrError> {
        let adapter = Self {
            caps: provider.capabilities(),
            provider,
            cleaned_up: false,
        };
        adapter.require_capabilities()?;
        debug!(capabilities = ?adapter.caps, "Provider bound");
        Ok(adapter)
    }

    pub fn require_capabilities(&self) -> Result<(), AttrError> {
        let missing = self.caps.missing(Capabilities::REQUIRED);
        if missing.is_empty() {
            return Ok(());
        }
        Err(AttrError::UnsupportedProvider {
            provider: self.provider.name().unwrap_or_else(|| "(unnamed)".to_string()),
            missing,
        })
    }

    #[inline]
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn int_attr(&self, attr: Attr) -> Option<i64> {
        match attr {
            Attr::Mediasize => self.provider.mediasize(),
            Attr::Sectorsize => self.provider.sectorsize(),
            Attr::Flags => self.provider.flags(),
            Attr::Readoffset => self.provider.readoffset(),
            Attr::Maxcount => self.provider.maxcount(),
            Attr::Name | Attr::Info | Attr::Readprov => None,
        }
    }

    fn str_attr(&self, attr: Attr) -> Option<String> {
        match attr {
            Attr::Name => self.provider.name(),
            Attr::Info => self.provider.info(),
            Attr::Readprov => self.provider.readprov(),
            _ => None,
        }
    }

    /// Read an unsigned 64-bit attribute. Without `default` an absent
    /// attribute is an error.
    pub fn get_u64(&self, attr: Attr, default: Option<u64>) -> Result<u64, AttrError> {
        match self.int_attr(attr) {
            None => default.ok_or(AttrError::MissingAttribute(attr)),
            Some(value) => {
                u64::try_from(value).map_err(|_| AttrError::AttributeRange { attr, value })
            }
        }
    }

    /// Read an unsigned 32-bit attribute. Without `default` an absent
    /// attribute is an error.
    pub fn get_u32(&self, attr: Attr, default: Option<u32>) -> Result<u32, AttrError> {
        match self.int_attr(attr) {
            None => default.ok_or(AttrError::MissingAttribute(attr)),
            Some(value) => {
                u32::try_from(value).map_err(|_| AttrError::AttributeRange { attr, value })
            }
        }
    }

    /// Copy a string attribute into a NUL-terminated field of `buf.len()`
    /// bytes. Returns `false` and leaves `buf` alone if the provider has no
    /// such attribute.
    pub fn get_string(&self, attr: Attr, buf: &mut [u8]) -> Result<bool, AttrError> {
        let Some(value) = self.str_attr(attr) else {
            return Ok(false);
        };
        if !set_c_field(buf, value.as_bytes()) {
            return Err(AttrError::AttributeTooLong {
                attr,
                max: buf.len().saturating_sub(1),
                actual: value.len(),
            });
        }
        Ok(true)
    }

    /// Run a provider I/O method and turn the outcome into an errno.
    pub fn invoke_io(&mut self, call: IoCall<'_>) -> i32 {
        let op = call.name();
        if !self.caps.contains(call.capability()) {
            return libc::EOPNOTSUPP;
        }

        let provider = &mut self.provider;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match call {
            IoCall::Read { offset, length, buf } => provider.readat(offset, length, buf),
            IoCall::Write { offset, buf } => provider.writeat(offset, buf),
            IoCall::Delete { offset, length } => provider.deleteat(offset, length),
        }));

        normalize_status(op, outcome)
    }

    /// Run the optional cleanup hook, at most once. Failures are logged and
    /// swallowed. Returns whether the hook was invoked.
    pub fn try_cleanup(&mut self) -> bool {
        if self.cleaned_up || !self.caps.contains(Capabilities::CLEANUP) {
            return false;
        }
        self.cleaned_up = true;

        let provider = &mut self.provider;
        match panic::catch_unwind(AssertUnwindSafe(|| provider.cleanup())) {
            Ok(Ok(())) => debug!("Provider cleanup finished"),
            Ok(Err(e)) => warn!(error = %e, "Provider cleanup failed"),
            Err(_) => warn!("Provider cleanup panicked"),
        }
        true
    }
}

/// Map a provider outcome to the errno reported to the kernel.
pub(crate) fn normalize_status(op: &'static str, outcome: std::thread::Result<IoReply>) -> i32 {
    match outcome {
        Ok(Ok(None)) => 0,
        Ok(Ok(Some(code))) => match i32::try_from(code) {
            Ok(code) if code >= 0 => {
                if code != 0 {
                    trace!(op, code, "Provider reported an error");
                }
                code
            }
            _ => {
                warn!(op, code, "Provider returned an invalid status");
                libc::EIO
            }
        },
        Ok(Err(e)) => {
            warn!(op, error = %e, "Provider call failed");
            libc::EIO
        }
        Err(_) => {
            warn!(op, "Provider call panicked");
            libc::EIO
        }
    }
}
