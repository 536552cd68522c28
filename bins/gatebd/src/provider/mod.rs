//! Storage providers
//!
//! A provider supplies the semantics of the backing store. gatebd only
//! forwards block requests to it and maps its answers back to the kernel.

pub mod adapter;
pub mod file;
pub mod manifest;
pub mod memory;

pub use adapter::{Attr, AttrError, IoCall, ProviderAdapter};
pub use file::FileProvider;
pub use manifest::{load_manifest, Manifest, ManifestError, ProviderKind};
pub use memory::MemoryProvider;

use bitflags::bitflags;

/// Result of a provider I/O call.
///
/// `Ok(None)` is success, `Ok(Some(errno))` a failed block operation with
/// that error code, and `Err(_)` a fault inside the provider (reported to
/// the kernel as `EIO`).
pub type IoReply = anyhow::Result<Option<i64>>;

bitflags! {
    /// Set of operations a provider declares it implements
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const MEDIASIZE = 1 << 0;
        const SECTORSIZE = 1 << 1;
        const READAT = 1 << 2;
        const WRITEAT = 1 << 3;
        const DELETEAT = 1 << 4;
        const CLEANUP = 1 << 5;
    }
}

impl Capabilities {
    /// What every provider must answer to
    pub const REQUIRED: Self = Self::MEDIASIZE
        .union(Self::SECTORSIZE)
        .union(Self::READAT)
        .union(Self::WRITEAT)
        .union(Self::DELETEAT);

    /// Names of the capabilities in `required` that `self` lacks, lowercased
    /// the way providers spell their methods
    pub fn missing(self, required: Self) -> Vec<String> {
        required
            .difference(self)
            .iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect()
    }
}

/// A user-supplied block store.
///
/// Attribute methods return `None` when the provider has no opinion; the
/// adapter then falls back to a default or reports a missing attribute.
/// Integer attributes are signed so out-of-range answers can be rejected
/// instead of silently wrapped.
pub trait Provider {
    /// Operations this provider implements. Checked once when binding.
    fn capabilities(&self) -> Capabilities;

    /// Total addressable size in bytes
    fn mediasize(&self) -> Option<i64>;

    /// Block granularity in bytes
    fn sectorsize(&self) -> Option<i64>;

    /// `G_GATE_FLAG_READONLY` / `G_GATE_FLAG_WRITEONLY` bits
    fn flags(&self) -> Option<i64> {
        None
    }

    fn name(&self) -> Option<String> {
        None
    }

    /// Free text shown by `ggatel list -v`
    fn info(&self) -> Option<String> {
        None
    }

    /// Provider the kernel may read from directly
    fn readprov(&self) -> Option<String> {
        None
    }

    fn readoffset(&self) -> Option<i64> {
        None
    }

    /// Reserved; gatebd serves one request at a time
    fn maxcount(&self) -> Option<i64> {
        None
    }

    /// Append up to `length` bytes starting at `offset` to `buf`.
    ///
    /// `buf` arrives empty with room for at least `length` bytes. Anything
    /// short of `length` is zero-filled before it reaches the kernel.
    fn readat(&mut self, offset: u64, length: usize, buf: &mut Vec<u8>) -> IoReply {
        let _ = (offset, length, buf);
        anyhow::bail!("readat is not implemented")
    }

    /// Store all of `buf` at `offset`.
    fn writeat(&mut self, offset: u64, buf: &[u8]) -> IoReply {
        let _ = (offset, buf);
        anyhow::bail!("writeat is not implemented")
    }

    /// The range is no longer in use (TRIM).
    fn deleteat(&mut self, offset: u64, length: usize) -> IoReply {
        let _ = (offset, length);
        anyhow::bail!("deleteat is not implemented")
    }

    /// Called once when the device goes away. Only invoked when
    /// [`Capabilities::CLEANUP`] is declared.
    fn cleanup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Attribute values shared by the built-in providers, usually filled in
/// from a [`Manifest`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderAttrs {
    pub mediasize: Option<u64>,
    pub sectorsize: Option<u32>,
    pub flags: Option<u32>,
    pub name: Option<String>,
    pub info: Option<String>,
    pub readprov: Option<String>,
    pub readoffset: Option<u64>,
    pub maxcount: Option<u32>,
}

/// Default sector size of the built-in providers
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Widen an unsigned attribute. Values past `i64::MAX` come out negative so
/// the adapter reports them as out of range.
pub(crate) fn attr_i64(value: Option<u64>) -> Option<i64> {
    value.map(|v| i64::try_from(v).unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_required_names() {
        let missing = Capabilities::empty().missing(Capabilities::REQUIRED);
        assert_eq!(missing, ["mediasize", "sectorsize", "readat", "writeat", "deleteat"]);
    }

    #[test]
    fn test_capabilities_missing_writeat() {
        let caps = Capabilities::REQUIRED.difference(Capabilities::WRITEAT);
        assert_eq!(caps.missing(Capabilities::REQUIRED), ["writeat"]);
        assert!(!caps.contains(Capabilities::WRITEAT));
        assert!(caps.contains(Capabilities::READAT | Capabilities::DELETEAT));
    }

    #[test]
    fn test_capabilities_cleanup_is_optional() {
        assert!(!Capabilities::REQUIRED.contains(Capabilities::CLEANUP));
        assert!(Capabilities::REQUIRED.missing(Capabilities::REQUIRED).is_empty());
    }

    #[test]
    fn test_capabilities_bits() {
        let caps = Capabilities::READAT | Capabilities::CLEANUP;
        assert_eq!(caps.bits(), (1 << 2) | (1 << 5));
        assert_eq!(Capabilities::REQUIRED.bits(), 0x1f);
    }

    struct Bare;

    impl Provider for Bare {
        fn capabilities(&self) -> Capabilities {
            Capabilities::MEDIASIZE | Capabilities::SECTORSIZE
        }

        fn mediasize(&self) -> Option<i64> {
            Some(4096)
        }

        fn sectorsize(&self) -> Option<i64> {
            Some(512)
        }
    }

    #[test]
    fn test_default_io_methods_fail() {
        let mut p = Bare;
        let mut buf = Vec::new();
        assert!(p.readat(0, 512, &mut buf).is_err());
        assert!(p.writeat(0, &[0; 512]).is_err());
        assert!(p.deleteat(0, 512).is_err());
        assert!(p.cleanup().is_ok());
        assert_eq!(p.flags(), None);
        assert_eq!(p.maxcount(), None);
    }
}
