//! RAM-backed provider

use super::{attr_i64, Capabilities, IoReply, Provider, ProviderAttrs, DEFAULT_SECTOR_SIZE};
use anyhow::Context;
use nix::libc;
use std::ops::Range;

/// Zero-initialised in-memory disk. Contents are lost when the process exits.
#[derive(Debug)]
pub struct MemoryProvider {
    attrs: ProviderAttrs,
    data: Vec<u8>,
    zero_on_delete: bool,
}

impl MemoryProvider {
    pub fn new(attrs: ProviderAttrs) -> anyhow::Result<Self> {
        let size = attrs
            .mediasize
            .context("memory provider needs a mediasize")?;
        let len = usize::try_from(size).context("mediasize does not fit in memory")?;

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .with_context(|| format!("cannot allocate {size} bytes"))?;
        data.resize(len, 0);

        Ok(Self {
            attrs,
            data,
            zero_on_delete: true,
        })
    }

    /// Whether `deleteat` clears the range (default) or leaves it alone
    pub fn with_zero_on_delete(mut self, zero_on_delete: bool) -> Self {
        self.zero_on_delete = zero_on_delete;
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, offset: u64, length: usize) -> Option<Range<usize>> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(length)?;
        (end <= self.data.len()).then_some(start..end)
    }
}

impl Provider for MemoryProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::REQUIRED
    }

    fn mediasize(&self) -> Option<i64> {
        i64::try_from(self.data.len()).ok()
    }

    fn sectorsize(&self) -> Option<i64> {
        Some(self.attrs.sectorsize.unwrap_or(DEFAULT_SECTOR_SIZE).into())
    }

    fn flags(&self) -> Option<i64> {
        self.attrs.flags.map(i64::from)
    }

    fn name(&self) -> Option<String> {
        self.attrs.name.clone()
    }

    fn info(&self) -> Option<String> {
        self.attrs.info.clone()
    }

    fn readprov(&self) -> Option<String> {
        self.attrs.readprov.clone()
    }

    fn readoffset(&self) -> Option<i64> {
        attr_i64(self.attrs.readoffset)
    }

    fn maxcount(&self) -> Option<i64> {
        self.attrs.maxcount.map(i64::from)
    }

    fn readat(&mut self, offset: u64, length: usize, buf: &mut Vec<u8>) -> IoReply {
        // Past the end is a short read; the caller zero-fills
        let Ok(start) = usize::try_from(offset) else {
            return Ok(None);
        };
        if start < self.data.len() {
            let end = start.saturating_add(length).min(self.data.len());
            buf.extend_from_slice(&self.data[start..end]);
        }
        Ok(None)
    }

    fn writeat(&mut self, offset: u64, buf: &[u8]) -> IoReply {
        match self.range(offset, buf.len()) {
            Some(range) => {
                self.data[range].copy_from_slice(buf);
                Ok(None)
            }
            None => Ok(Some(libc::EIO.into())),
        }
    }

    fn deleteat(&mut self, offset: u64, length: usize) -> IoReply {
        match self.range(offset, length) {
            Some(range) => {
                if self.zero_on_delete {
                    self.data[range].fill(0);
                }
                Ok(None)
            }
            None => Ok(Some(libc::EIO.into())),
        }
    }
}
