//! File-backed provider

use super::{attr_i64, Capabilities, IoReply, Provider, ProviderAttrs, DEFAULT_SECTOR_SIZE};
use crate::gate::sys::G_GATE_FLAG_READONLY;
use anyhow::Context;
use nix::errno::Errno;
use nix::libc;
use nix::sys::uio::{pread, pwrite};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Serves the device from a regular file or another disk.
#[derive(Debug)]
pub struct FileProvider {
    attrs: ProviderAttrs,
    file: File,
    path: PathBuf,
    mediasize: u64,
}

impl FileProvider {
    /// Open `path` as backing store.
    ///
    /// Without a configured mediasize the current file length is used. With
    /// `create`, a missing file is created and a short one extended.
    pub fn open(path: impl AsRef<Path>, attrs: ProviderAttrs, create: bool) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let readonly = attrs.flags == Some(G_GATE_FLAG_READONLY);

        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .create(create && !readonly)
            .open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;

        let len = file
            .metadata()
            .with_context(|| format!("cannot stat {}", path.display()))?
            .len();

        let mediasize = match attrs.mediasize {
            Some(size) => {
                if create && !readonly && len < size {
                    file.set_len(size)
                        .with_context(|| format!("cannot extend {} to {size} bytes", path.display()))?;
                }
                size
            }
            None => len,
        };

        debug!(path = %path.display(), mediasize, readonly, "Backing file opened");

        Ok(Self {
            attrs,
            file,
            path: path.to_path_buf(),
            mediasize,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn position(offset: u64, done: usize) -> Option<libc::off_t> {
    offset
        .checked_add(done as u64)
        .and_then(|pos| libc::off_t::try_from(pos).ok())
}

fn errno_reply(errno: Errno) -> IoReply {
    Ok(Some(i64::from(errno as i32)))
}

impl Provider for FileProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::REQUIRED | Capabilities::CLEANUP
    }

    fn mediasize(&self) -> Option<i64> {
        attr_i64(Some(self.mediasize))
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
        self.attrs
            .info
            .clone()
            .or_else(|| Some(self.path.display().to_string()))
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
        let start = buf.len();
        buf.resize(start + length, 0);

        let mut done = 0;
        while done < length {
            let Some(pos) = position(offset, done) else {
                buf.truncate(start);
                return errno_reply(Errno::EINVAL);
            };
            match pread(&self.file, &mut buf[start + done..start + length], pos) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    buf.truncate(start);
                    return errno_reply(errno);
                }
            }
        }

        // EOF before `length`: hand back a short read
        buf.truncate(start + done);
        Ok(None)
    }

    fn writeat(&mut self, offset: u64, buf: &[u8]) -> IoReply {
        let mut done = 0;
        while done < buf.len() {
            let Some(pos) = position(offset, done) else {
                return errno_reply(Errno::EINVAL);
            };
            match pwrite(&self.file, &buf[done..], pos) {
                Ok(0) => return errno_reply(Errno::EIO),
                Ok(n) => done += n,
                Err(Errno::EINTR) => continue,
                Err(errno) => return errno_reply(errno),
            }
        }
        Ok(None)
    }

    fn deleteat(&mut self, _offset: u64, _length: usize) -> IoReply {
        Ok(None)
    }

    fn cleanup(&mut self) -> anyhow::Result<()> {
        self.file
            .sync_all()
            .with_context(|| format!("cannot sync {}", self.path.display()))
    }
}
