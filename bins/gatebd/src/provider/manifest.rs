//! Provider manifest
//!
//! A small TOML file selecting one of the built-in providers and its
//! attributes:
//!
//! ```toml
//! kind = "file"
//! mediasize = "200M"
//! sectorsize = 4096
//! flags = "rw"
//! path = "/var/tmp/disk.img"
//! create = true
//! ```

use super::{FileProvider, MemoryProvider, Provider, ProviderAttrs};
use crate::gate::sys::{G_GATE_FLAG_READONLY, G_GATE_FLAG_READWRITE, G_GATE_FLAG_WRITEONLY};
use serde::Deserialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// RAM disk
    Memory,
    /// Regular file or disk
    File,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::Memory => "memory",
            ProviderKind::File => "file",
        })
    }
}

/// Access flags a provider advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestFlags {
    Rw,
    Ro,
    Wo,
}

impl ManifestFlags {
    pub fn bits(self) -> u32 {
        match self {
            ManifestFlags::Rw => G_GATE_FLAG_READWRITE,
            ManifestFlags::Ro => G_GATE_FLAG_READONLY,
            ManifestFlags::Wo => G_GATE_FLAG_WRITEONLY,
        }
    }
}

/// Size given either as bytes or with a K/M/G/T suffix
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Bytes(u64),
    Text(String),
}

impl SizeSpec {
    pub fn to_bytes(&self) -> Result<u64, ManifestError> {
        match self {
            SizeSpec::Bytes(n) => Ok(*n),
            SizeSpec::Text(s) => parse_size(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub kind: ProviderKind,

    /// Total size. Optional for `file`, where the file length is used.
    pub mediasize: Option<SizeSpec>,

    /// Sector size in bytes (default 512)
    pub sectorsize: Option<u32>,

    pub flags: Option<ManifestFlags>,
    pub name: Option<String>,
    pub info: Option<String>,
    pub readprov: Option<String>,
    pub readoffset: Option<u64>,

    /// Reserved, logged only
    pub maxcount: Option<u32>,

    /// Backing file. Falls back to the first provider argument.
    pub path: Option<PathBuf>,

    /// Create or extend the backing file to `mediasize`
    #[serde(default)]
    pub create: bool,

    /// Memory provider: zero ranges on delete
    #[serde(default = "default_zero_on_delete")]
    pub zero_on_delete: bool,
}

fn default_zero_on_delete() -> bool {
    true
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("cannot read {}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("cannot parse {}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid size '{value}': {reason}")]
    InvalidSize { value: String, reason: &'static str },

    #[error("{kind} provider needs a mediasize")]
    MissingMediasize { kind: ProviderKind },

    #[error("file provider needs a path (manifest `path` or first argument)")]
    MissingPath,

    #[error("cannot set up {kind} provider: {error:#}")]
    Open {
        kind: ProviderKind,
        error: anyhow::Error,
    },
}

/// Parse a size such as `4096`, `64K`, `200M`, `2GiB` or `1T`.
pub fn parse_size(s: &str) -> Result<u64, ManifestError> {
    let invalid = |reason| ManifestError::InvalidSize {
        value: s.to_string(),
        reason,
    };

    let upper = s.trim().to_ascii_uppercase();
    let digits = upper
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(upper.len());
    let (num, suffix) = upper.split_at(digits);
    if num.is_empty() {
        return Err(invalid("expected a number"));
    }

    let shift = match suffix.trim() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        _ => return Err(invalid("unknown suffix")),
    };

    let num: u64 = num.parse().map_err(|_| invalid("number too large"))?;
    num.checked_mul(1u64 << shift)
        .ok_or_else(|| invalid("number too large"))
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Attribute values common to all provider kinds
    pub fn attrs(&self) -> Result<ProviderAttrs, ManifestError> {
        Ok(ProviderAttrs {
            mediasize: self.mediasize.as_ref().map(SizeSpec::to_bytes).transpose()?,
            sectorsize: self.sectorsize,
            flags: self.flags.map(ManifestFlags::bits),
            name: self.name.clone(),
            info: self.info.clone(),
            readprov: self.readprov.clone(),
            readoffset: self.readoffset,
            maxcount: self.maxcount,
        })
    }

    /// Instantiate the provider. `args` are the trailing command-line
    /// arguments.
    pub fn build(&self, args: &[String]) -> Result<Box<dyn Provider>, ManifestError> {
        let attrs = self.attrs()?;
        let kind = self.kind;

        match kind {
            ProviderKind::Memory => {
                if attrs.mediasize.is_none() {
                    return Err(ManifestError::MissingMediasize { kind });
                }
                let provider = MemoryProvider::new(attrs)
                    .map_err(|error| ManifestError::Open { kind, error })?
                    .with_zero_on_delete(self.zero_on_delete);
                Ok(Box::new(provider))
            }
            ProviderKind::File => {
                let path = self
                    .path
                    .clone()
                    .or_else(|| args.first().map(PathBuf::from))
                    .ok_or(ManifestError::MissingPath)?;
                let provider = FileProvider::open(&path, attrs, self.create)
                    .map_err(|error| ManifestError::Open { kind, error })?;
                Ok(Box::new(provider))
            }
        }
    }
}

/// Read the manifest at `path` and build its provider.
pub fn load_manifest(path: &Path, args: &[String]) -> Result<Box<dyn Provider>, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let manifest = Manifest::parse(&text).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(path = %path.display(), kind = %manifest.kind, args = args.len(), "Manifest loaded");
    manifest.build(args)
}
