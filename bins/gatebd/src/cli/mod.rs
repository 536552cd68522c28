//! CLI module for gatebd
//!
//! `gatebd [-hqv] [-o rw|ro|wo] [-t secs] [-u unit] <manifest> [args...]`

pub mod serve;

use clap::{ArgAction, Parser, ValueEnum};
use gatebd::gate::AccessMode;
use std::path::PathBuf;

/// gatebd - serve a GEOM Gate block device from a storage provider
#[derive(Parser, Debug)]
#[command(name = "gatebd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Only report errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Access mode of the device
    #[arg(short = 'o', long = "access", value_enum, default_value = "rw")]
    pub access: Access,

    /// Request timeout in seconds (below 1 means 30, above 1000 means 500)
    #[arg(short, long, default_value_t = 30, allow_negative_numbers = true)]
    pub timeout: i64,

    /// Unit number of /dev/ggate<N>; negative picks a free one
    #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
    pub unit: i32,

    /// Provider manifest (TOML)
    pub manifest: PathBuf,

    /// Arguments handed to the provider
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum, Default, PartialEq, Eq)]
pub enum Access {
    /// Read-write (default)
    #[default]
    Rw,
    /// Read-only
    Ro,
    /// Write-only
    Wo,
}

impl From<Access> for AccessMode {
    fn from(access: Access) -> Self {
        match access {
            Access::Rw => AccessMode::ReadWrite,
            Access::Ro => AccessMode::ReadOnly,
            Access::Wo => AccessMode::WriteOnly,
        }
    }
}

impl Cli {
    /// Log filter used when `RUST_LOG` is not set
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Format bytes as human-readable string
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    if bytes >= TIB {
        format!("{:.1}T", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1}G", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1}M", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1}K", bytes as f64 / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}
