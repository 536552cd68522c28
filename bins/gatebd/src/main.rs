//! gatebd - user-space block devices on FreeBSD GEOM Gate
//!
//! # Usage
//!
//! ```bash
//! # 200 MiB RAM disk, unit picked by the kernel
//! cat > ram.toml <<EOF
//! kind = "memory"
//! mediasize = "200M"
//! EOF
//! gatebd ram.toml            # prints /dev/ggate0
//!
//! # Read-only view of an image file on /dev/ggate3
//! gatebd -o ro -u 3 file.toml /var/tmp/disk.img
//! ```

mod cleanup;
mod cli;

use clap::Parser;
use cli::Cli;
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version go to stdout and are not failures
            let code = if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
            let _ = e.print();
            return code;
        }
    };

    // RUST_LOG wins over -q/-v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli::serve::run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e:#}", progname());
            ExitCode::FAILURE
        }
    }
}

fn progname() -> String {
    std::env::args_os()
        .next()
        .and_then(|arg| Path::new(&arg).file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "gatebd".to_string())
}
