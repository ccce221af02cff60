//! The `s3load` command line tool.
//!
//! Uploads a configurable number of objects to an S3-compatible endpoint and reports throughput
//! and latency. See [`s3load_cli::config`] for all settings.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

use std::process::ExitCode;

fn main() -> ExitCode {
    s3load_cli::cli::execute()
}
