//! Command line surface of `s3load`: configuration, logging and the `upload` command.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod observability;
pub mod preflight;
