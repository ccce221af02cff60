//! Load generation and measurement engine for benchmarking object uploads.
//!
//! A run uploads a fixed number of equally sized objects with pseudo-random contents to a storage
//! endpoint. The [`LoadEngine`] spreads the uploads over a bounded pool of workers, each with at
//! most one upload in flight. Every result flows into a [`MetricsAggregator`], whose final
//! [`RunSnapshot`] is rendered by the [`report`] module.
//!
//! Uploads go through the [`Uploader`] trait. [`S3Uploader`] writes to S3-compatible endpoints,
//! tests plug in their own implementations.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod engine;
pub mod metrics;
pub mod payload;
pub mod report;
pub mod size;
pub mod upload;

pub use engine::{EngineError, LoadEngine, RunConfiguration};
pub use metrics::{LatencyPercentiles, MetricsAggregator, RunSnapshot};
pub use payload::PayloadGenerator;
pub use report::RunLabels;
pub use size::{InvalidSizeFormat, parse_size};
pub use upload::{
    ErrorKind, S3Uploader, S3UploaderConfig, UploadError, UploadResult, UploadTask, Uploader,
    UploaderError,
};
