//! The `s3load` command line and the lifecycle of a run.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use argh::FromArgs;
use s3load_engine::{LoadEngine, RunLabels, RunSnapshot, S3Uploader, report};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use yansi::Paint;

use crate::config::{Config, ConfigError, Overrides, RunPlan};
use crate::{observability, preflight};

/// Exit code of a fatal error, such as an unreachable endpoint.
pub const EXIT_FATAL: u8 = 1;
/// Exit code of invalid or incomplete settings.
pub const EXIT_CONFIG: u8 = 2;

/// Benchmark object uploads to S3-compatible storage.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Upload(UploadCommand),
    Version(VersionCommand),
}

/// upload objects with random contents and report throughput and latency
///
/// Settings not given as flags are taken from the environment (prefixed with `S3LOAD__`) and the
/// configuration file.
#[derive(Debug, Default, FromArgs)]
#[argh(subcommand, name = "upload")]
struct UploadCommand {
    /// endpoint URL, for example http://localhost:9000
    #[argh(option, short = 'e')]
    endpoint: Option<String>,

    /// access key ID
    #[argh(option)]
    s3key: Option<String>,

    /// secret access key
    #[argh(option)]
    s3secret: Option<String>,

    /// bucket that receives the objects
    #[argh(option, short = 'b')]
    bucket: Option<String>,

    /// number of objects to upload (default: 100)
    #[argh(option, short = 'n')]
    object_count: Option<u64>,

    /// size of every object with an optional k, m or g suffix (default: 4k)
    #[argh(option, short = 's')]
    object_size: Option<String>,

    /// accept invalid TLS certificates and host names
    #[argh(switch)]
    insecure: bool,

    /// region used to sign requests (default: us-east-1)
    #[argh(option)]
    location: Option<String>,

    /// maximum number of uploads in flight (default: number of CPUs)
    #[argh(option, short = 'j')]
    concurrency: Option<usize>,

    /// prefix of all object keys (default: s3load)
    #[argh(option)]
    prefix: Option<String>,

    /// interrupt the run after this time, for example 30s or 5m
    #[argh(option)]
    deadline: Option<String>,

    /// skip the reachability check of the endpoint
    #[argh(switch)]
    no_preflight: bool,
}

impl UploadCommand {
    fn overrides(self) -> Overrides {
        Overrides {
            endpoint: self.endpoint,
            bucket: self.bucket,
            region: self.location,
            access_key: self.s3key,
            secret_key: self.s3secret,
            insecure: self.insecure.then_some(true),
            object_count: self.object_count,
            object_size: self.object_size,
            concurrency: self.concurrency,
            key_prefix: self.prefix,
            deadline: self.deadline,
            preflight: self.no_preflight.then_some(false),
        }
    }
}

/// print the s3load version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Reasons a run could not produce a report.
#[derive(Debug, Error)]
pub enum RunError {
    /// The settings are invalid or incomplete.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The run could not start, for example because the endpoint is unreachable.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Maps the outcome of a run to the process exit code.
///
/// A run that completes exits successfully, even if uploads failed or the run was interrupted.
pub fn exit_code(outcome: &Result<RunSnapshot, RunError>) -> u8 {
    match outcome {
        Ok(_) => 0,
        Err(RunError::Config(_)) => EXIT_CONFIG,
        Err(RunError::Fatal(_)) => EXIT_FATAL,
    }
}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> ExitCode {
    let args: Args = argh::from_env();

    let upload = match args.command {
        Command::Version(VersionCommand {}) => {
            println!("s3load {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Command::Upload(upload) => upload,
    };

    let outcome = upload_command(args.config.as_deref(), upload.overrides());
    match &outcome {
        Ok(snapshot) => {
            println!("{}", "upload summary".bold());
            print!("{}", report::render(snapshot));
        }
        Err(err) => eprintln!("{} {}", "error:".red().bold(), describe(err)),
    }

    ExitCode::from(exit_code(&outcome))
}

fn describe(err: &RunError) -> String {
    match err {
        RunError::Config(err) => error_chain(err),
        RunError::Fatal(err) => format!("{err:#}"),
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn upload_command(
    config_path: Option<&Path>,
    overrides: Overrides,
) -> Result<RunSnapshot, RunError> {
    let config = Config::load(config_path, &overrides)?;
    let plan = config.plan()?;

    // Sentry should be initialized before creating the async runtime.
    let _sentry_guard = observability::init_sentry(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("s3load-rt")
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config)?;
    tracing::debug!(?config);

    runtime.block_on(run(plan))
}

/// Executes a validated run and returns its final statistics.
///
/// Checks that the endpoint is reachable first, unless disabled in the plan.
pub async fn run(plan: RunPlan) -> Result<RunSnapshot, RunError> {
    if plan.preflight {
        preflight::check_endpoint(
            &plan.target.endpoint,
            plan.target.tls_verify,
            preflight::PREFLIGHT_TIMEOUT,
        )
        .await?;
    }

    let endpoint = plan.target.endpoint.clone();
    let bucket = plan.target.bucket.clone();
    let region = plan.target.region.clone();
    let object_size = plan.run.object_size_bytes;

    let uploader = S3Uploader::new(plan.target).map_err(ConfigError::from)?;
    let engine = LoadEngine::new(plan.run, Arc::new(uploader)).map_err(ConfigError::from)?;
    let run_id = engine.run_id().to_owned();

    let cancel = CancellationToken::new();
    let snapshot = run_until_interrupted(engine, cancel, plan.deadline).await;

    let labels = RunLabels {
        run_id: &run_id,
        endpoint: &endpoint,
        bucket: &bucket,
        region: &region,
        object_size,
    };
    report::log_summary(&labels, &snapshot);
    Ok(snapshot)
}

/// Runs the engine and cancels it on SIGINT, SIGTERM or when the deadline passes.
async fn run_until_interrupted(
    engine: LoadEngine,
    cancel: CancellationToken,
    deadline: Option<Duration>,
) -> RunSnapshot {
    let run = engine.run(cancel.clone());
    tokio::pin!(run);

    tokio::select! {
        snapshot = &mut run => return snapshot,
        _ = interrupted(deadline) => {}
    }

    cancel.cancel();
    run.await
}

async fn interrupted(deadline: Option<Duration>) {
    let deadline = async {
        match deadline {
            Some(deadline) => {
                tokio::time::sleep(deadline).await;
                tracing::info!(?deadline, "deadline reached");
            }
            None => std::future::pending().await,
        }
    };

    let signal = async {
        elegant_departure::tokio::depart()
            .on_termination()
            .on_sigint()
            .await;
        tracing::info!("received shutdown signal");
    };

    tokio::select! {
        _ = deadline => {}
        _ = signal => {}
    }
}
