//! Logging to stderr and the log file, and error reporting to Sentry.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use sentry::integrations::tracing as sentry_tracing;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

use crate::config::Config;

/// Initializes Sentry if a DSN is configured.
///
/// Must be called before the tokio runtime is created.
pub fn init_sentry(config: &Config) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry.dsn.as_ref()?;

    Some(sentry::init(sentry::ClientOptions {
        dsn: dsn.expose_secret().as_str().parse().ok(),
        environment: config.sentry.environment.clone(),
        sample_rate: config.sentry.sample_rate,
        release: sentry::release_name!(),
        ..Default::default()
    }))
}

/// Directives applied unless `RUST_LOG` holds custom ones.
///
/// This is the maximum verbosity that will be logged, the outputs filter this down to their level.
const DEFAULT_DIRECTIVES: &str = "INFO,s3load_cli=TRACE,s3load_engine=TRACE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Installs the global subscriber: stderr, the log file, and Sentry if enabled.
pub fn init_tracing(config: &Config) -> Result<()> {
    let path = config.logging.file_path();
    let file = open_log_file(&path)
        .with_context(|| format!("failed to open log file `{}`", path.display()))?;

    let (level, directives) = parse_rust_log(config.logging.level);
    let mut layers = output_layers(
        std::io::stderr,
        Mutex::new(file),
        level,
        &directives,
        config.logging.level,
    );

    if config.sentry.is_enabled() {
        let sentry_layer =
            sentry_tracing::layer().event_filter(|metadata| match *metadata.level() {
                Level::ERROR => sentry_tracing::EventFilter::Event,
                Level::WARN | Level::INFO => sentry_tracing::EventFilter::Breadcrumb,
                Level::DEBUG | Level::TRACE => sentry_tracing::EventFilter::Ignore,
            });
        layers.push(sentry_layer.with_filter(EnvFilter::new(&directives)).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}

/// Builds the stderr and file outputs.
///
/// `RUST_LOG` only shapes stderr. The file receives the default directives at the configured
/// level but never less than INFO, so upload records and the run summary always reach it.
fn output_layers<E, F>(
    stderr: E,
    file: F,
    level: LevelFilter,
    directives: &str,
    configured: LevelFilter,
) -> Vec<BoxedLayer>
where
    E: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    F: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(stderr)
        .with_target(true)
        .with_filter(EnvFilter::new(directives).and(level));
    let file = tracing_subscriber::fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(true)
        .with_filter(EnvFilter::new(DEFAULT_DIRECTIVES).and(configured.max(LevelFilter::INFO)));

    vec![stderr.boxed(), file.boxed()]
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Resolves the stderr level and filter directives.
///
/// `RUST_LOG` holding a plain level replaces the configured level. Any other value is used
/// literally as filter directives.
pub fn parse_rust_log(configured: LevelFilter) -> (LevelFilter, String) {
    match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<LevelFilter>() {
            Ok(level) => (level, DEFAULT_DIRECTIVES.to_owned()),
            Err(_) => (LevelFilter::TRACE, value),
        },
        Err(_) => (configured, DEFAULT_DIRECTIVES.to_owned()),
    }
}
