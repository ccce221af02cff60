//! Configuration for the `s3load` command.
//!
//! Settings are layered with the following precedence (highest to lowest):
//!
//! 1. Command line flags of the `upload` command
//! 2. Environment variables (prefixed with `S3LOAD__`)
//! 3. YAML configuration file (specified via `-c` or `--config` flag)
//! 4. Defaults
//!
//! # Environment Variables
//!
//! Environment variables use `S3LOAD__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `S3LOAD__ENDPOINT=http://localhost:9000` sets the S3 endpoint
//! - `S3LOAD__OBJECT_SIZE=1m` sets the size of every object
//! - `S3LOAD__LOGGING__LEVEL=debug` sets the log level
//!
//! # YAML Configuration File
//!
//! ```yaml
//! endpoint: http://localhost:9000
//! bucket: benchmarks
//! access_key: minioadmin
//! secret_key: minioadmin
//! object_count: 1000
//! object_size: 1m
//!
//! logging:
//!   level: debug
//! ```

use std::borrow::Cow;
use std::fmt;
use std::num::NonZero;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use s3load_engine::engine::{DEFAULT_GRACE_PERIOD, DEFAULT_KEY_PREFIX};
use s3load_engine::{
    EngineError, InvalidSizeFormat, RunConfiguration, S3UploaderConfig, UploaderError, parse_size,
};
use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "S3LOAD__";

/// Newtype around `String` that protects against accidental logging of secrets. Use with
/// [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// The secret in plain text.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Errors that prevent a run from starting because of invalid settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration source could not be read or has invalid values.
    #[error("failed to load configuration")]
    Load(#[from] figment::Error),

    /// A setting without a default was not given.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    /// The object size is not a number with an optional suffix.
    #[error("invalid object size")]
    InvalidSize(#[from] InvalidSizeFormat),

    /// The engine rejected the shape of the run.
    #[error("invalid run configuration")]
    Engine(#[from] EngineError),

    /// The S3 client could not be set up.
    #[error("invalid S3 client configuration")]
    Uploader(#[from] UploaderError),
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Accepts object sizes as plain numbers as well as strings with a suffix.
mod size_token {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Token {
        Bytes(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Token::deserialize(deserializer)? {
            Token::Bytes(bytes) => bytes.to_string(),
            Token::Text(text) => text,
        })
    }
}

/// Log output settings.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum level written to stderr, unless overridden by `RUST_LOG`.
    ///
    /// # Default
    ///
    /// `info`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// File that receives a copy of the log records at `level`, but at least `info`. This includes
    /// one line per upload and the run summary, regardless of `RUST_LOG`. Records are appended.
    ///
    /// # Default
    ///
    /// `$HOME/.s3load/s3load.log`, or `s3load.log` in the working directory without `HOME`.
    pub file: Option<PathBuf>,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            file: None,
        }
    }
}

impl Logging {
    /// The log file to append to.
    pub fn file_path(&self) -> PathBuf {
        if let Some(file) = &self.file {
            return file.clone();
        }

        match std::env::var_os("HOME") {
            Some(home) => Path::new(&home).join(".s3load").join("s3load.log"),
            None => PathBuf::from("s3load.log"),
        }
    }
}

/// Error reporting to Sentry. Disabled unless a DSN is set.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Sentry {
    /// DSN of the Sentry project that receives errors.
    pub dsn: Option<SecretBox<ConfigSecret>>,

    /// Environment reported with every event.
    pub environment: Option<Cow<'static, str>>,

    /// Sample rate for error events, between `0.0` and `1.0`.
    pub sample_rate: f32,
}

impl Sentry {
    /// Whether errors are reported to Sentry.
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            sample_rate: 1.0,
        }
    }
}

/// Main configuration of a benchmark run.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// S3 endpoint URL, for example `https://s3.amazonaws.com` or `http://localhost:9000`.
    ///
    /// Required.
    pub endpoint: Option<String>,

    /// Bucket that receives the objects. It must exist before the run.
    ///
    /// Required.
    pub bucket: Option<String>,

    /// Region used to sign requests.
    ///
    /// # Default
    ///
    /// `us-east-1`
    pub region: String,

    /// Access key ID. Required.
    pub access_key: Option<String>,

    /// Secret access key. Required.
    pub secret_key: Option<SecretBox<ConfigSecret>>,

    /// Accept invalid TLS certificates and host names.
    pub insecure: bool,

    /// Timeout of a single upload request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Option<Duration>,

    /// Number of objects to upload.
    ///
    /// # Default
    ///
    /// `100`
    pub object_count: u64,

    /// Size of every object, a number with an optional `k`, `m` or `g` suffix.
    ///
    /// # Default
    ///
    /// `4k`
    #[serde(deserialize_with = "size_token::deserialize")]
    pub object_size: String,

    /// Maximum number of uploads in flight.
    ///
    /// # Default
    ///
    /// The number of available CPUs.
    pub concurrency: usize,

    /// Prefix of all object keys.
    ///
    /// # Default
    ///
    /// `s3load`
    pub key_prefix: String,

    /// Time in-flight uploads get to finish after the run was interrupted.
    ///
    /// # Default
    ///
    /// `10s`
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// Interrupts the run after this time. Unlimited by default.
    #[serde(with = "humantime_serde")]
    pub deadline: Option<Duration>,

    /// Check that the endpoint is reachable before starting the run.
    pub preflight: bool,

    /// Log output settings.
    pub logging: Logging,

    /// Error reporting settings.
    pub sentry: Sentry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: None,
            region: "us-east-1".to_owned(),
            access_key: None,
            secret_key: None,
            insecure: false,
            request_timeout: None,

            object_count: 100,
            object_size: "4k".to_owned(),
            concurrency: std::thread::available_parallelism().map_or(1, NonZero::get),
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            grace_period: DEFAULT_GRACE_PERIOD,
            deadline: None,
            preflight: true,

            logging: Logging::default(),
            sentry: Sentry::default(),
        }
    }
}

/// Settings given explicitly on the command line.
///
/// Only fields that are set override the other configuration sources.
#[derive(Debug, Default, Serialize)]
pub struct Overrides {
    /// Endpoint URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Target bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// Region used to sign requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Access key ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    /// Secret access key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Accept invalid TLS certificates and host names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
    /// Number of objects to upload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_count: Option<u64>,
    /// Size of every object, with an optional suffix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_size: Option<String>,
    /// Maximum number of uploads in flight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Prefix of all object keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
    /// Parsed as a `humantime` duration when the configuration is extracted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    /// Check the endpoint before the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preflight: Option<bool>,
}

/// A validated run, ready to be handed to the engine.
#[derive(Debug)]
pub struct RunPlan {
    /// The shape of the load.
    pub run: RunConfiguration,
    /// Where the objects are written to.
    pub target: S3UploaderConfig,
    /// Interrupts the run after this time.
    pub deadline: Option<Duration>,
    /// Whether the endpoint is checked before the run.
    pub preflight: bool,
}

impl Config {
    /// Loads the configuration from defaults, an optional YAML file, the environment and the given
    /// command line overrides.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::defaults(overrides))
            .extract()?;

        Ok(config)
    }

    /// Validates all settings a run needs.
    pub fn plan(&self) -> Result<RunPlan, ConfigError> {
        let endpoint = required(&self.endpoint, "endpoint")?;
        let bucket = required(&self.bucket, "bucket")?;
        let access_key = required(&self.access_key, "access_key")?;
        let secret_key = self
            .secret_key
            .as_ref()
            .ok_or(ConfigError::Missing("secret_key"))?;

        let run = RunConfiguration {
            object_count: self.object_count,
            object_size_bytes: parse_size(&self.object_size)?,
            concurrency: self.concurrency,
            key_prefix: self.key_prefix.clone(),
            grace_period: self.grace_period,
        };
        if run.concurrency == 0 {
            return Err(EngineError::ZeroConcurrency.into());
        }

        let target = S3UploaderConfig {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            bucket: bucket.to_owned(),
            region: self.region.clone(),
            access_key: access_key.to_owned(),
            secret_key: secret_key.expose_secret().as_str().to_owned(),
            tls_verify: !self.insecure,
            request_timeout: self.request_timeout,
        };

        Ok(RunPlan {
            run,
            target,
            deadline: self.deadline,
            preflight: self.preflight,
        })
    }
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn complete() -> Overrides {
        Overrides {
            endpoint: Some("http://localhost:9000/".into()),
            bucket: Some("benchmarks".into()),
            access_key: Some("access".into()),
            secret_key: Some("secret".into()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None, &Overrides::default()).unwrap();

            assert_eq!(config.object_count, 100);
            assert_eq!(config.object_size, "4k");
            assert_eq!(config.region, "us-east-1");
            assert_eq!(config.grace_period, Duration::from_secs(10));
            assert!(config.concurrency >= 1);
            assert!(config.preflight);
            assert!(!config.insecure);
            assert!(!config.sentry.is_enabled());

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("S3LOAD__ENDPOINT", "http://localhost:9000");
            jail.set_env("S3LOAD__BUCKET", "benchmarks");
            jail.set_env("S3LOAD__SECRET_KEY", "abcde");
            jail.set_env("S3LOAD__OBJECT_COUNT", "250");
            jail.set_env("S3LOAD__OBJECT_SIZE", "1m");
            jail.set_env("S3LOAD__DEADLINE", "1m 30s");
            jail.set_env("S3LOAD__LOGGING__LEVEL", "debug");
            jail.set_env("S3LOAD__SENTRY__DSN", "https://key@sentry.invalid/1");
            jail.set_env("S3LOAD__SENTRY__SAMPLE_RATE", "0.5");

            let config = Config::load(None, &Overrides::default()).unwrap();

            assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
            assert_eq!(config.bucket.as_deref(), Some("benchmarks"));
            assert_eq!(
                config.secret_key.as_ref().unwrap().expose_secret().as_str(),
                "abcde"
            );
            assert_eq!(config.object_count, 250);
            assert_eq!(config.object_size, "1m");
            assert_eq!(config.deadline, Some(Duration::from_secs(90)));
            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert!(config.sentry.is_enabled());
            assert_eq!(config.sentry.sample_rate, 0.5);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            endpoint: http://localhost:9000
            bucket: benchmarks
            access_key: access
            secret_key: secret
            insecure: true
            request_timeout: 5s
            concurrency: 12
            key_prefix: nightly
            grace_period: 2s
            logging:
                file: /tmp/s3load-test.log
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path()), &Overrides::default()).unwrap();

            assert!(config.insecure);
            assert_eq!(config.request_timeout, Some(Duration::from_secs(5)));
            assert_eq!(config.concurrency, 12);
            assert_eq!(config.key_prefix, "nightly");
            assert_eq!(config.grace_period, Duration::from_secs(2));
            assert_eq!(
                config.logging.file_path(),
                PathBuf::from("/tmp/s3load-test.log")
            );

            Ok(())
        });
    }

    #[test]
    fn object_size_accepts_plain_numbers() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("S3LOAD__OBJECT_SIZE", "4096");
            let config = Config::load(None, &complete()).unwrap();
            assert_eq!(config.object_size, "4096");
            assert_eq!(config.plan().unwrap().run.object_size_bytes, 4096);

            Ok(())
        });
    }

    #[test]
    fn flags_override_env_and_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            endpoint: http://yaml:9000
            bucket: from-yaml
            object_size: 1k
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("S3LOAD__ENDPOINT", "http://env:9000");
            jail.set_env("S3LOAD__BUCKET", "from-env");

            let overrides = Overrides {
                bucket: Some("from-flags".into()),
                preflight: Some(false),
                ..Default::default()
            };
            let config = Config::load(Some(tempfile.path()), &overrides).unwrap();

            // env overrides yaml, flags override env
            assert_eq!(config.endpoint.as_deref(), Some("http://env:9000"));
            assert_eq!(config.bucket.as_deref(), Some("from-flags"));
            assert_eq!(config.object_size, "1k");
            assert!(!config.preflight);

            Ok(())
        });
    }

    #[test]
    fn secrets_are_redacted() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None, &complete()).unwrap();

            let debug = format!("{config:?}");
            assert!(!debug.contains("secret\""), "{debug}");

            let plan = config.plan().unwrap();
            assert_eq!(plan.target.secret_key, "secret");
            assert!(!format!("{:?}", plan.target).contains("\"secret\""));

            Ok(())
        });
    }

    #[test]
    fn plans_run() {
        figment::Jail::expect_with(|_jail| {
            let overrides = Overrides {
                object_count: Some(10),
                object_size: Some("8m".into()),
                concurrency: Some(4),
                insecure: Some(true),
                region: Some("eu-central-1".into()),
                deadline: Some("30s".into()),
                ..complete()
            };
            let plan = Config::load(None, &overrides).unwrap().plan().unwrap();

            assert_eq!(plan.run.object_count, 10);
            assert_eq!(plan.run.object_size_bytes, 8 * 1024 * 1024);
            assert_eq!(plan.run.concurrency, 4);
            assert_eq!(plan.run.key_prefix, "s3load");
            assert_eq!(plan.target.endpoint, "http://localhost:9000");
            assert_eq!(plan.target.region, "eu-central-1");
            assert!(!plan.target.tls_verify);
            assert_eq!(plan.deadline, Some(Duration::from_secs(30)));
            assert!(plan.preflight);

            Ok(())
        });
    }

    #[test]
    fn rejects_incomplete_settings() {
        figment::Jail::expect_with(|_jail| {
            let overrides = Overrides {
                bucket: None,
                ..complete()
            };
            let err = Config::load(None, &overrides).unwrap().plan().unwrap_err();
            assert!(matches!(err, ConfigError::Missing("bucket")), "{err:?}");

            let overrides = Overrides {
                endpoint: Some("  ".into()),
                ..complete()
            };
            let err = Config::load(None, &overrides).unwrap().plan().unwrap_err();
            assert!(matches!(err, ConfigError::Missing("endpoint")), "{err:?}");

            let overrides = Overrides {
                secret_key: None,
                ..complete()
            };
            let err = Config::load(None, &overrides).unwrap().plan().unwrap_err();
            assert!(matches!(err, ConfigError::Missing("secret_key")), "{err:?}");

            Ok(())
        });
    }

    #[test]
    fn rejects_invalid_values() {
        figment::Jail::expect_with(|_jail| {
            let overrides = Overrides {
                object_size: Some("5x".into()),
                ..complete()
            };
            let err = Config::load(None, &overrides).unwrap().plan().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidSize(_)), "{err:?}");

            let overrides = Overrides {
                concurrency: Some(0),
                ..complete()
            };
            let err = Config::load(None, &overrides).unwrap().plan().unwrap_err();
            assert!(
                matches!(err, ConfigError::Engine(EngineError::ZeroConcurrency)),
                "{err:?}"
            );

            let overrides = Overrides {
                deadline: Some("soon".into()),
                ..complete()
            };
            let err = Config::load(None, &overrides).unwrap_err();
            assert!(matches!(err, ConfigError::Load(_)), "{err:?}");

            Ok(())
        });
    }
}
