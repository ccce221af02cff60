//! The upload client adapter: one PUT per object against an S3-compatible endpoint.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use thiserror::Error;
use tokio::time::Instant;

/// One scheduled object upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadTask {
    /// Position of this task in the run, unique within the run.
    pub sequence_id: u64,
    /// The key the object is written to.
    pub object_key: String,
    /// Size of the object in bytes.
    pub payload_size: u64,
}

/// Classification of a failed upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// The endpoint could not be reached or the transfer broke off.
    NetworkError,
    /// The endpoint rejected the credentials (HTTP 401 or 403).
    AuthError,
    /// The endpoint failed to process the request (HTTP 5xx).
    ServerError,
    /// The endpoint rejected the request (HTTP 4xx other than auth).
    ClientError,
    /// The run was cancelled while the upload was in flight.
    Cancelled,
}

impl ErrorKind {
    /// Classifies a non-success HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::AuthError,
            500..=599 => Self::ServerError,
            _ => Self::ClientError,
        }
    }

    /// The stable name of this kind, as used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "NetworkError",
            Self::AuthError => "AuthError",
            Self::ServerError => "ServerError",
            Self::ClientError => "ClientError",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of a single upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadResult {
    /// The [`UploadTask::sequence_id`] this result belongs to.
    pub sequence_id: u64,
    /// Whether the object was written.
    pub success: bool,
    /// Bytes written, zero for failed uploads.
    pub bytes_sent: u64,
    /// Wall-clock time from request start until the response was received.
    pub latency: Duration,
    /// The failure classification, `None` on success.
    pub error_kind: Option<ErrorKind>,
}

impl UploadResult {
    /// A successful upload of `bytes_sent` bytes.
    pub fn succeeded(sequence_id: u64, bytes_sent: u64, latency: Duration) -> Self {
        Self {
            sequence_id,
            success: true,
            bytes_sent,
            latency,
            error_kind: None,
        }
    }

    /// A failed upload.
    pub fn failed(sequence_id: u64, kind: ErrorKind, latency: Duration) -> Self {
        Self {
            sequence_id,
            success: false,
            bytes_sent: 0,
            latency,
            error_kind: Some(kind),
        }
    }
}

/// A classified upload failure, with a description for the logs.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct UploadError {
    /// How the failure is accounted for.
    pub kind: ErrorKind,
    /// Human-readable details.
    pub message: String,
}

impl UploadError {
    /// Creates a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors setting up an [`Uploader`].
#[derive(Debug, Error)]
pub enum UploaderError {
    /// The access or secret key was not accepted.
    #[error("invalid credentials")]
    Credentials(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The client for the endpoint could not be created.
    #[error("failed to set up client for `{endpoint}`")]
    Client {
        /// The configured endpoint.
        endpoint: String,
        /// The underlying client error.
        #[source]
        cause: S3Error,
    },

    /// The HTTP transport for the endpoint could not be created.
    #[error("failed to set up transport for `{endpoint}`")]
    Transport {
        /// The configured endpoint.
        endpoint: String,
        /// The underlying transport error.
        #[source]
        cause: reqwest::Error,
    },
}

/// Writes single objects to a storage endpoint.
///
/// Implementations perform exactly one write per call and do not retry on their own. Timing and
/// bookkeeping is done by [`put`].
#[async_trait::async_trait]
pub trait Uploader: fmt::Debug + Send + Sync + 'static {
    /// The uploader name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Writes `payload` to the object at `key`.
    async fn put_object(&self, key: &str, payload: Bytes) -> Result<(), UploadError>;
}

/// Uploads the payload for `task` and measures how long it took.
pub async fn put(uploader: &dyn Uploader, task: &UploadTask, payload: Bytes) -> UploadResult {
    let start = Instant::now();
    let outcome = uploader.put_object(&task.object_key, payload).await;
    let latency = start.elapsed();

    match outcome {
        Ok(()) => UploadResult::succeeded(task.sequence_id, task.payload_size, latency),
        Err(err) => {
            tracing::debug!(
                sequence_id = task.sequence_id,
                error = &err as &dyn std::error::Error,
                "upload attempt failed"
            );
            UploadResult::failed(task.sequence_id, err.kind, latency)
        }
    }
}

/// Connection settings for an [`S3Uploader`].
pub struct S3UploaderConfig {
    /// Base URL of the endpoint, e.g. `https://s3.amazonaws.com` or `http://localhost:9000`.
    pub endpoint: String,
    /// Target bucket, which must already exist.
    pub bucket: String,
    /// Region used for request signing.
    pub region: String,
    /// The access key ID.
    pub access_key: String,
    /// The secret access key.
    pub secret_key: String,
    /// Whether TLS certificates and hostnames are verified.
    pub tls_verify: bool,
    /// Upper bound for a single request, if any.
    pub request_timeout: Option<Duration>,
}

impl Default for S3UploaderConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            region: "us-east-1".to_owned(),
            access_key: String::new(),
            secret_key: String::new(),
            tls_verify: true,
            request_timeout: None,
        }
    }
}

impl fmt::Debug for S3UploaderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3UploaderConfig")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &"[redacted]")
            .field("tls_verify", &self.tls_verify)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Lifetime of the signature on a single upload request.
const SIGNATURE_EXPIRY_SECS: u32 = 3600;

/// Uploads objects to an S3-compatible endpoint using path-style requests.
///
/// Requests are signed by the S3 client and sent through an HTTP client that carries the TLS
/// policy and request timeout of the run.
pub struct S3Uploader {
    bucket: Box<Bucket>,
    client: reqwest::Client,
}

impl S3Uploader {
    /// Creates a new uploader bound to the configured bucket.
    pub fn new(config: S3UploaderConfig) -> Result<Self, UploaderError> {
        let credentials = Credentials::new(
            Some(config.access_key.as_str()),
            Some(config.secret_key.as_str()),
            None,
            None,
            None,
        )
        .map_err(|err| UploaderError::Credentials(Box::new(err)))?;

        let endpoint = config.endpoint.trim_end_matches('/').to_owned();
        let region = Region::Custom {
            region: config.region,
            endpoint: endpoint.clone(),
        };
        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|cause| UploaderError::Client {
                endpoint: endpoint.clone(),
                cause,
            })?
            .with_path_style();

        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.tls_verify)
            .danger_accept_invalid_hostnames(!config.tls_verify);
        if let Some(request_timeout) = config.request_timeout {
            builder = builder.timeout(request_timeout);
        }
        let client = builder
            .build()
            .map_err(|cause| UploaderError::Transport { endpoint, cause })?;

        Ok(Self { bucket, client })
    }
}

impl fmt::Debug for S3Uploader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Uploader")
            .field("bucket", &self.bucket.name())
            .field("endpoint", &self.bucket.host())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Uploader for S3Uploader {
    fn name(&self) -> &'static str {
        "s3"
    }

    #[tracing::instrument(level = "trace", skip(self, payload), fields(size = payload.len()))]
    async fn put_object(&self, key: &str, payload: Bytes) -> Result<(), UploadError> {
        let url = self
            .bucket
            .presign_put(key, SIGNATURE_EXPIRY_SECS, None, None)
            .await
            .map_err(|err| {
                UploadError::new(ErrorKind::ClientError, format!("failed to sign request: {err}"))
            })?;

        let response = self
            .client
            .put(url)
            .body(payload)
            .send()
            .await
            .map_err(|err| UploadError::new(ErrorKind::NetworkError, transport_message(&err)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        // the body is diagnostic only, a broken read must not change the classification
        let body = response.text().await.unwrap_or_default();
        Err(UploadError::new(
            ErrorKind::from_status(status.as_u16()),
            format!("status {status}: {body}"),
        ))
    }
}

/// Flattens a transport error and its causes, which carry the TLS or connect details.
fn transport_message(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
