//! The load engine: drives all uploads of a run through a bounded pool of workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metrics::{MetricsAggregator, RunSnapshot};
use crate::payload::PayloadGenerator;
use crate::upload::{self, ErrorKind, UploadResult, UploadTask, Uploader};

/// Default time in-flight uploads may take to finish after cancellation.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Default prefix of all object keys written by a run.
pub const DEFAULT_KEY_PREFIX: &str = "s3load";

/// Errors rejecting a [`RunConfiguration`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// At least one upload has to be allowed in flight.
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    /// Objects must contain at least one byte.
    #[error("object size must be at least 1 byte")]
    EmptyObjects,

    /// The object size does not fit into memory on this platform.
    #[error("object size of {0} bytes is too large")]
    ObjectTooLarge(u64),
}

/// The shape of the load generated by a run.
#[derive(Clone, Debug)]
pub struct RunConfiguration {
    /// Number of objects to upload.
    pub object_count: u64,
    /// Size of every object in bytes.
    pub object_size_bytes: u64,
    /// Maximum number of uploads in flight.
    pub concurrency: usize,
    /// Prefix of the generated object keys.
    pub key_prefix: String,
    /// How long in-flight uploads may drain after cancellation before they are abandoned.
    pub grace_period: Duration,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            object_count: 100,
            object_size_bytes: 4 * 1024,
            concurrency: 1,
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// State shared between the workers of one run.
#[derive(Debug)]
struct RunContext {
    uploader: Arc<dyn Uploader>,
    payloads: PayloadGenerator,
    metrics: MetricsAggregator,

    run_id: String,
    key_prefix: String,
    object_count: u64,
    object_size: u64,
    payload_len: usize,

    next_sequence_id: AtomicU64,
    cancel: CancellationToken,
    abandon: CancellationToken,
}

impl RunContext {
    /// Claims the next unclaimed sequence id, or `None` once all ids are taken.
    fn claim(&self) -> Option<u64> {
        self.next_sequence_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < self.object_count).then_some(next + 1)
            })
            .ok()
    }

    fn object_key(&self, sequence_id: u64) -> String {
        format!("{}/{}/{sequence_id:010}", self.key_prefix, self.run_id)
    }

    fn dispatched(&self) -> u64 {
        self.next_sequence_id.load(Ordering::Acquire)
    }
}

/// Runs a fixed number of uploads against an [`Uploader`] with bounded concurrency.
///
/// Every object is dispatched exactly once and yields exactly one [`UploadResult`]. Failed uploads
/// are recorded and logged, but never stop the run. Completion order is unspecified.
#[derive(Debug)]
pub struct LoadEngine {
    config: RunConfiguration,
    uploader: Arc<dyn Uploader>,
    run_id: String,
    seed: Option<u64>,
}

impl LoadEngine {
    /// Creates an engine after validating the configuration.
    pub fn new(config: RunConfiguration, uploader: Arc<dyn Uploader>) -> Result<Self, EngineError> {
        if config.concurrency == 0 {
            return Err(EngineError::ZeroConcurrency);
        }
        if config.object_size_bytes == 0 {
            return Err(EngineError::EmptyObjects);
        }
        if usize::try_from(config.object_size_bytes).is_err() {
            return Err(EngineError::ObjectTooLarge(config.object_size_bytes));
        }

        Ok(Self {
            config,
            uploader,
            run_id: Uuid::now_v7().simple().to_string(),
            seed: None,
        })
    }

    /// Uses a fixed seed for the payload contents.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// The identifier of this run, which is part of every object key.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The number of workers the run uses.
    ///
    /// This is the configured concurrency, clamped to the number of objects.
    pub fn worker_count(&self) -> usize {
        let objects = usize::try_from(self.config.object_count).unwrap_or(usize::MAX);
        self.config.concurrency.min(objects)
    }

    /// Uploads all objects and returns the final statistics.
    ///
    /// Once `cancel` fires, no further uploads are dispatched. Uploads already in flight get the
    /// configured grace period to finish, after which they are recorded as
    /// [`ErrorKind::Cancelled`] and the run completes.
    pub async fn run(self, cancel: CancellationToken) -> RunSnapshot {
        let workers = self.worker_count();
        let payload_len = usize::try_from(self.config.object_size_bytes).unwrap_or(usize::MAX);
        let payloads = match self.seed {
            Some(seed) => PayloadGenerator::with_seed(seed),
            None => PayloadGenerator::new(),
        };

        let context = Arc::new(RunContext {
            uploader: self.uploader,
            payloads,
            metrics: MetricsAggregator::new(self.config.object_count),

            run_id: self.run_id,
            key_prefix: self.config.key_prefix,
            object_count: self.config.object_count,
            object_size: self.config.object_size_bytes,
            payload_len,

            next_sequence_id: AtomicU64::new(0),
            cancel,
            abandon: CancellationToken::new(),
        });

        tracing::info!(
            run_id = %context.run_id,
            uploader = context.uploader.name(),
            objects = context.object_count,
            object_size = context.object_size,
            workers,
            "starting upload run"
        );

        let mut tasks = JoinSet::new();
        for worker_id in 0..workers {
            tasks.spawn(run_worker(Arc::clone(&context), worker_id));
        }

        let drained = drain(&mut tasks);
        tokio::pin!(drained);

        tokio::select! {
            biased;
            _ = &mut drained => {}
            _ = context.cancel.cancelled() => {
                tracing::info!(
                    dispatched = context.dispatched(),
                    grace_period = ?self.config.grace_period,
                    "run cancelled, draining in-flight uploads"
                );
                if tokio::time::timeout(self.config.grace_period, &mut drained).await.is_err() {
                    tracing::warn!("grace period elapsed, abandoning in-flight uploads");
                    context.abandon.cancel();
                    drained.await;
                }
            }
        }

        if context.cancel.is_cancelled() {
            context.metrics.mark_cancelled();
        }

        match Arc::try_unwrap(context) {
            Ok(context) => context.metrics.finalize(),
            // only reachable if a worker leaked its handle to the context
            Err(context) => context.metrics.snapshot(),
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = &err as &dyn std::error::Error, "upload worker failed");
        }
    }
}

async fn run_worker(context: Arc<RunContext>, worker_id: usize) {
    let mut scratch = BytesMut::new();

    while !context.cancel.is_cancelled() {
        let Some(sequence_id) = context.claim() else {
            break;
        };

        let task = UploadTask {
            sequence_id,
            object_key: context.object_key(sequence_id),
            payload_size: context.object_size,
        };
        tracing::debug!(worker_id, sequence_id, key = %task.object_key, "dispatching upload");
        context.metrics.mark_dispatched();

        let payload = context
            .payloads
            .fill_async(&mut scratch, context.payload_len)
            .await;
        let start = Instant::now();
        let result = tokio::select! {
            biased;
            result = upload::put(context.uploader.as_ref(), &task, payload) => result,
            _ = context.abandon.cancelled() => {
                UploadResult::failed(sequence_id, ErrorKind::Cancelled, start.elapsed())
            }
        };

        match result.error_kind {
            None => tracing::info!(
                sequence_id,
                key = %task.object_key,
                latency = ?result.latency,
                "upload succeeded"
            ),
            Some(error_kind) => tracing::warn!(
                sequence_id,
                key = %task.object_key,
                %error_kind,
                latency = ?result.latency,
                "upload failed"
            ),
        }
        context.metrics.record(result);
    }

    tracing::trace!(worker_id, "worker finished");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;
    use crate::upload::UploadError;

    #[derive(Debug, Default)]
    struct Recorder {
        keys: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Uploader for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn put_object(&self, key: &str, payload: Bytes) -> Result<(), UploadError> {
            assert_eq!(payload.len(), 16);
            self.keys.lock().unwrap().push(key.to_owned());
            Ok(())
        }
    }

    fn config(object_count: u64, concurrency: usize) -> RunConfiguration {
        RunConfiguration {
            object_count,
            object_size_bytes: 16,
            concurrency,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_invalid_configuration() {
        let uploader = Arc::new(Recorder::default());

        let err = LoadEngine::new(config(10, 0), uploader.clone()).unwrap_err();
        assert_eq!(err, EngineError::ZeroConcurrency);

        let mut empty = config(10, 1);
        empty.object_size_bytes = 0;
        let err = LoadEngine::new(empty, uploader).unwrap_err();
        assert_eq!(err, EngineError::EmptyObjects);
    }

    #[test]
    fn clamps_workers_to_object_count() {
        let uploader = Arc::new(Recorder::default());

        let engine = LoadEngine::new(config(3, 10), uploader.clone()).unwrap();
        assert_eq!(engine.worker_count(), 3);

        let engine = LoadEngine::new(config(0, 10), uploader.clone()).unwrap();
        assert_eq!(engine.worker_count(), 0);

        let engine = LoadEngine::new(config(100, 10), uploader).unwrap();
        assert_eq!(engine.worker_count(), 10);
    }

    #[tokio::test]
    async fn keys_are_unique_and_scoped_to_the_run() {
        let uploader = Arc::new(Recorder::default());
        let engine = LoadEngine::new(config(50, 4), uploader.clone()).unwrap();
        let run_id = engine.run_id().to_owned();

        let snapshot = engine.run(CancellationToken::new()).await;
        assert_eq!(snapshot.total_succeeded, 50);

        let keys = uploader.keys.lock().unwrap();
        let unique: BTreeSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), 50);
        assert!(keys.iter().all(|key| key.starts_with(&format!("s3load/{run_id}/"))));
        assert!(unique.contains(&format!("s3load/{run_id}/0000000049")));
    }

    #[tokio::test]
    async fn empty_run_completes_immediately() {
        let uploader = Arc::new(Recorder::default());
        let engine = LoadEngine::new(config(0, 8), uploader.clone()).unwrap();

        let snapshot = engine.run(CancellationToken::new()).await;
        assert_eq!(snapshot, RunSnapshot::default());
        assert!(uploader.keys.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_start_dispatches_nothing() {
        let uploader = Arc::new(Recorder::default());
        let engine = LoadEngine::new(config(10, 2), uploader.clone()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let snapshot = engine.run(cancel).await;

        assert_eq!(snapshot.total_attempted, 0);
        assert_eq!(snapshot.planned, 10);
        assert!(snapshot.cancelled);
        assert!(uploader.keys.lock().unwrap().is_empty());
    }
}
