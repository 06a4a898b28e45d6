// SPDX-License-Identifier: GPL-3.0-only

//! Asynchronous encode/write queue
//!
//! Read-back depth buffers are handed over as [`WriteJob`]s and processed off
//! the render thread:
//!
//! ```text
//! submit ──► mpsc ──► dispatcher ──► spawn_blocking(encode PNG) ──► tokio::fs::write
//!                      (≤ N jobs)          │                              │
//!                                    buffer released          report_file + file_produced
//! ```
//!
//! The queue owns its own tokio runtime so hosts do not need one. Each job
//! gets exactly one encode+write attempt and its pixel buffer is released
//! exactly once, whether the job is written, fails, or is rejected.

use crate::annotation::{AnnotationHandle, AnnotationRegistry};
use crate::config::{OverflowPolicy, QueueConfig};
use crate::encoding::DepthEncoding;
use crate::errors::{LabelerError, LabelerResult, PersistenceError};
use crate::readback::{FrameId, PixelBuffer};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// One depth image waiting to be encoded and written
pub struct WriteJob {
    pub frame_id: FrameId,
    pub buffer: PixelBuffer,
    /// Absolute destination path
    pub path: PathBuf,
    /// Dataset-relative path reported to the annotation
    pub relative_path: String,
    pub annotation: Arc<dyn AnnotationHandle>,
}

/// Result of one job, delivered to write listeners
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub frame_id: FrameId,
    pub path: PathBuf,
    pub result: Result<(), PersistenceError>,
}

pub type WriteListener = Arc<dyn Fn(&WriteOutcome) + Send + Sync>;

/// Shared list of write-outcome listeners
#[derive(Clone, Default)]
pub struct WriteListeners(Arc<Mutex<Vec<WriteListener>>>);

impl WriteListeners {
    pub fn add(&self, listener: WriteListener) {
        self.lock().push(listener);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn notify(&self, outcome: &WriteOutcome) {
        // Snapshot so a listener may register another listener
        let listeners: Vec<WriteListener> = self.lock().clone();
        for listener in listeners {
            listener(outcome);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<WriteListener>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs accepted into the queue
    pub submitted: u64,
    /// Jobs whose file was written
    pub written: u64,
    /// Jobs whose encode or write failed
    pub failed: u64,
    /// Jobs rejected because the queue was full or closed
    pub dropped: u64,
    /// Pixel buffers released
    pub released: u64,
}

impl QueueStats {
    /// Accepted jobs that have not finished yet
    pub fn pending(&self) -> u64 {
        self.submitted.saturating_sub(self.written + self.failed)
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    released: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            submitted: self.submitted.load(Ordering::SeqCst),
            written: self.written.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
        }
    }
}

/// Pixel buffer that counts its own release
struct BufferLease {
    buffer: PixelBuffer,
    counters: Arc<Counters>,
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct QueuedJob {
    frame_id: FrameId,
    lease: BufferLease,
    path: PathBuf,
    relative_path: String,
    annotation: Arc<dyn AnnotationHandle>,
}

#[derive(Clone)]
enum JobSender {
    Unbounded(mpsc::UnboundedSender<QueuedJob>),
    Bounded(mpsc::Sender<QueuedJob>),
}

enum JobReceiver {
    Unbounded(mpsc::UnboundedReceiver<QueuedJob>),
    Bounded(mpsc::Receiver<QueuedJob>),
}

impl JobReceiver {
    async fn recv(&mut self) -> Option<QueuedJob> {
        match self {
            JobReceiver::Unbounded(rx) => rx.recv().await,
            JobReceiver::Bounded(rx) => rx.recv().await,
        }
    }
}

struct JobContext {
    encoding: DepthEncoding,
    registry: Arc<dyn AnnotationRegistry>,
    counters: Arc<Counters>,
    listeners: WriteListeners,
}

/// Background PNG encode and file write queue
pub struct EncodeWriteQueue {
    runtime: Option<tokio::runtime::Runtime>,
    sender: Mutex<Option<JobSender>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    overflow: OverflowPolicy,
}

impl EncodeWriteQueue {
    /// Start the queue and its dispatcher
    pub fn new(
        config: &QueueConfig,
        encoding: DepthEncoding,
        registry: Arc<dyn AnnotationRegistry>,
        listeners: WriteListeners,
    ) -> LabelerResult<Self> {
        let max_concurrent_jobs = config.max_concurrent_jobs.max(1);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(max_concurrent_jobs.min(4))
            .thread_name("depth-writer")
            .enable_all()
            .build()
            .map_err(|e| LabelerError::Other(format!("Failed to start write runtime: {}", e)))?;

        let (sender, receiver) = match config.capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (JobSender::Bounded(tx), JobReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (JobSender::Unbounded(tx), JobReceiver::Unbounded(rx))
            }
        };

        let counters = Arc::new(Counters::default());
        let context = Arc::new(JobContext {
            encoding,
            registry,
            counters: Arc::clone(&counters),
            listeners,
        });

        let dispatcher = runtime.spawn(dispatch(receiver, context, max_concurrent_jobs));

        info!(
            capacity = ?config.capacity,
            overflow = ?config.overflow,
            max_concurrent_jobs,
            "Depth write queue started"
        );

        Ok(Self {
            runtime: Some(runtime),
            sender: Mutex::new(Some(sender)),
            dispatcher: Mutex::new(Some(dispatcher)),
            counters,
            overflow: config.overflow,
        })
    }

    /// Hand a job to the queue, taking ownership of its buffer
    ///
    /// Never blocks unless the queue is bounded with [`OverflowPolicy::Block`].
    /// A rejected job is counted as dropped and its buffer released.
    pub fn submit(&self, job: WriteJob) -> Result<(), PersistenceError> {
        let frame_id = job.frame_id;
        let queued = QueuedJob {
            frame_id,
            lease: BufferLease {
                buffer: job.buffer,
                counters: Arc::clone(&self.counters),
            },
            path: job.path,
            relative_path: job.relative_path,
            annotation: job.annotation,
        };

        // Clone the sender out so a blocked submit does not hold the lock
        let Some(sender) = self.lock_sender().clone() else {
            self.reject(frame_id, queued, PersistenceError::QueueClosed);
            return Err(PersistenceError::QueueClosed);
        };

        let rejected = match sender {
            JobSender::Unbounded(tx) => tx
                .send(queued)
                .err()
                .map(|e| (e.0, PersistenceError::QueueClosed)),
            JobSender::Bounded(tx) => match self.overflow {
                OverflowPolicy::Block => tx
                    .blocking_send(queued)
                    .err()
                    .map(|e| (e.0, PersistenceError::QueueClosed)),
                OverflowPolicy::DropNewest => match tx.try_send(queued) {
                    Ok(()) => None,
                    Err(mpsc::error::TrySendError::Full(job)) => {
                        Some((job, PersistenceError::QueueFull))
                    }
                    Err(mpsc::error::TrySendError::Closed(job)) => {
                        Some((job, PersistenceError::QueueClosed))
                    }
                },
            },
        };

        match rejected {
            None => {
                self.counters.submitted.fetch_add(1, Ordering::SeqCst);
                debug!(frame_id, "Depth write job queued");
                Ok(())
            }
            Some((job, err)) => {
                self.reject(frame_id, job, err.clone());
                Err(err)
            }
        }
    }

    fn reject(&self, frame_id: FrameId, job: QueuedJob, err: PersistenceError) {
        warn!(frame_id, error = %err, "Depth write job dropped");
        self.counters.dropped.fetch_add(1, Ordering::SeqCst);
        drop(job);
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_sender().is_none()
    }

    /// Close the queue and block until every accepted job has finished
    ///
    /// Later submits are rejected with [`PersistenceError::QueueClosed`].
    /// Calling it again is a no-op.
    pub fn drain(&self) {
        // Dropping the last sender ends the dispatcher's receive loop
        self.lock_sender().take();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(handle) = handle {
            let pending = self.stats().pending();
            debug!(pending, "Draining depth write queue");
            if let Err(e) = pollster::block_on(handle) {
                error!(error = %e, "Depth write dispatcher failed");
            }
            let stats = self.stats();
            info!(
                written = stats.written,
                failed = stats.failed,
                dropped = stats.dropped,
                "Depth write queue drained"
            );
        }
    }

    fn lock_sender(&self) -> MutexGuard<'_, Option<JobSender>> {
        self.sender.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for EncodeWriteQueue {
    fn drop(&mut self) {
        self.drain();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn dispatch(mut receiver: JobReceiver, context: Arc<JobContext>, max_concurrent_jobs: usize) {
    let mut running = JoinSet::new();

    while let Some(job) = receiver.recv().await {
        // Stop pulling while at the limit so a bounded channel pushes back
        while running.len() >= max_concurrent_jobs {
            if let Some(Err(e)) = running.join_next().await {
                error!(error = %e, "Depth write task panicked");
            }
        }
        running.spawn(run_job(job, Arc::clone(&context)));
    }

    while let Some(result) = running.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Depth write task panicked");
        }
    }
}

async fn run_job(job: QueuedJob, context: Arc<JobContext>) {
    let QueuedJob {
        frame_id,
        lease,
        path,
        relative_path,
        annotation,
    } = job;

    let encoding = context.encoding;
    // Run encoding in background task (CPU-bound)
    let encoded = tokio::task::spawn_blocking(move || {
        let result = encoding.encode_png(&lease.buffer);
        drop(lease);
        result
    })
    .await
    .map_err(|e| PersistenceError::EncodingFailed(format!("Encoding task error: {}", e)));

    let result = match encoded {
        Ok(Ok(png)) => write_file(&path, &png.data).await,
        Ok(Err(e)) | Err(e) => Err(e),
    };

    match &result {
        Ok(()) => {
            annotation.report_file(&relative_path);
            context.registry.file_produced(&path);
            context.counters.written.fetch_add(1, Ordering::SeqCst);
            debug!(frame_id, path = %path.display(), "Depth image saved");
        }
        Err(e) => {
            context.counters.failed.fetch_add(1, Ordering::SeqCst);
            error!(frame_id, path = %path.display(), error = %e, "Failed to save depth image");
        }
    }

    context.listeners.notify(&WriteOutcome {
        frame_id,
        path,
        result,
    });
}

async fn write_file(path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
    let write_failed = |e: std::io::Error| PersistenceError::WriteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(write_failed)?;
    }
    tokio::fs::write(path, data).await.map_err(write_failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::AnnotationDefinition;
    use crate::dataset::DatasetRegistry;
    use std::sync::mpsc as std_mpsc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn definition() -> AnnotationDefinition {
        AnnotationDefinition {
            id: Uuid::new_v4(),
            name: "depth".to_string(),
            description: "depth z-buffer image".to_string(),
            format: "PNG".to_string(),
        }
    }

    fn job(registry: &DatasetRegistry, root: &Path, frame_id: FrameId) -> WriteJob {
        let def = registry.register_definition(definition());
        let relative_path = format!("Depth/depth_{}.png", frame_id);
        WriteJob {
            frame_id,
            buffer: PixelBuffer::from_depth(2, 2, &[0.001; 4]).unwrap(),
            path: root.join(&relative_path),
            relative_path,
            annotation: registry.begin_annotation(&def, frame_id),
        }
    }

    fn queue(config: &QueueConfig, registry: &DatasetRegistry) -> EncodeWriteQueue {
        EncodeWriteQueue::new(
            config,
            DepthEncoding::default(),
            Arc::new(registry.clone()),
            WriteListeners::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_jobs_written_and_reported() {
        let tmp = tempdir().unwrap();
        let registry = DatasetRegistry::new(tmp.path());
        let queue = queue(&QueueConfig::default(), &registry);

        for frame_id in 0..5 {
            queue.submit(job(&registry, tmp.path(), frame_id)).unwrap();
        }
        queue.drain();

        let stats = queue.stats();
        assert_eq!(stats.submitted, 5);
        assert_eq!(stats.written, 5);
        assert_eq!(stats.released, 5);
        assert_eq!(stats.pending(), 0);

        for frame_id in 0..5 {
            assert!(tmp.path().join(format!("Depth/depth_{}.png", frame_id)).is_file());
            let annotation = &registry.annotations_for(frame_id)[0];
            assert_eq!(annotation.report_count(), 1);
        }
        assert_eq!(registry.produced_files().len(), 5);
    }

    #[test]
    fn test_write_failure_leaves_annotation_unfulfilled() {
        let tmp = tempdir().unwrap();
        // A file where the parent directory should be
        std::fs::write(tmp.path().join("Depth"), b"not a directory").unwrap();

        let registry = DatasetRegistry::new(tmp.path());
        let listeners = WriteListeners::default();
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        listeners.add(Arc::new(move |outcome: &WriteOutcome| {
            let _ = tx.lock().unwrap().send(outcome.clone());
        }));

        let queue = EncodeWriteQueue::new(
            &QueueConfig::default(),
            DepthEncoding::default(),
            Arc::new(registry.clone()),
            listeners,
        )
        .unwrap();

        queue.submit(job(&registry, tmp.path(), 1)).unwrap();
        queue.drain();

        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.written, 0);
        assert_eq!(stats.released, 1);
        assert!(!registry.annotations_for(1)[0].is_fulfilled());

        let outcome = rx.recv().unwrap();
        assert_eq!(outcome.frame_id, 1);
        assert!(matches!(
            outcome.result,
            Err(PersistenceError::WriteFailed { .. })
        ));
    }

    #[test]
    fn test_empty_buffer_settles() {
        let tmp = tempdir().unwrap();
        let registry = DatasetRegistry::new(tmp.path());
        let queue = queue(&QueueConfig::default(), &registry);

        let mut bad = job(&registry, tmp.path(), 3);
        bad.buffer = PixelBuffer::from_depth(0, 0, &[]).unwrap();
        queue.submit(bad).unwrap();
        queue.drain();

        let stats = queue.stats();
        assert_eq!(stats.failed + stats.written, 1);
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn test_submit_after_drain_is_rejected() {
        let tmp = tempdir().unwrap();
        let registry = DatasetRegistry::new(tmp.path());
        let queue = queue(&QueueConfig::default(), &registry);
        queue.drain();
        assert!(queue.is_closed());

        let result = queue.submit(job(&registry, tmp.path(), 9));
        assert!(matches!(result, Err(PersistenceError::QueueClosed)));

        let stats = queue.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.submitted, 0);
        // Second drain is a no-op
        queue.drain();
    }

    #[test]
    fn test_bounded_queue_accounts_for_every_job() {
        let tmp = tempdir().unwrap();
        let registry = DatasetRegistry::new(tmp.path());
        let config = QueueConfig {
            capacity: Some(1),
            overflow: OverflowPolicy::DropNewest,
            max_concurrent_jobs: 1,
        };
        let queue = queue(&config, &registry);

        let mut rejected = 0;
        for frame_id in 0..32 {
            if let Err(e) = queue.submit(job(&registry, tmp.path(), frame_id)) {
                assert!(matches!(e, PersistenceError::QueueFull));
                rejected += 1;
            }
        }
        queue.drain();

        let stats = queue.stats();
        assert_eq!(stats.dropped, rejected);
        assert_eq!(stats.submitted + stats.dropped, 32);
        assert_eq!(stats.written, stats.submitted);
        assert_eq!(stats.released, 32);
    }

    #[test]
    fn test_blocking_policy_writes_everything() {
        let tmp = tempdir().unwrap();
        let registry = DatasetRegistry::new(tmp.path());
        let config = QueueConfig {
            capacity: Some(2),
            overflow: OverflowPolicy::Block,
            max_concurrent_jobs: 1,
        };
        let queue = queue(&config, &registry);

        for frame_id in 0..8 {
            queue.submit(job(&registry, tmp.path(), frame_id)).unwrap();
        }
        queue.drain();

        let stats = queue.stats();
        assert_eq!(stats.written, 8);
        assert_eq!(stats.dropped, 0);
    }
}
