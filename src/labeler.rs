// SPDX-License-Identifier: GPL-3.0-only

//! Depth labeler
//!
//! Orchestrates one capture per rendered frame:
//!
//! 1. `on_end_rendering(frame_id)` opens an annotation for the frame and asks
//!    the backend for a readback of the target surface
//! 2. the readback completes on a backend thread, is matched to its
//!    annotation by frame id and handed to the write queue
//! 3. the queue writes `Depth<uuid>/depth_<frame>.png` and reports it to the
//!    annotation
//!
//! Captures overlap freely and complete in any order. Teardown waits for
//! every capture and every write before returning.

use crate::annotation::{AnnotationDefinition, AnnotationHandle, AnnotationRegistry};
use crate::backends::RenderBackend;
use crate::config::LabelerConfig;
use crate::constants::{
    ANNOTATION_DESCRIPTION, ANNOTATION_FORMAT, ANNOTATION_NAME, DEPTH_DIRECTORY_PREFIX,
    LABELER_DESCRIPTION, depth_file_name,
};
use crate::encoding::DepthEncoding;
use crate::errors::{LabelerError, LabelerResult};
use crate::frame_table::FrameRequestTable;
use crate::queue::{EncodeWriteQueue, QueueStats, WriteJob, WriteListeners, WriteOutcome};
use crate::readback::{FrameId, PixelBuffer, ReadbackTracker};
use crate::surface::{SurfaceId, TargetSurface, provision_target};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// How long teardown waits between "still waiting" warnings
const SETTLE_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Lifecycle of a [`DepthLabeler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelerState {
    /// Created, `setup` not called yet
    Uninitialized,
    /// Set up, no capture issued yet
    Ready,
    /// At least one capture issued
    Capturing,
    /// Waiting for captures and writes to finish
    TearingDown,
    /// Torn down or disabled by a setup error
    Disposed,
}

impl std::fmt::Display for LabelerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LabelerState::Uninitialized => "uninitialized",
            LabelerState::Ready => "ready",
            LabelerState::Capturing => "capturing",
            LabelerState::TearingDown => "tearing down",
            LabelerState::Disposed => "disposed",
        };
        write!(f, "{}", name)
    }
}

/// Called with every resolved readback before it is queued for writing
pub type ReadbackListener = Arc<dyn Fn(FrameId, &PixelBuffer) + Send + Sync>;

/// Capture and write counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelerStats {
    pub captures_requested: u64,
    pub captures_in_flight: usize,
    pub captures_completed: u64,
    pub captures_dropped: u64,
    pub queue: QueueStats,
}

/// State shared with readback completions
struct CaptureContext {
    table: FrameRequestTable<Arc<dyn AnnotationHandle>>,
    queue: EncodeWriteQueue,
    directory: PathBuf,
    directory_name: String,
    readback_listeners: Arc<Mutex<Vec<ReadbackListener>>>,
}

impl CaptureContext {
    fn complete(&self, frame_id: FrameId, buffer: PixelBuffer) {
        let Some(annotation) = self.table.resolve(frame_id) else {
            return;
        };

        let listeners: Vec<ReadbackListener> = self
            .readback_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener(frame_id, &buffer);
        }

        let file_name = depth_file_name(frame_id);
        let job = WriteJob {
            frame_id,
            buffer,
            path: self.directory.join(&file_name),
            relative_path: format!("{}/{}", self.directory_name, file_name),
            annotation,
        };
        trace!(frame_id, "Readback resolved, queueing depth image");
        if let Err(e) = self.queue.submit(job) {
            debug!(frame_id, error = %e, "Depth image not queued");
        }
    }
}

struct Session {
    target: TargetSurface,
    context: Arc<CaptureContext>,
}

/// Captures the depth target of every rendered frame into a dataset
pub struct DepthLabeler {
    config: LabelerConfig,
    backend: Arc<dyn RenderBackend>,
    registry: Arc<dyn AnnotationRegistry>,
    external_surface: Option<SurfaceId>,
    state: LabelerState,
    /// Frames at or below this id were already captured by this instance
    last_frame_executed: Option<FrameId>,
    session: Option<Session>,
    /// Kept after teardown so hosts can locate the output
    definition: Option<Arc<AnnotationDefinition>>,
    depth_directory: Option<PathBuf>,
    depth_directory_name: Option<String>,
    tracker: ReadbackTracker,
    captures_requested: u64,
    readback_listeners: Arc<Mutex<Vec<ReadbackListener>>>,
    write_listeners: WriteListeners,
    final_queue_stats: QueueStats,
}

impl DepthLabeler {
    pub fn new(
        config: LabelerConfig,
        backend: Arc<dyn RenderBackend>,
        registry: Arc<dyn AnnotationRegistry>,
    ) -> Self {
        Self {
            config,
            backend,
            registry,
            external_surface: None,
            state: LabelerState::Uninitialized,
            last_frame_executed: None,
            session: None,
            definition: None,
            depth_directory: None,
            depth_directory_name: None,
            tracker: ReadbackTracker::new(),
            captures_requested: 0,
            readback_listeners: Arc::new(Mutex::new(Vec::new())),
            write_listeners: WriteListeners::default(),
            final_queue_stats: QueueStats::default(),
        }
    }

    /// Capture from a host-owned surface instead of allocating one
    ///
    /// The surface must be linear; it is reformatted to the camera resolution
    /// on setup and never released by the labeler.
    pub fn with_target_surface(mut self, surface: SurfaceId) -> Self {
        self.external_surface = Some(surface);
        self
    }

    /// Provision the target surface and start the write queue
    ///
    /// Any error disables the labeler (`Disposed`); it is logged and
    /// returned, never a panic.
    pub fn setup(&mut self, camera_width: u32, camera_height: u32) -> LabelerResult<()> {
        if self.state != LabelerState::Uninitialized {
            return Err(LabelerError::State(format!(
                "setup called while {}",
                self.state
            )));
        }

        match self.start_session(camera_width, camera_height) {
            Ok((session, definition)) => {
                info!(
                    description = LABELER_DESCRIPTION,
                    backend = self.backend.name(),
                    surface = session.target.id,
                    width = camera_width,
                    height = camera_height,
                    directory = %session.context.directory.display(),
                    "Depth labeler ready"
                );
                self.depth_directory = Some(session.context.directory.clone());
                self.depth_directory_name = Some(session.context.directory_name.clone());
                self.definition = Some(definition);
                self.session = Some(session);
                self.state = LabelerState::Ready;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Depth labeler disabled");
                self.state = LabelerState::Disposed;
                Err(e)
            }
        }
    }

    fn start_session(
        &self,
        camera_width: u32,
        camera_height: u32,
    ) -> LabelerResult<(Session, Arc<AnnotationDefinition>)> {
        self.config.validate()?;

        let target = provision_target(
            self.backend.as_ref(),
            camera_width,
            camera_height,
            self.config.surface_format,
            self.external_surface,
        )?;

        match self.start_capture_context() {
            Ok((definition, context)) => Ok((Session { target, context }, definition)),
            Err(e) => {
                if target.owned {
                    self.backend.release_surface(target.id);
                }
                Err(e)
            }
        }
    }

    fn start_capture_context(
        &self,
    ) -> LabelerResult<(Arc<AnnotationDefinition>, Arc<CaptureContext>)> {
        let definition = self.registry.register_definition(AnnotationDefinition {
            id: self.config.annotation_id,
            name: ANNOTATION_NAME.to_string(),
            description: ANNOTATION_DESCRIPTION.to_string(),
            format: ANNOTATION_FORMAT.to_string(),
        });

        let directory_name = format!("{}{}", DEPTH_DIRECTORY_PREFIX, Uuid::new_v4());
        let directory = self.registry.directory_for(&directory_name)?;

        let queue = EncodeWriteQueue::new(
            &self.config.queue,
            DepthEncoding::from_config(&self.config),
            Arc::clone(&self.registry),
            self.write_listeners.clone(),
        )?;

        let context = Arc::new(CaptureContext {
            table: FrameRequestTable::new(),
            queue,
            directory,
            directory_name,
            readback_listeners: Arc::clone(&self.readback_listeners),
        });
        Ok((definition, context))
    }

    /// Capture the target surface for a frame that finished rendering
    ///
    /// Never waits for the GPU. A frame id at or below the last captured one
    /// is ignored. Calls on a disabled or torn down labeler are ignored.
    pub fn on_end_rendering(&mut self, frame_id: FrameId) -> LabelerResult<()> {
        match self.state {
            LabelerState::Ready | LabelerState::Capturing => {}
            LabelerState::Uninitialized => {
                return Err(LabelerError::State(
                    "on_end_rendering called before setup".to_string(),
                ));
            }
            LabelerState::TearingDown | LabelerState::Disposed => {
                trace!(frame_id, state = %self.state, "Labeler inactive, frame skipped");
                return Ok(());
            }
        }

        if self.last_frame_executed.is_some_and(|last| frame_id <= last) {
            trace!(frame_id, "Frame already captured");
            return Ok(());
        }
        self.last_frame_executed = Some(frame_id);

        let Some(session) = self.session.as_ref() else {
            return Err(LabelerError::State("no active capture session".to_string()));
        };

        let Some(definition) = self.definition.as_ref().map(Arc::clone) else {
            return Err(LabelerError::State("no registered annotation definition".to_string()));
        };
        let registry = Arc::clone(&self.registry);
        session
            .context
            .table
            .open(frame_id, || registry.begin_annotation(&definition, frame_id))?;

        let context = Arc::clone(&session.context);
        let on_complete = self.tracker.track(frame_id, move |frame_id, buffer| {
            context.complete(frame_id, buffer);
        });
        self.backend
            .request_readback(session.target.id, frame_id, on_complete);

        self.captures_requested += 1;
        self.state = LabelerState::Capturing;
        debug!(frame_id, surface = session.target.id, "Depth capture requested");
        Ok(())
    }

    /// Finish every capture and write, then release resources
    ///
    /// Blocks until all issued captures completed or were dropped by the
    /// backend and every queued image is written. Idempotent.
    pub fn teardown(&mut self) {
        match self.state {
            LabelerState::Disposed | LabelerState::TearingDown => return,
            LabelerState::Uninitialized => {
                self.state = LabelerState::Disposed;
                return;
            }
            LabelerState::Ready | LabelerState::Capturing => {}
        }
        self.state = LabelerState::TearingDown;

        while !self.tracker.wait_idle_timeout(SETTLE_WARN_INTERVAL) {
            warn!(
                in_flight = self.tracker.in_flight(),
                "Still waiting for depth captures to settle"
            );
        }

        if let Some(session) = self.session.take() {
            session.context.queue.drain();
            self.final_queue_stats = session.context.queue.stats();

            if session.target.owned {
                self.backend.release_surface(session.target.id);
            }

            for (frame_id, annotation) in session.context.table.drain() {
                warn!(
                    frame_id,
                    fulfilled = annotation.is_fulfilled(),
                    "Depth capture never completed, annotation left unfulfilled"
                );
            }
        }

        let stats = self.stats();
        info!(
            captures = stats.captures_requested,
            completed = stats.captures_completed,
            dropped = stats.captures_dropped,
            written = stats.queue.written,
            failed = stats.queue.failed,
            "Depth labeler torn down"
        );
        self.state = LabelerState::Disposed;
    }

    pub fn state(&self) -> LabelerState {
        self.state
    }

    pub fn config(&self) -> &LabelerConfig {
        &self.config
    }

    pub fn target_surface(&self) -> Option<&TargetSurface> {
        self.session.as_ref().map(|s| &s.target)
    }

    /// Absolute directory the depth images are written to
    pub fn depth_directory(&self) -> Option<&Path> {
        self.depth_directory.as_deref()
    }

    /// Dataset-relative name of the depth directory, `Depth<uuid>`
    pub fn depth_directory_name(&self) -> Option<&str> {
        self.depth_directory_name.as_deref()
    }

    pub fn annotation_definition(&self) -> Option<&Arc<AnnotationDefinition>> {
        self.definition.as_ref()
    }

    pub fn stats(&self) -> LabelerStats {
        LabelerStats {
            captures_requested: self.captures_requested,
            captures_in_flight: self.tracker.in_flight(),
            captures_completed: self.tracker.completed(),
            captures_dropped: self.tracker.dropped(),
            queue: self
                .session
                .as_ref()
                .map(|s| s.context.queue.stats())
                .unwrap_or(self.final_queue_stats),
        }
    }

    /// Frames whose capture has not completed yet, ascending
    pub fn pending_frames(&self) -> Vec<FrameId> {
        self.session
            .as_ref()
            .map(|s| s.context.table.frames())
            .unwrap_or_default()
    }

    /// Observe every resolved readback; runs on the completing thread
    pub fn on_readback<F>(&self, listener: F)
    where
        F: Fn(FrameId, &PixelBuffer) + Send + Sync + 'static,
    {
        self.readback_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(listener));
    }

    /// Observe the outcome of every depth image write
    pub fn on_write_complete<F>(&self, listener: F)
    where
        F: Fn(&WriteOutcome) + Send + Sync + 'static,
    {
        self.write_listeners.add(Arc::new(listener));
    }
}

impl Drop for DepthLabeler {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::HeadlessBackend;
    use crate::dataset::DatasetRegistry;
    use crate::errors::SurfaceError;
    use crate::readback::PixelFormat;
    use crate::surface::{ColorSpace, SurfaceDescriptor};
    use tempfile::tempdir;

    fn labeler(
        backend: &Arc<HeadlessBackend>,
        registry: &DatasetRegistry,
    ) -> DepthLabeler {
        DepthLabeler::new(
            LabelerConfig::default(),
            Arc::clone(backend) as Arc<dyn RenderBackend>,
            Arc::new(registry.clone()),
        )
    }

    #[test]
    fn test_setup_then_teardown() {
        let tmp = tempdir().unwrap();
        let backend = Arc::new(HeadlessBackend::manual());
        let registry = DatasetRegistry::new(tmp.path());
        let mut labeler = labeler(&backend, &registry);
        assert_eq!(labeler.state(), LabelerState::Uninitialized);

        labeler.setup(4, 3).unwrap();
        assert_eq!(labeler.state(), LabelerState::Ready);

        let target = labeler.target_surface().unwrap().clone();
        assert!(target.owned);
        assert_eq!((target.width(), target.height()), (4, 3));

        let dir_name = labeler.depth_directory_name().unwrap().to_string();
        assert!(dir_name.starts_with("Depth"));
        assert!(labeler.depth_directory().unwrap().is_dir());
        assert_eq!(labeler.annotation_definition().unwrap().name, "depth");

        labeler.teardown();
        assert_eq!(labeler.state(), LabelerState::Disposed);
        assert!(backend.surface_descriptor(target.id).is_none());

        // Idempotent
        labeler.teardown();
        assert_eq!(labeler.state(), LabelerState::Disposed);
    }

    #[test]
    fn test_setup_twice_is_state_error() {
        let tmp = tempdir().unwrap();
        let backend = Arc::new(HeadlessBackend::manual());
        let registry = DatasetRegistry::new(tmp.path());
        let mut labeler = labeler(&backend, &registry);
        labeler.setup(2, 2).unwrap();
        assert!(matches!(labeler.setup(2, 2), Err(LabelerError::State(_))));
    }

    #[test]
    fn test_zero_dimensions_disable_labeler() {
        let tmp = tempdir().unwrap();
        let backend = Arc::new(HeadlessBackend::manual());
        let registry = DatasetRegistry::new(tmp.path());
        let mut labeler = labeler(&backend, &registry);

        let result = labeler.setup(0, 480);
        assert!(matches!(
            result,
            Err(LabelerError::Surface(SurfaceError::InvalidDimensions { .. }))
        ));
        assert_eq!(labeler.state(), LabelerState::Disposed);

        // Disabled labeler ignores frames
        labeler.on_end_rendering(1).unwrap();
        assert!(registry.annotations().is_empty());
    }

    #[test]
    fn test_srgb_surface_disables_labeler() {
        let tmp = tempdir().unwrap();
        let backend = Arc::new(HeadlessBackend::manual());
        let registry = DatasetRegistry::new(tmp.path());

        let mut descriptor = SurfaceDescriptor::linear(4, 4, PixelFormat::Rgba8Unorm);
        descriptor.color_space = ColorSpace::Srgb;
        let surface = backend.create_surface(&descriptor).unwrap();

        let mut labeler = labeler(&backend, &registry).with_target_surface(surface);
        let result = labeler.setup(4, 4);
        assert!(matches!(
            result,
            Err(LabelerError::Surface(SurfaceError::NonLinear))
        ));
        assert_eq!(labeler.state(), LabelerState::Disposed);
        assert!(registry.definitions().is_empty());
        // Host surface untouched
        assert!(backend.surface_descriptor(surface).is_some());
    }

    #[test]
    fn test_frame_before_setup_is_state_error() {
        let tmp = tempdir().unwrap();
        let backend = Arc::new(HeadlessBackend::manual());
        let registry = DatasetRegistry::new(tmp.path());
        let mut labeler = labeler(&backend, &registry);
        assert!(matches!(
            labeler.on_end_rendering(1),
            Err(LabelerError::State(_))
        ));
    }

    #[test]
    fn test_repeated_frame_id_captured_once() {
        let tmp = tempdir().unwrap();
        let backend = Arc::new(HeadlessBackend::manual());
        let registry = DatasetRegistry::new(tmp.path());
        let mut labeler = labeler(&backend, &registry);
        labeler.setup(2, 2).unwrap();

        labeler.on_end_rendering(5).unwrap();
        labeler.on_end_rendering(5).unwrap();
        labeler.on_end_rendering(4).unwrap();

        assert_eq!(labeler.state(), LabelerState::Capturing);
        assert_eq!(labeler.pending_frames(), vec![5]);
        assert_eq!(backend.pending_frames(), vec![5]);
        assert_eq!(registry.annotations().len(), 1);

        backend.deliver_all();
        labeler.teardown();
        assert_eq!(labeler.stats().queue.written, 1);
    }

    #[test]
    fn test_readback_listener_sees_buffer() {
        let tmp = tempdir().unwrap();
        let backend = Arc::new(HeadlessBackend::manual());
        let registry = DatasetRegistry::new(tmp.path());
        let mut labeler = labeler(&backend, &registry);
        labeler.setup(2, 1).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        labeler.on_readback(move |frame_id, buffer| {
            sink.lock().unwrap().push((frame_id, buffer.width, buffer.height));
        });

        labeler.on_end_rendering(1).unwrap();
        backend.deliver(1);
        labeler.teardown();

        assert_eq!(*seen.lock().unwrap(), vec![(1, 2, 1)]);
    }

    #[test]
    fn test_dropped_capture_leaves_annotation_unfulfilled() {
        let tmp = tempdir().unwrap();
        let backend = Arc::new(HeadlessBackend::manual());
        let registry = DatasetRegistry::new(tmp.path());
        let mut labeler = labeler(&backend, &registry);
        labeler.setup(2, 2).unwrap();

        labeler.on_end_rendering(1).unwrap();
        labeler.on_end_rendering(2).unwrap();
        assert!(backend.drop_pending(1));
        backend.deliver(2);
        labeler.teardown();

        let stats = labeler.stats();
        assert_eq!(stats.captures_completed, 1);
        assert_eq!(stats.captures_dropped, 1);
        assert_eq!(stats.queue.written, 1);
        assert!(!registry.annotations_for(1)[0].is_fulfilled());
        assert!(registry.annotations_for(2)[0].is_fulfilled());
    }
}
