// SPDX-License-Identifier: GPL-3.0-only

//! Depth labeler - per-frame depth ground truth for synthetic datasets
//!
//! Every rendered frame, the labeler copies the renderer's linear depth
//! target back to the CPU without stalling the frame, encodes it as a
//! single channel 16-bit PNG of millimetres and files it as a `depth`
//! annotation of that frame.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`labeler`]: The [`DepthLabeler`] orchestrator and its lifecycle
//! - [`backends`]: Renderer abstraction with headless (CPU) and wgpu implementations
//! - [`readback`]: Pixel buffers and in-flight capture tracking
//! - [`frame_table`]: Frame id to pending annotation bookkeeping
//! - [`queue`]: Background encode/write queue
//! - [`encoding`]: Normalised depth to millimetre PNG encoding
//! - [`surface`]: Target surface provisioning
//! - [`annotation`] and [`dataset`]: Annotation registry interface and a file-backed registry
//! - [`config`]: Labeler configuration
//!
//! # Example
//!
//! ```no_run
//! use depth_labeler::{DatasetRegistry, DepthLabeler, HeadlessBackend, LabelerConfig};
//! use std::sync::Arc;
//!
//! let backend = Arc::new(HeadlessBackend::automatic());
//! let registry = Arc::new(DatasetRegistry::new("dataset"));
//! let mut labeler = DepthLabeler::new(LabelerConfig::default(), backend, registry.clone());
//!
//! labeler.setup(640, 480)?;
//! for frame_id in 0..10 {
//!     // ... render depth into the target surface ...
//!     labeler.on_end_rendering(frame_id)?;
//! }
//! labeler.teardown();
//! registry.write_manifests()?;
//! # Ok::<(), depth_labeler::LabelerError>(())
//! ```

pub mod annotation;
pub mod backends;
pub mod config;
pub mod constants;
pub mod dataset;
pub mod encoding;
pub mod errors;
pub mod frame_table;
pub mod gpu;
pub mod labeler;
pub mod logging;
pub mod queue;
pub mod readback;
pub mod surface;

// Re-export commonly used types
pub use annotation::{AnnotationDefinition, AnnotationHandle, AnnotationRegistry};
pub use backends::{BackendKind, DeliveryMode, GpuBackend, HeadlessBackend, RenderBackend};
pub use config::{LabelerConfig, OverflowPolicy, QueueConfig};
pub use dataset::DatasetRegistry;
pub use errors::{LabelerError, LabelerResult, PersistenceError, SurfaceError};
pub use labeler::{DepthLabeler, LabelerState, LabelerStats};
pub use queue::{QueueStats, WriteOutcome};
pub use readback::{FrameId, PixelBuffer, PixelFormat};
pub use surface::{ColorSpace, SurfaceDescriptor, SurfaceId, TargetSurface};
