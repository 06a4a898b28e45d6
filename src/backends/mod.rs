// SPDX-License-Identifier: GPL-3.0-only

//! Renderer backend abstraction
//!
//! The labeler never talks to a graphics API directly. A backend provides the
//! two capabilities the labeler needs from the renderer:
//!
//! ```text
//! ┌─────────────────────┐
//! │    DepthLabeler     │
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │ RenderBackend Trait │  ← target surfaces + deferred readback
//! └──────────┬──────────┘
//!            │
//!      ┌─────┴──────┐
//!      ▼            ▼
//! ┌─────────┐  ┌─────────┐
//! │Headless │  │  wgpu   │
//! └─────────┘  └─────────┘
//! ```
//!
//! Backends are picked at runtime with [`create_backend`].

mod gpu_backend;
mod headless;
pub mod readback_pump;

pub use gpu_backend::GpuBackend;
pub use headless::{DeliveryMode, HeadlessBackend};

use crate::errors::LabelerResult;
use crate::readback::{FrameId, ReadbackCallback};
use crate::surface::{SurfaceDescriptor, SurfaceId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Surface allocation and readback, as provided by the renderer
///
/// All methods take `&self`; backends are shared between the render thread
/// and readback completion threads.
pub trait RenderBackend: Send + Sync {
    /// Short backend name for logging
    fn name(&self) -> &'static str;

    /// Allocate a surface the renderer can draw depth into
    fn create_surface(&self, descriptor: &SurfaceDescriptor) -> LabelerResult<SurfaceId>;

    /// Resize/reformat an existing surface
    ///
    /// Readbacks still pending against the surface are dropped.
    fn reformat_surface(&self, surface: SurfaceId, descriptor: &SurfaceDescriptor)
    -> LabelerResult<()>;

    /// Current descriptor, or `None` if the surface does not exist
    fn surface_descriptor(&self, surface: SurfaceId) -> Option<SurfaceDescriptor>;

    /// Free a surface; pending readbacks against it are dropped
    fn release_surface(&self, surface: SurfaceId);

    /// Schedule a copy of `surface` into CPU memory for `frame_id`
    ///
    /// Must not block on the GPU. `on_complete` runs once the copy finished,
    /// on whatever thread the backend delivers from. If the capture is lost
    /// (unknown or invalidated surface) the callback is dropped unrun.
    fn request_readback(&self, surface: SurfaceId, frame_id: FrameId, on_complete: ReadbackCallback);
}

/// Available backend implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BackendKind {
    /// CPU surfaces with an automatic copy thread
    #[default]
    Headless,
    /// wgpu textures with asynchronous buffer mapping
    Gpu,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Headless => write!(f, "headless"),
            BackendKind::Gpu => write!(f, "wgpu"),
        }
    }
}

/// Create a backend of the requested kind
pub fn create_backend(kind: BackendKind) -> LabelerResult<Arc<dyn RenderBackend>> {
    info!(backend = %kind, "Creating render backend");
    match kind {
        BackendKind::Headless => Ok(Arc::new(HeadlessBackend::automatic())),
        BackendKind::Gpu => Ok(Arc::new(GpuBackend::new_blocking()?)),
    }
}
