// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the depth labeler
//!
//! Errors follow the labeler's failure taxonomy:
//! - configuration problems found at setup ([`SurfaceError`], `Config`)
//! - per-job persistence failures ([`PersistenceError`])
//! - lifecycle misuse (`State`)
//!
//! Transient capture loss and completions for unknown frames are not errors;
//! they are logged and discarded where they happen.

use std::fmt;
use std::path::PathBuf;

/// Result type alias using LabelerError
pub type LabelerResult<T> = Result<T, LabelerError>;

/// Main labeler error type
#[derive(Debug, Clone)]
pub enum LabelerError {
    /// Target surface could not be provisioned or failed validation
    Surface(SurfaceError),
    /// Encoding or writing a depth image failed
    Persistence(PersistenceError),
    /// Invalid configuration value
    Config(String),
    /// Operation not allowed in the labeler's current state
    State(String),
    /// A capture for this frame id is already pending
    DuplicateFrame(u64),
    /// GPU device or adapter could not be acquired
    Gpu(String),
    /// Generic error with message
    Other(String),
}

/// Render-target provisioning errors
#[derive(Debug, Clone)]
pub enum SurfaceError {
    /// The surface uses a perceptual (sRGB) encoding instead of linear
    NonLinear,
    /// Width or height is zero
    InvalidDimensions { width: u32, height: u32 },
    /// Backend cannot allocate the requested format
    UnsupportedFormat(String),
    /// The surface handle does not belong to this backend (or was released)
    Unknown(u64),
    /// Backend-side allocation failure
    AllocationFailed(String),
}

/// Encode/write errors for a single depth image
#[derive(Debug, Clone)]
pub enum PersistenceError {
    /// Pixel data did not match the declared dimensions/format
    InvalidBuffer(String),
    /// PNG encoding failed
    EncodingFailed(String),
    /// Writing the encoded bytes failed
    WriteFailed { path: PathBuf, reason: String },
    /// The job was dropped because the queue was full
    QueueFull,
    /// The queue has already been closed by teardown
    QueueClosed,
}

impl fmt::Display for LabelerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelerError::Surface(e) => write!(f, "Surface error: {}", e),
            LabelerError::Persistence(e) => write!(f, "Persistence error: {}", e),
            LabelerError::Config(msg) => write!(f, "Configuration error: {}", msg),
            LabelerError::State(msg) => write!(f, "Invalid state: {}", msg),
            LabelerError::DuplicateFrame(id) => {
                write!(f, "Frame {} already has a pending capture", id)
            }
            LabelerError::Gpu(msg) => write!(f, "GPU error: {}", msg),
            LabelerError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for SurfaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurfaceError::NonLinear => write!(f, "target surface must use a linear encoding"),
            SurfaceError::InvalidDimensions { width, height } => {
                write!(f, "invalid surface dimensions {}x{}", width, height)
            }
            SurfaceError::UnsupportedFormat(msg) => write!(f, "unsupported format: {}", msg),
            SurfaceError::Unknown(id) => write!(f, "unknown surface {}", id),
            SurfaceError::AllocationFailed(msg) => write!(f, "allocation failed: {}", msg),
        }
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::InvalidBuffer(msg) => write!(f, "invalid pixel buffer: {}", msg),
            PersistenceError::EncodingFailed(msg) => write!(f, "PNG encoding failed: {}", msg),
            PersistenceError::WriteFailed { path, reason } => {
                write!(f, "failed to write {}: {}", path.display(), reason)
            }
            PersistenceError::QueueFull => write!(f, "write queue is full"),
            PersistenceError::QueueClosed => write!(f, "write queue is closed"),
        }
    }
}

impl std::error::Error for LabelerError {}
impl std::error::Error for SurfaceError {}
impl std::error::Error for PersistenceError {}

impl From<SurfaceError> for LabelerError {
    fn from(err: SurfaceError) -> Self {
        LabelerError::Surface(err)
    }
}

impl From<PersistenceError> for LabelerError {
    fn from(err: PersistenceError) -> Self {
        LabelerError::Persistence(err)
    }
}

impl From<String> for LabelerError {
    fn from(msg: String) -> Self {
        LabelerError::Other(msg)
    }
}

impl From<&str> for LabelerError {
    fn from(msg: &str) -> Self {
        LabelerError::Other(msg.to_string())
    }
}

impl From<serde_json::Error> for LabelerError {
    fn from(err: serde_json::Error) -> Self {
        LabelerError::Config(err.to_string())
    }
}

impl From<image::ImageError> for PersistenceError {
    fn from(err: image::ImageError) -> Self {
        PersistenceError::EncodingFailed(err.to_string())
    }
}
