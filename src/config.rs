// SPDX-License-Identifier: GPL-3.0-only

use crate::constants::{
    DEFAULT_ANNOTATION_ID, DEFAULT_FAR_CLIP_PLANE_M, DEFAULT_MAX_CONCURRENT_JOBS,
    DEFAULT_MAX_VALID_DEPTH_M, DEFAULT_MIN_VALID_DEPTH_M,
};
use crate::errors::{LabelerError, LabelerResult};
use crate::readback::PixelFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

/// What `submit` does when a bounded write queue is full
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum OverflowPolicy {
    /// Block the producer until a slot frees up
    #[default]
    Block,
    /// Drop the job being submitted
    DropNewest,
}

/// Encode/write queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued jobs, `None` for unbounded
    pub capacity: Option<usize>,
    /// Behaviour when `capacity` is reached
    pub overflow: OverflowPolicy,
    /// Jobs encoded and written at the same time
    pub max_concurrent_jobs: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            overflow: OverflowPolicy::default(),
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
        }
    }
}

/// Depth labeler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelerConfig {
    /// Id of the registered depth annotation definition
    pub annotation_id: Uuid,
    /// Distance in metres that normalised depth 1.0 maps to
    pub far_clip_plane_m: f32,
    /// Depths below this are written as invalid
    pub min_valid_depth_m: f32,
    /// Depths at or beyond this are written as invalid
    pub max_valid_depth_m: f32,
    /// Format of a newly allocated target surface
    pub surface_format: PixelFormat,
    pub queue: QueueConfig,
}

impl Default for LabelerConfig {
    fn default() -> Self {
        Self {
            annotation_id: Uuid::parse_str(DEFAULT_ANNOTATION_ID).unwrap_or_default(),
            far_clip_plane_m: DEFAULT_FAR_CLIP_PLANE_M,
            min_valid_depth_m: DEFAULT_MIN_VALID_DEPTH_M,
            max_valid_depth_m: DEFAULT_MAX_VALID_DEPTH_M,
            surface_format: PixelFormat::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl LabelerConfig {
    /// Parse and validate a JSON config; missing fields take their defaults
    pub fn from_json_str(json: &str) -> LabelerResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> LabelerResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading labeler config");
        let json = std::fs::read_to_string(path).map_err(|e| {
            LabelerError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> LabelerResult<()> {
        if !self.far_clip_plane_m.is_finite() || self.far_clip_plane_m <= 0.0 {
            return Err(LabelerError::Config(format!(
                "far_clip_plane_m must be positive, got {}",
                self.far_clip_plane_m
            )));
        }
        if !self.min_valid_depth_m.is_finite() || self.min_valid_depth_m < 0.0 {
            return Err(LabelerError::Config(format!(
                "min_valid_depth_m must be non-negative, got {}",
                self.min_valid_depth_m
            )));
        }
        // Infinity is allowed: no upper cut-off
        if self.max_valid_depth_m.is_nan() || self.max_valid_depth_m <= self.min_valid_depth_m {
            return Err(LabelerError::Config(format!(
                "max_valid_depth_m ({}) must be greater than min_valid_depth_m ({})",
                self.max_valid_depth_m, self.min_valid_depth_m
            )));
        }
        if self.queue.max_concurrent_jobs == 0 {
            return Err(LabelerError::Config(
                "queue.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.queue.capacity == Some(0) {
            return Err(LabelerError::Config(
                "queue.capacity must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}
