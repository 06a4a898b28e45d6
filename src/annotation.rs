// SPDX-License-Identifier: GPL-3.0-only

//! Annotation registry interface
//!
//! The dataset side is an external collaborator. The labeler registers one
//! definition for its lifetime, begins one annotation per captured frame, and
//! reports the written file back to it. Reporting the file fulfils the
//! annotation.

use crate::errors::LabelerResult;
use crate::readback::FrameId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Describes one kind of per-frame ground truth in a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationDefinition {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub format: String,
}

/// One per-frame annotation awaiting its file
pub trait AnnotationHandle: Send + Sync + std::fmt::Debug {
    /// Frame this annotation belongs to
    fn frame_id(&self) -> FrameId;

    /// Record the dataset-relative path of the written file
    fn report_file(&self, relative_path: &str);

    /// Whether a file has been reported
    fn is_fulfilled(&self) -> bool;
}

/// Dataset/annotation registry the labeler reports into
pub trait AnnotationRegistry: Send + Sync {
    /// Register an annotation definition; called once per labeler
    fn register_definition(&self, definition: AnnotationDefinition) -> Arc<AnnotationDefinition>;

    /// Open an annotation for `frame_id`
    fn begin_annotation(
        &self,
        definition: &AnnotationDefinition,
        frame_id: FrameId,
    ) -> Arc<dyn AnnotationHandle>;

    /// Absolute directory for a dataset-relative directory, created if missing
    fn directory_for(&self, relative: &str) -> LabelerResult<PathBuf>;

    /// Notification that a dataset file has been written
    fn file_produced(&self, _path: &Path) {}
}
