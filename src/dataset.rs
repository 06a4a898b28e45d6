// SPDX-License-Identifier: GPL-3.0-only

//! In-process dataset registry
//!
//! A file-backed [`AnnotationRegistry`] for hosts without their own dataset
//! layer. It hands out directories under a dataset root, keeps every
//! definition and per-frame annotation in memory, and writes them out as JSON
//! manifests next to the captured files.

use crate::annotation::{AnnotationDefinition, AnnotationHandle, AnnotationRegistry};
use crate::constants::{ANNOTATIONS_MANIFEST, DEFINITIONS_MANIFEST};
use crate::errors::{LabelerResult, PersistenceError};
use crate::readback::FrameId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

/// Serialized form of one annotation in `annotations.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub id: Uuid,
    pub annotation_definition: Uuid,
    pub frame_id: FrameId,
    pub filename: Option<String>,
    pub created: DateTime<Utc>,
}

/// Annotation handed out by [`DatasetRegistry`]
#[derive(Debug)]
pub struct DatasetAnnotation {
    id: Uuid,
    definition_id: Uuid,
    frame_id: FrameId,
    created: DateTime<Utc>,
    reports: Mutex<Vec<String>>,
}

impl DatasetAnnotation {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Last reported file, if any
    pub fn file(&self) -> Option<String> {
        self.lock_reports().last().cloned()
    }

    /// How many times a file was reported
    pub fn report_count(&self) -> usize {
        self.lock_reports().len()
    }

    pub fn record(&self) -> AnnotationRecord {
        AnnotationRecord {
            id: self.id,
            annotation_definition: self.definition_id,
            frame_id: self.frame_id,
            filename: self.file(),
            created: self.created,
        }
    }

    fn lock_reports(&self) -> MutexGuard<'_, Vec<String>> {
        self.reports.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AnnotationHandle for DatasetAnnotation {
    fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    fn report_file(&self, relative_path: &str) {
        debug!(frame_id = self.frame_id, path = relative_path, "Annotation file reported");
        self.lock_reports().push(relative_path.to_string());
    }

    fn is_fulfilled(&self) -> bool {
        !self.lock_reports().is_empty()
    }
}

#[derive(Default)]
struct DatasetState {
    definitions: Vec<Arc<AnnotationDefinition>>,
    annotations: Vec<Arc<DatasetAnnotation>>,
    produced: Vec<PathBuf>,
}

/// File-backed annotation registry rooted at a dataset directory
#[derive(Clone)]
pub struct DatasetRegistry {
    root: PathBuf,
    state: Arc<Mutex<DatasetState>>,
}

impl DatasetRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Arc::new(Mutex::new(DatasetState::default())),
        }
    }

    /// Registry under the user's local data directory
    pub fn default_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("depth-labeler")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn definitions(&self) -> Vec<Arc<AnnotationDefinition>> {
        self.lock().definitions.clone()
    }

    pub fn annotations(&self) -> Vec<Arc<DatasetAnnotation>> {
        self.lock().annotations.clone()
    }

    /// Annotations opened for `frame_id`
    pub fn annotations_for(&self, frame_id: FrameId) -> Vec<Arc<DatasetAnnotation>> {
        self.lock()
            .annotations
            .iter()
            .filter(|a| a.frame_id == frame_id)
            .cloned()
            .collect()
    }

    /// Absolute paths reported through `file_produced`
    pub fn produced_files(&self) -> Vec<PathBuf> {
        self.lock().produced.clone()
    }

    pub fn records(&self) -> Vec<AnnotationRecord> {
        self.lock().annotations.iter().map(|a| a.record()).collect()
    }

    /// Write `annotation_definitions.json` and `annotations.json` to the root
    pub fn write_manifests(&self) -> LabelerResult<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| write_failed(&self.root, e))?;

        let definitions: Vec<AnnotationDefinition> =
            self.definitions().iter().map(|d| (**d).clone()).collect();
        write_json(&self.root.join(DEFINITIONS_MANIFEST), &definitions)?;

        let records = self.records();
        write_json(&self.root.join(ANNOTATIONS_MANIFEST), &records)?;

        info!(
            root = %self.root.display(),
            definitions = definitions.len(),
            annotations = records.len(),
            "Dataset manifests written"
        );
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, DatasetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn write_failed(path: &Path, err: std::io::Error) -> PersistenceError {
    PersistenceError::WriteFailed {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> LabelerResult<()> {
    let file = std::fs::File::create(path).map_err(|e| write_failed(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.write_all(b"\n").map_err(|e| write_failed(path, e))?;
    writer.flush().map_err(|e| write_failed(path, e))?;
    Ok(())
}

impl AnnotationRegistry for DatasetRegistry {
    fn register_definition(&self, definition: AnnotationDefinition) -> Arc<AnnotationDefinition> {
        let mut state = self.lock();
        if let Some(existing) = state.definitions.iter().find(|d| d.id == definition.id) {
            debug!(id = %definition.id, "Annotation definition already registered");
            return Arc::clone(existing);
        }

        info!(id = %definition.id, name = %definition.name, "Registered annotation definition");
        let definition = Arc::new(definition);
        state.definitions.push(Arc::clone(&definition));
        definition
    }

    fn begin_annotation(
        &self,
        definition: &AnnotationDefinition,
        frame_id: FrameId,
    ) -> Arc<dyn AnnotationHandle> {
        let annotation = Arc::new(DatasetAnnotation {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            frame_id,
            created: Utc::now(),
            reports: Mutex::new(Vec::new()),
        });
        self.lock().annotations.push(Arc::clone(&annotation));
        annotation
    }

    fn directory_for(&self, relative: &str) -> LabelerResult<PathBuf> {
        let dir = self.root.join(relative);
        std::fs::create_dir_all(&dir).map_err(|e| write_failed(&dir, e))?;
        Ok(dir)
    }

    fn file_produced(&self, path: &Path) {
        self.lock().produced.push(path.to_path_buf());
    }
}
