// SPDX-License-Identifier: GPL-3.0-only

//! Frame request bookkeeping
//!
//! Maps a frame id to the annotation opened when the frame ended, so an
//! asynchronous readback completion can find the annotation it belongs to.
//! Touched by the render thread (`open`) and by completion threads
//! (`resolve`), hence the mutex.

use crate::errors::{LabelerError, LabelerResult};
use crate::readback::FrameId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::trace;

/// Pending captures keyed by frame id
pub struct FrameRequestTable<H> {
    pending: Mutex<HashMap<FrameId, H>>,
}

impl<H: Clone> FrameRequestTable<H> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register the annotation for `frame_id` before its capture is issued
    ///
    /// `begin` is only called when the frame is not already pending, so a
    /// duplicate open never creates a second annotation.
    pub fn open(&self, frame_id: FrameId, begin: impl FnOnce() -> H) -> LabelerResult<H> {
        let mut pending = self.lock();
        if pending.contains_key(&frame_id) {
            return Err(LabelerError::DuplicateFrame(frame_id));
        }
        let handle = begin();
        pending.insert(frame_id, handle.clone());
        trace!(frame_id, pending = pending.len(), "Opened capture request");
        Ok(handle)
    }

    /// Remove and return the annotation for a completed capture
    ///
    /// Unknown ids (never opened, already resolved, or cleared by teardown)
    /// return `None`.
    pub fn resolve(&self, frame_id: FrameId) -> Option<H> {
        let handle = self.lock().remove(&frame_id);
        if handle.is_none() {
            trace!(frame_id, "Completion for unknown frame discarded");
        }
        handle
    }

    pub fn contains(&self, frame_id: FrameId) -> bool {
        self.lock().contains_key(&frame_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Pending frame ids in ascending order
    pub fn frames(&self) -> Vec<FrameId> {
        let mut frames: Vec<FrameId> = self.lock().keys().copied().collect();
        frames.sort_unstable();
        frames
    }

    /// Empty the table, returning whatever never resolved
    pub fn drain(&self) -> Vec<(FrameId, H)> {
        let mut drained: Vec<(FrameId, H)> = self.lock().drain().collect();
        drained.sort_unstable_by_key(|(frame_id, _)| *frame_id);
        drained
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FrameId, H>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<H: Clone> Default for FrameRequestTable<H> {
    fn default() -> Self {
        Self::new()
    }
}
