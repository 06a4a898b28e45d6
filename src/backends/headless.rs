// SPDX-License-Identifier: GPL-3.0-only

//! Headless backend with CPU-resident surfaces
//!
//! The renderer writes finished depth frames straight into a surface with
//! [`HeadlessBackend::write_pixels`]. A readback snapshots the surface when it
//! is requested (the frame-end signal), then completes later:
//! - `Automatic`: a copy thread delivers pending readbacks in request order
//!   and flushes the rest when the backend is dropped
//! - `Manual`: the host calls [`deliver`](HeadlessBackend::deliver) in
//!   whatever order it likes, which makes out-of-order completion
//!   reproducible

use super::RenderBackend;
use super::readback_pump::{ReadbackPump, ReadbackSource};
use crate::errors::{LabelerResult, SurfaceError};
use crate::readback::{FrameId, PixelBuffer, PixelFormat, ReadbackCallback};
use crate::surface::{SurfaceDescriptor, SurfaceId};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

/// How pending readbacks get completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Host triggers every completion
    Manual,
    /// A copy thread completes readbacks after `latency`
    Automatic { latency: Duration },
}

struct CpuSurface {
    descriptor: SurfaceDescriptor,
    pixels: Vec<u8>,
}

struct PendingReadback {
    frame_id: FrameId,
    surface: SurfaceId,
    buffer: PixelBuffer,
    callback: ReadbackCallback,
}

#[derive(Default)]
struct HeadlessState {
    next_surface: SurfaceId,
    surfaces: HashMap<SurfaceId, CpuSurface>,
    pending: Vec<PendingReadback>,
}

struct Shared {
    state: Mutex<HeadlessState>,
    work: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// CPU render backend
pub struct HeadlessBackend {
    shared: Arc<Shared>,
    mode: DeliveryMode,
    copy_pump: Mutex<Option<ReadbackPump>>,
}

impl HeadlessBackend {
    /// Backend whose readbacks complete only through [`deliver`](Self::deliver)
    pub fn manual() -> Self {
        Self::new(DeliveryMode::Manual)
    }

    /// Backend with a copy thread and no added latency
    pub fn automatic() -> Self {
        Self::new(DeliveryMode::Automatic {
            latency: Duration::ZERO,
        })
    }

    pub fn new(mode: DeliveryMode) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(HeadlessState::default()),
            work: Condvar::new(),
        });

        let copy_pump = match mode {
            DeliveryMode::Manual => None,
            DeliveryMode::Automatic { latency } => {
                let engine = CopyEngine {
                    shared: Arc::clone(&shared),
                    latency,
                };
                Some(ReadbackPump::start("headless-readback", Arc::new(engine)))
            }
        };

        Self {
            shared,
            mode,
            copy_pump: Mutex::new(copy_pump),
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Store a rendered frame in `surface` (tightly packed rows)
    pub fn write_pixels(&self, surface: SurfaceId, data: &[u8]) -> LabelerResult<()> {
        let mut state = self.shared.lock();
        let target = state
            .surfaces
            .get_mut(&surface)
            .ok_or(SurfaceError::Unknown(surface))?;

        let expected = target.descriptor.buffer_size();
        if data.len() != expected {
            return Err(SurfaceError::AllocationFailed(format!(
                "frame is {} bytes, surface expects {}",
                data.len(),
                expected
            ))
            .into());
        }
        target.pixels.copy_from_slice(data);
        Ok(())
    }

    /// Store normalised depth samples in an `R32Float` surface
    pub fn write_depth(&self, surface: SurfaceId, depth: &[f32]) -> LabelerResult<()> {
        let format = self
            .surface_descriptor(surface)
            .ok_or(SurfaceError::Unknown(surface))?
            .format;
        if format != PixelFormat::R32Float {
            return Err(SurfaceError::UnsupportedFormat(format!(
                "write_depth needs R32Float, surface is {:?}",
                format
            ))
            .into());
        }
        let bytes: Vec<u8> = depth.iter().flat_map(|d| d.to_le_bytes()).collect();
        self.write_pixels(surface, &bytes)
    }

    /// Frame ids with a readback waiting to complete, in request order
    pub fn pending_frames(&self) -> Vec<FrameId> {
        self.shared.lock().pending.iter().map(|p| p.frame_id).collect()
    }

    /// Complete the pending readback for `frame_id` on the calling thread
    ///
    /// Returns `false` if nothing is pending for that frame.
    pub fn deliver(&self, frame_id: FrameId) -> bool {
        let readback = {
            let mut state = self.shared.lock();
            let Some(index) = state.pending.iter().position(|p| p.frame_id == frame_id) else {
                return false;
            };
            state.pending.remove(index)
        };
        complete(readback);
        true
    }

    /// Complete every pending readback in request order
    pub fn deliver_all(&self) -> usize {
        let ready = std::mem::take(&mut self.shared.lock().pending);
        let count = ready.len();
        for readback in ready {
            complete(readback);
        }
        count
    }

    /// Lose the pending readback for `frame_id` without completing it
    pub fn drop_pending(&self, frame_id: FrameId) -> bool {
        let dropped = {
            let mut state = self.shared.lock();
            let Some(index) = state.pending.iter().position(|p| p.frame_id == frame_id) else {
                return false;
            };
            state.pending.remove(index)
        };
        debug!(frame_id, "Dropping pending readback");
        drop(dropped);
        true
    }

    /// Remove pending readbacks against `surface`; caller drops them unlocked
    fn take_pending_for(state: &mut HeadlessState, surface: SurfaceId) -> Vec<PendingReadback> {
        let (stale, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|p| p.surface == surface);
        state.pending = keep;
        stale
    }
}

/// Copy thread side of an `Automatic` backend
struct CopyEngine {
    shared: Arc<Shared>,
    latency: Duration,
}

impl ReadbackSource for CopyEngine {
    fn pump(&self, timeout: Duration) -> usize {
        let ready = {
            let state = self.shared.lock();
            let (mut state, _) = self
                .shared
                .work
                .wait_timeout_while(state, timeout, |s| s.pending.is_empty())
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut state.pending)
        };

        let count = ready.len();
        for readback in ready {
            if !self.latency.is_zero() {
                std::thread::sleep(self.latency);
            }
            complete(readback);
        }
        count
    }

    fn flush(&self) -> usize {
        let ready = std::mem::take(&mut self.shared.lock().pending);
        let count = ready.len();
        for readback in ready {
            complete(readback);
        }
        count
    }
}

fn complete(readback: PendingReadback) {
    trace!(
        frame_id = readback.frame_id,
        surface = readback.surface,
        "Delivering headless readback"
    );
    (readback.callback)(readback.frame_id, readback.buffer);
}

impl RenderBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn create_surface(&self, descriptor: &SurfaceDescriptor) -> LabelerResult<SurfaceId> {
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(SurfaceError::InvalidDimensions {
                width: descriptor.width,
                height: descriptor.height,
            }
            .into());
        }

        let mut state = self.shared.lock();
        state.next_surface += 1;
        let id = state.next_surface;
        state.surfaces.insert(
            id,
            CpuSurface {
                descriptor: descriptor.clone(),
                pixels: vec![0; descriptor.buffer_size()],
            },
        );
        debug!(surface = id, label = %descriptor.label, "Created headless surface");
        Ok(id)
    }

    fn reformat_surface(
        &self,
        surface: SurfaceId,
        descriptor: &SurfaceDescriptor,
    ) -> LabelerResult<()> {
        let stale = {
            let mut state = self.shared.lock();
            let target = state
                .surfaces
                .get_mut(&surface)
                .ok_or(SurfaceError::Unknown(surface))?;
            target.descriptor = descriptor.clone();
            target.pixels = vec![0; descriptor.buffer_size()];
            Self::take_pending_for(&mut state, surface)
        };
        if !stale.is_empty() {
            debug!(surface, dropped = stale.len(), "Surface reformatted with readbacks pending");
        }
        Ok(())
    }

    fn surface_descriptor(&self, surface: SurfaceId) -> Option<SurfaceDescriptor> {
        self.shared
            .lock()
            .surfaces
            .get(&surface)
            .map(|s| s.descriptor.clone())
    }

    fn release_surface(&self, surface: SurfaceId) {
        let stale = {
            let mut state = self.shared.lock();
            state.surfaces.remove(&surface);
            Self::take_pending_for(&mut state, surface)
        };
        debug!(surface, dropped = stale.len(), "Released headless surface");
    }

    fn request_readback(
        &self,
        surface: SurfaceId,
        frame_id: FrameId,
        on_complete: ReadbackCallback,
    ) {
        let mut state = self.shared.lock();
        let Some(source) = state.surfaces.get(&surface) else {
            debug!(surface, frame_id, "Readback requested for unknown surface");
            return;
        };

        let descriptor = &source.descriptor;
        let Some(buffer) = PixelBuffer::new(
            descriptor.width,
            descriptor.height,
            descriptor.format,
            source.pixels.clone(),
        ) else {
            debug!(surface, frame_id, "Surface contents do not match descriptor");
            return;
        };

        state.pending.push(PendingReadback {
            frame_id,
            surface,
            buffer,
            callback: on_complete,
        });
        self.shared.work.notify_one();
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        let copy_pump = self
            .copy_pump
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut copy_pump) = copy_pump {
            copy_pump.stop();
        }
    }
}
