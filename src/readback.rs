// SPDX-License-Identifier: GPL-3.0-only

//! Pixel buffer transfer
//!
//! A capture copies a finished target surface into CPU memory without
//! blocking the render thread. Backends deliver completions through a
//! [`ReadbackCallback`]; the [`ReadbackTracker`] counts captures that have not
//! settled yet so teardown can wait for them.
//!
//! A capture settles in one of two ways:
//! - the backend invokes the callback with the finished [`PixelBuffer`]
//! - the backend drops the callback (surface released or resized mid-flight)
//!
//! Completions arrive in any order and on any thread, so callers correlate
//! them by frame id only.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

/// Identifier of a rendered frame
pub type FrameId = u64;

/// Completion callback handed to a backend for one capture
pub type ReadbackCallback = Box<dyn FnOnce(FrameId, PixelBuffer) + Send + 'static>;

/// Pixel layout of a target surface and of the buffers read back from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// One `f32` per pixel: linear depth normalised to the far clip plane
    #[default]
    R32Float,
    /// Four bytes per pixel: normalised linear depth in the red channel
    Rgba8Unorm,
}

impl PixelFormat {
    /// Bytes used by a single pixel
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::R32Float => 4,
            PixelFormat::Rgba8Unorm => 4,
        }
    }

    /// Tightly packed size of a `width` x `height` image
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel() as usize
    }
}

/// CPU-side copy of one captured frame
///
/// Owns its pixel data. Not `Clone`: a buffer has exactly one owner at a
/// time and moves from the readback into a write job.
#[derive(PartialEq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Wrap tightly packed pixel rows
    ///
    /// Returns `None` if `data` does not match the declared size.
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Option<Self> {
        if data.len() != format.buffer_size(width, height) {
            return None;
        }
        Some(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Build an `R32Float` buffer from normalised depth samples
    pub fn from_depth(width: u32, height: u32, depth: &[f32]) -> Option<Self> {
        let data: Vec<u8> = depth.iter().flat_map(|d| d.to_le_bytes()).collect();
        Self::new(width, height, PixelFormat::R32Float, data)
    }

    /// Build a buffer from row-padded readback data, dropping the padding
    ///
    /// GPU copies align each row to `padded_bytes_per_row`; only the first
    /// `width * bytes_per_pixel` bytes of each row are pixels.
    pub fn from_padded_rows(
        width: u32,
        height: u32,
        format: PixelFormat,
        padded: &[u8],
        padded_bytes_per_row: usize,
    ) -> Option<Self> {
        let packed_row = width as usize * format.bytes_per_pixel() as usize;
        if padded_bytes_per_row < packed_row || padded.len() < padded_bytes_per_row * height as usize
        {
            return None;
        }

        let mut packed = Vec::with_capacity(packed_row * height as usize);
        for row in 0..height as usize {
            let start = row * padded_bytes_per_row;
            packed.extend_from_slice(&padded[start..start + packed_row]);
        }
        Self::new(width, height, format, packed)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Normalised depth of every pixel, row-major
    pub fn normalized_depth(&self) -> impl Iterator<Item = f32> + '_ {
        let bpp = self.format.bytes_per_pixel() as usize;
        let format = self.format;
        self.data.chunks_exact(bpp).map(move |px| match format {
            PixelFormat::R32Float => bytemuck::pod_read_unaligned::<f32>(px),
            PixelFormat::Rgba8Unorm => px[0] as f32 / 255.0,
        })
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PixelBuffer({}x{} {:?}, {} bytes)",
            self.width,
            self.height,
            self.format,
            self.data.len()
        )
    }
}

#[derive(Default)]
struct TrackerState {
    in_flight: usize,
}

#[derive(Default)]
struct TrackerShared {
    state: Mutex<TrackerState>,
    idle: Condvar,
    completed: AtomicU64,
    dropped: AtomicU64,
}

/// Counts captures that have been issued but not settled
#[derive(Clone, Default)]
pub struct ReadbackTracker {
    shared: Arc<TrackerShared>,
}

impl ReadbackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capture and wrap its completion handler
    ///
    /// The returned callback is what gets handed to the backend. Running it
    /// marks the capture completed; dropping it unrun marks it dropped.
    pub fn track<F>(&self, frame_id: FrameId, on_complete: F) -> ReadbackCallback
    where
        F: FnOnce(FrameId, PixelBuffer) + Send + 'static,
    {
        {
            let mut state = self.lock_state();
            state.in_flight += 1;
        }
        trace!(frame_id, "Capture issued");

        let guard = InFlightGuard {
            shared: Arc::clone(&self.shared),
            frame_id,
            completed: false,
        };
        Box::new(move |frame_id, buffer| {
            on_complete(frame_id, buffer);
            guard.complete();
        })
    }

    /// Captures issued and not yet settled
    pub fn in_flight(&self) -> usize {
        self.lock_state().in_flight
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    /// Block until every issued capture has settled
    pub fn wait_idle(&self) {
        let mut state = self.lock_state();
        while state.in_flight > 0 {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`wait_idle`](Self::wait_idle) with an upper bound
    ///
    /// Returns `true` if the tracker became idle within `timeout`.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let state = self.lock_state();
        let (state, _) = self
            .shared
            .idle
            .wait_timeout_while(state, timeout, |s| s.in_flight > 0)
            .unwrap_or_else(|e| e.into_inner());
        state.in_flight == 0
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Settles one capture when dropped
struct InFlightGuard {
    shared: Arc<TrackerShared>,
    frame_id: FrameId,
    completed: bool,
}

impl InFlightGuard {
    /// Settle the capture as completed
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.completed {
            self.shared.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.shared.dropped.fetch_add(1, Ordering::SeqCst);
            debug!(frame_id = self.frame_id, "Capture dropped before completion");
        }

        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn test_buffer_size_checked() {
        assert!(PixelBuffer::new(2, 2, PixelFormat::R32Float, vec![0; 16]).is_some());
        assert!(PixelBuffer::new(2, 2, PixelFormat::R32Float, vec![0; 15]).is_none());
        assert!(PixelBuffer::new(3, 1, PixelFormat::Rgba8Unorm, vec![0; 12]).is_some());
    }

    #[test]
    fn test_from_padded_rows_strips_padding() {
        // 2x2 RGBA rows padded to 12 bytes
        let mut padded = vec![0u8; 24];
        padded[0..8].copy_from_slice(&[1, 0, 0, 255, 2, 0, 0, 255]);
        padded[12..20].copy_from_slice(&[3, 0, 0, 255, 4, 0, 0, 255]);

        let buffer =
            PixelBuffer::from_padded_rows(2, 2, PixelFormat::Rgba8Unorm, &padded, 12).unwrap();
        assert_eq!(buffer.len(), 16);
        let reds: Vec<u8> = buffer.data().chunks(4).map(|px| px[0]).collect();
        assert_eq!(reds, vec![1, 2, 3, 4]);

        assert!(PixelBuffer::from_padded_rows(2, 2, PixelFormat::Rgba8Unorm, &padded, 4).is_none());
    }

    #[test]
    fn test_normalized_depth_decodes_both_formats() {
        let buffer = PixelBuffer::from_depth(2, 1, &[0.25, 1.0]).unwrap();
        let depth: Vec<f32> = buffer.normalized_depth().collect();
        assert_eq!(depth, vec![0.25, 1.0]);

        let buffer =
            PixelBuffer::new(2, 1, PixelFormat::Rgba8Unorm, vec![255, 0, 0, 255, 0, 9, 9, 255])
                .unwrap();
        let depth: Vec<f32> = buffer.normalized_depth().collect();
        assert_eq!(depth, vec![1.0, 0.0]);
    }

    #[test]
    fn test_tracker_completed_capture() {
        let tracker = ReadbackTracker::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        let callback = tracker.track(5, move |frame_id, buffer| {
            assert_eq!(frame_id, 5);
            assert_eq!(buffer.width, 1);
            ran_clone.store(true, Ordering::SeqCst);
        });
        assert_eq!(tracker.in_flight(), 1);

        callback(5, PixelBuffer::from_depth(1, 1, &[0.5]).unwrap());
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.completed(), 1);
        assert_eq!(tracker.dropped(), 0);
    }

    #[test]
    fn test_tracker_keeps_capture_in_flight_until_callback_runs() {
        let tracker = ReadbackTracker::new();
        let callback = tracker.track(1, |_, _| {});

        // Handing the callback to another thread must not settle it
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            callback(1, PixelBuffer::from_depth(1, 1, &[0.2]).unwrap());
        });
        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(tracker.dropped(), 0);
        assert!(!tracker.wait_idle_timeout(Duration::ZERO));

        worker.join().unwrap();
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.completed(), 1);
        assert_eq!(tracker.dropped(), 0);
    }

    #[test]
    fn test_tracker_dropped_capture_settles() {
        let tracker = ReadbackTracker::new();
        let callback = tracker.track(9, |_, _| panic!("dropped capture must not complete"));
        assert_eq!(tracker.in_flight(), 1);

        drop(callback);
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.dropped(), 1);
        assert!(tracker.wait_idle_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_idle_blocks_until_settled() {
        let tracker = ReadbackTracker::new();
        let callbacks: Vec<_> = (0..4).map(|id| tracker.track(id, |_, _| {})).collect();

        let worker = thread::spawn(move || {
            for (id, callback) in callbacks.into_iter().enumerate() {
                thread::sleep(Duration::from_millis(5));
                if id % 2 == 0 {
                    callback(id as u64, PixelBuffer::from_depth(1, 1, &[0.1]).unwrap());
                }
            }
        });

        tracker.wait_idle();
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.completed(), 2);
        assert_eq!(tracker.dropped(), 2);
        worker.join().unwrap();
    }
}
