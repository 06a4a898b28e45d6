// SPDX-License-Identifier: GPL-3.0-only

//! wgpu render backend
//!
//! Target surfaces are wgpu textures. A readback records a texture-to-buffer
//! copy into a row-padded staging buffer, submits it and maps the buffer
//! asynchronously. A readback pump drives `device.poll`, and once a mapping
//! finishes it strips the row padding and fires the completion callback.
//! The render thread never waits on the GPU.

use super::RenderBackend;
use super::readback_pump::{ReadbackPump, ReadbackSource};
use crate::errors::{LabelerResult, SurfaceError};
use crate::gpu::{self, GpuDeviceInfo, padded_bytes_per_row};
use crate::readback::{FrameId, PixelBuffer, PixelFormat, ReadbackCallback};
use crate::surface::{ColorSpace, SurfaceDescriptor, SurfaceId};
use futures::channel::oneshot;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

type MapResult = Result<(), wgpu::BufferAsyncError>;

struct GpuSurface {
    descriptor: SurfaceDescriptor,
    texture: wgpu::Texture,
}

struct InFlightCopy {
    frame_id: FrameId,
    surface: SurfaceId,
    staging: wgpu::Buffer,
    padded_bytes_per_row: u32,
    width: u32,
    height: u32,
    format: PixelFormat,
    mapped: oneshot::Receiver<MapResult>,
    callback: ReadbackCallback,
}

#[derive(Default)]
struct GpuState {
    next_surface: SurfaceId,
    next_ticket: u64,
    surfaces: HashMap<SurfaceId, GpuSurface>,
    in_flight: HashMap<u64, InFlightCopy>,
}

fn lock(state: &Mutex<GpuState>) -> MutexGuard<'_, GpuState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Map a surface descriptor onto a wgpu texture format
fn texture_format(descriptor: &SurfaceDescriptor) -> Result<wgpu::TextureFormat, SurfaceError> {
    match (descriptor.format, descriptor.color_space) {
        (PixelFormat::R32Float, ColorSpace::Linear) => Ok(wgpu::TextureFormat::R32Float),
        (PixelFormat::Rgba8Unorm, ColorSpace::Linear) => Ok(wgpu::TextureFormat::Rgba8Unorm),
        (PixelFormat::Rgba8Unorm, ColorSpace::Srgb) => Ok(wgpu::TextureFormat::Rgba8UnormSrgb),
        (PixelFormat::R32Float, ColorSpace::Srgb) => Err(SurfaceError::UnsupportedFormat(
            "R32Float has no sRGB variant".to_string(),
        )),
    }
}

/// GPU render backend on a headless wgpu device
pub struct GpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    info: GpuDeviceInfo,
    state: Arc<Mutex<GpuState>>,
    poller: Mutex<Option<ReadbackPump>>,
}

impl GpuBackend {
    /// Create a device and start the readback poll thread
    pub async fn new() -> LabelerResult<Self> {
        let (device, queue, info) = gpu::create_readback_device("depth_labeler_gpu").await?;

        info!(
            adapter_name = %info.adapter_name,
            adapter_backend = ?info.backend,
            "GPU device created for depth readback"
        );

        Ok(Self::with_device(device, queue, info))
    }

    /// Blocking wrapper around [`new`](Self::new) for non-async hosts
    pub fn new_blocking() -> LabelerResult<Self> {
        pollster::block_on(Self::new())
    }

    /// Use a device the renderer already owns
    pub fn with_device(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        info: GpuDeviceInfo,
    ) -> Self {
        let state = Arc::new(Mutex::new(GpuState::default()));

        let poller = ReadbackPump::start(
            "gpu-readback",
            Arc::new(MapPoller {
                device: Arc::clone(&device),
                state: Arc::clone(&state),
            }),
        );

        Self {
            device,
            queue,
            info,
            state,
            poller: Mutex::new(Some(poller)),
        }
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    pub fn device_info(&self) -> &GpuDeviceInfo {
        &self.info
    }

    /// Run `f` with the texture backing `surface` (e.g. to build a render pass)
    ///
    /// `f` runs unlocked and may call back into the backend.
    pub fn with_texture<R>(
        &self,
        surface: SurfaceId,
        f: impl FnOnce(&wgpu::Texture) -> R,
    ) -> Option<R> {
        let texture = lock(&self.state)
            .surfaces
            .get(&surface)
            .map(|s| s.texture.clone())?;
        Some(f(&texture))
    }

    /// Upload tightly packed pixel rows into `surface`
    pub fn write_pixels(&self, surface: SurfaceId, data: &[u8]) -> LabelerResult<()> {
        let state = lock(&self.state);
        let target = state
            .surfaces
            .get(&surface)
            .ok_or(SurfaceError::Unknown(surface))?;
        let descriptor = &target.descriptor;
        if data.len() != descriptor.buffer_size() {
            return Err(SurfaceError::AllocationFailed(format!(
                "frame is {} bytes, surface expects {}",
                data.len(),
                descriptor.buffer_size()
            ))
            .into());
        }

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(descriptor.width * descriptor.format.bytes_per_pixel()),
                rows_per_image: Some(descriptor.height),
            },
            wgpu::Extent3d {
                width: descriptor.width,
                height: descriptor.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn create_texture(&self, descriptor: &SurfaceDescriptor) -> Result<wgpu::Texture, SurfaceError> {
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(SurfaceError::InvalidDimensions {
                width: descriptor.width,
                height: descriptor.height,
            });
        }

        let limit = self.device.limits().max_texture_dimension_2d;
        if descriptor.width > limit || descriptor.height > limit {
            return Err(SurfaceError::AllocationFailed(format!(
                "{}x{} exceeds the device limit of {}",
                descriptor.width, descriptor.height, limit
            )));
        }

        let format = texture_format(descriptor)?;
        Ok(self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&descriptor.label),
            size: wgpu::Extent3d {
                width: descriptor.width,
                height: descriptor.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        }))
    }

    /// Remove copies pending against `surface`; caller drops them unlocked
    fn take_in_flight_for(state: &mut GpuState, surface: SurfaceId) -> Vec<InFlightCopy> {
        let tickets: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, copy)| copy.surface == surface)
            .map(|(ticket, _)| *ticket)
            .collect();
        tickets
            .into_iter()
            .filter_map(|ticket| state.in_flight.remove(&ticket))
            .collect()
    }
}

/// Drives `device.poll` and delivers mapped staging buffers
struct MapPoller {
    device: Arc<wgpu::Device>,
    state: Arc<Mutex<GpuState>>,
}

impl ReadbackSource for MapPoller {
    fn pump(&self, timeout: Duration) -> usize {
        if lock(&self.state).in_flight.is_empty() {
            std::thread::sleep(timeout);
            return 0;
        }
        if let Err(e) = self.device.poll(wgpu::PollType::Poll) {
            warn!(error = ?e, "Device poll failed");
        }
        let delivered = deliver_mapped(&self.state);
        if delivered == 0 {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        delivered
    }

    fn flush(&self) -> usize {
        if lock(&self.state).in_flight.is_empty() {
            return 0;
        }
        if let Err(e) = self.device.poll(wgpu::PollType::wait_indefinitely()) {
            warn!(error = ?e, "Device poll failed while flushing readbacks");
        }
        deliver_mapped(&self.state)
    }
}

/// Deliver every copy whose mapping has finished
///
/// Returns how many callbacks ran.
fn deliver_mapped(state: &Mutex<GpuState>) -> usize {
    let ready: Vec<(InFlightCopy, MapResult)> = {
        let mut state = lock(state);
        if state.in_flight.is_empty() {
            return 0;
        }

        let mut finished = Vec::new();
        for (ticket, copy) in state.in_flight.iter_mut() {
            match copy.mapped.try_recv() {
                Ok(Some(result)) => finished.push((*ticket, result)),
                Ok(None) => {}
                Err(oneshot::Canceled) => finished.push((*ticket, Err(wgpu::BufferAsyncError))),
            }
        }
        finished
            .into_iter()
            .filter_map(|(ticket, result)| state.in_flight.remove(&ticket).map(|c| (c, result)))
            .collect()
    };

    let mut delivered = 0;
    for (copy, result) in ready {
        if let Err(e) = result {
            debug!(frame_id = copy.frame_id, error = %e, "Readback mapping failed, dropping capture");
            continue;
        }

        let buffer = {
            let slice = copy.staging.slice(..);
            let mapped = slice.get_mapped_range();
            PixelBuffer::from_padded_rows(
                copy.width,
                copy.height,
                copy.format,
                &mapped,
                copy.padded_bytes_per_row as usize,
            )
        };
        copy.staging.unmap();

        match buffer {
            Some(buffer) => {
                (copy.callback)(copy.frame_id, buffer);
                delivered += 1;
            }
            None => warn!(frame_id = copy.frame_id, "Readback size mismatch, dropping capture"),
        }
    }
    delivered
}

impl RenderBackend for GpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_surface(&self, descriptor: &SurfaceDescriptor) -> LabelerResult<SurfaceId> {
        let texture = self.create_texture(descriptor)?;
        let mut state = lock(&self.state);
        state.next_surface += 1;
        let id = state.next_surface;
        state.surfaces.insert(
            id,
            GpuSurface {
                descriptor: descriptor.clone(),
                texture,
            },
        );
        debug!(surface = id, label = %descriptor.label, "Created GPU surface");
        Ok(id)
    }

    fn reformat_surface(
        &self,
        surface: SurfaceId,
        descriptor: &SurfaceDescriptor,
    ) -> LabelerResult<()> {
        let texture = self.create_texture(descriptor)?;
        let stale = {
            let mut state = lock(&self.state);
            let target = state
                .surfaces
                .get_mut(&surface)
                .ok_or(SurfaceError::Unknown(surface))?;
            let old = std::mem::replace(&mut target.texture, texture);
            target.descriptor = descriptor.clone();
            old.destroy();
            Self::take_in_flight_for(&mut state, surface)
        };
        if !stale.is_empty() {
            debug!(surface, dropped = stale.len(), "Surface reformatted with readbacks pending");
        }
        Ok(())
    }

    fn surface_descriptor(&self, surface: SurfaceId) -> Option<SurfaceDescriptor> {
        lock(&self.state)
            .surfaces
            .get(&surface)
            .map(|s| s.descriptor.clone())
    }

    fn release_surface(&self, surface: SurfaceId) {
        let stale = {
            let mut state = lock(&self.state);
            if let Some(released) = state.surfaces.remove(&surface) {
                released.texture.destroy();
            }
            Self::take_in_flight_for(&mut state, surface)
        };
        debug!(surface, dropped = stale.len(), "Released GPU surface");
    }

    fn request_readback(
        &self,
        surface: SurfaceId,
        frame_id: FrameId,
        on_complete: ReadbackCallback,
    ) {
        let mut state = lock(&self.state);
        let Some(source) = state.surfaces.get(&surface) else {
            debug!(surface, frame_id, "Readback requested for unknown surface");
            return;
        };

        let width = source.descriptor.width;
        let height = source.descriptor.height;
        let format = source.descriptor.format;
        let padded = padded_bytes_per_row(width * format.bytes_per_pixel());

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("depth_readback_staging"),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("depth_readback_encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = oneshot::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });

        state.next_ticket += 1;
        let ticket = state.next_ticket;
        state.in_flight.insert(
            ticket,
            InFlightCopy {
                frame_id,
                surface,
                staging,
                padded_bytes_per_row: padded,
                width,
                height,
                format,
                mapped: receiver,
                callback: on_complete,
            },
        );
    }
}

impl Drop for GpuBackend {
    fn drop(&mut self) {
        let poller = self
            .poller
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        // Stopping the pump flushes outstanding copies
        if let Some(mut poller) = poller {
            poller.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_texture_format_mapping() {
        let linear = SurfaceDescriptor::linear(4, 4, PixelFormat::R32Float);
        assert_eq!(texture_format(&linear).unwrap(), wgpu::TextureFormat::R32Float);

        let srgb = SurfaceDescriptor {
            color_space: ColorSpace::Srgb,
            ..SurfaceDescriptor::linear(4, 4, PixelFormat::Rgba8Unorm)
        };
        assert!(texture_format(&srgb).unwrap().is_srgb());

        let bad = SurfaceDescriptor {
            color_space: ColorSpace::Srgb,
            ..linear
        };
        assert!(texture_format(&bad).is_err());
    }

    #[test]
    fn test_gpu_readback_round_trip() {
        // This test requires a GPU, so it may be skipped in CI
        let backend = match GpuBackend::new_blocking() {
            Ok(backend) => backend,
            Err(e) => {
                println!("Skipping test (no GPU): {}", e);
                return;
            }
        };

        let id = backend
            .create_surface(&SurfaceDescriptor::linear(3, 2, PixelFormat::R32Float))
            .unwrap();
        let depth = [0.0f32, 0.1, 0.2, 0.3, 0.4, 0.5];
        let bytes: Vec<u8> = depth.iter().flat_map(|d| d.to_le_bytes()).collect();
        backend.write_pixels(id, &bytes).unwrap();

        let (tx, rx) = mpsc::channel();
        backend.request_readback(
            id,
            7,
            Box::new(move |frame, buffer| tx.send((frame, buffer)).unwrap()),
        );

        let (frame, buffer) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(frame, 7);
        assert_eq!(buffer.normalized_depth().collect::<Vec<_>>(), depth.to_vec());
    }

    #[test]
    fn test_with_texture_can_call_back_into_backend() {
        // This test requires a GPU, so it may be skipped in CI
        let backend = match GpuBackend::new_blocking() {
            Ok(backend) => backend,
            Err(e) => {
                println!("Skipping test (no GPU): {}", e);
                return;
            }
        };

        let id = backend
            .create_surface(&SurfaceDescriptor::linear(2, 1, PixelFormat::R32Float))
            .unwrap();
        let (tx, rx) = mpsc::channel();
        let width = backend.with_texture(id, |texture| {
            backend.write_pixels(id, &[0u8; 8]).unwrap();
            backend.request_readback(
                id,
                1,
                Box::new(move |frame, _| tx.send(frame).unwrap()),
            );
            texture.width()
        });

        assert_eq!(width, Some(2));
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 1);
        assert!(backend.with_texture(99, |_| ()).is_none());
    }

    #[test]
    fn test_drop_flushes_in_flight_copies() {
        // This test requires a GPU, so it may be skipped in CI
        let backend = match GpuBackend::new_blocking() {
            Ok(backend) => backend,
            Err(e) => {
                println!("Skipping test (no GPU): {}", e);
                return;
            }
        };

        let id = backend
            .create_surface(&SurfaceDescriptor::linear(4, 4, PixelFormat::R32Float))
            .unwrap();
        let (tx, rx) = mpsc::channel();
        for frame in 0..3 {
            let tx = tx.clone();
            backend.request_readback(
                id,
                frame,
                Box::new(move |frame, _| tx.send(frame).unwrap()),
            );
        }
        drop(tx);
        drop(backend);

        let mut frames: Vec<FrameId> = rx.iter().collect();
        frames.sort();
        assert_eq!(frames, vec![0, 1, 2]);
    }
}
