// SPDX-License-Identifier: GPL-3.0-only

//! Render-target provisioning
//!
//! The labeler owns exactly one target surface. It either allocates one sized
//! to the camera resolution, or takes an externally supplied surface and
//! reformats it. Depth must be stored linearly: a perceptual (sRGB) surface is
//! a configuration error.

use crate::backends::RenderBackend;
use crate::constants::TARGET_SURFACE_LABEL;
use crate::errors::{LabelerResult, SurfaceError};
use crate::readback::PixelFormat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Backend-issued surface handle
pub type SurfaceId = u64;

/// How stored values map to intensities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ColorSpace {
    /// Values are stored as-is
    #[default]
    Linear,
    /// Values are gamma-encoded (sRGB)
    Srgb,
}

/// Shape and encoding of a target surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub color_space: ColorSpace,
}

impl SurfaceDescriptor {
    /// Linear surface with the default label
    pub fn linear(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            label: TARGET_SURFACE_LABEL.to_string(),
            width,
            height,
            format,
            color_space: ColorSpace::Linear,
        }
    }

    /// Check the descriptor can hold depth
    pub fn validate(&self) -> Result<(), SurfaceError> {
        if self.width == 0 || self.height == 0 {
            return Err(SurfaceError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.color_space != ColorSpace::Linear {
            return Err(SurfaceError::NonLinear);
        }
        Ok(())
    }

    /// Size of one tightly packed readback
    pub fn buffer_size(&self) -> usize {
        self.format.buffer_size(self.width, self.height)
    }
}

/// The surface the renderer draws depth into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSurface {
    pub id: SurfaceId,
    pub descriptor: SurfaceDescriptor,
    /// Allocated by the labeler (released on teardown) rather than supplied
    pub owned: bool,
}

impl TargetSurface {
    pub fn width(&self) -> u32 {
        self.descriptor.width
    }

    pub fn height(&self) -> u32 {
        self.descriptor.height
    }
}

/// Allocate or adopt the labeler's target surface
///
/// * `external` - surface supplied by the host; validated and reformatted to
///   the camera resolution, never released by the labeler
/// * otherwise a linear surface of `format` is allocated and owned
pub fn provision_target<B>(
    backend: &B,
    camera_width: u32,
    camera_height: u32,
    format: PixelFormat,
    external: Option<SurfaceId>,
) -> LabelerResult<TargetSurface>
where
    B: RenderBackend + ?Sized,
{
    if camera_width == 0 || camera_height == 0 {
        return Err(SurfaceError::InvalidDimensions {
            width: camera_width,
            height: camera_height,
        }
        .into());
    }

    match external {
        Some(id) => {
            let current = backend
                .surface_descriptor(id)
                .ok_or(SurfaceError::Unknown(id))?;
            if current.color_space != ColorSpace::Linear {
                return Err(SurfaceError::NonLinear.into());
            }

            let descriptor = SurfaceDescriptor {
                width: camera_width,
                height: camera_height,
                ..current
            };
            descriptor.validate()?;
            if backend.surface_descriptor(id).as_ref() != Some(&descriptor) {
                debug!(
                    surface = id,
                    width = camera_width,
                    height = camera_height,
                    "Reformatting supplied target surface"
                );
                backend.reformat_surface(id, &descriptor)?;
            }

            info!(surface = id, backend = backend.name(), "Using supplied target surface");
            Ok(TargetSurface {
                id,
                descriptor,
                owned: false,
            })
        }
        None => {
            let descriptor = SurfaceDescriptor::linear(camera_width, camera_height, format);
            descriptor.validate()?;
            let id = backend.create_surface(&descriptor)?;

            info!(
                surface = id,
                width = camera_width,
                height = camera_height,
                format = ?format,
                backend = backend.name(),
                "Allocated target surface"
            );
            Ok(TargetSurface {
                id,
                descriptor,
                owned: true,
            })
        }
    }
}
