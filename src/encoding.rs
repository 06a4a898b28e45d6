// SPDX-License-Identifier: GPL-3.0-only

//! Depth PNG encoding
//!
//! Converts a read-back depth buffer into a single channel 16-bit PNG whose
//! samples are millimetres from the camera. `0` is reserved for invalid or
//! unknown depth, so a valid depth that rounds to zero is written as 1 mm.
//!
//! Encoding is CPU bound and runs on the queue's blocking pool.

use crate::config::LabelerConfig;
use crate::constants::{DEPTH_INVALID_MM, DEPTH_MIN_VALID_MM};
use crate::errors::PersistenceError;
use crate::readback::PixelBuffer;
use image::{ImageBuffer, ImageFormat, Luma};
use std::io::Cursor;
use tracing::debug;

/// 16-bit greyscale image of millimetre depths
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Normalised depth to millimetre conversion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthEncoding {
    pub far_clip_plane_m: f32,
    pub min_valid_depth_m: f32,
    pub max_valid_depth_m: f32,
}

impl Default for DepthEncoding {
    fn default() -> Self {
        Self::from_config(&LabelerConfig::default())
    }
}

impl DepthEncoding {
    pub fn from_config(config: &LabelerConfig) -> Self {
        Self {
            far_clip_plane_m: config.far_clip_plane_m,
            min_valid_depth_m: config.min_valid_depth_m,
            max_valid_depth_m: config.max_valid_depth_m,
        }
    }

    /// Millimetre sample for one normalised depth value
    pub fn to_millimetres(&self, normalized: f32) -> u16 {
        let metres = normalized * self.far_clip_plane_m;
        if !metres.is_finite()
            || metres < 0.0
            || metres < self.min_valid_depth_m
            || metres >= self.max_valid_depth_m
        {
            return DEPTH_INVALID_MM;
        }

        let mm = (metres * 1000.0).round().min(u16::MAX as f32) as u16;
        mm.max(DEPTH_MIN_VALID_MM)
    }

    /// Convert a whole buffer to a millimetre image
    pub fn to_depth_image(&self, buffer: &PixelBuffer) -> Result<DepthImage, PersistenceError> {
        let samples: Vec<u16> = buffer
            .normalized_depth()
            .map(|d| self.to_millimetres(d))
            .collect();

        ImageBuffer::from_raw(buffer.width, buffer.height, samples).ok_or_else(|| {
            PersistenceError::InvalidBuffer(format!(
                "{}x{} buffer does not hold a full frame",
                buffer.width, buffer.height
            ))
        })
    }

    /// Encode a buffer as a 16-bit PNG
    pub fn encode_png(&self, buffer: &PixelBuffer) -> Result<EncodedDepth, PersistenceError> {
        let image = self.to_depth_image(buffer)?;

        let mut data = Vec::new();
        image.write_to(&mut Cursor::new(&mut data), ImageFormat::Png)?;

        debug!(
            width = buffer.width,
            height = buffer.height,
            size = data.len(),
            "Encoded depth PNG"
        );

        Ok(EncodedDepth {
            data,
            width: buffer.width,
            height: buffer.height,
        })
    }
}

/// Encoded PNG bytes ready for writing
pub struct EncodedDepth {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}
