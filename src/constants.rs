// SPDX-License-Identifier: GPL-3.0-only

//! Labeler-wide constants
//!
//! Annotation identity, output naming and the depth encoding range all live
//! here so the labeler, the encoder and the tests agree on one set of values.

/// Default id that marks depth annotations in a dataset manifest
pub const DEFAULT_ANNOTATION_ID: &str = "12f94d8d-5425-4deb-9b21-0123456789ab";

/// Annotation definition registered once per labeler
pub const ANNOTATION_NAME: &str = "depth";
pub const ANNOTATION_DESCRIPTION: &str = "depth z-buffer image";
pub const ANNOTATION_FORMAT: &str = "PNG";

/// Labeler description reported to hosts
pub const LABELER_DESCRIPTION: &str = "Depth labeler";

/// Per-instance output directory is `Depth<uuid>`
pub const DEPTH_DIRECTORY_PREFIX: &str = "Depth";
/// Per-frame file is `depth_<frame id>.png`
pub const DEPTH_FILE_PREFIX: &str = "depth_";
pub const DEPTH_FILE_EXTENSION: &str = "png";

/// Debug name given to labeler-owned target surfaces
pub const TARGET_SURFACE_LABEL: &str = "Labeling";

/// Encoded value meaning "invalid / unknown depth"
pub const DEPTH_INVALID_MM: u16 = 0;
/// Smallest encoded value for a valid depth sample
pub const DEPTH_MIN_VALID_MM: u16 = 1;

/// Far clip plane used to scale normalised depth into metres
pub const DEFAULT_FAR_CLIP_PLANE_M: f32 = 1000.0;
/// Depth at or above this is treated as invalid. 16-bit millimetres top out at
/// 65.535 m; one metre of headroom is kept below that.
pub const DEFAULT_MAX_VALID_DEPTH_M: f32 = 64.0;
pub const DEFAULT_MIN_VALID_DEPTH_M: f32 = 0.0;

/// Jobs encoded/written concurrently by the write queue
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 2;

/// Manifest file names written by the in-process dataset registry
pub const DEFINITIONS_MANIFEST: &str = "annotation_definitions.json";
pub const ANNOTATIONS_MANIFEST: &str = "annotations.json";

/// Build the file name for a frame's depth image
pub fn depth_file_name(frame_id: u64) -> String {
    format!(
        "{}{}.{}",
        DEPTH_FILE_PREFIX, frame_id, DEPTH_FILE_EXTENSION
    )
}
