// SPDX-License-Identifier: GPL-3.0-only

//! Log subscriber setup
//!
//! Set the `RUST_LOG` environment variable to control the log level.
//! Examples: `RUST_LOG=debug`, `RUST_LOG=depth_labeler=debug`, `RUST_LOG=info`

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "warn";

/// Install the global fmt subscriber
///
/// Returns `false` if a subscriber was already installed (by the host or an
/// earlier call), in which case nothing changes.
pub fn init() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_target(true)
        .with_level(true)
        .try_init()
        .is_ok()
}
