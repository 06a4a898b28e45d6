// SPDX-License-Identifier: GPL-3.0-only

//! Background delivery of finished readbacks
//!
//! A [`ReadbackPump`] owns the thread that completes a backend's readbacks.
//! The backend exposes its copy queue as a [`ReadbackSource`]; the pump keeps
//! pumping it until stopped and then flushes whatever is still outstanding,
//! so stopping a backend never silently loses a capture that was already
//! copied.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on how long one pump pass may wait for work
pub const PUMP_INTERVAL: Duration = Duration::from_millis(5);

/// Readbacks a backend has issued and not yet delivered
pub trait ReadbackSource: Send + Sync + 'static {
    /// Wait up to `timeout` for ready readbacks and deliver them
    ///
    /// Returns how many callbacks ran.
    fn pump(&self, timeout: Duration) -> usize;

    /// Deliver everything still outstanding, blocking until copies finish
    fn flush(&self) -> usize;
}

struct PumpShared {
    source: Arc<dyn ReadbackSource>,
    stop: AtomicBool,
    delivered: AtomicU64,
}

impl PumpShared {
    fn flush(&self, name: &str) {
        let flushed = self.source.flush();
        self.delivered.fetch_add(flushed as u64, Ordering::SeqCst);
        if flushed > 0 {
            debug!(name, flushed, "Flushed outstanding readbacks");
        }
    }
}

/// Thread delivering a [`ReadbackSource`]'s completions
pub struct ReadbackPump {
    shared: Arc<PumpShared>,
    thread_handle: Option<JoinHandle<()>>,
    name: String,
}

impl ReadbackPump {
    /// Start pumping `source` on a thread called `name`
    ///
    /// If the thread cannot be spawned, readbacks are still delivered when
    /// the pump is stopped.
    pub fn start(name: &str, source: Arc<dyn ReadbackSource>) -> Self {
        let shared = Arc::new(PumpShared {
            source,
            stop: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
        });

        info!(name, "Starting readback pump");

        let thread_shared = Arc::clone(&shared);
        let thread_name = name.to_string();
        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !thread_shared.stop.load(Ordering::SeqCst) {
                    let delivered = thread_shared.source.pump(PUMP_INTERVAL);
                    thread_shared
                        .delivered
                        .fetch_add(delivered as u64, Ordering::SeqCst);
                }
                thread_shared.flush(&thread_name);
                debug!(name = %thread_name, "Readback pump exiting");
            });

        let thread_handle = match thread_handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(name, error = %e, "Failed to spawn readback pump thread");
                None
            }
        };

        Self {
            shared,
            thread_handle,
            name: name.to_string(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Callbacks delivered so far, flushes included
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::SeqCst)
    }

    /// Stop pumping, flush outstanding readbacks and join the thread
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        match self.thread_handle.take() {
            Some(handle) => {
                if let Err(e) = handle.join() {
                    warn!(name = %self.name, "Readback pump thread panicked: {:?}", e);
                }
            }
            None => self.shared.flush(&self.name),
        }
    }
}

impl Drop for ReadbackPump {
    fn drop(&mut self) {
        if !self.shared.stop.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}
