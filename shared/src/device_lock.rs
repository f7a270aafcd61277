//! Exclusive access to a single piece of hardware.
//!
//! Every device adapter owns one [`DeviceLock`] and holds its guard for the
//! whole duration of a command (an exposure including readout, a slew
//! command, a motion wait). Callers sharing one adapter instance are
//! therefore serialized rather than interleaved on the wire. The guard is
//! released when dropped, which includes the case where the awaiting future
//! is cancelled.

use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};

/// Async mutual-exclusion token for one device.
#[derive(Debug)]
pub struct DeviceLock {
    name: String,
    inner: Mutex<()>,
}

/// Proof of exclusive device access; released on drop.
#[derive(Debug)]
pub struct DeviceGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl DeviceLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for exclusive access.
    pub async fn acquire(&self) -> DeviceGuard<'_> {
        if let Ok(guard) = self.inner.try_lock() {
            return DeviceGuard { _guard: guard };
        }

        log::debug!("{} busy, waiting for outstanding command", self.name);
        let start = Instant::now();
        let guard = self.inner.lock().await;
        log::debug!(
            "{} acquired after {:.1} ms",
            self.name,
            start.elapsed().as_secs_f64() * 1000.0
        );
        DeviceGuard { _guard: guard }
    }

    /// True while some command holds the device.
    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
