//! Mount control abstraction.
//!
//! Wraps whatever driver model the hardware exposes behind four
//! capabilities: read the current position, start a slew, sync the pointing
//! model, and wait for motion to finish. Slews are fire-and-forget at the
//! command level; completion is observed through [`MountInterface::wait_for_idle`].

pub mod mock;

use crate::sky::SkyCoordinate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Motion status of the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionStatus {
    /// Stationary, not tracking
    Idle,
    /// Slew in progress
    Slewing,
    /// Following the sky at sidereal rate
    Tracking,
    /// Hardware reported a fault; no further motion should be commanded
    Fault,
}

impl MotionStatus {
    /// Motion complete: the mount is either parked still or tracking.
    pub fn is_settled(&self) -> bool {
        matches!(self, MotionStatus::Idle | MotionStatus::Tracking)
    }
}

/// Snapshot of what the adapter knows about the mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountState {
    /// Last coordinate the mount was commanded to
    pub commanded: Option<SkyCoordinate>,
    /// Current motion status
    pub status: MotionStatus,
    /// Most recent error reported by the device or driver
    pub last_error: Option<String>,
}

impl Default for MountState {
    fn default() -> Self {
        Self {
            commanded: None,
            status: MotionStatus::Idle,
            last_error: None,
        }
    }
}

/// Error type for mount operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MountError {
    /// Device could not be reached or is not connected
    #[error("mount unreachable: {0}")]
    DeviceUnreachable(String),

    /// Device answered but refused the command
    #[error("mount rejected command: {0}")]
    CommandRejected(String),

    /// Motion did not complete within the allowed time
    #[error("motion did not complete within {timeout:?} (last status {status:?})")]
    MotionTimeout {
        timeout: Duration,
        status: MotionStatus,
    },

    /// Hardware reported a fault
    #[error("mount fault: {0}")]
    Fault(String),
}

impl MountError {
    /// Errors that make further motion commands unsafe.
    pub fn is_motion_error(&self) -> bool {
        matches!(self, MountError::MotionTimeout { .. } | MountError::Fault(_))
    }
}

/// Result type for mount operations
pub type MountResult<T> = Result<T, MountError>;

/// Mount state owned by an adapter.
///
/// Only the adapter mutates it; everyone else reads snapshots.
#[derive(Debug, Default)]
pub struct SharedMountState {
    inner: RwLock<MountState>,
}

impl SharedMountState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MountState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update<F: FnOnce(&mut MountState)>(&self, f: F) {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }

    pub fn set_status(&self, status: MotionStatus) {
        self.update(|state| state.status = status);
    }

    pub fn record_error(&self, error: &MountError) {
        let message = error.to_string();
        self.update(|state| {
            if matches!(error, MountError::Fault(_)) {
                state.status = MotionStatus::Fault;
            }
            state.last_error = Some(message);
        });
    }
}

/// Capability interface every mount adapter provides.
///
/// Implementations serialize their own commands: at most one command is
/// outstanding per device regardless of how many callers share the adapter.
#[async_trait]
pub trait MountInterface: Send + Sync {
    /// Get mount name/identifier
    fn name(&self) -> &str;

    /// Poll the hardware for the position it believes it is pointing at.
    async fn current_position(&self) -> MountResult<SkyCoordinate>;

    /// Start a slew to `target`. Returns once the motion is commanded.
    async fn slew_to(&self, target: SkyCoordinate) -> MountResult<()>;

    /// Tell the mount it is actually pointing at `actual`, without moving.
    async fn sync_to(&self, actual: SkyCoordinate) -> MountResult<()>;

    /// Wait until motion completes or `timeout` elapses.
    async fn wait_for_idle(&self, timeout: Duration) -> MountResult<MountState>;

    /// Current state snapshot
    fn state(&self) -> MountState;

    /// Stop any motion in progress, if the hardware supports it.
    async fn abort_slew(&self) -> MountResult<()> {
        Ok(())
    }
}

/// Poll a status source until the mount settles.
///
/// Calls `poll` every `interval` until it reports a settled status, returns
/// a fault, or `timeout` elapses.
///
/// # Returns
/// * `Ok(status)` - The settled status (`Idle` or `Tracking`)
/// * `Err(MountError::Fault)` - If the status source reports `Fault`
/// * `Err(MountError::MotionTimeout)` - If the deadline passes first
pub async fn poll_until_settled<F, Fut>(
    mut poll: F,
    interval: Duration,
    timeout: Duration,
) -> MountResult<MotionStatus>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MountResult<MotionStatus>>,
{
    let start = tokio::time::Instant::now();

    loop {
        let status = poll().await?;
        match status {
            MotionStatus::Fault => {
                return Err(MountError::Fault(
                    "hardware reported fault while waiting for motion".to_string(),
                ))
            }
            s if s.is_settled() => return Ok(s),
            _ => {}
        }

        if start.elapsed() >= timeout {
            return Err(MountError::MotionTimeout { timeout, status });
        }

        tokio::time::sleep(interval).await;
    }
}
