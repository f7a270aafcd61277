use super::{
    poll_until_settled, MotionStatus, MountError, MountInterface, MountResult, MountState,
    SharedMountState,
};
use crate::device_lock::DeviceLock;
use crate::sky::SkyCoordinate;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Command received by a [`MockMount`], in arrival order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MountCommand {
    SlewTo(SkyCoordinate),
    SyncTo(SkyCoordinate),
    AbortSlew,
}

/// In-memory mount that records every command.
///
/// The reported position follows the last slew target or sync coordinate.
/// Slews settle into `Tracking` after `settle_time`.
pub struct MockMount {
    lock: DeviceLock,
    state: SharedMountState,
    position: Mutex<SkyCoordinate>,
    settle_time: Duration,
    slew_started: Mutex<Option<Instant>>,
    commands: Mutex<Vec<MountCommand>>,
    unreachable: AtomicBool,
    fault_on_wait: AtomicBool,
    never_settles: AtomicBool,
    reject_next: Mutex<Option<String>>,
}

impl MockMount {
    pub fn new(position: SkyCoordinate) -> Self {
        Self {
            lock: DeviceLock::new("MockMount"),
            state: SharedMountState::new(),
            position: Mutex::new(position),
            settle_time: Duration::ZERO,
            slew_started: Mutex::new(None),
            commands: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
            fault_on_wait: AtomicBool::new(false),
            never_settles: AtomicBool::new(false),
            reject_next: Mutex::new(None),
        }
    }

    /// Time between a slew command and the mount reporting `Tracking`.
    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Report `Fault` on the next motion wait.
    pub fn set_fault_on_wait(&self, fault: bool) {
        self.fault_on_wait.store(fault, Ordering::SeqCst);
    }

    /// Keep reporting `Slewing` forever so waits time out.
    pub fn set_never_settles(&self, never: bool) {
        self.never_settles.store(never, Ordering::SeqCst);
    }

    /// Reject the next slew or sync with the given driver message.
    pub fn reject_next_command(&self, message: impl Into<String>) {
        *self.reject_next.lock().unwrap() = Some(message.into());
    }

    pub fn commands(&self) -> Vec<MountCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn slew_targets(&self) -> Vec<SkyCoordinate> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                MountCommand::SlewTo(target) => Some(target),
                _ => None,
            })
            .collect()
    }

    pub fn sync_positions(&self) -> Vec<SkyCoordinate> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                MountCommand::SyncTo(actual) => Some(actual),
                _ => None,
            })
            .collect()
    }

    fn check_reachable(&self) -> MountResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            let err = MountError::DeviceUnreachable("mock mount offline".to_string());
            self.state.record_error(&err);
            return Err(err);
        }
        Ok(())
    }

    fn take_rejection(&self) -> MountResult<()> {
        if let Some(message) = self.reject_next.lock().unwrap().take() {
            let err = MountError::CommandRejected(message);
            self.state.record_error(&err);
            return Err(err);
        }
        Ok(())
    }

    fn poll_status(&self) -> MotionStatus {
        if self.fault_on_wait.load(Ordering::SeqCst) {
            return MotionStatus::Fault;
        }
        let current = self.state.snapshot().status;
        if current != MotionStatus::Slewing || self.never_settles.load(Ordering::SeqCst) {
            return current;
        }
        let settled = self
            .slew_started
            .lock()
            .unwrap()
            .map_or(true, |start| start.elapsed() >= self.settle_time);
        if settled {
            self.state.set_status(MotionStatus::Tracking);
            MotionStatus::Tracking
        } else {
            MotionStatus::Slewing
        }
    }
}

#[async_trait]
impl MountInterface for MockMount {
    fn name(&self) -> &str {
        "MockMount"
    }

    async fn current_position(&self) -> MountResult<SkyCoordinate> {
        let _guard = self.lock.acquire().await;
        self.check_reachable()?;
        Ok(*self.position.lock().unwrap())
    }

    async fn slew_to(&self, target: SkyCoordinate) -> MountResult<()> {
        let _guard = self.lock.acquire().await;
        self.check_reachable()?;
        self.take_rejection()?;

        self.commands.lock().unwrap().push(MountCommand::SlewTo(target));
        *self.position.lock().unwrap() = target;
        *self.slew_started.lock().unwrap() = Some(Instant::now());
        self.state.update(|state| {
            state.commanded = Some(target);
            state.status = MotionStatus::Slewing;
        });
        Ok(())
    }

    async fn sync_to(&self, actual: SkyCoordinate) -> MountResult<()> {
        let _guard = self.lock.acquire().await;
        self.check_reachable()?;
        self.take_rejection()?;

        self.commands.lock().unwrap().push(MountCommand::SyncTo(actual));
        *self.position.lock().unwrap() = actual;
        Ok(())
    }

    async fn wait_for_idle(&self, timeout: Duration) -> MountResult<MountState> {
        let _guard = self.lock.acquire().await;
        self.check_reachable()?;

        let result = poll_until_settled(
            || async { Ok(self.poll_status()) },
            POLL_INTERVAL,
            timeout,
        )
        .await;

        match result {
            Ok(_) => Ok(self.state.snapshot()),
            Err(err) => {
                self.state.record_error(&err);
                Err(err)
            }
        }
    }

    fn state(&self) -> MountState {
        self.state.snapshot()
    }

    async fn abort_slew(&self) -> MountResult<()> {
        let _guard = self.lock.acquire().await;
        self.commands.lock().unwrap().push(MountCommand::AbortSlew);
        self.state.set_status(MotionStatus::Idle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(ra: f64, dec: f64) -> SkyCoordinate {
        SkyCoordinate::new(ra, dec).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_slew_settles_after_settle_time() {
        let mount = MockMount::new(coord(0.0, 0.0)).with_settle_time(Duration::from_secs(3));
        mount.slew_to(coord(10.0, 20.0)).await.unwrap();
        assert_eq!(mount.state().status, MotionStatus::Slewing);

        let state = mount.wait_for_idle(Duration::from_secs(10)).await.unwrap();
        assert_eq!(state.status, MotionStatus::Tracking);
        assert_eq!(state.commanded, Some(coord(10.0, 20.0)));
        assert_eq!(mount.current_position().await.unwrap(), coord(10.0, 20.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_when_mount_never_settles() {
        let mount = MockMount::new(coord(0.0, 0.0));
        mount.set_never_settles(true);
        mount.slew_to(coord(5.0, 5.0)).await.unwrap();

        let result = mount.wait_for_idle(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(MountError::MotionTimeout { .. })));
        assert!(mount.state().last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_is_reported() {
        let mount = MockMount::new(coord(0.0, 0.0));
        mount.set_fault_on_wait(true);
        mount.slew_to(coord(5.0, 5.0)).await.unwrap();

        let result = mount.wait_for_idle(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(MountError::Fault(_))));
        assert_eq!(mount.state().status, MotionStatus::Fault);
    }

    #[tokio::test]
    async fn test_commands_are_recorded_in_order() {
        let mount = MockMount::new(coord(0.0, 0.0));
        mount.sync_to(coord(1.0, 1.0)).await.unwrap();
        mount.slew_to(coord(2.0, 2.0)).await.unwrap();
        mount.abort_slew().await.unwrap();

        assert_eq!(
            mount.commands(),
            vec![
                MountCommand::SyncTo(coord(1.0, 1.0)),
                MountCommand::SlewTo(coord(2.0, 2.0)),
                MountCommand::AbortSlew,
            ]
        );
        assert_eq!(mount.state().status, MotionStatus::Idle);
    }

    #[tokio::test]
    async fn test_unreachable_and_rejected() {
        let mount = MockMount::new(coord(0.0, 0.0));
        mount.set_unreachable(true);
        assert!(matches!(
            mount.current_position().await,
            Err(MountError::DeviceUnreachable(_))
        ));

        mount.set_unreachable(false);
        mount.reject_next_command("below horizon");
        assert!(matches!(
            mount.slew_to(coord(3.0, -80.0)).await,
            Err(MountError::CommandRejected(_))
        ));
        assert!(mount.slew_to(coord(3.0, 10.0)).await.is_ok());
        assert_eq!(mount.slew_targets(), vec![coord(3.0, 10.0)]);
    }
}
