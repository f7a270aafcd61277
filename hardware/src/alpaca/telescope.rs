//! Alpaca telescope (mount) binding.
//!
//! Right ascension travels on the wire in hours, declination in degrees.
//! Equatorial slews use the asynchronous `slewtocoordinatesasync` method and
//! completion is observed by polling `slewing`.

use super::client::{bool_param, AlpacaClient, AlpacaDevice, AlpacaError, DeviceType};
use async_trait::async_trait;
use shared::device_lock::DeviceLock;
use shared::mount_interface::{
    poll_until_settled, MotionStatus, MountError, MountInterface, MountResult, MountState,
    SharedMountState,
};
use shared::sky::{Epoch, SkyCoordinate};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default interval between `slewing` polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// ASCOM `EquatorialCoordinateType` value for J2000.
const EQU_J2000: i32 = 2;

/// Classify a driver error for the mount interface.
fn mount_error(err: AlpacaError) -> MountError {
    if err.is_transport() || err.is_not_connected() {
        MountError::DeviceUnreachable(err.to_string())
    } else {
        MountError::CommandRejected(err.to_string())
    }
}

/// Mount driven through an Alpaca `telescope` device.
pub struct AlpacaTelescope {
    device: AlpacaDevice,
    name: String,
    epoch: Epoch,
    lock: DeviceLock,
    state: SharedMountState,
    poll_interval: Duration,
}

impl AlpacaTelescope {
    /// Connect to telescope `device_number` on the server behind `client`.
    ///
    /// Sets `Connected`, reads the driver name and the equatorial system the
    /// driver works in. Coordinates handed to the mount are tagged with that
    /// system; no precession is applied.
    pub async fn connect(client: &AlpacaClient, device_number: u32) -> Result<Self, AlpacaError> {
        let device = client.device(DeviceType::Telescope, device_number);
        device.set_connected(true).await?;

        let name = device
            .name()
            .await
            .unwrap_or_else(|_| format!("Alpaca telescope {device_number}"));

        let epoch = match device.get::<i32>("equatorialsystem").await {
            Ok(EQU_J2000) => Epoch::J2000,
            Ok(_) => Epoch::JNow,
            Err(e) => {
                warn!("{name}: cannot read equatorial system ({e}), assuming JNow");
                Epoch::JNow
            }
        };

        info!(
            "Connected to telescope '{}' at {} ({})",
            name,
            client.base_url(),
            epoch
        );

        Ok(Self {
            device,
            name,
            epoch,
            lock: DeviceLock::new(format!("telescope {device_number}")),
            state: SharedMountState::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Equatorial system the driver reports coordinates in.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub async fn disconnect(&self) -> Result<(), AlpacaError> {
        let _guard = self.lock.acquire().await;
        self.device.set_connected(false).await?;
        info!("Disconnected from telescope '{}'", self.name);
        Ok(())
    }

    pub async fn set_tracking(&self, tracking: bool) -> MountResult<()> {
        let _guard = self.lock.acquire().await;
        self.put_tracking(tracking).await
    }

    /// Start a slew to horizon coordinates. Tracking is switched off first,
    /// as drivers refuse alt/az slews while tracking.
    pub async fn slew_to_altaz(&self, altitude_deg: f64, azimuth_deg: f64) -> MountResult<()> {
        if !(-90.0..=90.0).contains(&altitude_deg) || !azimuth_deg.is_finite() {
            return Err(MountError::CommandRejected(format!(
                "invalid alt/az ({altitude_deg}, {azimuth_deg})"
            )));
        }

        let _guard = self.lock.acquire().await;
        self.put_tracking(false).await?;

        info!(
            "{}: slewing to Alt {:.3}° Az {:.3}°",
            self.name, altitude_deg, azimuth_deg
        );
        self.device
            .put(
                "slewtoaltazasync",
                &[
                    ("Azimuth", azimuth_deg.rem_euclid(360.0).to_string()),
                    ("Altitude", altitude_deg.to_string()),
                ],
            )
            .await
            .map_err(|e| self.fail(e))?;

        self.state.update(|state| {
            state.commanded = None;
            state.status = MotionStatus::Slewing;
        });
        Ok(())
    }

    async fn put_tracking(&self, tracking: bool) -> MountResult<()> {
        self.device
            .put("tracking", &[("Tracking", bool_param(tracking))])
            .await
            .map_err(|e| self.fail(e))
    }

    fn fail(&self, err: AlpacaError) -> MountError {
        let err = mount_error(err);
        self.state.record_error(&err);
        err
    }

    fn wire_params(&self, coord: &SkyCoordinate) -> [(&'static str, String); 2] {
        if coord.epoch() != self.epoch {
            debug!(
                "{}: coordinate tagged {} sent to {} mount unchanged",
                self.name,
                coord.epoch(),
                self.epoch
            );
        }
        [
            ("RightAscension", coord.ra_hours().to_string()),
            ("Declination", coord.dec_deg().to_string()),
        ]
    }

    async fn poll_status(&self) -> MountResult<MotionStatus> {
        let slewing: bool = self.device.get("slewing").await.map_err(|e| {
            if e.is_transport() || e.is_not_connected() {
                MountError::DeviceUnreachable(e.to_string())
            } else {
                MountError::Fault(e.to_string())
            }
        })?;

        let status = if slewing {
            MotionStatus::Slewing
        } else {
            match self.device.get::<bool>("tracking").await {
                Ok(true) => MotionStatus::Tracking,
                Ok(false) => MotionStatus::Idle,
                Err(e) => {
                    debug!("{}: tracking state unavailable ({e})", self.name);
                    MotionStatus::Idle
                }
            }
        };
        self.state.set_status(status);
        Ok(status)
    }
}

#[async_trait]
impl MountInterface for AlpacaTelescope {
    fn name(&self) -> &str {
        &self.name
    }

    async fn current_position(&self) -> MountResult<SkyCoordinate> {
        let _guard = self.lock.acquire().await;

        let ra_hours: f64 = self
            .device
            .get("rightascension")
            .await
            .map_err(|e| self.fail(e))?;
        let dec_deg: f64 = self
            .device
            .get("declination")
            .await
            .map_err(|e| self.fail(e))?;

        SkyCoordinate::from_hours(ra_hours, dec_deg, self.epoch).map_err(|e| {
            let err = MountError::CommandRejected(format!("driver reported {e}"));
            self.state.record_error(&err);
            err
        })
    }

    async fn slew_to(&self, target: SkyCoordinate) -> MountResult<()> {
        let _guard = self.lock.acquire().await;

        match self.device.get::<bool>("tracking").await {
            Ok(true) => {}
            Ok(false) => self.put_tracking(true).await?,
            Err(e) => return Err(self.fail(e)),
        }

        info!("{}: slewing to {}", self.name, target);
        self.device
            .put("slewtocoordinatesasync", &self.wire_params(&target))
            .await
            .map_err(|e| self.fail(e))?;

        self.state.update(|state| {
            state.commanded = Some(target);
            state.status = MotionStatus::Slewing;
            state.last_error = None;
        });
        Ok(())
    }

    async fn sync_to(&self, actual: SkyCoordinate) -> MountResult<()> {
        let _guard = self.lock.acquire().await;

        info!("{}: syncing to {}", self.name, actual);
        self.device
            .put("synctocoordinates", &self.wire_params(&actual))
            .await
            .map_err(|e| self.fail(e))
    }

    async fn wait_for_idle(&self, timeout: Duration) -> MountResult<MountState> {
        let _guard = self.lock.acquire().await;

        match poll_until_settled(|| self.poll_status(), self.poll_interval, timeout).await {
            Ok(status) => {
                debug!("{}: motion complete ({:?})", self.name, status);
                Ok(self.state.snapshot())
            }
            Err(err) => {
                warn!("{}: {}", self.name, err);
                self.state.record_error(&err);
                Err(err)
            }
        }
    }

    fn state(&self) -> MountState {
        self.state.snapshot()
    }

    async fn abort_slew(&self) -> MountResult<()> {
        // Bypasses the device lock so it can interrupt a motion wait.
        warn!("{}: aborting slew", self.name);
        self.device
            .put("abortslew", &[])
            .await
            .map_err(|e| self.fail(e))?;
        self.state.set_status(MotionStatus::Idle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alpaca::client::DEFAULT_REQUEST_TIMEOUT;
    use mockito::{Matcher, Mock, Server, ServerGuard};

    const EMPTY_OK: &str = r#"{"ErrorNumber":0,"ErrorMessage":""}"#;

    fn value_body(value: &str) -> String {
        format!(r#"{{"Value":{value},"ErrorNumber":0,"ErrorMessage":""}}"#)
    }

    async fn mock_get(server: &mut ServerGuard, method: &str, value: &str) -> Mock {
        server
            .mock("GET", format!("/api/v1/telescope/0/{method}").as_str())
            .match_query(Matcher::Any)
            .with_body(value_body(value))
            .create_async()
            .await
    }

    async fn mock_put(server: &mut ServerGuard, method: &str) -> Mock {
        server
            .mock("PUT", format!("/api/v1/telescope/0/{method}").as_str())
            .with_body(EMPTY_OK)
            .create_async()
            .await
    }

    async fn connected_telescope(server: &mut ServerGuard) -> AlpacaTelescope {
        mock_put(server, "connected").await;
        mock_get(server, "name", r#""Test Mount""#).await;
        mock_get(server, "equatorialsystem", "2").await;
        let client = AlpacaClient::new(&server.url(), DEFAULT_REQUEST_TIMEOUT).unwrap();
        AlpacaTelescope::connect(&client, 0)
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_connect_reads_name_and_epoch() {
        let mut server = Server::new_async().await;
        let telescope = connected_telescope(&mut server).await;
        assert_eq!(telescope.name(), "Test Mount");
        assert_eq!(telescope.epoch(), Epoch::J2000);
    }

    #[tokio::test]
    async fn test_current_position_converts_hours() {
        let mut server = Server::new_async().await;
        let telescope = connected_telescope(&mut server).await;
        mock_get(&mut server, "rightascension", "2.0").await;
        mock_get(&mut server, "declination", "-15.5").await;

        let position = telescope.current_position().await.unwrap();
        assert!((position.ra_deg() - 30.0).abs() < 1e-9);
        assert_eq!(position.dec_deg(), -15.5);
        assert_eq!(position.epoch(), Epoch::J2000);
    }

    #[tokio::test]
    async fn test_slew_sends_hours_and_degrees() {
        let mut server = Server::new_async().await;
        let telescope = connected_telescope(&mut server).await;
        mock_get(&mut server, "tracking", "true").await;
        let slew = server
            .mock("PUT", "/api/v1/telescope/0/slewtocoordinatesasync")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("RightAscension".into(), "6".into()),
                Matcher::UrlEncoded("Declination".into(), "45".into()),
            ]))
            .with_body(EMPTY_OK)
            .create_async()
            .await;

        let target = SkyCoordinate::new(90.0, 45.0).unwrap();
        telescope.slew_to(target).await.unwrap();
        slew.assert_async().await;

        let state = telescope.state();
        assert_eq!(state.commanded, Some(target));
        assert_eq!(state.status, MotionStatus::Slewing);
    }

    #[tokio::test]
    async fn test_rejected_slew_is_command_rejected() {
        let mut server = Server::new_async().await;
        let telescope = connected_telescope(&mut server).await;
        mock_get(&mut server, "tracking", "true").await;
        server
            .mock("PUT", "/api/v1/telescope/0/slewtocoordinatesasync")
            .with_body(r#"{"ErrorNumber":1035,"ErrorMessage":"Target below horizon"}"#)
            .create_async()
            .await;

        let result = telescope
            .slew_to(SkyCoordinate::new(10.0, -80.0).unwrap())
            .await;
        assert!(matches!(result, Err(MountError::CommandRejected(_))));
        assert!(telescope
            .state()
            .last_error
            .unwrap()
            .contains("below horizon"));
    }

    #[tokio::test]
    async fn test_wait_for_idle_reports_tracking() {
        let mut server = Server::new_async().await;
        let telescope = connected_telescope(&mut server).await;
        mock_get(&mut server, "slewing", "false").await;
        mock_get(&mut server, "tracking", "true").await;

        let state = telescope
            .wait_for_idle(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(state.status, MotionStatus::Tracking);
    }

    #[tokio::test]
    async fn test_wait_for_idle_times_out_while_slewing() {
        let mut server = Server::new_async().await;
        let telescope = connected_telescope(&mut server).await;
        mock_get(&mut server, "slewing", "true").await;

        let result = telescope.wait_for_idle(Duration::from_millis(100)).await;
        assert!(matches!(
            result,
            Err(MountError::MotionTimeout {
                status: MotionStatus::Slewing,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_driver_error_during_wait_is_fault() {
        let mut server = Server::new_async().await;
        let telescope = connected_telescope(&mut server).await;
        server
            .mock("GET", "/api/v1/telescope/0/slewing")
            .match_query(Matcher::Any)
            .with_body(r#"{"Value":false,"ErrorNumber":1280,"ErrorMessage":"Motor stall"}"#)
            .create_async()
            .await;

        let result = telescope.wait_for_idle(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(MountError::Fault(_))));
    }

    #[tokio::test]
    async fn test_not_connected_is_unreachable() {
        let mut server = Server::new_async().await;
        let telescope = connected_telescope(&mut server).await;
        server
            .mock("GET", "/api/v1/telescope/0/rightascension")
            .match_query(Matcher::Any)
            .with_body(r#"{"Value":0.0,"ErrorNumber":1031,"ErrorMessage":"Not connected"}"#)
            .create_async()
            .await;

        assert!(matches!(
            telescope.current_position().await,
            Err(MountError::DeviceUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_altaz_slew_disables_tracking() {
        let mut server = Server::new_async().await;
        let telescope = connected_telescope(&mut server).await;
        let tracking = server
            .mock("PUT", "/api/v1/telescope/0/tracking")
            .match_body(Matcher::UrlEncoded("Tracking".into(), "False".into()))
            .with_body(EMPTY_OK)
            .create_async()
            .await;
        let slew = server
            .mock("PUT", "/api/v1/telescope/0/slewtoaltazasync")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("Altitude".into(), "45".into()),
                Matcher::UrlEncoded("Azimuth".into(), "180".into()),
            ]))
            .with_body(EMPTY_OK)
            .create_async()
            .await;

        telescope.slew_to_altaz(45.0, 180.0).await.unwrap();
        tracking.assert_async().await;
        slew.assert_async().await;

        assert!(telescope.slew_to_altaz(120.0, 0.0).await.is_err());
    }
}
