//! nova.astrometry.net web API client.
//!
//! A solve is a login (cached per client), a multipart upload carrying the
//! search window and scale bounds, polling the submission until a job
//! appears, polling the job until it finishes, and fetching the job's
//! calibration.

use async_trait::async_trait;
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use shared::camera_interface::PixelFrame;
use shared::image_io::encode_png;
use shared::plate_solver::{check_frame, PlateSolver, SolveFailure, SolveHint, SolveResult, Solution};
use shared::sky::{PixelScale, SkyCoordinate};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const NOVA_BASE_URL: &str = "https://nova.astrometry.net";

#[derive(Error, Debug)]
pub enum NovaError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("login failed: {0}")]
    Login(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("unexpected response: {0}")]
    Parse(String),
}

/// Settings for the web solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NovaConfig {
    pub base_url: String,
    pub api_key: String,
    /// Interval between submission/job status polls
    pub poll_interval: Duration,
    /// Time allowed from upload to a finished job
    pub job_timeout: Duration,
    /// Bound on each HTTP round trip
    pub request_timeout: Duration,
    /// Fractional tolerance around the frame's nominal plate scale
    pub scale_tolerance: f64,
}

impl Default for NovaConfig {
    fn default() -> Self {
        Self {
            base_url: NOVA_BASE_URL.to_string(),
            api_key: String::new(),
            poll_interval: Duration::from_secs(5),
            job_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(60),
            scale_tolerance: 0.2,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    status: String,
    session: Option<String>,
    #[serde(default)]
    errormessage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    status: String,
    subid: Option<u64>,
    #[serde(default)]
    errormessage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmissionResponse {
    #[serde(default)]
    jobs: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    status: Option<String>,
}

/// Calibration returned for a solved job.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Calibration {
    pub ra: f64,
    pub dec: f64,
    /// Arcseconds per pixel
    pub pixscale: f64,
    /// Degrees east of north
    pub orientation: f64,
    #[serde(default)]
    pub radius: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Processing,
    Success,
    Failure,
}

/// Plate solver backed by the nova.astrometry.net service.
#[derive(Debug)]
pub struct NovaClient {
    config: NovaConfig,
    http: reqwest::Client,
    session: Mutex<Option<String>>,
}

impl NovaClient {
    pub fn new(config: NovaConfig) -> Result<Self, NovaError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            config,
            http,
            session: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Log in and cache the session key.
    pub async fn login(&self) -> Result<String, NovaError> {
        let mut session = self.session.lock().await;
        if let Some(key) = session.as_ref() {
            return Ok(key.clone());
        }

        let request_json = serde_json::json!({ "apikey": self.config.api_key });
        let response: LoginResponse = self
            .http
            .post(self.url("/api/login"))
            .form(&[("request-json", request_json.to_string())])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| match e.status() {
                Some(status) if status.is_client_error() => NovaError::Login(e.to_string()),
                _ => NovaError::Http(e),
            })?
            .json()
            .await?;

        if response.status != "success" {
            return Err(NovaError::Login(
                response
                    .errormessage
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }
        let key = response
            .session
            .ok_or_else(|| NovaError::Login("no session key in response".to_string()))?;

        info!("Logged in to {}", self.config.base_url);
        *session = Some(key.clone());
        Ok(key)
    }

    /// Upload PNG bytes with an optional search window; returns the submission id.
    pub async fn upload(
        &self,
        png: Vec<u8>,
        hint: Option<&SolveHint>,
        scale: Option<PixelScale>,
    ) -> Result<u64, NovaError> {
        let session = self.login().await?;

        let mut request_json = serde_json::json!({
            "session": session,
            "publicly_visible": "n",
            "allow_modifications": "n",
            "allow_commercial_use": "n",
        });
        if let Some(hint) = hint {
            request_json["center_ra"] = hint.center.ra_deg().into();
            request_json["center_dec"] = hint.center.dec_deg().into();
            request_json["radius"] = hint.search_radius_deg.into();
        }
        if let Some(scale) = scale {
            let tol = self.config.scale_tolerance.clamp(0.0, 0.95);
            let nominal = scale.arcsec_per_pixel();
            request_json["scale_units"] = "arcsecperpix".into();
            request_json["scale_type"] = "ul".into();
            request_json["scale_lower"] = (nominal * (1.0 - tol)).into();
            request_json["scale_upper"] = (nominal * (1.0 + tol)).into();
        }

        let part = multipart::Part::bytes(png)
            .file_name("frame.png")
            .mime_str("application/octet-stream")?;
        let form = multipart::Form::new()
            .text("request-json", request_json.to_string())
            .part("file", part);

        let response: UploadResponse = self
            .http
            .post(self.url("/api/upload"))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.status != "success" {
            return Err(NovaError::Upload(
                response
                    .errormessage
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }
        let subid = response
            .subid
            .ok_or_else(|| NovaError::Parse("no submission id".to_string()))?;
        debug!("Uploaded frame, submission {subid}");
        Ok(subid)
    }

    async fn submission_jobs(&self, subid: u64) -> Result<Vec<u64>, NovaError> {
        let response: SubmissionResponse = self
            .http
            .get(self.url(&format!("/api/submissions/{subid}")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.jobs.into_iter().flatten().collect())
    }

    async fn job_status(&self, job_id: u64) -> Result<JobStatus, NovaError> {
        let response: JobResponse = self
            .http
            .get(self.url(&format!("/api/jobs/{job_id}")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(match response.status.as_deref() {
            Some("success") => JobStatus::Success,
            Some("failure") => JobStatus::Failure,
            _ => JobStatus::Processing,
        })
    }

    pub async fn calibration(&self, job_id: u64) -> Result<Calibration, NovaError> {
        Ok(self
            .http
            .get(self.url(&format!("/api/jobs/{job_id}/calibration/")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Drop the cached session key so the next solve logs in again.
    async fn forget_session(&self) {
        if self.session.lock().await.take().is_some() {
            debug!("Discarded nova session key");
        }
    }

    /// Map a client error onto the failure the correction loop acts on.
    ///
    /// Only rejected credentials and unusable configuration make the engine
    /// unavailable; anything the service may recover from stays retryable.
    fn failure(&self, err: NovaError) -> SolveFailure {
        match &err {
            NovaError::Http(e) if e.is_timeout() => SolveFailure::Timeout(self.config.request_timeout),
            NovaError::Http(e) if e.is_builder() => SolveFailure::EngineUnavailable(err.to_string()),
            NovaError::Login(_) => SolveFailure::EngineUnavailable(err.to_string()),
            NovaError::Http(_) | NovaError::Upload(_) | NovaError::Parse(_) => {
                SolveFailure::ServiceError(err.to_string())
            }
        }
    }

    /// Poll a submission until one of its jobs finishes.
    ///
    /// Returns the successful job id, `NoMatch` when every job failed, or
    /// `Timeout` once `job_timeout` has passed.
    async fn wait_for_job(&self, subid: u64) -> Result<u64, SolveFailure> {
        let start = Instant::now();

        loop {
            let jobs = self
                .submission_jobs(subid)
                .await
                .map_err(|e| self.failure(e))?;

            let mut failed = 0;
            for &job_id in &jobs {
                match self.job_status(job_id).await.map_err(|e| self.failure(e))? {
                    JobStatus::Success => return Ok(job_id),
                    JobStatus::Failure => {
                        warn!("Job {job_id} failed");
                        failed += 1;
                    }
                    JobStatus::Processing => debug!("Job {job_id} still processing"),
                }
            }
            if !jobs.is_empty() && failed == jobs.len() {
                return Err(SolveFailure::NoMatch);
            }

            if start.elapsed() >= self.config.job_timeout {
                return Err(SolveFailure::Timeout(self.config.job_timeout));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn run(&self, frame: &PixelFrame, hint: Option<&SolveHint>) -> Result<Solution, SolveFailure> {
        check_frame(frame)?;
        let owned = frame.clone();
        let png = tokio::task::spawn_blocking(move || encode_png(&owned))
            .await
            .map_err(|e| SolveFailure::ServiceError(format!("encoding frame: {e}")))?
            .map_err(|e| SolveFailure::InvalidFrame(e.to_string()))?;

        let start = Instant::now();
        let subid = match self.upload(png, hint, frame.pixel_scale()).await {
            Ok(subid) => subid,
            Err(e) => {
                // An expired session looks like a rejected upload.
                self.forget_session().await;
                return Err(self.failure(e));
            }
        };
        let job_id = self.wait_for_job(subid).await?;
        let calibration = self.calibration(job_id).await.map_err(|e| self.failure(e))?;

        let center = SkyCoordinate::new(calibration.ra, calibration.dec)
            .map_err(|e| SolveFailure::EngineUnavailable(format!("bad calibration: {e}")))?;
        Ok(Solution {
            center,
            pixel_scale: PixelScale::from_arcsec_per_pixel(calibration.pixscale),
            rotation_deg: calibration.orientation,
            solve_time: start.elapsed(),
        })
    }
}

#[async_trait]
impl PlateSolver for NovaClient {
    fn name(&self) -> &str {
        "nova.astrometry.net"
    }

    async fn solve(&self, frame: &PixelFrame, hint: Option<&SolveHint>) -> SolveResult {
        match self.run(frame, hint).await {
            Ok(solution) => {
                info!(
                    "Solved online: {} in {:.1}s",
                    solution.center,
                    solution.solve_time.as_secs_f64()
                );
                SolveResult::Solved(solution)
            }
            Err(failure) => {
                info!("Online solve failed: {failure}");
                SolveResult::Failed(failure)
            }
        }
    }
}
