//! Closed-loop pointing correction.
//!
//! Each attempt captures a frame, plate-solves it, compares the solved
//! center with the target and, if the error is above tolerance, syncs the
//! mount to where it really points and slews back to the target. The loop
//! stops when the error is within tolerance, when the attempt budget is
//! spent, on an unrecoverable device failure, or on cancellation.
//!
//! ```text
//! Idle -> Capturing -> Solving -> Evaluating -> Correcting -> Capturing ...
//!             |           |            |             |
//!             +-----------+--> Retrying (backoff) ---+--> Capturing
//!                                      |
//!                                      +--> Converged
//! any state --> Aborted
//! ```

pub mod callback;
pub mod config;
mod convergence;
pub mod error;
pub mod runner;
pub mod session;
pub mod state;

pub use callback::{CallbackId, CallbackRegistry, RunCallback, RunEvent};
pub use config::{CorrectionConfig, RunRequest};
pub use error::ConfigurationError;
pub use runner::RunHandle;
pub use session::{AttemptOutcome, AttemptRecord, Correction, FrameInfo, Session, SessionReport};
pub use state::{AbortReason, LoopState, RunOutcome, StepFailure};

use convergence::Convergence;
use shared::camera_interface::CameraInterface;
use shared::mount_interface::MountInterface;
use shared::plate_solver::PlateSolver;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Pointing corrector bound to one camera, mount and solver.
///
/// Cloning is cheap and clones share devices and callbacks.
#[derive(Clone)]
pub struct PointingCorrector {
    camera: Arc<dyn CameraInterface>,
    mount: Arc<dyn MountInterface>,
    solver: Arc<dyn PlateSolver>,
    config: CorrectionConfig,
    callbacks: CallbackRegistry,
}

impl PointingCorrector {
    /// Create a corrector. Fails if `config` is invalid.
    pub fn new(
        camera: Arc<dyn CameraInterface>,
        mount: Arc<dyn MountInterface>,
        solver: Arc<dyn PlateSolver>,
        config: CorrectionConfig,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            camera,
            mount,
            solver,
            config,
            callbacks: CallbackRegistry::new(),
        })
    }

    pub fn config(&self) -> &CorrectionConfig {
        &self.config
    }

    /// Register a callback for run events
    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&RunEvent) + Send + Sync + 'static,
    {
        self.callbacks.register(callback)
    }

    /// Deregister a callback
    pub fn deregister_callback(&self, callback_id: CallbackId) -> bool {
        self.callbacks.deregister(callback_id)
    }

    /// Get the number of registered callbacks
    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Run to completion on the current task.
    ///
    /// Configuration problems are reported before any device is used.
    pub async fn run(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, ConfigurationError> {
        let session = Session::new(request.target);
        self.run_with_session(request, cancel, &session).await
    }

    /// Like [`PointingCorrector::run`], recording into a caller-owned session.
    pub async fn run_with_session(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
        session: &Session,
    ) -> Result<RunOutcome, ConfigurationError> {
        request.validate()?;
        let exposure = request.exposure_request()?;

        let convergence = Convergence {
            camera: self.camera.as_ref(),
            mount: self.mount.as_ref(),
            solver: self.solver.as_ref(),
            config: &self.config,
            callbacks: &self.callbacks,
            session,
            cancel,
        };
        Ok(convergence.run(request, &exposure).await)
    }

    /// Start a run on a background tokio task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, request: RunRequest) -> Result<RunHandle, ConfigurationError> {
        request.validate()?;

        let cancel = CancellationToken::new();
        let session = Arc::new(Session::new(request.target));
        let corrector = self.clone();
        let task_cancel = cancel.clone();
        let task_session = session.clone();

        let task = tokio::spawn(async move {
            let result = corrector
                .run_with_session(&request, &task_cancel, &task_session)
                .await;
            match result {
                Ok(outcome) => outcome,
                // validated above
                Err(e) => RunOutcome::Aborted {
                    reason: AbortReason::WorkerFailed(e.to_string()),
                    attempts_taken: 0,
                },
            }
        });

        Ok(RunHandle::new(cancel, session, self.callbacks.clone(), task))
    }
}
