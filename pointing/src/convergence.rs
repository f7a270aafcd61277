//! One run of the capture / solve / evaluate / correct loop.

use crate::callback::{CallbackRegistry, RunEvent};
use crate::config::{CorrectionConfig, RunRequest};
use crate::session::{AttemptOutcome, AttemptRecord, Correction, FrameInfo, Session};
use crate::state::{AbortReason, LoopState, RunOutcome, StepFailure};
use shared::camera_interface::{CameraError, CameraInterface, ExposureRequest, PixelFrame, Timestamp};
use shared::mount_interface::{MountError, MountInterface};
use shared::plate_solver::{PlateSolver, SolveFailure, SolveHint, SolveResult, Solution};
use shared::sky::{PointingError, SkyCoordinate};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How one iteration ended.
enum Step {
    Converged(PointingError),
    Corrected(PointingError),
    Retry(StepFailure),
    Abort(AbortReason),
    Cancelled,
}

/// Fields of an [`AttemptRecord`] filled in as the iteration progresses.
struct AttemptDraft {
    sequence: u32,
    started_at: Timestamp,
    started: Instant,
    frame: Option<FrameInfo>,
    hint: Option<SolveHint>,
    solve: Option<SolveResult>,
    error: Option<PointingError>,
    correction: Option<Correction>,
}

impl AttemptDraft {
    fn new(sequence: u32) -> Self {
        Self {
            sequence,
            started_at: Timestamp::now(),
            started: Instant::now(),
            frame: None,
            hint: None,
            solve: None,
            error: None,
            correction: None,
        }
    }

    fn finish(self, outcome: AttemptOutcome) -> AttemptRecord {
        AttemptRecord {
            sequence: self.sequence,
            started_at: self.started_at,
            duration: self.started.elapsed(),
            frame: self.frame,
            hint: self.hint,
            solve: self.solve,
            error: self.error,
            correction: self.correction,
            outcome,
        }
    }
}

/// Per-run loop variables carried between iterations.
struct LoopMemory {
    /// Where the mount was last told to point, used as the next solve hint
    last_commanded: Option<SkyCoordinate>,
    search_radius_deg: f64,
}

pub(crate) struct Convergence<'a> {
    pub camera: &'a dyn CameraInterface,
    pub mount: &'a dyn MountInterface,
    pub solver: &'a dyn PlateSolver,
    pub config: &'a CorrectionConfig,
    pub callbacks: &'a CallbackRegistry,
    pub session: &'a Session,
    pub cancel: &'a CancellationToken,
}

impl Convergence<'_> {
    /// Drive the loop to an outcome. `request` must already be validated.
    pub async fn run(&self, request: &RunRequest, exposure: &ExposureRequest) -> RunOutcome {
        log::info!(
            "Starting pointing correction to {} (tolerance {:.4}°, up to {} attempts)",
            request.target,
            request.tolerance_deg,
            request.max_attempts
        );

        let mut memory = LoopMemory {
            last_commanded: None,
            search_radius_deg: self.config.search_radius_deg,
        };
        let mut last_failure = None;

        for attempt in 1..=request.max_attempts {
            let mut draft = AttemptDraft::new(attempt);
            let step = self
                .iterate(attempt, request, exposure, &mut memory, &mut draft)
                .await;

            match step {
                Step::Converged(final_error) => {
                    self.record(draft.finish(AttemptOutcome::Converged));
                    return self.finish(RunOutcome::Converged {
                        attempts: attempt,
                        final_error,
                    });
                }
                Step::Corrected(error) => {
                    self.record(draft.finish(AttemptOutcome::Corrected));
                    last_failure = Some(StepFailure::OutOfTolerance {
                        error_deg: error.magnitude_deg,
                    });
                }
                Step::Retry(failure) => {
                    log::warn!("Attempt {attempt} failed: {failure}");
                    self.record(draft.finish(AttemptOutcome::Failed(failure.clone())));
                    last_failure = Some(failure);

                    if attempt < request.max_attempts && !self.backoff(attempt).await {
                        return self.cancelled(attempt);
                    }
                }
                Step::Abort(reason) => {
                    log::error!("Attempt {attempt} aborted the run: {reason}");
                    self.record(draft.finish(AttemptOutcome::Aborted(reason.clone())));
                    return self.finish(RunOutcome::Aborted {
                        reason,
                        attempts_taken: attempt,
                    });
                }
                Step::Cancelled => {
                    self.record(draft.finish(AttemptOutcome::Aborted(AbortReason::Cancelled)));
                    return self.cancelled(attempt);
                }
            }
        }

        self.finish(RunOutcome::Aborted {
            reason: AbortReason::MaxAttemptsExceeded { last_failure },
            attempts_taken: request.max_attempts,
        })
    }

    async fn iterate(
        &self,
        attempt: u32,
        request: &RunRequest,
        exposure: &ExposureRequest,
        memory: &mut LoopMemory,
        draft: &mut AttemptDraft,
    ) -> Step {
        // Capturing
        self.transition(LoopState::Capturing { attempt });
        let frame = match self.capture(exposure).await {
            Ok(frame) => frame,
            Err(step) => return step,
        };
        draft.frame = Some(FrameInfo::from(frame.as_ref()));
        self.callbacks.emit(&RunEvent::FrameCaptured {
            attempt,
            frame: frame.clone(),
        });

        // Solving
        self.transition(LoopState::Solving { attempt });
        let hint = if attempt > 1 || self.config.hint_first_attempt {
            match self.hint_center(request, memory).await {
                Some(center) => Some(SolveHint::new(center, memory.search_radius_deg)),
                None => return Step::Cancelled,
            }
        } else {
            None
        };
        draft.hint = hint;

        let result = match self.solve(&frame, hint.as_ref()).await {
            Some(result) => result,
            None => return Step::Cancelled,
        };
        draft.solve = Some(result.clone());
        let solution = match self.accept_solution(result, memory) {
            Ok(solution) => solution,
            Err(step) => return step,
        };

        // Evaluating
        self.transition(LoopState::Evaluating { attempt });
        let error = PointingError::between(&request.target, &solution.center);
        draft.error = Some(error);
        log::info!(
            "Attempt {attempt}: solved {} in {:.1}s, error {}",
            solution.center,
            solution.solve_time.as_secs_f64(),
            error
        );
        if error.within(request.tolerance_deg) {
            return Step::Converged(error);
        }

        // Correcting
        self.transition(LoopState::Correcting { attempt });
        match self.correct(&solution, request.target, memory, draft).await {
            Ok(()) => Step::Corrected(error),
            Err(step) => step,
        }
    }

    async fn capture(&self, exposure: &ExposureRequest) -> Result<Arc<PixelFrame>, Step> {
        let timeout = self.config.capture_timeout();
        let started = AtomicBool::new(false);
        let capture = async {
            started.store(true, Ordering::SeqCst);
            tokio::time::timeout(timeout, self.camera.capture(exposure)).await
        };

        let error = match self.cancellable(capture).await {
            None => {
                if started.load(Ordering::SeqCst) {
                    self.abort_exposure("cancellation").await;
                }
                return Err(Step::Cancelled);
            }
            Some(Ok(Ok(frame))) => return Ok(Arc::new(frame)),
            Some(Ok(Err(e))) => e,
            Some(Err(_elapsed)) => {
                self.abort_exposure("capture timeout").await;
                CameraError::CaptureTimeout(timeout)
            }
        };

        if error.is_retryable() {
            Err(Step::Retry(StepFailure::Capture(error.to_string())))
        } else {
            Err(Step::Abort(AbortReason::CaptureFailure(error.to_string())))
        }
    }

    /// Center of the next hinted solve, or `None` when cancelled.
    async fn hint_center(&self, request: &RunRequest, memory: &mut LoopMemory) -> Option<SkyCoordinate> {
        if let Some(commanded) = memory.last_commanded {
            return Some(commanded);
        }

        let center = match self.cancellable(self.mount.current_position()).await? {
            Ok(position) => position,
            Err(e) => {
                log::warn!("Cannot read mount position for solve hint ({e}), using target");
                request.target
            }
        };
        memory.last_commanded = Some(center);
        Some(center)
    }

    /// Solve under the solve timeout, or `None` when cancelled.
    async fn solve(&self, frame: &PixelFrame, hint: Option<&SolveHint>) -> Option<SolveResult> {
        let timeout = self.config.solve_timeout();
        match self
            .cancellable(tokio::time::timeout(timeout, self.solver.solve(frame, hint)))
            .await?
        {
            Ok(result) => Some(result),
            Err(_elapsed) => Some(SolveResult::Failed(SolveFailure::Timeout(timeout))),
        }
    }

    fn accept_solution(&self, result: SolveResult, memory: &mut LoopMemory) -> Result<Solution, Step> {
        match result {
            SolveResult::Solved(solution) => {
                memory.search_radius_deg = self.config.search_radius_deg;
                Ok(solution)
            }
            SolveResult::Failed(SolveFailure::EngineUnavailable(reason)) => {
                Err(Step::Abort(AbortReason::SolveFailure(reason)))
            }
            SolveResult::Failed(failure) => {
                let widened = self.config.widen_radius(memory.search_radius_deg);
                if widened > memory.search_radius_deg {
                    log::debug!(
                        "Widening search radius {:.1}° -> {:.1}°",
                        memory.search_radius_deg,
                        widened
                    );
                }
                memory.search_radius_deg = widened;
                Err(Step::Retry(StepFailure::Solve(failure)))
            }
        }
    }

    /// Sync to the solved center, slew back to the target and wait for it to settle.
    async fn correct(
        &self,
        solution: &Solution,
        target: SkyCoordinate,
        memory: &mut LoopMemory,
        draft: &mut AttemptDraft,
    ) -> Result<(), Step> {
        match self.cancellable(self.mount.sync_to(solution.center)).await {
            None => return Err(Step::Cancelled),
            Some(Err(e)) => return Err(mount_failure(e)),
            Some(Ok(())) => {}
        }
        draft.correction = Some(Correction {
            synced_to: solution.center,
            slewed_to: None,
        });

        match self.cancellable(self.mount.slew_to(target)).await {
            None => {
                self.abort_slew().await;
                return Err(Step::Cancelled);
            }
            Some(Err(e)) => return Err(mount_failure(e)),
            Some(Ok(())) => {}
        }
        memory.last_commanded = Some(target);
        draft.correction = Some(Correction {
            synced_to: solution.center,
            slewed_to: Some(target),
        });

        match self
            .cancellable(self.mount.wait_for_idle(self.config.motion_timeout()))
            .await
        {
            None => {
                self.abort_slew().await;
                Err(Step::Cancelled)
            }
            Some(Err(e)) => Err(mount_failure(e)),
            Some(Ok(state)) => {
                log::debug!("Mount settled ({:?})", state.status);
                Ok(())
            }
        }
    }

    async fn abort_exposure(&self, cause: &str) {
        if let Err(e) = self.camera.abort_exposure().await {
            log::warn!("Failed to abort exposure after {cause}: {e}");
        }
    }

    async fn abort_slew(&self) {
        if let Err(e) = self.mount.abort_slew().await {
            log::warn!("Failed to abort slew after cancellation: {e}");
        }
    }

    /// Sleep the retry backoff. Returns false if cancelled first.
    async fn backoff(&self, attempt: u32) -> bool {
        self.transition(LoopState::Retrying { attempt });
        self.cancellable(tokio::time::sleep(self.config.retry_backoff()))
            .await
            .is_some()
    }

    async fn cancellable<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            output = future => Some(output),
        }
    }

    fn transition(&self, to: LoopState) {
        let from = self.session.set_state(to);
        log::info!("{from} -> {to}");
        self.callbacks.emit(&RunEvent::StateChanged { from, to });
    }

    fn record(&self, record: AttemptRecord) {
        self.session.record(record.clone());
        self.callbacks.emit(&RunEvent::AttemptRecorded(record));
    }

    fn cancelled(&self, attempts_taken: u32) -> RunOutcome {
        log::warn!("Run cancelled during attempt {attempts_taken}");
        self.finish(RunOutcome::Aborted {
            reason: AbortReason::Cancelled,
            attempts_taken,
        })
    }

    fn finish(&self, outcome: RunOutcome) -> RunOutcome {
        let from = self.session.state();
        if self.session.finish(&outcome) {
            let to = outcome.final_state();
            log::info!("{from} -> {to}: {outcome}");
            self.callbacks.emit(&RunEvent::StateChanged { from, to });
            self.callbacks.emit(&RunEvent::Finished(outcome.clone()));
        }
        outcome
    }
}

/// Motion errors end the run; command errors are worth another attempt.
fn mount_failure(error: MountError) -> Step {
    if error.is_motion_error() {
        Step::Abort(AbortReason::MotionFailure(error.to_string()))
    } else {
        Step::Retry(StepFailure::Mount(error.to_string()))
    }
}
