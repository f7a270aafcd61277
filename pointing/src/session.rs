//! Append-only history of a correction run.
//!
//! The loop is the only writer. Observers on other tasks read snapshots
//! while the run is in progress.

use crate::state::{AbortReason, LoopState, RunOutcome, StepFailure};
use serde::{Deserialize, Serialize};
use shared::camera_interface::{PixelFrame, Timestamp};
use shared::plate_solver::{SolveHint, SolveResult};
use shared::sky::{PointingError, SkyCoordinate};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// What was captured in one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub frame_number: u64,
    pub width: usize,
    pub height: usize,
    pub exposure: Duration,
    pub timestamp: Timestamp,
}

impl From<&PixelFrame> for FrameInfo {
    fn from(frame: &PixelFrame) -> Self {
        let metadata = frame.metadata();
        Self {
            frame_number: metadata.frame_number,
            width: frame.width(),
            height: frame.height(),
            exposure: metadata.exposure,
            timestamp: metadata.timestamp,
        }
    }
}

/// Mount commands issued to correct one attempt's error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    /// Coordinate the mount was synced to (the solved center)
    pub synced_to: SkyCoordinate,
    /// Coordinate the mount was then slewed to, once commanded
    pub slewed_to: Option<SkyCoordinate>,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// Error within tolerance
    Converged,
    /// Correction issued and settled
    Corrected,
    /// Attempt failed in a retryable way
    Failed(StepFailure),
    /// Attempt ended the run
    Aborted(AbortReason),
}

/// Diagnostic record of one capture/solve/evaluate/correct iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub sequence: u32,
    pub started_at: Timestamp,
    pub duration: Duration,
    pub frame: Option<FrameInfo>,
    pub hint: Option<SolveHint>,
    pub solve: Option<SolveResult>,
    pub error: Option<PointingError>,
    pub correction: Option<Correction>,
    pub outcome: AttemptOutcome,
}

/// Serializable snapshot of a whole session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub target: SkyCoordinate,
    pub state: LoopState,
    pub attempts: Vec<AttemptRecord>,
    pub outcome: Option<RunOutcome>,
}

#[derive(Debug)]
struct SessionInner {
    state: LoopState,
    history: Vec<AttemptRecord>,
    outcome: Option<RunOutcome>,
}

/// Current state and attempt history of one run.
#[derive(Debug)]
pub struct Session {
    target: SkyCoordinate,
    inner: RwLock<SessionInner>,
}

impl Session {
    pub fn new(target: SkyCoordinate) -> Self {
        Self {
            target,
            inner: RwLock::new(SessionInner {
                state: LoopState::Idle,
                history: Vec::new(),
                outcome: None,
            }),
        }
    }

    pub fn target(&self) -> SkyCoordinate {
        self.target
    }

    /// Append a finished attempt.
    pub fn record(&self, record: AttemptRecord) {
        self.write(|inner| inner.history.push(record));
    }

    /// All attempts so far, oldest first.
    pub fn history(&self) -> Vec<AttemptRecord> {
        self.read(|inner| inner.history.clone())
    }

    pub fn latest(&self) -> Option<AttemptRecord> {
        self.read(|inner| inner.history.last().cloned())
    }

    pub fn len(&self) -> usize {
        self.read(|inner| inner.history.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> LoopState {
        self.read(|inner| inner.state)
    }

    /// Final outcome, once the run has finished.
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.read(|inner| inner.outcome.clone())
    }

    /// Move to `state`, returning the state it replaced.
    pub(crate) fn set_state(&self, state: LoopState) -> LoopState {
        self.write(|inner| std::mem::replace(&mut inner.state, state))
    }

    /// Record the outcome. Only the first outcome sticks.
    pub(crate) fn finish(&self, outcome: &RunOutcome) -> bool {
        self.write(|inner| {
            if inner.outcome.is_some() {
                return false;
            }
            inner.state = outcome.final_state();
            inner.outcome = Some(outcome.clone());
            true
        })
    }

    pub fn report(&self) -> SessionReport {
        self.read(|inner| SessionReport {
            target: self.target,
            state: inner.state,
            attempts: inner.history.clone(),
            outcome: inner.outcome.clone(),
        })
    }

    /// Pretty-printed JSON of [`Session::report`].
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.report())
    }

    fn read<R>(&self, f: impl FnOnce(&SessionInner) -> R) -> R {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<R>(&self, f: impl FnOnce(&mut SessionInner) -> R) -> R {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::plate_solver::SolveFailure;

    fn record(sequence: u32, outcome: AttemptOutcome) -> AttemptRecord {
        AttemptRecord {
            sequence,
            started_at: Timestamp::new(1_700_000_000 + sequence as u64, 0),
            duration: Duration::from_secs(3),
            frame: None,
            hint: None,
            solve: Some(SolveResult::Failed(SolveFailure::NoMatch)),
            error: None,
            correction: None,
            outcome,
        }
    }

    #[test]
    fn test_history_is_ordered_snapshot() {
        let session = Session::new(SkyCoordinate::new(10.0, 20.0).unwrap());
        assert!(session.is_empty());
        assert!(session.latest().is_none());

        session.record(record(1, AttemptOutcome::Failed(StepFailure::Solve(SolveFailure::NoMatch))));
        let snapshot = session.history();
        session.record(record(2, AttemptOutcome::Converged));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(session.len(), 2);
        let sequences: Vec<u32> = session.history().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(session.latest().unwrap().outcome, AttemptOutcome::Converged);
    }

    #[test]
    fn test_first_outcome_sticks() {
        let session = Session::new(SkyCoordinate::new(0.0, 0.0).unwrap());
        let cancelled = RunOutcome::Aborted {
            reason: AbortReason::Cancelled,
            attempts_taken: 1,
        };
        assert!(session.finish(&cancelled));
        assert!(!session.finish(&RunOutcome::Aborted {
            reason: AbortReason::WorkerFailed("late".into()),
            attempts_taken: 1,
        }));
        assert_eq!(session.outcome(), Some(cancelled));
        assert_eq!(session.state(), LoopState::Aborted);
    }

    #[test]
    fn test_json_report() {
        let session = Session::new(SkyCoordinate::new(10.0, 20.0).unwrap());
        assert_eq!(session.set_state(LoopState::Capturing { attempt: 1 }), LoopState::Idle);
        session.record(record(1, AttemptOutcome::Corrected));

        let json = session.to_json().unwrap();
        let report: SessionReport = serde_json::from_str(&json).unwrap();
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.state, LoopState::Capturing { attempt: 1 });
        assert!(report.outcome.is_none());
        assert_eq!(report.target, session.target());
    }
}
