use serde::{Deserialize, Serialize};
use shared::plate_solver::SolveFailure;
use shared::sky::PointingError;
use std::fmt;
use thiserror::Error;

/// Correction loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    /// Not started
    Idle,
    /// Exposure in progress
    Capturing { attempt: u32 },
    /// Waiting for the plate solver
    Solving { attempt: u32 },
    /// Comparing the solved center with the target
    Evaluating { attempt: u32 },
    /// Syncing the mount and re-slewing to the target
    Correcting { attempt: u32 },
    /// Backing off before the next attempt
    Retrying { attempt: u32 },
    /// Pointing error is within tolerance
    Converged,
    /// Run ended without converging
    Aborted,
}

impl LoopState {
    /// Attempt number for in-progress states.
    pub fn attempt(&self) -> Option<u32> {
        match self {
            LoopState::Capturing { attempt }
            | LoopState::Solving { attempt }
            | LoopState::Evaluating { attempt }
            | LoopState::Correcting { attempt }
            | LoopState::Retrying { attempt } => Some(*attempt),
            LoopState::Idle | LoopState::Converged | LoopState::Aborted => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Converged | LoopState::Aborted)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoopState::Idle => write!(f, "Idle"),
            LoopState::Capturing { attempt } => write!(f, "Capturing (attempt {attempt})"),
            LoopState::Solving { attempt } => write!(f, "Solving (attempt {attempt})"),
            LoopState::Evaluating { attempt } => write!(f, "Evaluating (attempt {attempt})"),
            LoopState::Correcting { attempt } => write!(f, "Correcting (attempt {attempt})"),
            LoopState::Retrying { attempt } => write!(f, "Retrying after attempt {attempt}"),
            LoopState::Converged => write!(f, "Converged"),
            LoopState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Why a single attempt did not converge.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepFailure {
    /// Camera failed in a way worth retrying
    #[error("capture failed: {0}")]
    Capture(String),

    /// Solver produced no solution
    #[error("solve failed: {0}")]
    Solve(SolveFailure),

    /// Mount refused a command or could not be reached
    #[error("mount command failed: {0}")]
    Mount(String),

    /// A correction was issued but the error was still above tolerance
    #[error("pointing error {error_deg:.5}° above tolerance")]
    OutOfTolerance { error_deg: f64 },
}

/// Why a run ended without converging.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AbortReason {
    /// Camera reported a failure that retrying cannot fix
    #[error("capture failure: {0}")]
    CaptureFailure(String),

    /// Solver cannot be used at all
    #[error("solve failure: {0}")]
    SolveFailure(String),

    /// Mount timed out or faulted while moving
    #[error("motion failure: {0}")]
    MotionFailure(String),

    /// Every allowed attempt was used
    #[error("maximum attempts exceeded")]
    MaxAttemptsExceeded { last_failure: Option<StepFailure> },

    /// Cancelled by the caller
    #[error("cancelled")]
    Cancelled,

    /// Background task panicked or was aborted
    #[error("worker failed: {0}")]
    WorkerFailed(String),
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    Converged {
        attempts: u32,
        final_error: PointingError,
    },
    Aborted {
        reason: AbortReason,
        attempts_taken: u32,
    },
}

impl RunOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, RunOutcome::Converged { .. })
    }

    /// Attempts used, whichever way the run ended.
    pub fn attempts(&self) -> u32 {
        match self {
            RunOutcome::Converged { attempts, .. } => *attempts,
            RunOutcome::Aborted { attempts_taken, .. } => *attempts_taken,
        }
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            RunOutcome::Converged { .. } => None,
            RunOutcome::Aborted { reason, .. } => Some(reason),
        }
    }

    /// Terminal loop state matching this outcome.
    pub fn final_state(&self) -> LoopState {
        match self {
            RunOutcome::Converged { .. } => LoopState::Converged,
            RunOutcome::Aborted { .. } => LoopState::Aborted,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunOutcome::Converged {
                attempts,
                final_error,
            } => write!(f, "converged after {attempts} attempt(s), error {final_error}"),
            RunOutcome::Aborted {
                reason,
                attempts_taken,
            } => write!(f, "aborted after {attempts_taken} attempt(s): {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_numbers() {
        assert_eq!(LoopState::Solving { attempt: 3 }.attempt(), Some(3));
        assert_eq!(LoopState::Idle.attempt(), None);
        assert!(LoopState::Aborted.is_terminal());
        assert!(!LoopState::Retrying { attempt: 1 }.is_terminal());
    }

    #[test]
    fn test_outcome_serializes() {
        let outcome = RunOutcome::Aborted {
            reason: AbortReason::MaxAttemptsExceeded {
                last_failure: Some(StepFailure::Solve(SolveFailure::NoMatch)),
            },
            attempts_taken: 4,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        let back: RunOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outcome);
        assert_eq!(back.attempts(), 4);
        assert_eq!(back.final_state(), LoopState::Aborted);
        assert_eq!(
            outcome.to_string(),
            "aborted after 4 attempt(s): maximum attempts exceeded"
        );
    }
}
