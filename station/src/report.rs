//! Operator-facing output: event logging, saved frames and run summaries.

use anyhow::{Context, Result};
use pointing::{AttemptOutcome, AttemptRecord, CallbackId, PointingCorrector, RunEvent, RunOutcome, Session};
use shared::image_io::{frame_path, save_frame_png};
use shared::plate_solver::SolveResult;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Log every run event through `tracing`.
pub fn log_events(corrector: &PointingCorrector) -> CallbackId {
    corrector.register_callback(|event| match event {
        RunEvent::StateChanged { to, .. } => info!("▶ {to}"),
        RunEvent::FrameCaptured { attempt, frame } => info!(
            "📷 Attempt {attempt}: frame {} ({}x{}, {:.1}s)",
            frame.metadata().frame_number,
            frame.width(),
            frame.height(),
            frame.metadata().exposure.as_secs_f64()
        ),
        RunEvent::AttemptRecorded(record) => info!("{}", describe_attempt(record)),
        RunEvent::Finished(outcome) if outcome.is_converged() => info!("🎯 {outcome}"),
        RunEvent::Finished(outcome) => warn!("⚠️  {outcome}"),
    })
}

/// Save every captured frame as a PNG under `dir`.
pub fn save_frames(corrector: &PointingCorrector, dir: PathBuf) -> Result<CallbackId> {
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Cannot create frame directory {}", dir.display()))?;
    Ok(corrector.register_callback(move |event| {
        if let RunEvent::FrameCaptured { frame, .. } = event {
            let path = frame_path(&dir, frame);
            match save_frame_png(frame, &path) {
                Ok(()) => info!("Saved {}", path.display()),
                Err(e) => warn!("Failed to save {}: {e}", path.display()),
            }
        }
    }))
}

/// Write the session history as pretty JSON.
pub fn write_history(session: &Session, path: &Path) -> Result<()> {
    let json = session.to_json().context("Failed to serialize session")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote attempt history to {}", path.display());
    Ok(())
}

/// One-line description of an attempt.
pub fn describe_attempt(record: &AttemptRecord) -> String {
    let solve = match &record.solve {
        Some(SolveResult::Solved(solution)) => format!("solved {}", solution.center),
        Some(SolveResult::Failed(failure)) => format!("no solution ({failure})"),
        None => "not solved".to_string(),
    };
    let error = record
        .error
        .map(|e| format!(", error {e}"))
        .unwrap_or_default();
    let outcome = match &record.outcome {
        AttemptOutcome::Converged => "converged".to_string(),
        AttemptOutcome::Corrected => "corrected".to_string(),
        AttemptOutcome::Failed(failure) => format!("failed: {failure}"),
        AttemptOutcome::Aborted(reason) => format!("aborted: {reason}"),
    };
    format!(
        "Attempt {} ({:.1}s): {solve}{error} -> {outcome}",
        record.sequence,
        record.duration.as_secs_f64()
    )
}

/// Multi-line summary of a finished run.
pub fn summary(session: &Session, outcome: &RunOutcome) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "Target: {}", session.target());
    for record in session.history() {
        let _ = writeln!(text, "  {}", describe_attempt(&record));
    }
    let _ = write!(text, "Result: {outcome}");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use pointing::{AbortReason, StepFailure};
    use shared::camera_interface::Timestamp;
    use shared::plate_solver::SolveFailure;
    use shared::sky::PointingError;
    use std::time::Duration;
    use test_helpers::coord;

    fn attempt(sequence: u32, outcome: AttemptOutcome) -> AttemptRecord {
        AttemptRecord {
            sequence,
            started_at: Timestamp::new(0, 0),
            duration: Duration::from_millis(2500),
            frame: None,
            hint: None,
            solve: Some(SolveResult::Failed(SolveFailure::NoMatch)),
            error: None,
            correction: None,
            outcome,
        }
    }

    #[test]
    fn test_describe_failed_attempt() {
        let text = describe_attempt(&attempt(
            2,
            AttemptOutcome::Failed(StepFailure::Solve(SolveFailure::NoMatch)),
        ));
        assert_eq!(
            text,
            "Attempt 2 (2.5s): no solution (no match found) -> failed: solve failed: no match found"
        );
    }

    #[test]
    fn test_summary_lists_attempts() {
        let session = Session::new(coord(10.0, 20.0));
        session.record(attempt(1, AttemptOutcome::Corrected));
        let outcome = RunOutcome::Converged {
            attempts: 1,
            final_error: PointingError::between(&coord(10.0, 20.0), &coord(10.0, 20.001)),
        };
        let text = summary(&session, &outcome);
        assert!(text.starts_with("Target: "));
        assert!(text.contains("Attempt 1"));
        assert!(text.ends_with(&format!("Result: {outcome}")));

        let aborted = RunOutcome::Aborted {
            reason: AbortReason::Cancelled,
            attempts_taken: 1,
        };
        assert!(summary(&session, &aborted).ends_with("cancelled"));
    }

    #[test]
    fn test_write_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let session = Session::new(coord(10.0, 20.0));
        session.record(attempt(1, AttemptOutcome::Corrected));

        write_history(&session, &path).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["attempts"].as_array().unwrap().len(), 1);
    }
}
