use super::{check_frame, PlateSolver, SolveFailure, SolveHint, SolveResult, Solution};
use crate::camera_interface::PixelFrame;
use crate::sky::{PixelScale, SkyCoordinate};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Solver that replays a queue of canned results.
///
/// Each call pops one result; once the queue is empty every further call
/// fails with `NoMatch`. The hint passed to every call is recorded.
pub struct ScriptedSolver {
    results: Mutex<VecDeque<SolveResult>>,
    delay: Duration,
    hints: Mutex<Vec<Option<SolveHint>>>,
    calls: AtomicUsize,
}

impl ScriptedSolver {
    pub fn new(results: impl IntoIterator<Item = SolveResult>) -> Self {
        Self {
            results: Mutex::new(results.into_iter().collect()),
            delay: Duration::ZERO,
            hints: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Simulated engine run time per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Convenience for a successful result at `center` with a 1.5"/px scale.
    pub fn solved_at(center: SkyCoordinate) -> SolveResult {
        SolveResult::Solved(Solution {
            center,
            pixel_scale: PixelScale::from_arcsec_per_pixel(1.5),
            rotation_deg: 0.0,
            solve_time: Duration::from_millis(500),
        })
    }

    pub fn push(&self, result: SolveResult) {
        self.results.lock().unwrap().push_back(result);
    }

    /// Hints received so far, one per call.
    pub fn hints(&self) -> Vec<Option<SolveHint>> {
        self.hints.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlateSolver for ScriptedSolver {
    fn name(&self) -> &str {
        "ScriptedSolver"
    }

    async fn solve(&self, frame: &PixelFrame, hint: Option<&SolveHint>) -> SolveResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.hints.lock().unwrap().push(hint.copied());

        if let Err(failure) = check_frame(frame) {
            return SolveResult::Failed(failure);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SolveResult::Failed(SolveFailure::NoMatch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_interface::{FrameMetadata, Timestamp};
    use ndarray::Array2;

    fn frame() -> PixelFrame {
        let metadata = FrameMetadata::new(1, Duration::from_secs(1), Timestamp::new(0, 0));
        PixelFrame::new(Array2::zeros((16, 16)), 16, metadata)
    }

    #[tokio::test]
    async fn test_replays_queue_then_no_match() {
        let center = SkyCoordinate::new(10.0, 20.0).unwrap();
        let solver = ScriptedSolver::new([
            SolveResult::Failed(SolveFailure::NoMatch),
            ScriptedSolver::solved_at(center),
        ]);

        let frame = frame();
        assert!(!solver.solve(&frame, None).await.is_solved());
        let solved = solver.solve(&frame, None).await;
        assert_eq!(solved.solution().unwrap().center, center);
        assert_eq!(
            solver.solve(&frame, None).await,
            SolveResult::Failed(SolveFailure::NoMatch)
        );
        assert_eq!(solver.call_count(), 3);
    }

    #[tokio::test]
    async fn test_records_hints() {
        let center = SkyCoordinate::new(10.0, 20.0).unwrap();
        let solver = ScriptedSolver::new([]);
        let hint = SolveHint::new(center, 2.0);

        let frame = frame();
        solver.solve(&frame, None).await;
        solver.solve(&frame, Some(&hint)).await;
        assert_eq!(solver.hints(), vec![None, Some(hint)]);
    }
}
