use crate::callback::{CallbackRegistry, RunEvent};
use crate::session::Session;
use crate::state::{AbortReason, LoopState, RunOutcome};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to a run executing on a background task.
///
/// Dropping the handle does not stop the run; call [`RunHandle::cancel`].
#[derive(Debug)]
pub struct RunHandle {
    cancel: CancellationToken,
    session: Arc<Session>,
    callbacks: CallbackRegistry,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub(crate) fn new(
        cancel: CancellationToken,
        session: Arc<Session>,
        callbacks: CallbackRegistry,
        task: JoinHandle<RunOutcome>,
    ) -> Self {
        Self {
            cancel,
            session,
            callbacks,
            task,
        }
    }

    /// Request cancellation. The run stops at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this run, for wiring to signal handlers.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session(&self) -> Arc<Session> {
        self.session.clone()
    }

    pub fn state(&self) -> LoopState {
        self.session.state()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end.
    ///
    /// A task that panicked or was aborted yields `Aborted { WorkerFailed }`.
    pub async fn join(self) -> RunOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let outcome = RunOutcome::Aborted {
                    reason: AbortReason::WorkerFailed(e.to_string()),
                    attempts_taken: self.session.len() as u32,
                };
                log::error!("Pointing correction worker failed: {e}");
                if self.session.finish(&outcome) {
                    self.callbacks.emit(&RunEvent::Finished(outcome.clone()));
                }
                outcome
            }
        }
    }

    /// Abort the task outright without waiting for a suspension point.
    pub fn abort(&self) {
        self.task.abort();
    }
}
