use crate::session::AttemptRecord;
use crate::state::{LoopState, RunOutcome};
use shared::camera_interface::PixelFrame;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Events emitted for external callbacks
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Loop moved between states
    StateChanged { from: LoopState, to: LoopState },
    /// A frame was captured; clone the Arc to keep it alive
    FrameCaptured {
        attempt: u32,
        frame: Arc<PixelFrame>,
    },
    /// An attempt finished and was appended to the session
    AttemptRecorded(AttemptRecord),
    /// Run finished
    Finished(RunOutcome),
}

/// Callback ID for registration/deregistration
pub type CallbackId = u64;

/// Callback function type
pub type RunCallback = Arc<dyn Fn(&RunEvent) + Send + Sync>;

/// Set of registered callbacks, shared between a corrector and its runs.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: Arc<Mutex<HashMap<CallbackId, RunCallback>>>,
    next_callback_id: Arc<Mutex<CallbackId>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&RunEvent) + Send + Sync + 'static,
    {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next_id = self
            .next_callback_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let callback_id = *next_id;
        *next_id += 1;

        callbacks.insert(callback_id, Arc::new(callback));
        callback_id
    }

    pub fn deregister(&self, callback_id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        callbacks.remove(&callback_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every registered callback with `event`.
    ///
    /// Callbacks run outside the registry lock, so they may register or
    /// deregister callbacks themselves.
    pub fn emit(&self, event: &RunEvent) {
        let callbacks: Vec<RunCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("callbacks", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state_event() -> RunEvent {
        RunEvent::StateChanged {
            from: LoopState::Idle,
            to: LoopState::Capturing { attempt: 1 },
        }
    }

    #[test]
    fn test_callback_registration() {
        let registry = CallbackRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let callback_id = registry.register(move |_event| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit(&state_event());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(registry.deregister(callback_id));
        assert!(!registry.deregister(callback_id));

        registry.emit(&state_event());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_multiple_callbacks_and_shared_clones() {
        let registry = CallbackRegistry::new();
        let counter1 = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::new(AtomicUsize::new(0));

        let c1_clone = counter1.clone();
        let c2_clone = counter2.clone();
        let id1 = registry.register(move |_| {
            c1_clone.fetch_add(1, Ordering::SeqCst);
        });
        let id2 = registry.clone().register(move |_| {
            c2_clone.fetch_add(10, Ordering::SeqCst);
        });
        assert_ne!(id1, id2);
        assert_eq!(registry.len(), 2);

        registry.emit(&state_event());
        assert_eq!(counter1.load(Ordering::SeqCst), 1);
        assert_eq!(counter2.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_callback_may_deregister_itself() {
        let registry = CallbackRegistry::new();
        let inner = registry.clone();
        let id = Arc::new(Mutex::new(None::<CallbackId>));
        let id_clone = id.clone();

        let callback_id = registry.register(move |_| {
            if let Some(own) = *id_clone.lock().unwrap() {
                inner.deregister(own);
            }
        });
        *id.lock().unwrap() = Some(callback_id);

        registry.emit(&state_event());
        assert!(registry.is_empty());
    }
}
