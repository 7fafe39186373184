//! Hand-off queue onto the consumer context
//!
//! Background tasks (flush callbacks, subscription handlers) never touch
//! session state directly. They post a closure here and the consumer runs
//! it on its own tick. The lock guards only the queue itself; actions run
//! after it is released, so an action may post further actions.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

type Action = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Default)]
pub struct MainThreadQueue {
    actions: Arc<Mutex<VecDeque<Action>>>,
}

impl MainThreadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an action from any thread.
    pub fn post<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.actions.lock().push_back(Box::new(action));
    }

    /// Run the oldest action, if any. Returns whether one ran.
    pub fn run_one(&self) -> bool {
        let action = self.actions.lock().pop_front();
        match action {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }

    /// Run the actions queued at call time. Actions they post wait for the
    /// next tick.
    pub fn run_pending(&self) -> usize {
        let queued = self.len();
        let mut ran = 0;
        while ran < queued && self.run_one() {
            ran += 1;
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.lock().is_empty()
    }
}

impl std::fmt::Debug for MainThreadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainThreadQueue")
            .field("queued", &self.len())
            .finish()
    }
}
