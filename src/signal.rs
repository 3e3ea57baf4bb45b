//! Cross-thread shutdown signal

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct DoneState {
    set: bool,
    callbacks: Vec<Callback>,
}

/// A one-shot event that can be set from any thread.
///
/// Callbacks registered with `add_callback` run on the thread that calls
/// `set`, or immediately on the registering thread if the flag is already
/// set.
#[derive(Clone, Default)]
pub struct DoneFlag {
    inner: Arc<Mutex<DoneState>>,
}

impl DoneFlag {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DoneState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the flag and run every registered callback. Setting an already
    /// set flag does nothing.
    pub fn set(&self) {
        let callbacks = {
            let mut state = self.lock();
            if state.set {
                return;
            }
            state.set = true;
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }

    pub fn is_set(&self) -> bool {
        self.lock().set
    }

    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if state.set {
            drop(state);
            callback();
        } else {
            state.callbacks.push(Box::new(callback));
        }
    }
}

impl fmt::Debug for DoneFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("DoneFlag")
            .field("set", &state.set)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}
