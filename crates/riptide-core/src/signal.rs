//! One-shot completion latch.

use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

/// A one-shot completion signal.
///
/// Stores the first value it is fired with, invokes each registered
/// callback exactly once, and keeps firing for late subscribers with the
/// stored value. Subsequent fires are ignored. Async waiters use
/// [`Latch::wait`]; [`Latch::wait_blocking`] exists for test code running
/// off the reactor.
pub struct Latch<T> {
    state: Mutex<LatchState<T>>,
    condvar: Condvar,
    notify: Notify,
}

struct LatchState<T> {
    value: Option<T>,
    callbacks: Vec<Box<dyn FnOnce(&T) + Send>>,
}

impl<T: Clone> Latch<T> {
    /// Creates an unfired latch.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState {
                value: None,
                callbacks: Vec::new(),
            }),
            condvar: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Fires the latch with `value`.
    ///
    /// Returns `true` on the winning call; later calls are ignored and
    /// return `false`. The winning call invokes all pending callbacks and
    /// wakes every waiter.
    pub fn fire(&self, value: T) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value.clone());
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback(&value);
        }
        self.condvar.notify_all();
        self.notify.notify_waiters();
        true
    }

    /// Registers a one-shot callback.
    ///
    /// If the latch has already fired, the callback runs immediately with
    /// the stored value.
    pub fn subscribe(&self, callback: impl FnOnce(&T) + Send + 'static) {
        let mut state = self.state.lock();
        if let Some(value) = state.value.clone() {
            drop(state);
            callback(&value);
        } else {
            state.callbacks.push(Box::new(callback));
        }
    }

    /// The stored value, if the latch has fired.
    pub fn value(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    /// Whether the latch has fired.
    pub fn is_fired(&self) -> bool {
        self.state.lock().value.is_some()
    }

    /// Waits asynchronously for the latch to fire.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(value) = self.value() {
                return value;
            }
            notified.await;
        }
    }

    /// Blocks the current thread until the latch fires or `timeout`
    /// elapses. Test-only: must not be called on a reactor thread.
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> Option<T> {
        let mut state = self.state.lock();
        match timeout {
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while state.value.is_none() {
                    if self.condvar.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while state.value.is_none() {
                    self.condvar.wait(&mut state);
                }
            }
        }
        state.value.clone()
    }
}

impl<T: Clone> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Latch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Latch")
            .field("fired", &state.value.is_some())
            .field("pending_callbacks", &state.callbacks.len())
            .finish()
    }
}
