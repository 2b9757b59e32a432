//! Background-task drain counter.
//!
//! Counts asynchronous operations started through the engine boundary so
//! the host knows when it may exit. The drain signal is one-shot: it fires
//! when the count drops from 1 to 0 (or is forced to 0), and once fired,
//! [`DrainCounter::wait_for_drain`] never blocks again.

use crate::queue::panic_message;
use parking_lot::{Condvar, Mutex};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace};

#[derive(Debug, Default)]
struct DrainState {
    count: u64,
    fired: bool,
    signals: u64,
}

impl DrainState {
    fn drained(&self) -> bool {
        self.fired || self.count == 0
    }
}

/// Count of outstanding background operations plus a one-shot drain signal.
#[derive(Debug, Default)]
pub struct DrainCounter {
    state: Mutex<DrainState>,
    signal: Condvar,
}

impl DrainCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_started(&self) {
        let mut state = self.state.lock();
        state.count += 1;
        trace!(count = state.count, "Background task started");
    }

    /// Decrement, clamping at zero. Extra calls are tolerated.
    pub fn task_ended(&self) {
        let mut state = self.state.lock();
        if state.count == 0 {
            trace!("Background task ended with nothing outstanding");
            return;
        }
        state.count -= 1;
        trace!(count = state.count, "Background task ended");
        if state.count == 0 {
            self.fire(&mut state);
        }
    }

    /// Reset to zero and release waiters, for abrupt shutdown.
    pub fn force_drain(&self) {
        let mut state = self.state.lock();
        if state.count > 0 {
            debug!(outstanding = state.count, "Forcing drain");
        }
        state.count = 0;
        self.fire(&mut state);
    }

    fn fire(&self, state: &mut DrainState) {
        if state.fired {
            return;
        }
        state.fired = true;
        state.signals += 1;
        self.signal.notify_all();
        debug!("Background tasks drained");
    }

    /// Block until the drain signal fires.
    ///
    /// Returns immediately when nothing is outstanding.
    pub fn wait_for_drain(&self) {
        let mut state = self.state.lock();
        while !state.drained() {
            self.signal.wait(&mut state);
        }
    }

    /// Like [`Self::wait_for_drain`], giving up after `timeout`.
    /// Returns whether the counter drained.
    pub fn wait_for_drain_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.drained() {
            self.signal
                .wait_while_for(&mut state, |state| !state.drained(), timeout);
        }
        state.drained()
    }

    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    /// Whether the one-shot signal has fired
    pub fn has_fired(&self) -> bool {
        self.state.lock().fired
    }

    /// How many times waiters were signalled: 0 before the drain, 1 after.
    pub fn signal_count(&self) -> u64 {
        self.state.lock().signals
    }

    /// Count a task until the returned guard is dropped.
    pub fn track(self: &Arc<Self>) -> TaskGuard {
        self.task_started();
        TaskGuard {
            counter: self.clone(),
        }
    }
}

/// Ends its task when dropped, including on panic.
#[derive(Debug)]
pub struct TaskGuard {
    counter: Arc<DrainCounter>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter.task_ended();
    }
}

/// Run `f` on a named thread, counted by `counter` until it returns.
///
/// A panic inside `f` is caught and logged; the count is balanced either way.
pub fn spawn_background<F>(
    counter: &Arc<DrainCounter>,
    name: impl Into<String>,
    f: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let guard = counter.track();
    let name = name.into();
    std::thread::Builder::new().name(name.clone()).spawn(move || {
        let _guard = guard;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
            error!(
                task = %name,
                panic = %panic_message(panic.as_ref()),
                "Background task panicked"
            );
        }
    })
}
