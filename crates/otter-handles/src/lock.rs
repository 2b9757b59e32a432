//! Host-side latch released by script code.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

struct LockState {
    released: Mutex<bool>,
    signal: Condvar,
}

/// A latch created in the locked state.
///
/// Host code blocks in [`ScriptLock::wait`] until script code (through the
/// resource returned by [`crate::HandleTable::new_lock`]) calls
/// [`ScriptLock::release`]. Release is permanent.
#[derive(Clone)]
pub struct ScriptLock {
    state: Arc<LockState>,
}

impl ScriptLock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(LockState {
                released: Mutex::new(false),
                signal: Condvar::new(),
            }),
        }
    }

    /// Release all waiters. Returns `false` if already released.
    pub fn release(&self) -> bool {
        let mut released = self.state.released.lock();
        if *released {
            return false;
        }
        *released = true;
        self.state.signal.notify_all();
        true
    }

    pub fn is_released(&self) -> bool {
        *self.state.released.lock()
    }

    pub fn wait(&self) {
        let mut released = self.state.released.lock();
        while !*released {
            self.state.signal.wait(&mut released);
        }
    }

    /// Wait at most `timeout`. Returns whether the lock was released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut released = self.state.released.lock();
        if !*released {
            self.state
                .signal
                .wait_while_for(&mut released, |released| !*released, timeout);
        }
        *released
    }
}

impl Default for ScriptLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptLock")
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_wakes_waiter() {
        let lock = ScriptLock::new();
        let remote = lock.clone();

        let waiter = std::thread::spawn(move || {
            remote.wait();
            remote.is_released()
        });

        std::thread::sleep(Duration::from_millis(20));
        assert!(lock.release());
        assert!(waiter.join().unwrap());
        assert!(!lock.release());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let lock = ScriptLock::new();
        assert!(!lock.wait_timeout(Duration::from_millis(10)));
        lock.release();
        assert!(lock.wait_timeout(Duration::from_millis(10)));
    }
}
