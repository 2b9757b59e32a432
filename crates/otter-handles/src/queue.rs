//! Serializing task queue.
//!
//! Script engines may only be entered from one thread at a time. Any
//! completion that has to call back into the engine (timers, I/O, host
//! callbacks) pushes a closure here; one dedicated consumer thread runs the
//! closures strictly in push order.
//!
//! ## Backpressure
//!
//! The channel is bounded. A producer on a foreign thread blocks for at most
//! `push_timeout` when the queue is full, then the task is dropped and
//! counted in [`QueueStats::dropped`]. Pushes made from the consumer thread
//! never block, since the consumer cannot drain its own queue while waiting:
//! they are dropped immediately if the queue is full.
//!
//! ## Disposal
//!
//! After [`TaskQueue::dispose`], pushes are silently ignored. Tasks already
//! queued are discarded; a task that is running at that moment completes.

use crate::error::QueueError;
use crate::stats::QueueStats;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError, bounded};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info_span, trace, warn};

/// A deferred call executed on the consumer thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    name: String,
    disposed: AtomicBool,
    stats: QueueStats,
}

struct QueueInner {
    state: Arc<QueueState>,
    sender: RwLock<Option<Sender<Task>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    consumer_id: ThreadId,
    push_timeout: Duration,
}

/// Single-consumer FIFO execution channel.
///
/// Clones share the same queue and consumer thread. The queue is disposed
/// when [`TaskQueue::dispose`] is called or the last clone is dropped.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Start a queue and its consumer thread.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        push_timeout: Duration,
    ) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<Task>(capacity.max(1));
        let state = Arc::new(QueueState {
            name: name.into(),
            disposed: AtomicBool::new(false),
            stats: QueueStats::new(),
        });

        let consumer_state = state.clone();
        let consumer = std::thread::Builder::new()
            .name(state.name.clone())
            .spawn(move || run_consumer(rx, consumer_state))?;
        let consumer_id = consumer.thread().id();

        Ok(Self {
            inner: Arc::new(QueueInner {
                state,
                sender: RwLock::new(Some(tx)),
                consumer: Mutex::new(Some(consumer)),
                consumer_id,
                push_timeout,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.state.name
    }

    /// Enqueue a task.
    ///
    /// Never fails for the caller: after disposal the task is ignored, and a
    /// task that cannot be queued in time is dropped and logged.
    pub fn push<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.enqueue(Box::new(task), true) {
            Ok(()) => {}
            Err(QueueError::Disposed) => {
                trace!(queue = %self.inner.state.name, "Ignoring task pushed after dispose");
            }
            Err(QueueError::Full) => {
                self.inner.state.stats.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    queue = %self.inner.state.name,
                    timeout_ms = self.inner.push_timeout.as_millis() as u64,
                    "Task queue full, task dropped"
                );
            }
        }
    }

    /// Enqueue a task without blocking.
    pub fn try_push<F>(&self, task: F) -> Result<(), QueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(task), false)
    }

    fn enqueue(&self, task: Task, wait: bool) -> Result<(), QueueError> {
        if self.is_disposed() {
            return Err(QueueError::Disposed);
        }
        // Send outside the lock so a blocked producer never holds up dispose.
        let sender = self.inner.sender.read().clone();
        let Some(sender) = sender else {
            return Err(QueueError::Disposed);
        };

        let result = if wait && !self.on_consumer_thread() {
            sender
                .send_timeout(task, self.inner.push_timeout)
                .map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => QueueError::Full,
                    SendTimeoutError::Disconnected(_) => QueueError::Disposed,
                })
        } else {
            sender.try_send(task).map_err(|e| match e {
                TrySendError::Full(_) => QueueError::Full,
                TrySendError::Disconnected(_) => QueueError::Disposed,
            })
        };

        if result.is_ok() {
            self.inner.state.stats.pushed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Wait until every task pushed before this call has run.
    ///
    /// Returns `false` if the queue was disposed first, or when called from
    /// the consumer thread (which would wait on itself).
    pub fn flush(&self) -> bool {
        if self.on_consumer_thread() {
            warn!(queue = %self.inner.state.name, "flush() called from the consumer thread");
            return false;
        }
        let (done_tx, done_rx) = bounded::<()>(1);
        let barrier: Task = Box::new(move || {
            let _ = done_tx.send(());
        });
        if self.enqueue(barrier, true).is_err() {
            return false;
        }
        // A discarded barrier drops its sender, which ends the wait.
        done_rx.recv().is_ok()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.disposed.load(Ordering::Acquire)
    }

    /// Number of tasks waiting to run
    pub fn pending(&self) -> usize {
        self.inner
            .sender
            .read()
            .as_ref()
            .map_or(0, |sender| sender.len())
    }

    pub fn stats(&self) -> &QueueStats {
        &self.inner.state.stats
    }

    /// Whether the caller is running on the consumer thread.
    pub fn on_consumer_thread(&self) -> bool {
        std::thread::current().id() == self.inner.consumer_id
    }

    /// Stop accepting tasks and stop the consumer.
    ///
    /// Joins the consumer thread unless called from it.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl QueueInner {
    fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(queue = %self.state.name, "Disposing task queue");

        // Dropping the sender disconnects an idle consumer.
        self.sender.write().take();

        let consumer = self.consumer.lock().take();
        if let Some(handle) = consumer {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.state.name)
            .field("pending", &self.pending())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn run_consumer(rx: Receiver<Task>, state: Arc<QueueState>) {
    let _span = info_span!("task_queue", name = %state.name).entered();
    debug!("Task queue consumer started");

    for task in rx.iter() {
        if state.disposed.load(Ordering::Acquire) {
            // The task just received counts as discarded too.
            let discarded = 1 + rx.try_iter().count() as u64;
            state.stats.discarded.fetch_add(discarded, Ordering::Relaxed);
            debug!(discarded, "Discarding queued tasks after dispose");
            break;
        }

        match catch_unwind(AssertUnwindSafe(task)) {
            Ok(()) => {
                state.stats.executed.fetch_add(1, Ordering::Relaxed);
            }
            Err(panic) => {
                state.stats.panicked.fetch_add(1, Ordering::Relaxed);
                error!(panic = %panic_message(panic.as_ref()), "Queued task panicked");
            }
        }
    }

    debug!("Task queue consumer stopped");
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn queue(capacity: usize) -> TaskQueue {
        TaskQueue::new("test-queue", capacity, Duration::from_millis(200)).unwrap()
    }

    #[test]
    fn test_fifo_single_producer() {
        let q = queue(64);
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 1..=50 {
            let log = log.clone();
            q.push(move || log.lock().push(i));
        }

        assert!(q.flush());
        assert_eq!(*log.lock(), (1..=50).collect::<Vec<_>>());
        q.dispose();
    }

    #[test]
    fn test_panicking_task_keeps_consumer_alive() {
        let q = queue(8);
        let ran = Arc::new(AtomicUsize::new(0));

        q.push(|| panic!("task failure"));
        let counter = ran.clone();
        q.push(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(q.flush());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let stats = q.stats().snapshot();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.executed, 2); // second task + flush barrier
        q.dispose();
    }

    #[test]
    fn test_push_after_dispose_is_ignored() {
        let q = queue(8);
        q.dispose();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        q.push(move || flag.store(true, Ordering::SeqCst));

        assert_eq!(q.try_push(|| {}), Err(QueueError::Disposed));
        assert!(!q.flush());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dispose_discards_queued_tasks() {
        let q = queue(16);
        let gate = crate::lock::ScriptLock::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let g = gate.clone();
        q.push(move || g.wait());
        for _ in 0..5 {
            let counter = ran.clone();
            q.push(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // The consumer must be inside the blocking task before dispose.
        while q.pending() > 5 {
            std::thread::yield_now();
        }

        let disposer = {
            let q = q.clone();
            std::thread::spawn(move || q.dispose())
        };
        // Let dispose flip the flag before the blocking task finishes.
        while !q.is_disposed() {
            std::thread::yield_now();
        }
        gate.release();
        disposer.join().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(q.stats().snapshot().discarded, 5);
    }

    #[test]
    fn test_try_push_reports_full() {
        let q = queue(1);
        let gate = crate::lock::ScriptLock::new();

        let g = gate.clone();
        q.push(move || g.wait());
        // Wait for the consumer to pick up the blocking task.
        while q.pending() > 0 {
            std::thread::yield_now();
        }
        q.push(|| {});
        assert_eq!(q.try_push(|| {}), Err(QueueError::Full));

        gate.release();
        assert!(q.flush());
        q.dispose();
    }

    #[test]
    fn test_push_from_consumer_does_not_block() {
        let q = queue(1);
        let inner = q.clone();
        let (tx, rx) = crossbeam_channel::bounded(1);

        q.push(move || {
            // Fill the single slot, then overflow it from the consumer itself.
            inner.push(|| {});
            inner.push(|| {});
            let _ = tx.send(inner.on_consumer_thread());
        });

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(q.flush());
        assert_eq!(q.stats().snapshot().dropped, 1);
        q.dispose();
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
