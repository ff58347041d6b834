//! Per-topic push scheduling.
//!
//! Every topic owns a [`PushScheduler`]: a queue of delivery tasks waiting
//! for new messages and three state bits kept in one atomic byte:
//!
//! - `ENABLED` - the topic accepts passes
//! - `LOCKED` - a pass is queued or running
//! - `UPDATE` - work arrived since the running pass started
//!
//! A notification sets `UPDATE` and then tries to take `LOCKED`; only the
//! winner submits a pass to the [`Executor`]. A pass drains the queue up to a
//! barrier appended on entry, releases `LOCKED`, and starts over if `UPDATE`
//! was raised meanwhile and tasks are waiting. A notification can therefore
//! never be lost between the last task of a pass and the release of `LOCKED`.

use crate::metrics;
use crate::topic::Topic;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{error, trace, warn};

const ENABLED: u8 = 1 << 0;
const LOCKED: u8 = 1 << 1;
const UPDATE: u8 = 1 << 2;

/// A unit of work submitted to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The worker pool topic passes run on.
///
/// Shared by every topic of a broker and injected at construction.
pub trait Executor: Send + Sync {
    /// Run `job` at some point, possibly on another thread.
    fn execute(&self, job: Job);
}

/// Runs passes as tasks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    /// Create an executor spawning onto the given runtime.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create an executor for the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) {
        self.handle.spawn(async move { job() });
    }
}

/// Runs passes immediately on the calling thread.
///
/// Useful for single-threaded embedding and deterministic tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

/// Errors a delivery task can report to its pass.
///
/// These are logged and never stop the pass.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The subscriber's session no longer exists.
    #[error("Session for {0} is gone")]
    SessionGone(String),

    /// The wire layer dropped the session's outbound channel.
    #[error("Outbound channel closed for {0}")]
    OutboundClosed(String),
}

/// Something a pass runs: a subscriber cursor or a shared group.
pub(crate) trait DeliveryTask: Send + Sync + fmt::Debug {
    fn deliver(self: Arc<Self>, topic: &Topic) -> Result<(), DeliveryError>;
}

enum Entry {
    Task(Arc<dyn DeliveryTask>),
    Barrier,
}

/// Scheduling state and task queue of one topic.
pub(crate) struct PushScheduler {
    state: AtomicU8,
    queue: Mutex<VecDeque<Entry>>,
    executor: Arc<dyn Executor>,
}

impl PushScheduler {
    pub(crate) fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            state: AtomicU8::new(ENABLED),
            queue: Mutex::new(VecDeque::new()),
            executor,
        }
    }

    /// Queue a task for the next pass.
    pub(crate) fn register(&self, task: Arc<dyn DeliveryTask>) {
        self.lock_queue().push_back(Entry::Task(task));
    }

    /// Raise `UPDATE` and try to take `LOCKED`.
    ///
    /// Returns `true` if the caller won and must submit a pass.
    pub(crate) fn acquire(&self) -> bool {
        self.state.fetch_or(UPDATE, Ordering::SeqCst);
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                (state & (ENABLED | LOCKED) == ENABLED).then_some(state | LOCKED)
            })
            .is_ok()
    }

    pub(crate) fn submit(&self, job: Job) {
        self.executor.execute(job);
    }

    /// Run one pass over the tasks queued before it started.
    ///
    /// Returns `true` if another pass is needed.
    pub(crate) fn drain(&self, topic: &Topic) -> bool {
        self.state.fetch_and(!UPDATE, Ordering::SeqCst);
        self.lock_queue().push_back(Entry::Barrier);

        let mut ran = 0usize;
        loop {
            let entry = self.lock_queue().pop_front();
            match entry {
                Some(Entry::Task(task)) => {
                    run_task(task, topic);
                    ran += 1;
                }
                Some(Entry::Barrier) | None => break,
            }
        }

        self.state.fetch_and(!LOCKED, Ordering::SeqCst);
        let again =
            self.state.load(Ordering::SeqCst) & UPDATE != 0 && !self.lock_queue().is_empty();
        trace!(topic = %topic.name(), tasks = ran, again, "Push pass finished");
        again
    }

    /// Stop accepting passes.
    pub(crate) fn disable(&self) {
        self.state.fetch_and(!ENABLED, Ordering::SeqCst);
        self.lock_queue().clear();
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.state.load(Ordering::SeqCst) & ENABLED != 0
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) & LOCKED != 0
    }

    pub(crate) fn pending(&self) -> usize {
        self.lock_queue()
            .iter()
            .filter(|entry| matches!(entry, Entry::Task(_)))
            .count()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Entry>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PushScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushScheduler")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("pending", &self.pending())
            .finish()
    }
}

fn run_task(task: Arc<dyn DeliveryTask>, topic: &Topic) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| Arc::clone(&task).deliver(topic)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(topic = %topic.name(), task = ?task, error = %e, "Delivery task failed");
            metrics::record_task_failure("error");
        }
        Err(_) => {
            error!(topic = %topic.name(), task = ?task, "Delivery task panicked");
            metrics::record_task_failure("panic");
        }
    }
}
