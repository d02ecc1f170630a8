//! Structured-concurrency task tree
//!
//! Every long-lived component owns a [`Task`]: a node in a cancellation tree
//! rooted at the process [`Root`]. A task can:
//! - spawn subtasks, either independent (own signal, tracked and waited on) or
//!   attached (sharing the parent's signal, not tracked)
//! - carry a reason with its cancellation ([`Cause`])
//! - run cleanup callbacks when it is cancelled or when it finishes
//! - drain its children and callbacks with a bounded wait on [`Task::finish`]
//!
//! Cancellation never terminates anything by force. A task that observes its
//! signal is responsible for calling its own `finish`; parents only signal and
//! then wait with a ceiling, reporting the stragglers when it is exceeded.

mod callback;
mod pool;
mod root;

pub use callback::CallbackKind;
pub use pool::{TaskPool, POOL_CAPACITY};
pub use root::{shutdown_signal, Root};

use callback::{Callback, CallbackFn};
use parking_lot::Mutex;
use pool::TaskBook;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

/// How long a drain stage waits before reporting the task as stuck
pub const STUCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Reason used by the root on graceful shutdown
pub const SHUTDOWN: &str = "shutdown";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Why a task was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause {
    /// Cancelled without a reason
    Canceled,
    Reason(Arc<str>),
}

impl Cause {
    pub fn reason(&self) -> Option<&str> {
        match self {
            Cause::Canceled => None,
            Cause::Reason(r) => Some(r),
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Canceled => f.write_str("canceled"),
            Cause::Reason(r) => f.write_str(r),
        }
    }
}

impl From<&str> for Cause {
    fn from(reason: &str) -> Self {
        if reason.is_empty() {
            Cause::Canceled
        } else {
            Cause::Reason(Arc::from(reason))
        }
    }
}

impl From<String> for Cause {
    fn from(reason: String) -> Self {
        Cause::from(reason.as_str())
    }
}

/// Lifecycle of a task. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Active,
    /// Cancellation signal fired, `finish` not called yet
    Canceling,
    /// `finish` is waiting on children and callbacks
    Draining,
    Finished,
}

#[derive(Clone, Copy)]
enum Drain {
    Children,
    Callbacks,
}

/// Handle to a node in the task tree. Cloning is cheap.
///
/// Ownership flows strictly downward: a parent holds its tracked children,
/// a child only keeps a weak reference back to its parent.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    id: u64,
    name: String,
    full_name: String,
    parent: Option<Weak<TaskInner>>,
    independent: bool,
    token: CancellationToken,
    pool: Arc<TaskPool>,
    book: Mutex<TaskBook>,
    cause: Mutex<Option<Cause>>,
    finishing: AtomicBool,
    finished: AtomicBool,
    changed: Notify,
}

impl Task {
    pub(crate) fn new_root(pool: Arc<TaskPool>) -> Self {
        Self::build(
            "root".to_string(),
            "root".to_string(),
            None,
            true,
            CancellationToken::new(),
            pool,
        )
    }

    fn build(
        name: String,
        full_name: String,
        parent: Option<Weak<TaskInner>>,
        independent: bool,
        token: CancellationToken,
        pool: Arc<TaskPool>,
    ) -> Self {
        let book = pool.take();
        Self {
            inner: Arc::new(TaskInner {
                id: next_id(),
                name,
                full_name,
                parent,
                independent,
                token,
                pool,
                book: Mutex::new(book),
                cause: Mutex::new(None),
                finishing: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                changed: Notify::new(),
            }),
        }
    }

    /// Create a subtask.
    ///
    /// An independent subtask gets a signal derived from this task's and is
    /// tracked, so this task's `finish` waits for it. An attached subtask
    /// shares this task's signal and is not tracked.
    ///
    /// # Panics
    ///
    /// Panics if this task has already finished.
    pub fn subtask(&self, name: impl Into<String>, independent: bool) -> Task {
        let name = name.into();
        let full_name = format!("{}.{}", self.inner.full_name, name);
        let token = if independent {
            self.inner.token.child_token()
        } else {
            self.inner.token.clone()
        };

        let mut book = self.inner.book.lock();
        assert!(
            !self.inner.finished.load(Ordering::Acquire),
            "cannot create subtask {full_name:?}: task {self} is finished"
        );
        let child = Task::build(
            name,
            full_name,
            Some(Arc::downgrade(&self.inner)),
            independent,
            token,
            Arc::clone(&self.inner.pool),
        );
        if independent {
            book.children.insert(child.inner.id, child.clone());
        }
        child
    }

    /// Run `f` as soon as the cancellation signal fires.
    ///
    /// Callbacks run concurrently on the blocking pool; a panic is logged and
    /// does not affect other callbacks. Attached tasks forward the
    /// registration to their parent. Registering after the signal fired but
    /// before `finish` runs `f` immediately.
    ///
    /// # Panics
    ///
    /// Panics if `finish` has already been called on this task.
    pub fn on_cancel<F>(&self, about: impl Into<String>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.inner.independent {
            if let Some(parent) = self.parent() {
                parent.on_cancel(about, f);
                return;
            }
        }

        let about = about.into();
        let id = next_id();
        self.register(id, Callback::new(about.clone(), CallbackKind::OnCancel, None));

        let task = self.clone();
        tokio::spawn(async move {
            task.inner.token.cancelled().await;
            callback::invoke(&task, &about, CallbackKind::OnCancel, Box::new(f)).await;
            task.remove_callback(id);
        });
    }

    /// Run `f` when `finish` is called on this task, after its children have
    /// drained. Cancellation through an ancestor alone does not run it.
    ///
    /// # Panics
    ///
    /// Panics if `finish` has already been called on this task.
    pub fn on_finished<F>(&self, about: impl Into<String>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let func: CallbackFn = Box::new(f);
        self.register(
            next_id(),
            Callback::new(about.into(), CallbackKind::OnFinished, Some(func)),
        );
    }

    fn register(&self, id: u64, callback: Callback) {
        let mut book = self.inner.book.lock();
        assert!(
            !self.inner.finishing.load(Ordering::Acquire),
            "cannot register {} callback {:?}: task {} is finishing",
            callback.kind,
            callback.about,
            self
        );
        book.callbacks.insert(id, callback);
    }

    /// Cancel the task with `reason` and drain it.
    ///
    /// Idempotent: the first caller drains, later callers return at once.
    /// Each drain stage waits at most [`STUCK_TIMEOUT`] and then logs the
    /// pending children and callbacks instead of hanging.
    pub async fn finish(&self, reason: impl Into<Cause>) {
        self.finish_within(reason.into(), STUCK_TIMEOUT).await;
    }

    /// Drain with a custom ceiling per stage. Returns whether the drain was
    /// clean.
    pub(crate) async fn finish_within(&self, reason: Cause, ceiling: Duration) -> bool {
        if self.inner.finishing.swap(true, Ordering::AcqRel) {
            return true;
        }

        let inherited = if self.inner.token.is_cancelled() {
            self.inherited_cause()
        } else {
            None
        };
        let cause = inherited.unwrap_or(reason);
        *self.inner.cause.lock() = Some(cause.clone());
        debug!(task = %self, cause = %cause, "finishing task");

        if self.inner.independent {
            self.inner.token.cancel();
        }

        let children_done = self.drained(Drain::Children, ceiling).await;
        if !children_done {
            self.report_stuck("children", ceiling);
        }

        let pending: Vec<(u64, String, CallbackFn)> = {
            let mut book = self.inner.book.lock();
            book.callbacks
                .iter_mut()
                .filter_map(|(id, cb)| cb.func.take().map(|f| (*id, cb.about.clone(), f)))
                .collect()
        };
        for (id, about, func) in pending {
            let task = self.clone();
            tokio::spawn(async move {
                callback::invoke(&task, &about, CallbackKind::OnFinished, func).await;
                task.remove_callback(id);
            });
        }

        let callbacks_done = self.drained(Drain::Callbacks, ceiling).await;
        if !callbacks_done {
            self.report_stuck("callbacks", ceiling);
        }

        let clean = children_done && callbacks_done;
        self.mark_finished(clean);
        clean
    }

    fn mark_finished(&self, clean: bool) {
        let book = {
            let mut book = self.inner.book.lock();
            self.inner.finished.store(true, Ordering::Release);
            std::mem::take(&mut *book)
        };

        if self.inner.independent {
            if let Some(parent) = self.parent() {
                parent.remove_child(self.inner.id);
            }
        }
        if clean {
            self.inner.pool.put(book);
        }
        self.inner.changed.notify_waiters();
        debug!(task = %self, clean, "task finished");
    }

    async fn drained(&self, what: Drain, ceiling: Duration) -> bool {
        let deadline = Instant::now() + ceiling;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_drained(what) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_drained(what);
            }
        }
    }

    fn is_drained(&self, what: Drain) -> bool {
        let book = self.inner.book.lock();
        match what {
            Drain::Children => book.children.is_empty(),
            Drain::Callbacks => book.callbacks.is_empty(),
        }
    }

    fn remove_child(&self, id: u64) {
        self.inner.book.lock().children.remove(&id);
        self.inner.changed.notify_waiters();
    }

    fn remove_callback(&self, id: u64) {
        self.inner.book.lock().callbacks.remove(&id);
        self.inner.changed.notify_waiters();
    }

    fn report_stuck(&self, stage: &'static str, ceiling: Duration) {
        let pending = self.pending();
        warn!(
            task = %self,
            stage,
            timeout_ms = ceiling.as_millis() as u64,
            pending = ?pending,
            "task stuck while draining"
        );
    }

    /// Names of the tracked descendants and callbacks that have not completed.
    pub fn pending(&self) -> Vec<String> {
        let (children, callbacks): (Vec<Task>, Vec<String>) = {
            let book = self.inner.book.lock();
            (
                book.children.values().cloned().collect(),
                book.callbacks
                    .values()
                    .map(|cb| format!("{}: {} ({})", self.inner.full_name, cb.about, cb.kind))
                    .collect(),
            )
        };

        let mut out = callbacks;
        for child in children {
            out.push(child.full_name().to_string());
            out.extend(child.pending());
        }
        out
    }

    fn parent(&self) -> Option<Task> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Task { inner })
    }

    fn inherited_cause(&self) -> Option<Cause> {
        let mut current = self.parent();
        while let Some(task) = current {
            if let Some(cause) = task.inner.cause.lock().clone() {
                return Some(cause);
            }
            current = task.parent();
        }
        None
    }

    /// The reason this task was cancelled, if it carried one.
    ///
    /// When an ancestor's cancellation reached the task before its own
    /// `finish`, the nearest ancestor's reason wins over the reason passed to
    /// `finish`.
    pub fn finish_cause(&self) -> Option<Cause> {
        let own = self.inner.cause.lock().clone();
        let cause = match own {
            Some(cause) => Some(cause),
            None if self.inner.token.is_cancelled() => self.inherited_cause(),
            None => None,
        };
        cause.filter(|c| *c != Cause::Canceled)
    }

    /// Resolves once the cancellation signal fires
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The underlying cancellation token, for code that selects on it directly
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Resolves once `finish` has completed on this task
    pub async fn wait_finished(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }

    pub fn state(&self) -> TaskState {
        if self.is_finished() {
            TaskState::Finished
        } else if self.inner.finishing.load(Ordering::Acquire) {
            TaskState::Draining
        } else if self.is_cancelled() {
            TaskState::Canceling
        } else {
            TaskState::Active
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Ancestry-qualified name, e.g. `root.routes.idlewatcher.whoami`
    pub fn full_name(&self) -> &str {
        &self.inner.full_name
    }

    pub fn is_independent(&self) -> bool {
        self.inner.independent
    }

    /// Number of tracked children that have not finished
    pub fn children_len(&self) -> usize {
        self.inner.book.lock().children.len()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Task {}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.full_name)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.full_name)
            .field("state", &self.state())
            .finish()
    }
}
