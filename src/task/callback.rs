use super::Task;
use std::fmt;
use tracing::{error, warn};

pub(crate) type CallbackFn = Box<dyn FnOnce() + Send + 'static>;

/// When a callback runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// As soon as the task's cancellation signal fires
    OnCancel,
    /// When `finish` is called on the task itself
    OnFinished,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackKind::OnCancel => f.write_str("on_cancel"),
            CallbackKind::OnFinished => f.write_str("on_finished"),
        }
    }
}

/// A named unit of cleanup work registered on a task.
///
/// On-cancel callbacks hand their function to a waiter at registration, so
/// only the description stays here until the function has run.
pub(crate) struct Callback {
    pub(crate) about: String,
    pub(crate) kind: CallbackKind,
    pub(crate) func: Option<CallbackFn>,
}

impl Callback {
    pub(crate) fn new(about: String, kind: CallbackKind, func: Option<CallbackFn>) -> Self {
        Self { about, kind, func }
    }
}

/// Run a callback on the blocking pool. A panic is logged and contained.
pub(crate) async fn invoke(task: &Task, about: &str, kind: CallbackKind, func: CallbackFn) {
    match tokio::task::spawn_blocking(func).await {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            error!(task = %task, callback = about, %kind, "callback panicked");
        }
        Err(e) => {
            warn!(task = %task, callback = about, %kind, error = %e, "callback did not complete");
        }
    }
}
