use std::sync::Arc;

use thiserror::Error;

/// Everything that can go wrong inside the runtime, from a task's own
/// failure to a contract violation at a call site.
///
/// User errors are carried behind an [`Arc`] so that a stored failure can be
/// observed more than once (every observation sees the same error).
#[derive(Debug, Clone, Error)]
pub enum TameError {
    /// The error a task's body returned. Stored in the task's
    /// [`DelayedResult`](crate::DelayedResult) until a waiter observes it or
    /// the owning scope re-raises it at exit.
    #[error("{0}")]
    Task(Arc<anyhow::Error>),

    /// The task was cancelled cooperatively. Cancellation counts as already
    /// observed: it never resurfaces at scope exit.
    #[error("task was cancelled")]
    Cancelled,

    /// `value()` was read before the result was fulfilled or failed.
    #[error("result is not available yet")]
    NotAvailable,

    /// Two or more unconsumed failures were found when the scope drained.
    #[error(transparent)]
    Aggregate(AggregateError),

    /// A blocking drive of the event loop was requested from inside a
    /// running event loop.
    #[error("cannot drive the event loop from inside a running event loop")]
    BlockingReentry,

    /// The scope has closed and no longer accepts tasks.
    #[error("scope is closed and no longer accepts tasks")]
    ScopeClosed,

    /// `exit_async` was called on a scope that owns its event loop. Nothing
    /// would drive that loop, so the scope must exit through the blocking
    /// path instead.
    #[error("a scope entered without a running event loop must exit through `AsyncScope::exit`")]
    BlockingExitRequired,

    /// Building a fresh event loop failed.
    #[error("failed to start an event loop: {0}")]
    LoopInit(Arc<std::io::Error>),
}

impl TameError {
    pub(crate) fn failed(error: anyhow::Error) -> Self {
        TameError::Task(Arc::new(error))
    }

    /// True for the distinguished cancellation kind.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TameError::Cancelled)
    }

    /// The task's own error, if this is a task failure.
    pub fn user_error(&self) -> Option<&anyhow::Error> {
        match self {
            TameError::Task(error) => Some(error),
            _ => None,
        }
    }
}

/// Two or more unconsumed task failures raised together at scope exit.
///
/// The contained errors appear in the order the failing tasks were scheduled
/// onto the scope.
#[derive(Debug, Clone, Error)]
#[error("{} scoped tasks failed", .errors.len())]
pub struct AggregateError {
    errors: Vec<TameError>,
}

impl AggregateError {
    pub(crate) fn new(errors: Vec<TameError>) -> Self {
        debug_assert!(errors.len() >= 2);
        Self { errors }
    }

    pub fn errors(&self) -> &[TameError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<TameError> {
        self.errors
    }
}
