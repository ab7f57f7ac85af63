use std::{
    future::Future,
    sync::{Arc, Mutex, Weak},
};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, trace, warn};

use crate::{
    context::{self, LoopDriver},
    delayed::{ChildState, DelayedResult},
    error::{AggregateError, TameError},
};

/// What happens to still-running tasks when the scope exits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ExitMode {
    /// Wait for every owned task to finish naturally.
    #[default]
    Wait,
    /// Cancel every still-running task, then wait for the cancellations to
    /// be observed.
    Cancel,
}

/// How the scope reacts when an owned task fails mid-flight.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ErrorMode {
    /// Cancel all sibling tasks in the same scope as soon as one fails.
    #[default]
    Cancel,
    /// Leave siblings undisturbed; the error is carried until scope exit.
    Ignore,
}

/// Lifecycle of a scope.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Open,
    Draining,
    Closed,
}

/// Configuration for a scope, built before entry.
///
/// ```rust
/// # fn main() -> Result<(), async_tamer::TameError> {
/// let scope = async_tamer::AsyncScope::builder()
///     .exit_mode(async_tamer::ExitMode::Cancel)
///     .enter()?;
/// scope.exit()?;
/// # Ok(()) }
/// ```
#[derive(Copy, Clone, Debug, Default)]
pub struct ScopeBuilder {
    exit_mode: ExitMode,
    error_mode: ErrorMode,
}

impl ScopeBuilder {
    pub fn exit_mode(mut self, mode: ExitMode) -> Self {
        self.exit_mode = mode;
        self
    }

    pub fn error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    /// Enter a scope in the current context.
    ///
    /// From async context the scope borrows the ambient event loop. From
    /// sync context it reuses the loop of the innermost enclosing
    /// sync-entered scope on this thread, or builds a fresh one.
    pub fn enter(self) -> Result<AsyncScope, TameError> {
        let driver = LoopDriver::acquire()?;
        let core = Arc::new(ScopeCore {
            state: Mutex::new(ScopeState {
                phase: Phase::Open,
                children: Vec::new(),
            }),
            exit_mode: self.exit_mode,
            error_mode: self.error_mode,
            driver,
        });
        context::register_scope(&core);
        debug!(exit_mode = ?self.exit_mode, error_mode = ?self.error_mode, "entered scope");
        Ok(AsyncScope { core })
    }
}

/// A lexically delimited region owning a set of tasks and their completion
/// policy.
///
/// Tasks scheduled onto a scope start eagerly and are guaranteed to be
/// terminal by the time the scope closes. Unconsumed failures are re-raised
/// from the exit call, one as-is, several as a [`TameError::Aggregate`].
///
/// Scopes nest: an inner scope drains before the surrounding code
/// continues, while tasks of the outer scope keep progressing on the shared
/// loop. Dropping a scope without exiting it cancels its tasks without
/// waiting for them; the supported path is an explicit [`exit`](Self::exit)
/// or [`exit_async`](Self::exit_async).
pub struct AsyncScope {
    core: Arc<ScopeCore>,
}

impl AsyncScope {
    pub fn builder() -> ScopeBuilder {
        ScopeBuilder::default()
    }

    /// Enter a scope with the default configuration.
    pub fn enter() -> Result<AsyncScope, TameError> {
        ScopeBuilder::default().enter()
    }

    /// Schedule a task onto this scope.
    ///
    /// The task starts eagerly on the scope's loop; scheduling itself never
    /// suspends. The returned [`DelayedResult`] is the only way to observe
    /// the task's outcome before the scope exits.
    ///
    /// ```rust
    /// # fn main() -> Result<(), async_tamer::TameError> {
    /// let scope = async_tamer::AsyncScope::enter()?;
    /// let task = scope.spawn(async { anyhow::Ok(40 + 2) })?;
    /// assert_eq!(task.block()?, 42);
    /// scope.exit()?;
    /// # Ok(()) }
    /// ```
    pub fn spawn<T, E, F>(&self, future: F) -> Result<DelayedResult<T>, TameError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.core.spawn(future)
    }

    /// A weak, cloneable spawner for this scope, usable from inside owned
    /// tasks to schedule siblings.
    pub fn handle(&self) -> ScopeHandle {
        ScopeHandle {
            core: Arc::downgrade(&self.core),
        }
    }

    pub fn phase(&self) -> Phase {
        self.core.state.lock().unwrap().phase
    }

    pub fn exit_mode(&self) -> ExitMode {
        self.core.exit_mode
    }

    pub fn error_mode(&self) -> ErrorMode {
        self.core.error_mode
    }

    /// Exit the scope from a synchronous caller, blocking until every owned
    /// task is terminal.
    ///
    /// This is the switch into an async frame: a sync-entered scope drives
    /// its own loop here. Calling it from inside a running loop fails fast
    /// with [`TameError::BlockingReentry`]. A scope with nothing scheduled
    /// closes without driving the loop at all.
    pub fn exit(self) -> Result<(), TameError> {
        if self.core.close_if_idle() {
            return Ok(());
        }
        self.core.driver.block_on(self.core.drain())?
    }

    /// Exit the scope from an asynchronous caller.
    ///
    /// Only valid for scopes that borrowed the ambient loop: a scope that
    /// owns its loop has nobody to drive it here and must use
    /// [`exit`](Self::exit).
    pub async fn exit_async(self) -> Result<(), TameError> {
        if self.core.close_if_idle() {
            return Ok(());
        }
        if self.core.driver.is_owned() {
            return Err(TameError::BlockingExitRequired);
        }
        self.core.drain().await
    }
}

impl Drop for AsyncScope {
    fn drop(&mut self) {
        context::forget_scope(&self.core);
        let mut state = self.core.state.lock().unwrap();
        if state.phase != Phase::Closed {
            warn!(
                tasks = state.children.len(),
                "scope dropped before exit; cancelling its tasks"
            );
            for child in &state.children {
                child.abort.abort();
            }
            state.phase = Phase::Closed;
        }
    }
}

/// A weak spawner handed out by [`AsyncScope::handle`].
///
/// Tasks scheduled through a handle join the scope's child list and
/// participate in its drain exactly like tasks scheduled directly. Once the
/// scope has closed, spawning reports [`TameError::ScopeClosed`].
#[derive(Clone)]
pub struct ScopeHandle {
    core: Weak<ScopeCore>,
}

impl ScopeHandle {
    pub fn spawn<T, E, F>(&self, future: F) -> Result<DelayedResult<T>, TameError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        match self.core.upgrade() {
            Some(core) => core.spawn(future),
            None => Err(TameError::ScopeClosed),
        }
    }
}

pub(crate) struct ScopeCore {
    state: Mutex<ScopeState>,
    exit_mode: ExitMode,
    error_mode: ErrorMode,
    pub(crate) driver: LoopDriver,
}

struct ScopeState {
    phase: Phase,
    /// Child slots in scheduling order. Slots are never removed before the
    /// scope closes, so every result stays reachable for aggregation.
    children: Vec<Child>,
}

struct Child {
    observer: Arc<dyn ChildState>,
    abort: AbortHandle,
    /// Taken by the drain; `None` once the child has been joined.
    join: Option<JoinHandle<()>>,
}

impl ScopeCore {
    fn spawn<T, E, F>(self: &Arc<Self>, future: F) -> Result<DelayedResult<T>, TameError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();
        if state.phase == Phase::Closed {
            return Err(TameError::ScopeClosed);
        }

        let (result, completer) = DelayedResult::new(self.driver.clone());
        let scope = Arc::downgrade(self);
        let join = self.driver.handle().spawn(async move {
            match future.await {
                Ok(value) => completer.fulfill(value),
                Err(error) => {
                    completer.fail(error.into());
                    if let Some(scope) = scope.upgrade() {
                        scope.child_failed();
                    }
                }
            }
        });

        trace!(task = state.children.len(), "scheduled task on scope");
        state.children.push(Child {
            observer: result.observer(),
            abort: join.abort_handle(),
            join: Some(join),
        });
        Ok(result)
    }

    /// Mid-flight reaction to a failing child.
    fn child_failed(&self) {
        if self.error_mode != ErrorMode::Cancel {
            return;
        }
        let state = self.state.lock().unwrap();
        if state.phase == Phase::Closed {
            return;
        }
        debug!("task failed; cancelling its siblings");
        for child in &state.children {
            child.abort.abort();
        }
    }

    /// Close without driving the loop, if nothing was ever scheduled.
    fn close_if_idle(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.children.is_empty() {
            state.phase = Phase::Closed;
            true
        } else {
            false
        }
    }

    /// Bring every owned task to a terminal state, then re-raise whatever
    /// failed and was never observed.
    async fn drain(&self) -> Result<(), TameError> {
        {
            let mut state = self.state.lock().unwrap();
            state.phase = Phase::Draining;
            debug!(tasks = state.children.len(), exit_mode = ?self.exit_mode, "draining scope");
        }

        // Tasks may keep scheduling siblings onto the scope while we wait,
        // so keep joining until a pass finds nothing new. The phase flips to
        // closed in the same critical section that observes the empty batch,
        // so no child can slip in unjoined.
        loop {
            let batch: Vec<JoinHandle<()>> = {
                let mut state = self.state.lock().unwrap();
                let batch: Vec<_> = state
                    .children
                    .iter_mut()
                    .filter_map(|child| {
                        if self.exit_mode == ExitMode::Cancel {
                            child.abort.abort();
                        }
                        child.join.take()
                    })
                    .collect();
                if batch.is_empty() {
                    state.phase = Phase::Closed;
                }
                batch
            };
            if batch.is_empty() {
                break;
            }

            let mut joins: FuturesUnordered<JoinHandle<()>> = batch.into_iter().collect();
            while let Some(joined) = joins.next().await {
                match joined {
                    Ok(()) => {}
                    Err(err) if err.is_cancelled() => {}
                    Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                    Err(_) => {}
                }
            }
        }

        let mut failures: Vec<TameError> = {
            let state = self.state.lock().unwrap();
            state
                .children
                .iter()
                .filter_map(|child| child.observer.unconsumed_error())
                .collect()
        };
        debug!(failures = failures.len(), "scope closed");

        if failures.is_empty() {
            Ok(())
        } else if failures.len() == 1 {
            Err(failures.remove(0))
        } else {
            Err(TameError::Aggregate(AggregateError::new(failures)))
        }
    }
}
