use std::{
    fmt,
    sync::{Arc, Mutex},
};

use crate::{context::LoopDriver, error::TameError};

/// A one-shot cell holding either a value or an error produced by a scoped
/// task.
///
/// The handle decouples the producing task from its consumers: it can be
/// awaited from async code, blocked on from sync code, or read without
/// waiting. A handle is a value, not a running computation — it cannot
/// cancel the task behind it and holders never own that task.
///
/// A stored error stays put until somebody observes it; the first
/// observation marks it *consumed*, which removes it from the owning
/// scope's end-of-exit aggregation. Observing the same result again is
/// fine: a fulfilled cell hands out clones of the value, a failed cell
/// re-raises the same error.
pub struct DelayedResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DelayedResult<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for DelayedResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match &*self.shared.state.lock().unwrap() {
            State::Pending { .. } => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Failed { .. } => "failed",
        };
        f.debug_struct("DelayedResult").field("state", &tag).finish()
    }
}

pub(crate) struct Shared<T> {
    state: Mutex<State<T>>,
    /// Completion signal. Nothing is ever sent; the sender half lives in the
    /// pending state and its drop on settlement closes the channel, waking
    /// every waiter at once.
    completion: async_channel::Receiver<()>,
    driver: LoopDriver,
}

enum State<T> {
    Pending { _signal: async_channel::Sender<()> },
    Fulfilled(T),
    Failed { error: TameError, consumed: bool },
}

impl<T: Send + 'static> DelayedResult<T> {
    pub(crate) fn new(driver: LoopDriver) -> (DelayedResult<T>, Completer<T>) {
        let (signal, completion) = async_channel::bounded(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Pending { _signal: signal }),
            completion,
            driver,
        });
        (
            DelayedResult {
                shared: shared.clone(),
            },
            Completer {
                shared: Some(shared),
            },
        )
    }

    /// The scope-facing view of this cell, used at drain time.
    pub(crate) fn observer(&self) -> Arc<dyn ChildState> {
        self.shared.clone()
    }
}

impl<T> DelayedResult<T> {
    /// Suspend until the result is terminal, then observe it.
    ///
    /// On a fulfilled cell this returns the value; on a failed cell it
    /// returns the stored error and marks it consumed.
    pub async fn wait(&self) -> Result<T, TameError>
    where
        T: Clone,
    {
        self.settled().await;
        self.value()
    }

    /// Like [`wait`](Self::wait), but drives the event loop from a
    /// synchronous caller. Fails fast with [`TameError::BlockingReentry`]
    /// when called from inside a running loop.
    pub fn block(&self) -> Result<T, TameError>
    where
        T: Clone,
    {
        self.shared.driver.block_on(self.settled())?;
        self.value()
    }

    /// Observe the result without waiting.
    ///
    /// Pending cells yield [`TameError::NotAvailable`]; failed cells yield
    /// the stored error and mark it consumed.
    pub fn value(&self) -> Result<T, TameError>
    where
        T: Clone,
    {
        let mut state = self.shared.state.lock().unwrap();
        match &mut *state {
            State::Pending { .. } => Err(TameError::NotAvailable),
            State::Fulfilled(value) => Ok(value.clone()),
            State::Failed { error, consumed } => {
                *consumed = true;
                Err(error.clone())
            }
        }
    }

    /// True once the result is fulfilled or failed.
    pub fn is_ready(&self) -> bool {
        !matches!(
            &*self.shared.state.lock().unwrap(),
            State::Pending { .. }
        )
    }

    async fn settled(&self) {
        // Recv only returns once the sender half is dropped, which happens
        // exactly when the cell settles.
        let _ = self.shared.completion.recv().await;
    }
}

/// The producer half of a [`DelayedResult`], held by the backing task.
///
/// Fulfilment and failure consume the completer, so settling a cell twice
/// is unrepresentable from task code. Dropping a completer that never
/// settled means the backing task was torn down mid-flight: the cell is
/// marked failed with the cancellation kind, already consumed.
pub(crate) struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Completer<T> {
    pub(crate) fn fulfill(mut self, value: T) {
        self.settle(State::Fulfilled(value));
    }

    pub(crate) fn fail(mut self, error: anyhow::Error) {
        self.settle(State::Failed {
            error: TameError::failed(error),
            consumed: false,
        });
    }

    fn settle(&mut self, next: State<T>) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let mut state = shared.state.lock().unwrap();
        assert!(
            matches!(*state, State::Pending { .. }),
            "delayed result settled twice"
        );
        *state = next;
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let mut state = shared.state.lock().unwrap();
        if matches!(*state, State::Pending { .. }) {
            *state = State::Failed {
                error: TameError::Cancelled,
                consumed: true,
            };
        }
    }
}

/// What a scope needs to know about a child at drain time.
pub(crate) trait ChildState: Send + Sync {
    /// The stored error, if the child failed and nobody observed it.
    /// Cancellation never shows up here.
    fn unconsumed_error(&self) -> Option<TameError>;
}

impl<T: Send + 'static> ChildState for Shared<T> {
    fn unconsumed_error(&self) -> Option<TameError> {
        match &*self.state.lock().unwrap() {
            State::Failed {
                error,
                consumed: false,
            } => Some(error.clone()),
            _ => None,
        }
    }
}
