use std::{
    cell::RefCell,
    future::Future,
    sync::{Arc, Weak},
};

use tokio::runtime::{Builder, Handle, Runtime};

use crate::{error::TameError, scope::ScopeCore, AsyncScope};

/// The concurrency context a call site finds itself in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallContext {
    /// No event loop is running the current call chain. Adapters must
    /// create or reuse a loop themselves before doing async work.
    Sync,
    /// An event loop is actively running the current call chain, so
    /// suspension is possible.
    Async,
    /// The caller handed an explicit scope to schedule onto.
    Scoped,
}

impl CallContext {
    /// Probe the current context, honoring an explicit scope argument.
    ///
    /// ```rust
    /// assert_eq!(async_tamer::CallContext::current(), async_tamer::CallContext::Sync);
    /// ```
    pub fn detect(scope: Option<&AsyncScope>) -> CallContext {
        if scope.is_some() {
            CallContext::Scoped
        } else if Handle::try_current().is_ok() {
            CallContext::Async
        } else {
            CallContext::Sync
        }
    }

    /// [`CallContext::detect`] without a scope argument.
    pub fn current() -> CallContext {
        CallContext::detect(None)
    }
}

/// The event loop a scope (or a scope-less blocking call) schedules onto:
/// either a loop we built ourselves for a sync-entered flow, or the ambient
/// loop already running the caller.
#[derive(Clone)]
pub(crate) enum LoopDriver {
    Owned(Arc<Runtime>),
    Ambient(Handle),
}

impl LoopDriver {
    /// Pick a driver for the current call site: the ambient loop if one is
    /// running, else the loop of the innermost sync-entered scope on this
    /// thread, else a fresh current-thread loop.
    pub(crate) fn acquire() -> Result<LoopDriver, TameError> {
        if let Ok(handle) = Handle::try_current() {
            return Ok(LoopDriver::Ambient(handle));
        }
        if let Some(driver) = inherited_driver() {
            return Ok(driver);
        }
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TameError::LoopInit(Arc::new(e)))?;
        Ok(LoopDriver::Owned(Arc::new(runtime)))
    }

    pub(crate) fn handle(&self) -> Handle {
        match self {
            LoopDriver::Owned(runtime) => runtime.handle().clone(),
            LoopDriver::Ambient(handle) => handle.clone(),
        }
    }

    /// The blocking-run primitive. Re-entering it from inside a running
    /// loop is a contract violation and fails fast.
    pub(crate) fn block_on<F: Future>(&self, future: F) -> Result<F::Output, TameError> {
        if Handle::try_current().is_ok() {
            return Err(TameError::BlockingReentry);
        }
        Ok(match self {
            LoopDriver::Owned(runtime) => runtime.block_on(future),
            LoopDriver::Ambient(handle) => handle.block_on(future),
        })
    }

    pub(crate) fn is_owned(&self) -> bool {
        matches!(self, LoopDriver::Owned(_))
    }
}

thread_local! {
    /// Sync-entered scopes currently open on this thread, innermost last.
    /// Used only so nested sync entries (and scope-less blocking calls made
    /// from inside a scope body) share one loop instead of stacking loops.
    /// Ambient-loop scopes are discoverable through tokio itself and are
    /// not recorded here.
    static SYNC_SCOPES: RefCell<Vec<Weak<ScopeCore>>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn register_scope(core: &Arc<ScopeCore>) {
    if core.driver.is_owned() {
        SYNC_SCOPES.with(|stack| stack.borrow_mut().push(Arc::downgrade(core)));
    }
}

pub(crate) fn forget_scope(core: &Arc<ScopeCore>) {
    SYNC_SCOPES.with(|stack| {
        stack
            .borrow_mut()
            .retain(|weak| weak.upgrade().is_some_and(|c| !Arc::ptr_eq(&c, core)));
    });
}

fn inherited_driver() -> Option<LoopDriver> {
    SYNC_SCOPES.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find_map(|weak| weak.upgrade())
            .map(|core| core.driver.clone())
    })
}
