use std::{future::Future, pin::Pin, sync::Arc, task::Poll};

use futures::{future::BoxFuture, FutureExt};

use crate::{
    context::{CallContext, LoopDriver},
    delayed::DelayedResult,
    error::TameError,
    scope::AsyncScope,
};

/// An async function adapted to its call context.
///
/// One definition, three call operations, three return shapes:
///
/// * [`blocking_call`](Self::blocking_call) — for synchronous callers;
///   acquires or creates an event loop, runs the body to completion, and
///   returns the value (or the error) inline.
/// * [`call`](Self::call) — for asynchronous callers; returns a
///   [`TamedCall`] future that does nothing until awaited, because nothing
///   owns the work's lifetime yet.
/// * [`spawn_in`](Self::spawn_in) — for scoped callers; hands the body to
///   the scope, which starts it eagerly and guarantees its completion, and
///   returns the task's [`DelayedResult`].
///
/// The three shapes are intentional and observable: callers pick the
/// operation, the adapter never papers over the difference. The scope is an
/// explicit parameter of `spawn_in`, so there is no reserved argument name
/// to collide with.
pub struct Tamed<A, T> {
    run: Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>,
}

impl<A, T> Clone for Tamed<A, T> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
        }
    }
}

/// Wrap an async function into a [`Tamed`] adapter.
///
/// ```rust
/// let double = async_tamer::tamed(|x: u32| async move { Ok(x * 2) });
/// assert_eq!(double.blocking_call(21).unwrap(), 42);
/// ```
pub fn tamed<A, T, F, Fut>(function: F) -> Tamed<A, T>
where
    A: 'static,
    T: Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Tamed {
        run: Arc::new(move |args| Box::pin(function(args))),
    }
}

impl<A: 'static, T: Send + 'static> Tamed<A, T> {
    /// Run the body to completion on an event loop driven by this thread
    /// and return its outcome inline.
    ///
    /// From inside a running loop this is a contract violation and fails
    /// fast with [`TameError::BlockingReentry`]; suspend-capable callers
    /// should use [`call`](Self::call) instead.
    pub fn blocking_call(&self, args: A) -> Result<T, TameError> {
        if CallContext::current() == CallContext::Async {
            return Err(TameError::BlockingReentry);
        }
        let driver = LoopDriver::acquire()?;
        driver.block_on((self.run)(args))?.map_err(TameError::failed)
    }

    /// Package the body as a future. No work begins until the returned
    /// [`TamedCall`] is awaited; errors raise at the await site.
    ///
    /// ```rust
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let double = async_tamer::tamed(|x: u32| async move { Ok(x * 2) });
    /// let pending = double.call(21); // nothing has run yet
    /// assert_eq!(pending.await.unwrap(), 42);
    /// # });
    /// ```
    pub fn call(&self, args: A) -> TamedCall<T> {
        TamedCall {
            future: (self.run)(args),
        }
    }

    /// Schedule the body onto `scope`. The task starts eagerly; the
    /// returned [`DelayedResult`] observes it.
    pub fn spawn_in(&self, scope: &AsyncScope, args: A) -> Result<DelayedResult<T>, TameError> {
        scope.spawn((self.run)(args))
    }
}

/// The unstarted awaitable returned by [`Tamed::call`].
pub struct TamedCall<T> {
    future: BoxFuture<'static, anyhow::Result<T>>,
}

impl<T> Future for TamedCall<T> {
    type Output = Result<T, TameError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.get_mut()
            .future
            .poll_unpin(cx)
            .map(|out| out.map_err(TameError::failed))
    }
}
