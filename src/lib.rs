//! Structured concurrency for async Rust, with call-context adaptation.
//!
//! One async function definition can be invoked from three contexts, and in
//! each the runtime adapts how the body executes, how its result comes
//! back, and how its failures propagate:
//!
//! * a **synchronous** caller blocks on an event loop the runtime acquires
//!   or creates, and gets the value (or error) inline;
//! * an **asynchronous** caller gets an unstarted future and the error at
//!   the await site;
//! * a **scoped** caller hands the work to an [`AsyncScope`], which starts
//!   it eagerly, guarantees it is finished by scope exit, and re-raises
//!   any failure nobody observed.
//!
//! ```rust
//! let double = async_tamer::tamed(|x: u32| async move { Ok(x * 2) });
//!
//! // Synchronous context: blocking, value returned inline.
//! assert_eq!(double.blocking_call(21)?, 42);
//!
//! // Scoped context: eager start, joined before the scope closes.
//! let scope = async_tamer::AsyncScope::enter()?;
//! let task = double.spawn_in(&scope, 4)?;
//! assert_eq!(task.block()?, 8);
//! scope.exit()?;
//! # Ok::<(), async_tamer::TameError>(())
//! ```
//!
//! # Scopes
//!
//! A scope is a lexically delimited region owning a set of tasks. Exit
//! drains it: every owned task reaches a terminal state before the
//! surrounding flow continues, and failures that no waiter consumed are
//! re-raised from the exit call — one as-is, several as an aggregate.
//! Two knobs configure the boundary: [`ExitMode`] (wait for tasks, or
//! cancel them) and [`ErrorMode`] (a failing task cancels its siblings, or
//! is carried silently until exit).
//!
//! Scopes nest within one flow of control and share its event loop, so
//! tasks of an outer scope keep making progress while an inner scope
//! drains.
//!
//! # Cancellation
//!
//! Cancellation is cooperative: a cancelled task stops at its next
//! suspension point and its [`DelayedResult`] reports the distinguished
//! [`TameError::Cancelled`] kind, which never resurfaces at scope exit.

mod context;
mod delayed;
mod error;
mod scope;
mod tamed;

pub use crate::context::CallContext;
pub use crate::delayed::DelayedResult;
pub use crate::error::{AggregateError, TameError};
pub use crate::scope::{AsyncScope, ErrorMode, ExitMode, Phase, ScopeBuilder, ScopeHandle};
pub use crate::tamed::{tamed, Tamed, TamedCall};

/// Creates an async scope, runs `$body` against it, and drains it, as one
/// future of `Result<R, TameError>`.
///
/// The scope enters in the ambient event loop, so this form is for
/// asynchronous callers; a synchronous flow uses [`blocking_scope`]. An
/// optional first argument supplies a configured [`ScopeBuilder`].
///
/// ```rust
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let out = async_tamer::async_scope!(|scope| {
///     let task = scope.spawn(async { anyhow::Ok(1 + 1) }).unwrap();
///     task.wait().await.unwrap()
/// })
/// .await
/// .unwrap();
/// assert_eq!(out, 2);
/// # });
/// ```
#[macro_export]
macro_rules! async_scope {
    (|$scope:ident| $body:expr) => {
        $crate::async_scope!($crate::AsyncScope::builder(), |$scope| $body)
    };
    ($builder:expr, |$scope:ident| $body:expr) => {
        async {
            let __scope = $crate::ScopeBuilder::enter($builder)?;
            let __out = {
                let $scope = &__scope;
                async move { $body }.await
            };
            __scope.exit_async().await?;
            ::core::result::Result::<_, $crate::TameError>::Ok(__out)
        }
    };
}

/// Declaration-site sugar for [`tamed`].
///
/// ```rust
/// let greet = async_tamer::tamed!(|name: &'static str| { Ok(format!("hello {name}")) });
/// assert_eq!(greet.blocking_call("tamer").unwrap(), "hello tamer");
/// ```
#[macro_export]
macro_rules! tamed {
    (|$arg:ident : $ty:ty| $body:expr) => {
        $crate::tamed(move |$arg: $ty| async move { $body })
    };
    (|$arg:ident| $body:expr) => {
        $crate::tamed(move |$arg| async move { $body })
    };
}

/// Enter a default-configured scope, run a synchronous closure against it,
/// and drain it, blocking until every scheduled task is terminal.
pub fn blocking_scope<R>(body: impl FnOnce(&AsyncScope) -> R) -> Result<R, TameError> {
    blocking_scope_with(ScopeBuilder::default(), body)
}

/// [`blocking_scope`] with an explicit [`ScopeBuilder`].
///
/// Fails fast with [`TameError::BlockingReentry`] when called from inside a
/// running event loop.
pub fn blocking_scope_with<R>(
    builder: ScopeBuilder,
    body: impl FnOnce(&AsyncScope) -> R,
) -> Result<R, TameError> {
    if CallContext::current() == CallContext::Async {
        return Err(TameError::BlockingReentry);
    }
    let scope = builder.enter()?;
    let out = body(&scope);
    scope.exit()?;
    Ok(out)
}
