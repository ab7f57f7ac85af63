//! Scope lifecycle: drain ordering, nesting, error aggregation and
//! consumption, cancellation policies, and the misuse paths.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_tamer::{AsyncScope, ErrorMode, ExitMode, Phase, TameError};
use tokio::time::sleep;

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type Log = Arc<Mutex<Vec<&'static str>>>;

async fn run_forever() -> anyhow::Result<()> {
    loop {
        sleep(Duration::from_millis(10)).await;
    }
}

fn record(log: &Log, entry: &'static str) {
    log.lock().unwrap().push(entry);
}

fn timed_task(log: &Log, entry: &'static str, delay: Duration) -> impl std::future::Future<Output = anyhow::Result<()>> {
    let log = log.clone();
    async move {
        sleep(delay).await;
        record(&log, entry);
        Ok(())
    }
}

#[test]
fn completion_order_follows_timers_not_scheduling_order() {
    trace_init();
    let log: Log = Default::default();

    let scope = AsyncScope::enter().unwrap();
    scope
        .spawn(timed_task(&log, "A", Duration::from_millis(120)))
        .unwrap();
    scope
        .spawn(timed_task(&log, "B", Duration::from_millis(60)))
        .unwrap();
    scope.exit().unwrap();

    assert_eq!(*log.lock().unwrap(), ["B", "A"]);
}

#[tokio::test(start_paused = true)]
async fn scheduling_order_does_not_dictate_completion_order() {
    let log: Log = Default::default();

    let scope = AsyncScope::enter().unwrap();
    scope
        .spawn(timed_task(&log, "A", Duration::from_millis(200)))
        .unwrap();
    scope
        .spawn(timed_task(&log, "B", Duration::from_millis(100)))
        .unwrap();
    scope.exit_async().await.unwrap();

    assert_eq!(*log.lock().unwrap(), ["B", "A"]);
}

#[test]
fn outer_tasks_progress_while_an_inner_scope_drains() {
    trace_init();
    let log: Log = Default::default();

    let outer = AsyncScope::enter().unwrap();
    outer
        .spawn(timed_task(&log, "outer-short", Duration::from_millis(100)))
        .unwrap();
    outer
        .spawn(timed_task(&log, "outer-mid", Duration::from_millis(150)))
        .unwrap();

    // The inner scope shares the outer flow's loop, so outer timers keep
    // firing while it drains.
    let inner = AsyncScope::enter().unwrap();
    inner
        .spawn(timed_task(&log, "inner-short", Duration::from_millis(110)))
        .unwrap();
    inner
        .spawn(timed_task(&log, "inner-long", Duration::from_millis(200)))
        .unwrap();
    inner.exit().unwrap();

    // Nothing scheduled after the inner drain runs before it closes.
    outer
        .spawn(timed_task(&log, "outer-late", Duration::from_millis(50)))
        .unwrap();
    outer.exit().unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        ["outer-short", "inner-short", "outer-mid", "inner-long", "outer-late"]
    );
}

#[test]
fn unobserved_failure_raises_at_scope_exit() {
    let scope = AsyncScope::enter().unwrap();
    scope
        .spawn(async { Err::<(), _>(anyhow::anyhow!("boom")) })
        .unwrap();
    let err = scope.exit().unwrap_err();
    assert_eq!(err.to_string(), "boom");
}

#[test]
fn observed_failure_does_not_raise_again_at_exit() {
    let scope = AsyncScope::enter().unwrap();
    let task = scope
        .spawn(async { Err::<(), _>(anyhow::anyhow!("boom")) })
        .unwrap();

    let err = task.block().unwrap_err();
    assert!(matches!(err, TameError::Task(_)));

    // Consumed: the exit path stays clean.
    scope.exit().unwrap();
}

#[test]
fn multiple_unconsumed_failures_aggregate() {
    let scope = AsyncScope::builder()
        .error_mode(ErrorMode::Ignore)
        .enter()
        .unwrap();
    scope
        .spawn(async { Err::<(), _>(anyhow::anyhow!("first")) })
        .unwrap();
    scope
        .spawn(async { Err::<(), _>(anyhow::anyhow!("second")) })
        .unwrap();

    match scope.exit().unwrap_err() {
        TameError::Aggregate(aggregate) => {
            let messages: Vec<_> = aggregate.errors().iter().map(|e| e.to_string()).collect();
            assert_eq!(messages, ["first", "second"]);
        }
        other => panic!("expected an aggregate, got {other:?}"),
    }
}

#[test]
fn cancel_exit_mode_stops_a_nonterminating_task() {
    trace_init();
    let scope = AsyncScope::builder()
        .exit_mode(ExitMode::Cancel)
        .enter()
        .unwrap();
    let task = scope.spawn(run_forever()).unwrap();

    let started = Instant::now();
    scope.exit().unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(task.value(), Err(TameError::Cancelled)));
}

#[test]
fn first_failure_cancels_running_siblings() {
    trace_init();
    let scope = AsyncScope::enter().unwrap(); // error_mode defaults to cancel
    let slow = scope
        .spawn(async {
            sleep(Duration::from_secs(10)).await;
            anyhow::Ok(())
        })
        .unwrap();
    scope
        .spawn(async {
            sleep(Duration::from_millis(50)).await;
            Err::<(), _>(anyhow::anyhow!("early failure"))
        })
        .unwrap();

    let started = Instant::now();
    let err = scope.exit().unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(err.to_string(), "early failure");
    assert!(matches!(slow.value(), Err(TameError::Cancelled)));
}

#[test]
fn ignore_mode_lets_siblings_finish() {
    let finished = Arc::new(AtomicBool::new(false));
    let probe = finished.clone();

    let scope = AsyncScope::builder()
        .error_mode(ErrorMode::Ignore)
        .enter()
        .unwrap();
    scope
        .spawn(async { Err::<(), _>(anyhow::anyhow!("quick failure")) })
        .unwrap();
    let sibling = scope
        .spawn(async move {
            sleep(Duration::from_millis(60)).await;
            probe.store(true, Ordering::SeqCst);
            anyhow::Ok(())
        })
        .unwrap();

    let err = scope.exit().unwrap_err();
    assert_eq!(err.to_string(), "quick failure");
    assert!(finished.load(Ordering::SeqCst));
    assert!(sibling.value().is_ok());
}

#[test]
fn cancel_exit_applies_under_ignore_error_mode() {
    let scope = AsyncScope::builder()
        .exit_mode(ExitMode::Cancel)
        .error_mode(ErrorMode::Ignore)
        .enter()
        .unwrap();
    let failing = scope
        .spawn(async {
            sleep(Duration::from_millis(20)).await;
            Err::<(), _>(anyhow::anyhow!("observed failure"))
        })
        .unwrap();
    let eternal = scope.spawn(run_forever()).unwrap();

    // Observe the failure mid-flight; ignore mode leaves the sibling alone.
    let err = failing.block().unwrap_err();
    assert_eq!(err.to_string(), "observed failure");
    assert!(!eternal.is_ready());

    // The cancel exit mode still reaps it.
    scope.exit().unwrap();
    assert!(matches!(eternal.value(), Err(TameError::Cancelled)));
}

#[test]
fn every_task_is_terminal_once_the_scope_closes() {
    let scope = AsyncScope::enter().unwrap();
    let tasks: Vec<_> = (0u32..4)
        .map(|i| {
            scope
                .spawn(async move {
                    sleep(Duration::from_millis(10 * u64::from(i) + 10)).await;
                    anyhow::Ok(i)
                })
                .unwrap()
        })
        .collect();

    scope.exit().unwrap();
    for (i, task) in tasks.iter().enumerate() {
        assert!(task.is_ready());
        assert_eq!(task.value().unwrap(), i as u32);
    }
}

#[tokio::test]
async fn empty_scope_closes_without_driving_the_loop() {
    // A blocking exit inside a running loop would be a reentry error if it
    // had to drive anything; with nothing scheduled it just closes.
    let scope = AsyncScope::enter().unwrap();
    scope.exit().unwrap();
}

#[test]
fn empty_scope_closes_cleanly_from_sync() {
    let scope = AsyncScope::enter().unwrap();
    assert_eq!(scope.phase(), Phase::Open);
    scope.exit().unwrap();
}

#[tokio::test]
async fn blocking_exit_with_live_tasks_inside_a_loop_is_rejected() {
    let scope = AsyncScope::enter().unwrap();
    scope.spawn(async { anyhow::Ok(()) }).unwrap();
    assert!(matches!(scope.exit(), Err(TameError::BlockingReentry)));
}

#[test]
fn sync_entered_scope_requires_the_blocking_exit() {
    let scope = AsyncScope::enter().unwrap();
    scope.spawn(async { anyhow::Ok(()) }).unwrap();

    let runtime = tokio::runtime::Runtime::new().unwrap();
    assert!(matches!(
        runtime.block_on(scope.exit_async()),
        Err(TameError::BlockingExitRequired)
    ));
}

#[tokio::test]
async fn spawning_onto_a_closed_scope_is_rejected() {
    let scope = AsyncScope::enter().unwrap();
    let handle = scope.handle();
    scope.exit_async().await.unwrap();

    assert!(matches!(
        handle.spawn(async { anyhow::Ok(()) }),
        Err(TameError::ScopeClosed)
    ));
}

#[tokio::test]
async fn tasks_may_schedule_siblings_onto_their_own_scope() {
    let ran = Arc::new(AtomicBool::new(false));
    let probe = ran.clone();

    let scope = AsyncScope::enter().unwrap();
    let handle = scope.handle();
    scope
        .spawn(async move {
            sleep(Duration::from_millis(10)).await;
            handle.spawn(async move {
                probe.store(true, Ordering::SeqCst);
                anyhow::Ok(())
            })?;
            anyhow::Ok(())
        })
        .unwrap();

    scope.exit_async().await.unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn child_scope_failure_reaches_the_parent_as_one_error() {
    let outer = AsyncScope::enter().unwrap();
    outer
        .spawn(async {
            let inner = AsyncScope::enter()?;
            inner.spawn(async { Err::<(), _>(anyhow::anyhow!("inner boom")) })?;
            inner.exit_async().await?;
            Ok::<(), TameError>(())
        })
        .unwrap();

    let err = outer.exit_async().await.unwrap_err();
    assert_eq!(err.to_string(), "inner boom");
}

#[tokio::test]
async fn dropping_a_scope_cancels_its_tasks() {
    let scope = AsyncScope::enter().unwrap();
    let task = scope
        .spawn(async {
            sleep(Duration::from_secs(10)).await;
            anyhow::Ok(())
        })
        .unwrap();

    drop(scope);
    sleep(Duration::from_millis(20)).await;

    assert!(matches!(task.value(), Err(TameError::Cancelled)));
}

#[test]
#[should_panic(expected = "kaboom")]
fn task_panics_resurface_at_exit() {
    async fn go_kaboom() -> anyhow::Result<()> {
        panic!("kaboom")
    }

    let scope = AsyncScope::enter().unwrap();
    scope.spawn(go_kaboom()).unwrap();
    let _ = scope.exit();
}
