// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests against the in-process emulator.
//!
//! Each test starts its own emulator with a short poll interval, connects a
//! worker client to it and drives workflows through the public client API.
//!
//! Run with:
//! ```bash
//! cargo test -p cadenza-worker --test emulator_test
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cadenza_protocol::ErrorKind;
use cadenza_protocol::payloads::{
    ActivityOptions, ChildWorkflowOptions, DomainRegisterRequest, DomainUpdateRequest,
    LocalActivityOptions, StartWorkflowOptions,
};
use cadenza_worker::{
    Activity, ActivityContext, ActivityError, ActivityExit, Emulator, EmulatorConfig,
    LocalActivity, MethodMapBuilder, WorkerClient, WorkerConfig, WorkerError, Workflow,
    WorkflowContext, WorkflowError, WorkflowExit, WorkflowStatus,
};
use tokio::sync::Notify;

const DOMAIN: &str = "D";
const TASK_LIST: &str = "default";

// ============================================================================
// Helpers
// ============================================================================

/// Emulator plus a connected client polling `D`/`default` with every test workflow registered.
async fn setup() -> (Emulator, WorkerClient) {
    let emulator = Emulator::start(EmulatorConfig::default().with_poll_interval_ms(10));
    let client = WorkerClient::emulated(
        WorkerConfig::localhost().with_heartbeat_interval_ms(0),
        &emulator,
    );
    client.connect().await.unwrap();
    client
        .register_domain(DomainRegisterRequest {
            name: DOMAIN.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    client.register_workflow::<Echo>("Echo", Some(DOMAIN)).await.unwrap();
    client.register_workflow::<Stamped>("Stamped", Some(DOMAIN)).await.unwrap();
    client.register_workflow::<Tally>("Tally", Some(DOMAIN)).await.unwrap();
    client.register_workflow::<Countdown>("Countdown", Some(DOMAIN)).await.unwrap();
    client.register_workflow::<Sleeper>("Sleeper", Some(DOMAIN)).await.unwrap();
    client.register_workflow::<Parent>("Parent", Some(DOMAIN)).await.unwrap();
    client.register_workflow::<Waiter>("Waiter", Some(DOMAIN)).await.unwrap();
    client.register_workflow::<Guardian>("Guardian", Some(DOMAIN)).await.unwrap();
    client.register_workflow::<Abandoner>("Abandoner", Some(DOMAIN)).await.unwrap();
    client.register_workflow::<CallActivity>("CallActivity", Some(DOMAIN)).await.unwrap();
    client.register_workflow::<CallWithDeadline>("CallWithDeadline", Some(DOMAIN)).await.unwrap();
    client.start_worker(DOMAIN, TASK_LIST).await.unwrap();

    (emulator, client)
}

/// Register the test activities and poll `D`/`default` for them.
async fn start_activities(client: &WorkerClient) {
    client.register_activity::<Upcase>("Upcase", Some(DOMAIN)).await.unwrap();
    client.register_activity::<Beat>("Beat", Some(DOMAIN)).await.unwrap();
    client.register_activity::<Deferred>("Deferred", Some(DOMAIN)).await.unwrap();
    client.register_activity::<Stall>("Stall", Some(DOMAIN)).await.unwrap();
    client.start_activity_worker(DOMAIN, TASK_LIST).await.unwrap();
}

fn options(id: &str) -> StartWorkflowOptions {
    StartWorkflowOptions {
        id: Some(id.to_string()),
        task_list: TASK_LIST.to_string(),
        ..Default::default()
    }
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

fn proxy_kind(err: &WorkerError) -> Option<ErrorKind> {
    match err {
        WorkerError::Proxy(err) => Some(err.kind),
        _ => None,
    }
}

// ============================================================================
// Test workflows
// ============================================================================

#[derive(Default)]
struct Echo;

#[async_trait]
impl Workflow for Echo {
    async fn run(&self, _ctx: &WorkflowContext, args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
        Ok(WorkflowExit::Completed(args))
    }
}

static STAMP_CALLS: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct CountCalls;

#[async_trait]
impl LocalActivity for CountCalls {
    async fn run(&self, _ctx: &ActivityContext, _args: Vec<u8>) -> Result<Vec<u8>, ActivityError> {
        let calls = STAMP_CALLS.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(vec![calls as u8])
    }
}

/// Combines every kind of recorded value into its result.
#[derive(Default)]
struct Stamped;

#[async_trait]
impl Workflow for Stamped {
    async fn run(&self, ctx: &WorkflowContext, _args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
        let now = ctx.utc_now().await?;
        let version = ctx.get_version("stamp-format", 1, 2).await?;
        let nonce = ctx
            .mutable_side_effect("nonce", uuid::Uuid::new_v4().as_bytes().to_vec())
            .await?;
        let calls = ctx
            .execute_local_activity::<CountCalls>(vec![], LocalActivityOptions::default())
            .await?;
        ctx.sleep(Duration::from_millis(5)).await?;

        let mut result = now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes().to_vec();
        result.extend(version.to_le_bytes());
        result.extend(nonce);
        result.extend(calls);
        Ok(WorkflowExit::Completed(result))
    }
}

/// Completes once it has received two `add` signals.
#[derive(Default)]
struct Tally {
    count: Mutex<u8>,
    changed: Notify,
}

#[async_trait]
impl Workflow for Tally {
    fn register_methods(methods: &mut MethodMapBuilder<Self>) {
        methods.signal("add", |wf: Arc<Tally>, _, _| async move {
            *wf.count.lock().unwrap() += 1;
            wf.changed.notify_one();
            Ok(())
        });
        methods.query("count", |wf: Arc<Tally>, _, _| async move {
            Ok(vec![*wf.count.lock().unwrap()])
        });
    }

    async fn run(&self, _ctx: &WorkflowContext, _args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
        loop {
            let done = *self.count.lock().unwrap() >= 2;
            if done {
                break;
            }
            self.changed.notified().await;
        }
        let count = *self.count.lock().unwrap();
        Ok(WorkflowExit::Completed(vec![count]))
    }
}

/// Continues as new until its argument reaches zero.
#[derive(Default)]
struct Countdown;

#[async_trait]
impl Workflow for Countdown {
    async fn run(&self, ctx: &WorkflowContext, args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
        match args.first().copied().unwrap_or(0) {
            0 => Ok(WorkflowExit::Completed(b"liftoff".to_vec())),
            n => Ok(ctx.continue_as_new(vec![n - 1]).into()),
        }
    }
}

/// Sleeps until cancelled.
#[derive(Default)]
struct Sleeper;

#[async_trait]
impl Workflow for Sleeper {
    async fn run(&self, ctx: &WorkflowContext, _args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
        loop {
            ctx.sleep(Duration::from_millis(20)).await?;
        }
    }
}

/// Runs `Echo` as a child and returns its result.
#[derive(Default)]
struct Parent;

#[async_trait]
impl Workflow for Parent {
    async fn run(&self, ctx: &WorkflowContext, args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
        let child = ctx
            .start_child_workflow("Echo", args, ChildWorkflowOptions::default())
            .await?;
        assert!(!child.execution.run_id.is_empty());
        let result = ctx.wait_for_child(&child).await?;
        Ok(WorkflowExit::Completed(result))
    }
}

/// Waits for a `go` signal without calling back into the proxy.
#[derive(Default)]
struct Waiter {
    go: Notify,
}

#[async_trait]
impl Workflow for Waiter {
    fn register_methods(methods: &mut MethodMapBuilder<Self>) {
        methods.signal("go", |wf: Arc<Waiter>, _, _| async move {
            wf.go.notify_one();
            Ok(())
        });
    }

    async fn run(&self, _ctx: &WorkflowContext, args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
        self.go.notified().await;
        Ok(WorkflowExit::Completed(args))
    }
}

/// Releases a `Waiter` child with a signal and returns its result.
#[derive(Default)]
struct Guardian;

#[async_trait]
impl Workflow for Guardian {
    async fn run(&self, ctx: &WorkflowContext, args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
        let child = ctx
            .start_child_workflow("Waiter", args, ChildWorkflowOptions::default())
            .await?;
        ctx.signal_child_workflow(&child, "go", vec![]).await?;
        let result = ctx.wait_for_child(&child).await?;
        Ok(WorkflowExit::Completed(result))
    }
}

/// Cancels its `Waiter` child and returns how waiting for it failed.
#[derive(Default)]
struct Abandoner;

#[async_trait]
impl Workflow for Abandoner {
    async fn run(&self, ctx: &WorkflowContext, _args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
        let child = ctx
            .start_child_workflow("Waiter", vec![], ChildWorkflowOptions {
                workflow_id: Some("abandoned".to_string()),
                ..Default::default()
            })
            .await?;
        ctx.cancel_child_workflow(&child).await?;
        let kind = match ctx.wait_for_child(&child).await {
            Ok(_) => "Completed".to_string(),
            Err(WorkflowError::Proxy(err)) => err.kind.as_str().to_string(),
            Err(err) => err.to_string(),
        };
        Ok(WorkflowExit::Completed(kind.into_bytes()))
    }
}

/// Runs the activity named by `args` on `hi` and returns its result, or the
/// kind of the error it failed with.
async fn call_activity(
    ctx: &WorkflowContext,
    args: Vec<u8>,
    options: ActivityOptions,
) -> Result<WorkflowExit, WorkflowError> {
    let activity = String::from_utf8_lossy(&args).into_owned();
    match ctx.execute_activity(&activity, b"hi".to_vec(), options).await {
        Ok(result) => Ok(WorkflowExit::Completed(result)),
        Err(WorkflowError::Proxy(err)) => {
            Ok(WorkflowExit::Completed(err.kind.as_str().as_bytes().to_vec()))
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Default)]
struct CallActivity;

#[async_trait]
impl Workflow for CallActivity {
    async fn run(&self, ctx: &WorkflowContext, args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
        call_activity(ctx, args, ActivityOptions::default()).await
    }
}

#[derive(Default)]
struct CallWithDeadline;

#[async_trait]
impl Workflow for CallWithDeadline {
    async fn run(&self, ctx: &WorkflowContext, args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
        let options = ActivityOptions {
            start_to_close_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        call_activity(ctx, args, options).await
    }
}

// ============================================================================
// Test activities
// ============================================================================

#[derive(Default)]
struct Upcase;

#[async_trait]
impl Activity for Upcase {
    async fn run(&self, _ctx: &ActivityContext, args: Vec<u8>) -> Result<ActivityExit, ActivityError> {
        Ok(ActivityExit::Completed(args.to_ascii_uppercase()))
    }
}

/// Returns `[had_details_before, has_details_after]` followed by the recorded details.
#[derive(Default)]
struct Beat;

#[async_trait]
impl Activity for Beat {
    async fn run(&self, ctx: &ActivityContext, args: Vec<u8>) -> Result<ActivityExit, ActivityError> {
        let before = ctx.has_heartbeat_details().await?;
        ctx.record_heartbeat(args).await?;
        let after = ctx.has_heartbeat_details().await?;
        let details = ctx.heartbeat_details().await?.unwrap_or_default();

        let mut result = vec![u8::from(before), u8::from(after)];
        result.extend(details);
        Ok(ActivityExit::Completed(result))
    }
}

static DEFERRED_TOKENS: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// Hands its task token to the test and leaves completion to it.
#[derive(Default)]
struct Deferred;

#[async_trait]
impl Activity for Deferred {
    async fn run(&self, ctx: &ActivityContext, _args: Vec<u8>) -> Result<ActivityExit, ActivityError> {
        let token = ctx.task_token().unwrap_or_default().to_vec();
        DEFERRED_TOKENS.lock().unwrap().push(token);
        Ok(ActivityExit::CompleteExternally)
    }
}

/// Runs until asked to stop.
#[derive(Default)]
struct Stall;

#[async_trait]
impl Activity for Stall {
    async fn run(&self, ctx: &ActivityContext, _args: Vec<u8>) -> Result<ActivityExit, ActivityError> {
        ctx.cancellation_token().cancelled().await;
        Err(ActivityError::Cancelled)
    }
}

// ============================================================================
// Execution
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_execute_runs_to_completion() {
    let (emulator, client) = setup().await;

    let execution = client
        .start_workflow(Some(DOMAIN), "Echo", vec![1, 2, 3], options("echo-1"))
        .await
        .unwrap();
    assert_eq!(execution.workflow_id, "echo-1");
    assert!(emulator.workflow_status("echo-1").is_some());

    let result = within(client.get_workflow_result("echo-1", None)).await.unwrap();
    assert_eq!(result, vec![1, 2, 3]);
    assert_eq!(emulator.workflow_status("echo-1"), Some(WorkflowStatus::Completed));
    assert_eq!(client.active_contexts(), 0);

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_execute_without_matching_worker_stays_pending() {
    let (emulator, client) = setup().await;

    client
        .start_workflow(Some(DOMAIN), "Echo", vec![], StartWorkflowOptions {
            id: Some("idle".to_string()),
            task_list: "nobody-polls-this".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(emulator.workflow_status("idle"), Some(WorkflowStatus::Pending));
    assert_eq!(emulator.pending_workflows(), 1);

    // Never-started workflows are dropped on shutdown.
    emulator.shutdown().await;
    assert_eq!(emulator.workflow_status("idle"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_execute_validation() {
    let (emulator, client) = setup().await;

    let err = client
        .start_workflow(Some("missing"), "Echo", vec![], options("a"))
        .await
        .unwrap_err();
    assert_eq!(proxy_kind(&err), Some(ErrorKind::EntityNotExists));

    let err = client
        .start_workflow(Some(DOMAIN), "Echo", vec![], StartWorkflowOptions::default())
        .await
        .unwrap_err();
    assert_eq!(proxy_kind(&err), Some(ErrorKind::BadRequest));

    client
        .start_workflow(Some(DOMAIN), "Sleeper", vec![], options("dup"))
        .await
        .unwrap();
    let err = client
        .start_workflow(Some(DOMAIN), "Sleeper", vec![], options("dup"))
        .await
        .unwrap_err();
    assert_eq!(proxy_kind(&err), Some(ErrorKind::AlreadyExists));

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_child_workflow_result_reaches_parent() {
    let (emulator, client) = setup().await;

    client
        .start_workflow(Some(DOMAIN), "Parent", b"from parent".to_vec(), options("parent"))
        .await
        .unwrap();

    let result = within(client.get_workflow_result("parent", None)).await.unwrap();
    assert_eq!(result, b"from parent".to_vec());

    emulator.shutdown().await;
}

// ============================================================================
// Replay
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_reproduces_recorded_values() {
    let (emulator, client) = setup().await;

    client
        .start_workflow(Some(DOMAIN), "Stamped", vec![], options("stamped"))
        .await
        .unwrap();
    let original = within(client.get_workflow_result("stamped", None)).await.unwrap();
    assert_eq!(STAMP_CALLS.load(Ordering::SeqCst), 1);

    // Version 2 was recorded for the fresh run.
    assert_eq!(&original[8..12], &2i32.to_le_bytes());

    let replayed = within(emulator.replay_workflow("stamped")).await.unwrap();
    assert_eq!(replayed, original);
    assert_eq!(
        STAMP_CALLS.load(Ordering::SeqCst),
        1,
        "local activity must not run again on replay"
    );

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_requires_finished_run() {
    let (emulator, client) = setup().await;

    let err = emulator.replay_workflow("unknown").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::EntityNotExists);

    client
        .start_workflow(Some(DOMAIN), "Sleeper", vec![], options("sleepy"))
        .await
        .unwrap();
    let err = emulator.replay_workflow("sleepy").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadRequest);

    emulator.shutdown().await;
}

// ============================================================================
// Signals, queries, continue-as-new
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signals_and_queries_reach_running_workflow() {
    let (emulator, client) = setup().await;

    client
        .start_workflow(Some(DOMAIN), "Tally", vec![], options("tally"))
        .await
        .unwrap();
    wait_until(|| client.active_contexts() == 1).await;

    let count = within(client.query_workflow("tally", "count", vec![])).await.unwrap();
    assert_eq!(count, vec![0]);

    client.signal_workflow("tally", "add", vec![]).await.unwrap();
    client.signal_workflow("tally", "add", vec![]).await.unwrap();

    let result = within(client.get_workflow_result("tally", None)).await.unwrap();
    assert_eq!(result, vec![2]);

    let err = client
        .signal_workflow("tally", "add", vec![])
        .await
        .unwrap_err();
    assert_eq!(proxy_kind(&err), Some(ErrorKind::EntityNotExists));

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_continue_as_new_starts_new_run() {
    let (emulator, client) = setup().await;

    let first = client
        .start_workflow(Some(DOMAIN), "Countdown", vec![3], options("countdown"))
        .await
        .unwrap();

    let result = within(client.get_workflow_result("countdown", None)).await.unwrap();
    assert_eq!(result, b"liftoff".to_vec());

    let last = emulator.execution("countdown").unwrap();
    assert_eq!(last.workflow_id, first.workflow_id);
    assert_ne!(last.run_id, first.run_id);
    assert_eq!(emulator.workflow_status("countdown"), Some(WorkflowStatus::Completed));

    emulator.shutdown().await;
}

// ============================================================================
// Termination and shutdown
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_running_workflow() {
    let (emulator, client) = setup().await;

    client
        .start_workflow(Some(DOMAIN), "Sleeper", vec![], options("sleeper"))
        .await
        .unwrap();
    wait_until(|| emulator.workflow_status("sleeper") == Some(WorkflowStatus::Running)).await;

    client
        .terminate_workflow("sleeper", Some("operator request"))
        .await
        .unwrap();

    let err = within(client.get_workflow_result("sleeper", None))
        .await
        .unwrap_err();
    assert_eq!(proxy_kind(&err), Some(ErrorKind::Terminated));
    assert_eq!(emulator.workflow_status("sleeper"), Some(WorkflowStatus::Terminated));

    // The worker side unwinds once its pending sleep is cancelled.
    wait_until(|| client.active_contexts() == 0).await;

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_terminates_running_workflows() {
    let (emulator, client) = setup().await;

    client
        .start_workflow(Some(DOMAIN), "Sleeper", vec![], options("forever"))
        .await
        .unwrap();
    wait_until(|| emulator.workflow_status("forever") == Some(WorkflowStatus::Running)).await;

    emulator.shutdown().await;

    assert_eq!(emulator.workflow_status("forever"), Some(WorkflowStatus::Terminated));
    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, WorkerError::Transport(_)));
}

// ============================================================================
// Domains and workers
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_domain_lifecycle() {
    let (emulator, client) = setup().await;

    let err = client
        .register_domain(DomainRegisterRequest {
            name: DOMAIN.to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(proxy_kind(&err), Some(ErrorKind::AlreadyExists));

    let err = client.describe_domain("missing").await.unwrap_err();
    match err {
        WorkerError::Proxy(err) => {
            assert_eq!(err.kind, ErrorKind::EntityNotExists);
            assert_eq!(err.message, "Domain missing does not exist");
        }
        other => panic!("unexpected error: {other}"),
    }

    client
        .update_domain(DomainUpdateRequest {
            name: DOMAIN.to_string(),
            description: Some("test domain".to_string()),
            retention_days: Some(3),
            ..Default::default()
        })
        .await
        .unwrap();
    let info = client.describe_domain(DOMAIN).await.unwrap();
    assert_eq!(info.description.as_deref(), Some("test domain"));
    assert_eq!(info.retention_days, 3);

    let err = client.start_worker("missing", TASK_LIST).await.unwrap_err();
    assert_eq!(proxy_kind(&err), Some(ErrorKind::EntityNotExists));

    assert!(emulator.registered_workflow_types().contains(&"Echo".to_string()));

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopped_worker_receives_no_work() {
    let (emulator, client) = setup().await;

    let extra = client.start_worker(DOMAIN, "side").await.unwrap();
    client.stop_worker(extra).await.unwrap();

    client
        .start_workflow(Some(DOMAIN), "Echo", vec![], StartWorkflowOptions {
            id: Some("side-echo".to_string()),
            task_list: "side".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(emulator.workflow_status("side-echo"), Some(WorkflowStatus::Pending));

    let err = client.stop_worker(extra).await.unwrap_err();
    assert_eq!(proxy_kind(&err), Some(ErrorKind::EntityNotExists));

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_registration_can_be_retried() {
    let (emulator, client) = setup().await;

    let err = client
        .register_workflow::<Echo>("Late", Some("nowhere"))
        .await
        .unwrap_err();
    assert_eq!(proxy_kind(&err), Some(ErrorKind::EntityNotExists));
    let err = client
        .register_activity::<Upcase>("LateActivity", Some("nowhere"))
        .await
        .unwrap_err();
    assert_eq!(proxy_kind(&err), Some(ErrorKind::EntityNotExists));
    assert!(!emulator.registered_workflow_types().contains(&"Late".to_string()));

    client
        .register_domain(DomainRegisterRequest {
            name: "nowhere".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    client
        .register_workflow::<Echo>("Late", Some("nowhere"))
        .await
        .unwrap();
    client
        .register_activity::<Upcase>("LateActivity", Some("nowhere"))
        .await
        .unwrap();

    assert!(emulator.registered_workflow_types().contains(&"Late".to_string()));
    assert!(emulator.registered_activity_types().contains(&"LateActivity".to_string()));

    emulator.shutdown().await;
}

// ============================================================================
// Stopping invocations on the worker
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_stops_workflow_on_worker() {
    let (emulator, client) = setup().await;

    client
        .start_workflow(Some(DOMAIN), "Waiter", vec![], options("waiter"))
        .await
        .unwrap();
    wait_until(|| client.active_contexts() == 1).await;

    client.terminate_workflow("waiter", None).await.unwrap();

    wait_until(|| client.active_contexts() == 0).await;
    assert_eq!(emulator.workflow_status("waiter"), Some(WorkflowStatus::Terminated));

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_workflows_on_worker() {
    let (emulator, client) = setup().await;

    client
        .start_workflow(Some(DOMAIN), "Waiter", vec![], options("waiter"))
        .await
        .unwrap();
    wait_until(|| client.active_contexts() == 1).await;

    emulator.shutdown().await;

    wait_until(|| client.active_contexts() == 0).await;
    assert_eq!(emulator.workflow_status("waiter"), Some(WorkflowStatus::Terminated));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_emulator_shuts_it_down() {
    let (emulator, client) = setup().await;

    client
        .start_workflow(Some(DOMAIN), "Waiter", vec![], options("waiter"))
        .await
        .unwrap();
    wait_until(|| client.active_contexts() == 1).await;

    drop(emulator);

    wait_until(|| client.active_contexts() == 0).await;
    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, WorkerError::Transport(_)));
}

// ============================================================================
// Child workflow messaging
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signal_child_releases_it() {
    let (emulator, client) = setup().await;

    client
        .start_workflow(Some(DOMAIN), "Guardian", b"freed".to_vec(), options("guardian"))
        .await
        .unwrap();
    let result = within(client.get_workflow_result("guardian", None))
        .await
        .unwrap();
    assert_eq!(result, b"freed");

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_child_stops_it() {
    let (emulator, client) = setup().await;

    client
        .start_workflow(Some(DOMAIN), "Abandoner", vec![], options("abandoner"))
        .await
        .unwrap();
    let result = within(client.get_workflow_result("abandoner", None))
        .await
        .unwrap();
    assert_eq!(result, b"Cancelled");
    assert_eq!(emulator.workflow_status("abandoned"), Some(WorkflowStatus::Canceled));

    wait_until(|| client.active_contexts() == 0).await;

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signal_with_start() {
    let (emulator, client) = setup().await;

    let started = client
        .signal_with_start_workflow(
            Some(DOMAIN),
            "Tally",
            "tally-sws",
            "add",
            vec![],
            vec![],
            options("tally-sws"),
        )
        .await
        .unwrap();
    let signalled = client
        .signal_with_start_workflow(
            Some(DOMAIN),
            "Tally",
            "tally-sws",
            "add",
            vec![],
            vec![],
            options("tally-sws"),
        )
        .await
        .unwrap();
    assert_eq!(signalled.run_id, started.run_id);

    let result = within(client.get_workflow_result("tally-sws", None))
        .await
        .unwrap();
    assert_eq!(result, vec![2]);

    emulator.shutdown().await;
}

// ============================================================================
// Regular activities
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_activity_runs_on_activity_worker() {
    let (emulator, client) = setup().await;
    start_activities(&client).await;

    client
        .start_workflow(Some(DOMAIN), "CallActivity", b"Upcase".to_vec(), options("upcase"))
        .await
        .unwrap();
    let result = within(client.get_workflow_result("upcase", None))
        .await
        .unwrap();
    assert_eq!(result, b"HI");
    assert_eq!(emulator.running_activities(), 0);
    assert!(emulator.registered_activity_types().contains(&"Upcase".to_string()));

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_activity_without_worker_is_entity_not_exists() {
    let (emulator, client) = setup().await;

    client
        .start_workflow(Some(DOMAIN), "CallActivity", b"Upcase".to_vec(), options("orphan"))
        .await
        .unwrap();
    let result = within(client.get_workflow_result("orphan", None))
        .await
        .unwrap();
    assert_eq!(result, b"EntityNotExists");

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_activity_heartbeat_details() {
    let (emulator, client) = setup().await;
    start_activities(&client).await;

    client
        .start_workflow(Some(DOMAIN), "CallActivity", b"Beat".to_vec(), options("beat"))
        .await
        .unwrap();
    let result = within(client.get_workflow_result("beat", None))
        .await
        .unwrap();
    assert_eq!(result, vec![0, 1, b'h', b'i']);

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_activity_completed_externally() {
    let (emulator, client) = setup().await;
    start_activities(&client).await;

    client
        .start_workflow(Some(DOMAIN), "CallActivity", b"Deferred".to_vec(), options("deferred"))
        .await
        .unwrap();
    wait_until(|| !DEFERRED_TOKENS.lock().unwrap().is_empty()).await;
    let token = DEFERRED_TOKENS.lock().unwrap()[0].clone();

    // The worker is done with the attempt; the emulator still waits for it.
    wait_until(|| client.active_activities() == 0).await;
    assert_eq!(emulator.running_activities(), 1);
    assert_eq!(emulator.workflow_status("deferred"), Some(WorkflowStatus::Running));

    client
        .record_activity_heartbeat(token.clone(), b"half".to_vec())
        .await
        .unwrap();
    client
        .complete_activity(token.clone(), b"done".to_vec())
        .await
        .unwrap();

    let result = within(client.get_workflow_result("deferred", None))
        .await
        .unwrap();
    assert_eq!(result, b"done");

    let err = client.complete_activity(token, vec![]).await.unwrap_err();
    assert_eq!(proxy_kind(&err), Some(ErrorKind::EntityNotExists));

    emulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_activity_timeout_stops_attempt() {
    let (emulator, client) = setup().await;
    start_activities(&client).await;

    client
        .start_workflow(Some(DOMAIN), "CallWithDeadline", b"Stall".to_vec(), options("stall"))
        .await
        .unwrap();
    let result = within(client.get_workflow_result("stall", None))
        .await
        .unwrap();
    assert_eq!(result, b"Timeout");

    wait_until(|| client.active_activities() == 0).await;
    assert_eq!(emulator.running_activities(), 0);

    emulator.shutdown().await;
}
