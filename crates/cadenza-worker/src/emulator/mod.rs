// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process stand-in for the sidecar proxy and the orchestration server.
//!
//! The emulator answers every request a [`WorkerClient`](crate::WorkerClient)
//! sends and drives registered workflows through the client's real
//! [`Dispatcher`]:
//!
//! ```text
//!   WorkerClient ──call──► EmulatedTransport ──► Emulator tables
//!        ▲                                            │
//!        │                                       poll loop
//!        └──────── Dispatcher ◄── WorkflowInvoke ─────┘
//! ```
//!
//! A background loop wakes every poll interval, hands pending workflows to a
//! worker polling the same domain and task list, and delivers queued signals
//! and queries to running ones. Workflow history is recorded per run so a
//! finished run can be replayed with [`Emulator::replay_workflow`].
//!
//! When a run is closed from outside (terminated, cancelled by its parent or
//! drained on shutdown) the worker still answering its `WorkflowInvoke` is
//! sent a `CancelRequest` for that invocation. Dropping the last [`Emulator`]
//! handle shuts it down the same way [`Emulator::shutdown`] does.

mod handlers;
mod history;
mod state;

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use cadenza_protocol::payloads::{
    CancelRequest, WorkflowExecution, WorkflowInvokeReply, WorkflowInvokeRequest, WorkflowQueryInvokeRequest,
    WorkflowSignalInvokeRequest,
};
use cadenza_protocol::{ProxyError, ProxyMessage, ProxyReply, ProxyRequest};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::EmulatorConfig;
use crate::correlation::{CorrelationTable, PendingReply};
use crate::dispatcher::{Dispatcher, WeakDispatcher};
use crate::error::{Result, WorkerError};
use crate::transport::ProxyTransport;

use state::{EmulatorState, PendingQuery, Stop, WorkflowStatus as Status};

pub use state::WorkflowStatus;

/// Times a stop is retried while the worker has not yet picked up the invocation.
const STOP_ATTEMPTS: usize = 20;

/// A running emulator. Clones share the same tables.
#[derive(Clone)]
pub struct Emulator {
    inner: Arc<EmulatorInner>,
    /// Shuts the emulator down when the last handle goes away.
    _stop_on_drop: Arc<DropGuard>,
}

pub(crate) struct EmulatorInner {
    config: EmulatorConfig,
    state: Mutex<EmulatorState>,
    /// Calls made into clients (invokes, signals, queries, local activities).
    operations: CorrelationTable,
    shutdown: CancellationToken,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

/// One workflow run handed to a worker.
struct Invocation {
    client_id: u64,
    workflow_id: String,
    run_id: String,
    request: WorkflowInvokeRequest,
}

/// Signals and queries queued for one running workflow.
struct Delivery {
    client_id: u64,
    context_id: i64,
    workflow_id: String,
    signals: Vec<(String, Option<Vec<u8>>)>,
    queries: Vec<PendingQuery>,
}

impl Emulator {
    /// Start an emulator and its poll loop on the current runtime.
    pub fn start(config: EmulatorConfig) -> Self {
        let inner = Arc::new(EmulatorInner {
            config,
            state: Mutex::new(EmulatorState::default()),
            operations: CorrelationTable::new(),
            shutdown: CancellationToken::new(),
            poll_task: Mutex::new(None),
        });

        let handle = tokio::spawn(poll_loop(inner.clone()));
        *lock(&inner.poll_task) = Some(handle);

        info!(poll_interval_ms = inner.config.poll_interval_ms, "Emulator started");
        let stop_on_drop = Arc::new(inner.shutdown.clone().drop_guard());
        Self {
            inner,
            _stop_on_drop: stop_on_drop,
        }
    }

    /// Transport a client uses to reach this emulator.
    pub(crate) fn transport_for(&self, client_id: u64) -> Arc<dyn ProxyTransport> {
        Arc::new(EmulatedTransport {
            emulator: self.inner.clone(),
            client_id,
        })
    }

    /// Route requests for the dispatcher's client to it.
    pub(crate) fn attach(&self, dispatcher: Dispatcher) {
        self.inner
            .lock()
            .clients
            .insert(dispatcher.client_id(), dispatcher.downgrade());
    }

    pub fn workflow_status(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        self.inner
            .lock()
            .workflows
            .get(workflow_id)
            .map(|w| w.status)
    }

    /// Current run of `workflow_id`.
    pub fn execution(&self, workflow_id: &str) -> Option<WorkflowExecution> {
        self.inner
            .lock()
            .workflows
            .get(workflow_id)
            .map(|w| w.execution.clone())
    }

    /// Number of workflows waiting for a worker.
    pub fn pending_workflows(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Workflow type names registered so far.
    pub fn registered_workflow_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().registered_types.keys().cloned().collect();
        names.sort();
        names
    }

    /// Activity type names registered so far.
    pub fn registered_activity_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().activity_types.keys().cloned().collect();
        names.sort();
        names
    }

    /// Regular activity attempts that have not reported a result yet.
    pub fn running_activities(&self) -> usize {
        self.inner.lock().activities.len()
    }

    /// Re-run the finished current run of `workflow_id` against its recorded history.
    ///
    /// The worker sees `is_replaying` set; routed calls answer from history.
    pub async fn replay_workflow(&self, workflow_id: &str) -> std::result::Result<Vec<u8>, ProxyError> {
        self.inner.replay(workflow_id).await
    }

    /// Stop the poll loop, terminating running top-level workflows and
    /// dropping those that never started.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = lock(&self.inner.poll_task).take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(error = %err, "Emulator poll loop failed");
        }
        info!("Emulator shut down");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn poll_loop(inner: Arc<EmulatorInner>) {
    let interval = inner.config.poll_interval();
    let shutdown = inner.shutdown.clone();
    debug!(?interval, "Emulator poll loop started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = tokio::time::sleep(interval) => inner.poll_once(),
        }
    }

    inner.drain().await;
    debug!("Emulator poll loop stopped");
}

async fn await_reply<R: ProxyRequest>(pending: PendingReply) -> Result<R::Reply> {
    let reply: R::Reply = pending.wait().await?.to_payload()?;
    Ok(reply.into_result()?)
}

impl EmulatorInner {
    fn lock(&self) -> MutexGuard<'_, EmulatorState> {
        lock(&self.state)
    }

    fn dispatcher(&self, client_id: u64) -> Option<Dispatcher> {
        self.lock().clients.get(&client_id).and_then(WeakDispatcher::upgrade)
    }

    /// Encode a call into a client and register it for a reply, without sending it.
    fn prepare_call<R: ProxyRequest>(
        &self,
        client_id: u64,
        request: &R,
    ) -> Result<(Dispatcher, ProxyMessage, PendingReply)> {
        let dispatcher = self
            .dispatcher(client_id)
            .ok_or(WorkerError::ConnectionClosed)?;
        let mut message = ProxyMessage::from_payload(request)?.with_client_id(client_id);
        let pending = self.operations.enqueue(&mut message)?;
        Ok((dispatcher, message, pending))
    }

    /// Call into a client and wait for its reply.
    async fn call_client<R: ProxyRequest>(&self, client_id: u64, request: &R) -> Result<R::Reply> {
        let (dispatcher, message, pending) = self.prepare_call(client_id, request)?;
        dispatcher.dispatch(message);
        await_reply::<R>(pending).await
    }

    // ========== Stops ==========

    /// Send the stops queued under the lock in the background.
    pub(super) fn flush_stops(self: &Arc<Self>) {
        let stops = std::mem::take(&mut self.lock().stops);
        if stops.is_empty() {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            for stop in stops {
                inner.send_stop(stop).await;
            }
        });
    }

    /// Cancel one invocation on its worker.
    async fn send_stop(&self, stop: Stop) {
        let request = CancelRequest {
            target_request_id: stop.request_id,
        };
        for _ in 0..STOP_ATTEMPTS {
            match self.call_client(stop.client_id, &request).await {
                Ok(reply) if reply.was_cancelled => {
                    debug!(client_id = stop.client_id, request_id = stop.request_id, "Invocation stopped");
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(client_id = stop.client_id, error = %err, "Stop not delivered");
                    return;
                }
            }
            // The worker may not be tracking the invocation yet.
            if !self.operations.contains(stop.request_id) {
                return;
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
        warn!(
            client_id = stop.client_id,
            request_id = stop.request_id,
            "Worker did not stop the invocation"
        );
    }

    /// Serve one request from a client and hand the reply to its dispatcher.
    async fn serve(self: Arc<Self>, client_id: u64, request: ProxyMessage) {
        // Resolved first: a Terminate detaches the client while being handled.
        let dispatcher = self.dispatcher(client_id);
        let Some(reply) = self.handle_request(client_id, &request).await else {
            return;
        };
        match dispatcher {
            Some(dispatcher) => {
                dispatcher.on_message(reply).await;
            }
            None => debug!(client_id, "Client gone, dropping reply"),
        }
    }

    // ========== Poll loop ==========

    fn poll_once(self: &Arc<Self>) {
        let mut invocations = Vec::new();
        let mut deliveries = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;

            for workflow_id in std::mem::take(&mut state.pending) {
                let Some(workflow) = state.workflows.get(&workflow_id) else {
                    continue;
                };
                if workflow.status != Status::Pending {
                    continue;
                }
                let Some(client_id) =
                    state.find_workflow_worker(&workflow.domain, &workflow.task_list)
                else {
                    state.pending.push_back(workflow_id);
                    continue;
                };
                let Some(context_id) = state.open_context(&workflow_id, client_id, false) else {
                    continue;
                };
                let Some(workflow) = state.workflows.get_mut(&workflow_id) else {
                    continue;
                };
                workflow.status = Status::Running;
                workflow.client_id = Some(client_id);
                workflow.context_id = Some(context_id);
                invocations.push(Invocation {
                    client_id,
                    workflow_id: workflow_id.clone(),
                    run_id: workflow.execution.run_id.clone(),
                    request: workflow.invoke_request(context_id, false),
                });
            }

            for workflow in state.workflows.values_mut() {
                // Held back until the worker has been handed the run.
                if workflow.status != Status::Running
                    || workflow.invoke_request_id.is_none()
                    || (workflow.signals.is_empty() && workflow.queries.is_empty())
                {
                    continue;
                }
                let (Some(client_id), Some(context_id)) = (workflow.client_id, workflow.context_id)
                else {
                    continue;
                };
                deliveries.push(Delivery {
                    client_id,
                    context_id,
                    workflow_id: workflow.workflow_id().to_string(),
                    signals: workflow.signals.drain(..).collect(),
                    queries: workflow.queries.drain(..).collect(),
                });
            }
        }

        for invocation in invocations {
            info!(
                workflow_id = %invocation.workflow_id,
                context_id = invocation.request.context_id,
                client_id = invocation.client_id,
                "Workflow dispatched to worker"
            );
            tokio::spawn(self.clone().run_invocation(invocation));
        }
        for delivery in deliveries {
            tokio::spawn(self.clone().deliver(delivery));
        }
    }

    async fn run_invocation(self: Arc<Self>, invocation: Invocation) {
        let reply = match self.prepare_call(invocation.client_id, &invocation.request) {
            Ok((dispatcher, message, pending)) => {
                if self.bind_invocation(&invocation, pending.request_id()) {
                    dispatcher.dispatch(message);
                    await_reply::<WorkflowInvokeRequest>(pending).await
                } else {
                    self.operations.cancel_and_remove(pending.request_id());
                    debug!(workflow_id = %invocation.workflow_id, "Run closed before it was dispatched");
                    Err(WorkerError::Cancelled)
                }
            }
            Err(err) => Err(err),
        };
        self.complete_run(&invocation, reply);
        self.flush_stops();
    }

    /// Remember the request a worker answers for this run; false once the run closed.
    fn bind_invocation(&self, invocation: &Invocation, request_id: u64) -> bool {
        let mut state = self.lock();
        match state.workflows.get_mut(&invocation.workflow_id) {
            Some(workflow)
                if workflow.execution.run_id == invocation.run_id
                    && workflow.status == Status::Running =>
            {
                workflow.invoke_request_id = Some(request_id);
                true
            }
            _ => false,
        }
    }

    /// Record how a run ended.
    fn complete_run(&self, invocation: &Invocation, reply: Result<WorkflowInvokeReply>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.contexts.remove(&invocation.request.context_id);

        let Some(workflow) = state.workflows.get_mut(&invocation.workflow_id) else {
            return;
        };
        if workflow.execution.run_id != invocation.run_id || workflow.status != Status::Running {
            debug!(workflow_id = %invocation.workflow_id, "Ignoring result of a closed run");
            return;
        }

        let children: Vec<String> = workflow.children.values().cloned().collect();
        match reply {
            Ok(reply) if reply.continue_as_new => {
                if let Some(workflow_type) = reply.continue_as_new_workflow {
                    workflow.workflow_type = workflow_type;
                }
                if let Some(domain) = reply.continue_as_new_domain {
                    workflow.domain = domain;
                }
                if let Some(task_list) = reply.continue_as_new_task_list {
                    workflow.task_list = task_list;
                }
                workflow.restart(reply.continue_as_new_args.unwrap_or_default());
                info!(
                    workflow_id = %invocation.workflow_id,
                    run_id = %workflow.execution.run_id,
                    "Workflow continued as new"
                );
                state.pending.push_back(invocation.workflow_id.clone());
            }
            Ok(reply) => {
                info!(workflow_id = %invocation.workflow_id, "Workflow completed");
                workflow.finish(Status::Completed, Ok(reply.result.unwrap_or_default()));
            }
            Err(err) => {
                let err = err.into_proxy_error();
                info!(workflow_id = %invocation.workflow_id, error = %err, "Workflow failed");
                workflow.finish(Status::Failed, Err(err));
            }
        }

        for child in children {
            handlers::terminate_locked(state, &child, "parent workflow closed");
        }
    }

    async fn deliver(self: Arc<Self>, delivery: Delivery) {
        for (signal_name, signal_args) in delivery.signals {
            let request = WorkflowSignalInvokeRequest {
                context_id: delivery.context_id,
                signal_name,
                signal_args,
            };
            if let Err(err) = self.call_client(delivery.client_id, &request).await {
                warn!(
                    workflow_id = %delivery.workflow_id,
                    signal = %request.signal_name,
                    error = %err,
                    "Signal delivery failed, discarding"
                );
            }
        }

        for query in delivery.queries {
            let request = WorkflowQueryInvokeRequest {
                context_id: delivery.context_id,
                query_name: query.name,
                query_args: query.args,
            };
            let result = self
                .call_client(delivery.client_id, &request)
                .await
                .map(|reply| reply.result.unwrap_or_default())
                .map_err(WorkerError::into_proxy_error);
            let _ = query.reply.send(result);
        }
    }

    /// Terminate running top-level workflows and forget those never started.
    async fn drain(&self) {
        let stops = self.drain_locked();
        for stop in stops {
            self.send_stop(stop).await;
        }
    }

    fn drain_locked(&self) -> Vec<Stop> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let never_started: Vec<String> = state.pending.drain(..).collect();
        for workflow_id in &never_started {
            if state
                .workflows
                .get(workflow_id)
                .is_some_and(|w| w.status == Status::Pending)
            {
                state.workflows.remove(workflow_id);
            }
        }

        let running: Vec<String> = state
            .workflows
            .values()
            .filter(|w| w.is_global && w.status.is_active())
            .map(|w| w.workflow_id().to_string())
            .collect();
        for workflow_id in &running {
            handlers::terminate_locked(state, workflow_id, "emulator shutting down");
        }

        info!(
            terminated = running.len(),
            dropped = never_started.len(),
            "Emulator drained"
        );
        std::mem::take(&mut state.stops)
    }

    // ========== Replay ==========

    async fn replay(&self, workflow_id: &str) -> std::result::Result<Vec<u8>, ProxyError> {
        let (client_id, request) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let workflow = state.workflows.get(workflow_id).ok_or_else(|| {
                ProxyError::entity_not_exists(format!("workflow '{workflow_id}' not found"))
            })?;
            if workflow.status.is_active() {
                return Err(ProxyError::bad_request(format!(
                    "workflow '{workflow_id}' has not finished"
                )));
            }
            let client_id = state
                .find_workflow_worker(&workflow.domain, &workflow.task_list)
                .ok_or_else(|| {
                    ProxyError::entity_not_exists(format!(
                        "no worker polls task list '{}'",
                        workflow.task_list
                    ))
                })?;
            let context_id = state
                .open_context(workflow_id, client_id, true)
                .ok_or_else(|| ProxyError::entity_not_exists(workflow_id.to_string()))?;
            let request = state
                .workflows
                .get(workflow_id)
                .map(|w| w.invoke_request(context_id, true))
                .ok_or_else(|| ProxyError::entity_not_exists(workflow_id.to_string()))?;
            (client_id, request)
        };

        info!(workflow_id, context_id = request.context_id, "Replaying workflow");
        let reply = self.call_client(client_id, &request).await;
        self.lock().contexts.remove(&request.context_id);

        let reply = reply.map_err(WorkerError::into_proxy_error)?;
        if reply.continue_as_new {
            return Err(ProxyError::bad_request(
                "replayed run continued as new instead of completing",
            ));
        }
        Ok(reply.result.unwrap_or_default())
    }
}

/// Client-side transport into an [`Emulator`].
struct EmulatedTransport {
    emulator: Arc<EmulatorInner>,
    client_id: u64,
}

#[async_trait]
impl ProxyTransport for EmulatedTransport {
    async fn send(&self, message: ProxyMessage) -> Result<()> {
        if self.emulator.shutdown.is_cancelled() && message.is_request() {
            return Err(WorkerError::Transport("emulator is shut down".to_string()));
        }
        if message.is_reply() {
            if let Err(err) = self.emulator.operations.complete_with_reply(message) {
                warn!(client_id = self.client_id, error = %err, "Rejected reply from client");
            }
            return Ok(());
        }
        tokio::spawn(self.emulator.clone().serve(self.client_id, message));
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.emulator.lock();
        state.clients.remove(&self.client_id);
        state.workers.retain(|_, w| w.client_id != self.client_id);
        debug!(client_id = self.client_id, "Client detached from emulator");
    }
}
