// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Emulator answers to client requests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cadenza_protocol::payloads::*;
use cadenza_protocol::{ErrorKind, MessageType, ProxyError, ProxyMessage, ProxyReply};
use chrono::Utc;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::EmulatorInner;
use super::state::{
    ActivityEntry, Completion, EmulatedWorkflow, EmulatorState, PendingQuery, Stop, WorkerEntry,
    WorkflowStatus,
};
use crate::dispatcher::{error_reply, handle};
use crate::error::WorkerError;

type Answer<T> = Result<T, ProxyError>;

/// Fold a handler result into its reply type.
fn fold<P: ProxyReply>(answer: Answer<P>) -> P {
    answer.unwrap_or_else(P::from_error)
}

/// Close the active run of `workflow_id` with `error`, terminating every
/// active child below it.
///
/// A worker still answering the run's invocation gets a queued [`Stop`].
fn close_locked(
    state: &mut EmulatorState,
    workflow_id: &str,
    status: WorkflowStatus,
    error: ProxyError,
) -> bool {
    let Some(workflow) = state.workflows.get_mut(workflow_id) else {
        return false;
    };
    if !workflow.status.is_active() {
        return false;
    }
    workflow.cancellation.cancel();
    if let (Some(client_id), Some(request_id)) = (workflow.client_id, workflow.invoke_request_id) {
        state.stops.push(Stop {
            client_id,
            request_id,
        });
    }
    let children: Vec<String> = workflow.children.values().cloned().collect();
    let reason = error.message.clone();
    workflow.finish(status, Err(error));
    state.pending.retain(|id| id != workflow_id);
    info!(workflow_id, ?status, reason = %reason, "Workflow closed");

    for child in children {
        terminate_locked(state, &child, "parent workflow closed");
    }
    true
}

pub(super) fn terminate_locked(state: &mut EmulatorState, workflow_id: &str, reason: &str) -> bool {
    close_locked(
        state,
        workflow_id,
        WorkflowStatus::Terminated,
        ProxyError::terminated(reason),
    )
}

fn cancel_locked(state: &mut EmulatorState, workflow_id: &str, reason: &str) -> bool {
    close_locked(
        state,
        workflow_id,
        WorkflowStatus::Canceled,
        ProxyError::cancelled(reason),
    )
}

/// Run `call` under `timeout`; zero means unbounded.
async fn bounded<T>(
    timeout: Duration,
    message: &str,
    call: impl Future<Output = Answer<T>>,
) -> Answer<T> {
    if timeout.is_zero() {
        return call.await;
    }
    match tokio::time::timeout(timeout, call).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ProxyError::new(ErrorKind::Timeout, message)),
    }
}

/// The tightest of the attempt timeouts that is set.
fn attempt_timeout(options: &ActivityOptions) -> Duration {
    [options.start_to_close_timeout, options.schedule_to_close_timeout]
        .into_iter()
        .filter(|timeout| !timeout.is_zero())
        .min()
        .unwrap_or_default()
}

/// Create a top-level workflow and queue it for a worker.
fn submit_locked(
    state: &mut EmulatorState,
    client_id: u64,
    request: WorkflowExecuteRequest,
) -> Answer<WorkflowExecution> {
    let domain = request
        .domain
        .or_else(|| state.client_domains.get(&client_id).cloned())
        .ok_or_else(|| ProxyError::bad_request("domain is required"))?;
    if !state.domains.contains_key(&domain) {
        return Err(ProxyError::entity_not_exists(format!(
            "Domain {domain} does not exist"
        )));
    }
    if request.options.task_list.is_empty() {
        return Err(ProxyError::bad_request("task list is required"));
    }

    let workflow_id = request
        .options
        .id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if state
        .workflows
        .get(&workflow_id)
        .is_some_and(|w| w.status.is_active())
    {
        return Err(ProxyError::already_exists(format!(
            "workflow '{workflow_id}' is already running"
        )));
    }

    let workflow = EmulatedWorkflow::new(
        workflow_id.clone(),
        request.workflow,
        domain,
        request.options.task_list,
        request.args.unwrap_or_default(),
        true,
    );
    let execution = workflow.execution.clone();
    state.workflows.insert(workflow_id.clone(), workflow);
    state.pending.push_back(workflow_id);

    info!(workflow_id = %execution.workflow_id, run_id = %execution.run_id, "Workflow submitted");
    Ok(execution)
}

/// Wait until a completion watch holds a result.
async fn wait_for_completion(mut completion: watch::Receiver<Completion>) -> Answer<Vec<u8>> {
    match completion.wait_for(Option::is_some).await {
        Ok(result) => (*result)
            .clone()
            .unwrap_or_else(|| Err(ProxyError::generic("workflow has no result"))),
        Err(_) => Err(ProxyError::cancelled("workflow dropped before completing")),
    }
}

impl EmulatorInner {
    pub(super) async fn handle_request(
        self: &Arc<Self>,
        client_id: u64,
        request: &ProxyMessage,
    ) -> Option<ProxyMessage> {
        use MessageType as T;

        match request.message_type() {
            // Connection
            T::InitializeRequest => {
                handle(request, |_: InitializeRequest| async { InitializeReply::default() }).await
            }
            T::ConnectRequest => {
                handle(request, |r: ConnectRequest| async move {
                    fold(self.connect(client_id, r))
                })
                .await
            }
            T::TerminateRequest => {
                handle(request, |_: TerminateRequest| async move {
                    self.detach_client(client_id);
                    TerminateReply::default()
                })
                .await
            }
            T::HeartbeatRequest => {
                handle(request, |_: HeartbeatRequest| async { HeartbeatReply::default() }).await
            }
            T::PingRequest => handle(request, |_: PingRequest| async { PingReply::default() }).await,
            T::CancelRequest => {
                // Emulator calls complete on their own; there is nothing to intercept.
                handle(request, |_: CancelRequest| async { CancelReply::default() }).await
            }

            // Workers and domains
            T::NewWorkerRequest => {
                handle(request, |r: NewWorkerRequest| async move {
                    fold(self.new_worker(client_id, r))
                })
                .await
            }
            T::StopWorkerRequest => {
                handle(request, |r: StopWorkerRequest| async move { fold(self.stop_worker(r)) })
                    .await
            }
            T::DomainRegisterRequest => {
                handle(request, |r: DomainRegisterRequest| async move {
                    fold(self.register_domain(r))
                })
                .await
            }
            T::DomainDescribeRequest => {
                handle(request, |r: DomainDescribeRequest| async move {
                    fold(self.describe_domain(r))
                })
                .await
            }
            T::DomainUpdateRequest => {
                handle(request, |r: DomainUpdateRequest| async move {
                    fold(self.update_domain(r))
                })
                .await
            }

            // Workflow client API
            T::WorkflowRegisterRequest => {
                handle(request, |r: WorkflowRegisterRequest| async move {
                    fold(self.register_workflow(r))
                })
                .await
            }
            T::WorkflowSetCacheSizeRequest => {
                handle(request, |_: WorkflowSetCacheSizeRequest| async {
                    WorkflowSetCacheSizeReply::default()
                })
                .await
            }
            T::WorkflowExecuteRequest => {
                handle(request, |r: WorkflowExecuteRequest| async move {
                    fold(self.execute(client_id, r))
                })
                .await
            }
            T::WorkflowGetResultRequest => {
                handle(request, |r: WorkflowGetResultRequest| async move {
                    fold(self.get_result(r).await)
                })
                .await
            }
            T::WorkflowSignalRequest => {
                handle(request, |r: WorkflowSignalRequest| async move {
                    fold(self.signal(r))
                })
                .await
            }
            T::WorkflowQueryRequest => {
                handle(request, |r: WorkflowQueryRequest| async move {
                    fold(self.query(r).await)
                })
                .await
            }
            T::WorkflowTerminateRequest => {
                handle(request, |r: WorkflowTerminateRequest| async move {
                    let reply = fold(self.terminate(r));
                    self.flush_stops();
                    reply
                })
                .await
            }
            T::WorkflowSignalWithStartRequest => {
                handle(request, |r: WorkflowSignalWithStartRequest| async move {
                    fold(self.signal_with_start(client_id, r))
                })
                .await
            }

            // Calls made from inside running workflows
            T::WorkflowSignalSubscribeRequest => {
                handle(request, |r: WorkflowSignalSubscribeRequest| async move {
                    fold(self.context_exists(r.context_id).map(|_| WorkflowSignalSubscribeReply::default()))
                })
                .await
            }
            T::WorkflowSetQueryHandlerRequest => {
                handle(request, |r: WorkflowSetQueryHandlerRequest| async move {
                    fold(self.context_exists(r.context_id).map(|_| WorkflowSetQueryHandlerReply::default()))
                })
                .await
            }
            T::WorkflowDisconnectContextRequest => {
                handle(request, |r: WorkflowDisconnectContextRequest| async move {
                    fold(self.disconnect_context(r))
                })
                .await
            }
            T::WorkflowGetTimeRequest => {
                handle(request, |r: WorkflowGetTimeRequest| async move {
                    fold(self.get_time(r))
                })
                .await
            }
            T::WorkflowSleepRequest => {
                handle(request, |r: WorkflowSleepRequest| async move {
                    fold(self.sleep(r).await)
                })
                .await
            }
            T::WorkflowGetVersionRequest => {
                handle(request, |r: WorkflowGetVersionRequest| async move {
                    fold(self.get_version(r))
                })
                .await
            }
            T::WorkflowMutableRequest => {
                handle(request, |r: WorkflowMutableRequest| async move {
                    fold(self.mutable(r))
                })
                .await
            }
            T::WorkflowHasLastResultRequest => {
                // The emulator runs no cron schedules, so there is never a previous run.
                handle(request, |r: WorkflowHasLastResultRequest| async move {
                    fold(self.context_exists(r.context_id).map(|_| WorkflowHasLastResultReply::default()))
                })
                .await
            }
            T::WorkflowGetLastResultRequest => {
                handle(request, |r: WorkflowGetLastResultRequest| async move {
                    fold(self.context_exists(r.context_id).map(|_| WorkflowGetLastResultReply::default()))
                })
                .await
            }
            T::WorkflowExecuteChildRequest => {
                handle(request, |r: WorkflowExecuteChildRequest| async move {
                    fold(self.execute_child(r))
                })
                .await
            }
            T::WorkflowWaitForChildRequest => {
                handle(request, |r: WorkflowWaitForChildRequest| async move {
                    fold(self.wait_for_child(r).await)
                })
                .await
            }
            T::WorkflowSignalChildRequest => {
                handle(request, |r: WorkflowSignalChildRequest| async move {
                    fold(self.signal_child(r))
                })
                .await
            }
            T::WorkflowCancelChildRequest => {
                handle(request, |r: WorkflowCancelChildRequest| async move {
                    let reply = fold(self.cancel_child(r));
                    self.flush_stops();
                    reply
                })
                .await
            }
            T::ActivityExecuteRequest => {
                handle(request, |r: ActivityExecuteRequest| async move {
                    fold(self.execute_activity(r).await)
                })
                .await
            }
            T::ActivityExecuteLocalRequest => {
                handle(request, |r: ActivityExecuteLocalRequest| async move {
                    fold(self.execute_local_activity(r).await)
                })
                .await
            }

            // Calls made by activities and their owners
            T::ActivityRegisterRequest => {
                handle(request, |r: ActivityRegisterRequest| async move {
                    fold(self.register_activity(r))
                })
                .await
            }
            T::ActivityRecordHeartbeatRequest => {
                handle(request, |r: ActivityRecordHeartbeatRequest| async move {
                    fold(self.record_heartbeat(r))
                })
                .await
            }
            T::ActivityGetHeartbeatDetailsRequest => {
                handle(request, |r: ActivityGetHeartbeatDetailsRequest| async move {
                    fold(self.heartbeat_details(r))
                })
                .await
            }
            T::ActivityHasHeartbeatDetailsRequest => {
                handle(request, |r: ActivityHasHeartbeatDetailsRequest| async move {
                    fold(self.has_heartbeat_details(r))
                })
                .await
            }
            T::ActivityCompleteRequest => {
                handle(request, |r: ActivityCompleteRequest| async move {
                    fold(self.complete_activity(r))
                })
                .await
            }

            other => {
                warn!(message_type = %other, client_id, "Emulator does not handle request");
                error_reply(
                    request,
                    ProxyError::bad_request(format!("emulator does not handle {other}")),
                )
            }
        }
    }

    // ========== Connection ==========

    fn connect(&self, client_id: u64, request: ConnectRequest) -> Answer<ConnectReply> {
        let mut state = self.lock();
        if let Some(domain) = request.domain {
            if request.create_domain && !state.domains.contains_key(&domain) {
                state.domains.insert(
                    domain.clone(),
                    DomainInfo {
                        name: domain.clone(),
                        uuid: Uuid::new_v4().to_string(),
                        ..Default::default()
                    },
                );
            }
            state.client_domains.insert(client_id, domain);
        }
        debug!(client_id, identity = %request.identity, "Client connected");
        Ok(ConnectReply::default())
    }

    fn detach_client(&self, client_id: u64) {
        let mut state = self.lock();
        state.clients.remove(&client_id);
        state.workers.retain(|_, w| w.client_id != client_id);
        info!(client_id, "Client terminated its connection");
    }

    fn new_worker(&self, client_id: u64, request: NewWorkerRequest) -> Answer<NewWorkerReply> {
        let mut state = self.lock();
        if !state.domains.contains_key(&request.domain) {
            return Err(ProxyError::entity_not_exists(format!(
                "Domain {} does not exist",
                request.domain
            )));
        }
        let worker_id = state.allocate_worker_id();
        info!(
            worker_id,
            client_id,
            domain = %request.domain,
            task_list = %request.task_list,
            "Worker started"
        );
        state.workers.insert(
            worker_id,
            WorkerEntry {
                client_id,
                domain: request.domain,
                task_list: request.task_list,
                is_workflow_worker: request.is_workflow_worker,
            },
        );
        Ok(NewWorkerReply {
            worker_id,
            error: None,
        })
    }

    fn stop_worker(&self, request: StopWorkerRequest) -> Answer<StopWorkerReply> {
        match self.lock().workers.remove(&request.worker_id) {
            Some(_) => Ok(StopWorkerReply::default()),
            None => Err(ProxyError::entity_not_exists(format!(
                "worker {} not found",
                request.worker_id
            ))),
        }
    }

    // ========== Domains ==========

    fn register_domain(&self, request: DomainRegisterRequest) -> Answer<DomainRegisterReply> {
        if request.name.is_empty() {
            return Err(ProxyError::bad_request("domain name is required"));
        }
        let mut state = self.lock();
        if state.domains.contains_key(&request.name) {
            return Err(ProxyError::already_exists(format!(
                "Domain {} already exists",
                request.name
            )));
        }
        info!(domain = %request.name, "Domain registered");
        state.domains.insert(
            request.name.clone(),
            DomainInfo {
                name: request.name,
                description: request.description,
                status: DomainStatus::Registered,
                owner_email: request.owner_email,
                uuid: Uuid::new_v4().to_string(),
                emit_metrics: request.emit_metrics,
                retention_days: request.retention_days,
            },
        );
        Ok(DomainRegisterReply::default())
    }

    fn describe_domain(&self, request: DomainDescribeRequest) -> Answer<DomainDescribeReply> {
        let state = self.lock();
        let info = state.domains.get(&request.name).cloned().ok_or_else(|| {
            ProxyError::entity_not_exists(format!("Domain {} does not exist", request.name))
        })?;
        Ok(DomainDescribeReply {
            domain_info: Some(info),
            error: None,
        })
    }

    fn update_domain(&self, request: DomainUpdateRequest) -> Answer<DomainUpdateReply> {
        let mut state = self.lock();
        let info = state.domains.get_mut(&request.name).ok_or_else(|| {
            ProxyError::entity_not_exists(format!("Domain {} does not exist", request.name))
        })?;
        if let Some(description) = request.description {
            info.description = Some(description);
        }
        if let Some(owner_email) = request.owner_email {
            info.owner_email = Some(owner_email);
        }
        if let Some(emit_metrics) = request.emit_metrics {
            info.emit_metrics = emit_metrics;
        }
        if let Some(retention_days) = request.retention_days {
            info.retention_days = retention_days;
        }
        Ok(DomainUpdateReply::default())
    }

    // ========== Workflow client API ==========

    fn register_workflow(&self, request: WorkflowRegisterRequest) -> Answer<WorkflowRegisterReply> {
        let mut state = self.lock();
        if let Some(domain) = &request.domain
            && !state.domains.contains_key(domain)
        {
            return Err(ProxyError::entity_not_exists(format!(
                "Domain {domain} does not exist"
            )));
        }
        state.registered_types.insert(request.name, request.domain);
        Ok(WorkflowRegisterReply::default())
    }

    fn register_activity(&self, request: ActivityRegisterRequest) -> Answer<ActivityRegisterReply> {
        let mut state = self.lock();
        if let Some(domain) = &request.domain
            && !state.domains.contains_key(domain)
        {
            return Err(ProxyError::entity_not_exists(format!(
                "Domain {domain} does not exist"
            )));
        }
        state.activity_types.insert(request.name, request.domain);
        Ok(ActivityRegisterReply::default())
    }

    fn execute(&self, client_id: u64, request: WorkflowExecuteRequest) -> Answer<WorkflowExecuteReply> {
        let mut state = self.lock();
        let execution = submit_locked(&mut state, client_id, request)?;
        Ok(WorkflowExecuteReply {
            execution: Some(execution),
            error: None,
        })
    }

    fn signal_with_start(
        &self,
        client_id: u64,
        request: WorkflowSignalWithStartRequest,
    ) -> Answer<WorkflowSignalWithStartReply> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let signal = (request.signal_name, request.signal_args);

        if let Some(workflow) = state
            .workflows
            .get_mut(&request.workflow_id)
            .filter(|w| w.status.is_active())
        {
            workflow.signals.push_back(signal);
            return Ok(WorkflowSignalWithStartReply {
                execution: Some(workflow.execution.clone()),
                error: None,
            });
        }

        let execution = submit_locked(
            state,
            client_id,
            WorkflowExecuteRequest {
                domain: request.domain,
                workflow: request.workflow,
                args: request.workflow_args,
                options: StartWorkflowOptions {
                    id: Some(request.workflow_id),
                    ..request.options
                },
            },
        )?;
        if let Some(workflow) = state.workflows.get_mut(&execution.workflow_id) {
            workflow.signals.push_back(signal);
        }
        Ok(WorkflowSignalWithStartReply {
            execution: Some(execution),
            error: None,
        })
    }

    async fn get_result(&self, request: WorkflowGetResultRequest) -> Answer<WorkflowGetResultReply> {
        let completion = {
            let state = self.lock();
            let workflow = state.workflows.get(&request.workflow_id).ok_or_else(|| {
                ProxyError::entity_not_exists(format!(
                    "workflow '{}' not found",
                    request.workflow_id
                ))
            })?;
            workflow.completion.subscribe()
        };
        let result = wait_for_completion(completion).await?;
        Ok(WorkflowGetResultReply {
            result: Some(result),
            error: None,
        })
    }

    fn signal(&self, request: WorkflowSignalRequest) -> Answer<WorkflowSignalReply> {
        let mut state = self.lock();
        let workflow = state
            .workflows
            .get_mut(&request.workflow_id)
            .filter(|w| w.status.is_active())
            .ok_or_else(|| {
                ProxyError::entity_not_exists(format!(
                    "workflow '{}' is not running",
                    request.workflow_id
                ))
            })?;
        workflow
            .signals
            .push_back((request.signal_name, request.signal_args));
        Ok(WorkflowSignalReply::default())
    }

    async fn query(&self, request: WorkflowQueryRequest) -> Answer<WorkflowQueryReply> {
        let (reply, answer) = oneshot::channel();
        {
            let mut state = self.lock();
            let workflow = state
                .workflows
                .get_mut(&request.workflow_id)
                .filter(|w| w.status.is_active())
                .ok_or_else(|| {
                    ProxyError::entity_not_exists(format!(
                        "workflow '{}' is not running",
                        request.workflow_id
                    ))
                })?;
            workflow.queries.push_back(PendingQuery {
                name: request.query_name,
                args: request.query_args,
                reply,
            });
        }

        let result = answer
            .await
            .map_err(|_| ProxyError::cancelled("query dropped before it was answered"))??;
        Ok(WorkflowQueryReply {
            result: Some(result),
            error: None,
        })
    }

    fn terminate(&self, request: WorkflowTerminateRequest) -> Answer<WorkflowTerminateReply> {
        let mut state = self.lock();
        let reason = request.reason.unwrap_or_else(|| "terminated".to_string());
        if !terminate_locked(&mut state, &request.workflow_id, &reason) {
            return Err(ProxyError::entity_not_exists(format!(
                "workflow '{}' is not running",
                request.workflow_id
            )));
        }
        Ok(WorkflowTerminateReply::default())
    }

    // ========== Calls from running workflows ==========

    fn context_exists(&self, context_id: i64) -> Answer<()> {
        self.lock().context_mut(context_id).map(|_| ())
    }

    fn disconnect_context(
        &self,
        request: WorkflowDisconnectContextRequest,
    ) -> Answer<WorkflowDisconnectContextReply> {
        let mut state = self.lock();
        let (entry, _) = state.context_mut(request.context_id)?;
        entry.cancellation = CancellationToken::new();
        debug!(context_id = request.context_id, "Context disconnected");
        Ok(WorkflowDisconnectContextReply::default())
    }

    fn get_time(&self, request: WorkflowGetTimeRequest) -> Answer<WorkflowGetTimeReply> {
        let mut state = self.lock();
        let (entry, workflow) = state.context_mut(request.context_id)?;
        let time = workflow.history.time(&mut entry.cursor, Utc::now())?;
        Ok(WorkflowGetTimeReply {
            time: Some(time),
            error: None,
        })
    }

    async fn sleep(&self, request: WorkflowSleepRequest) -> Answer<WorkflowSleepReply> {
        let (replaying, cancellation) = {
            let mut state = self.lock();
            let (entry, _) = state.context_mut(request.context_id)?;
            (entry.cursor.is_replaying(), entry.cancellation.clone())
        };
        // Timers already fired in the recorded run.
        if replaying {
            return Ok(WorkflowSleepReply::default());
        }

        tokio::select! {
            biased;

            _ = cancellation.cancelled() => Err(ProxyError::cancelled("sleep cancelled")),

            _ = tokio::time::sleep(request.duration) => Ok(WorkflowSleepReply::default()),
        }
    }

    fn get_version(&self, request: WorkflowGetVersionRequest) -> Answer<WorkflowGetVersionReply> {
        if request.min_supported > request.max_supported {
            return Err(ProxyError::bad_request(format!(
                "invalid version range [{}, {}] for '{}'",
                request.min_supported, request.max_supported, request.change_id
            )));
        }
        let mut state = self.lock();
        let (entry, workflow) = state.context_mut(request.context_id)?;
        let version = workflow
            .history
            .version(&entry.cursor, &request.change_id, request.max_supported);
        Ok(WorkflowGetVersionReply {
            version,
            error: None,
        })
    }

    fn mutable(&self, request: WorkflowMutableRequest) -> Answer<WorkflowMutableReply> {
        let mut state = self.lock();
        let (entry, workflow) = state.context_mut(request.context_id)?;
        let result = workflow.history.mutable(
            &mut entry.cursor,
            &request.mutable_id,
            request.result,
            request.update,
        )?;
        Ok(WorkflowMutableReply {
            result,
            error: None,
        })
    }

    fn execute_child(&self, request: WorkflowExecuteChildRequest) -> Answer<WorkflowExecuteChildReply> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let (entry, parent) = state.context_mut(request.context_id)?;
        if let Some(replayed) = parent.history.replay_child(&mut entry.cursor) {
            let child_id = replayed?;
            let child_workflow_id = parent.children.get(&child_id).cloned().ok_or_else(|| {
                ProxyError::bad_request(format!("history mismatch: child {child_id} unknown"))
            })?;
            let execution = state
                .workflows
                .get(&child_workflow_id)
                .map(|w| w.execution.clone())
                .ok_or_else(|| {
                    ProxyError::entity_not_exists(format!("workflow '{child_workflow_id}' not found"))
                })?;
            return Ok(WorkflowExecuteChildReply {
                child_id,
                execution: Some(execution),
                error: None,
            });
        }

        let options = request.options;
        let domain = options.domain.unwrap_or_else(|| parent.domain.clone());
        let task_list = options.task_list.unwrap_or_else(|| parent.task_list.clone());
        let workflow_id = options
            .workflow_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let parent_id = parent.workflow_id().to_string();

        if state
            .workflows
            .get(&workflow_id)
            .is_some_and(|w| w.status.is_active())
        {
            return Err(ProxyError::already_exists(format!(
                "workflow '{workflow_id}' is already running"
            )));
        }

        let child = EmulatedWorkflow::new(
            workflow_id.clone(),
            request.workflow,
            domain,
            task_list,
            request.args.unwrap_or_default(),
            false,
        );
        let execution = child.execution.clone();

        let parent = state.workflows.get_mut(&parent_id).ok_or_else(|| {
            ProxyError::entity_not_exists(format!("workflow '{parent_id}' not found"))
        })?;
        let child_id = parent.allocate_child_id();
        parent.children.insert(child_id, workflow_id.clone());
        parent.history.record_child(child_id);

        state.workflows.insert(workflow_id.clone(), child);
        state.pending.push_back(workflow_id);

        info!(parent = %parent_id, child_id, child = %execution.workflow_id, "Child workflow submitted");
        Ok(WorkflowExecuteChildReply {
            child_id,
            execution: Some(execution),
            error: None,
        })
    }

    async fn wait_for_child(
        &self,
        request: WorkflowWaitForChildRequest,
    ) -> Answer<WorkflowWaitForChildReply> {
        let (replaying, cancellation, completion) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let (entry, parent) = state.context_mut(request.context_id)?;
            let child_workflow_id = parent.children.get(&request.child_id).cloned().ok_or_else(|| {
                ProxyError::entity_not_exists(format!("child {} not found", request.child_id))
            })?;
            let replaying = entry.cursor.is_replaying();
            let cancellation = entry.cancellation.clone();
            let completion = state
                .workflows
                .get(&child_workflow_id)
                .map(|w| w.completion.subscribe())
                .ok_or_else(|| {
                    ProxyError::entity_not_exists(format!("workflow '{child_workflow_id}' not found"))
                })?;
            (replaying, cancellation, completion)
        };

        let result = if replaying {
            wait_for_completion(completion).await
        } else {
            tokio::select! {
                biased;

                _ = cancellation.cancelled() => Err(ProxyError::cancelled("wait for child cancelled")),

                result = wait_for_completion(completion) => result,
            }
        }?;
        Ok(WorkflowWaitForChildReply {
            result: Some(result),
            error: None,
        })
    }

    /// The workflow id of an active child of the context's workflow, or
    /// `None` while the context replays.
    fn active_child(&self, context_id: i64, child_id: i64) -> Answer<Option<String>> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let (entry, parent) = state.context_mut(context_id)?;
        if entry.cursor.is_replaying() {
            return Ok(None);
        }
        let child_workflow_id = parent.children.get(&child_id).cloned().ok_or_else(|| {
            ProxyError::entity_not_exists(format!("child {child_id} not found"))
        })?;
        Ok(Some(child_workflow_id))
    }

    fn signal_child(&self, request: WorkflowSignalChildRequest) -> Answer<WorkflowSignalChildReply> {
        let Some(child_workflow_id) = self.active_child(request.context_id, request.child_id)? else {
            return Ok(WorkflowSignalChildReply::default());
        };
        let mut state = self.lock();
        let child = state
            .workflows
            .get_mut(&child_workflow_id)
            .filter(|w| w.status.is_active())
            .ok_or_else(|| {
                ProxyError::entity_not_exists(format!(
                    "child workflow '{child_workflow_id}' is not running"
                ))
            })?;
        child
            .signals
            .push_back((request.signal_name, request.signal_args));
        Ok(WorkflowSignalChildReply::default())
    }

    /// Cancel a child run; a child that already closed is left as it is.
    fn cancel_child(&self, request: WorkflowCancelChildRequest) -> Answer<WorkflowCancelChildReply> {
        let Some(child_workflow_id) = self.active_child(request.context_id, request.child_id)? else {
            return Ok(WorkflowCancelChildReply::default());
        };
        let mut state = self.lock();
        if !cancel_locked(&mut state, &child_workflow_id, "cancelled by parent workflow") {
            debug!(child = %child_workflow_id, "Cancel for a closed child ignored");
        }
        Ok(WorkflowCancelChildReply::default())
    }

    // ========== Regular activities ==========

    /// Schedule an activity on a worker polling the task list and wait for its result.
    async fn execute_activity(&self, request: ActivityExecuteRequest) -> Answer<ActivityExecuteReply> {
        let (invoke, client_id, cancellation) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let (entry, workflow) = state.context_mut(request.context_id)?;
            if let Some(recorded) = workflow.history.replay_activity(&mut entry.cursor) {
                return recorded.map(|result| ActivityExecuteReply {
                    result: Some(result),
                    error: None,
                });
            }
            let cancellation = entry.cancellation.clone();
            let domain = request.domain.unwrap_or_else(|| workflow.domain.clone());
            let task_list = request
                .options
                .task_list
                .clone()
                .unwrap_or_else(|| workflow.task_list.clone());
            let invoke = ActivityInvokeRequest {
                context_id: 0,
                activity: request.activity,
                args: request.args,
                activity_id: String::new(),
                task_token: None,
                attempt: 1,
                domain,
                task_list,
                workflow_id: entry.workflow_id.clone(),
                run_id: entry.run_id.clone(),
                workflow_type: workflow.workflow_type.clone(),
            };

            let client_id = state
                .find_activity_worker(&invoke.domain, &invoke.task_list)
                .ok_or_else(|| {
                    ProxyError::entity_not_exists(format!(
                        "no activity worker polls task list '{}'",
                        invoke.task_list
                    ))
                })?;
            (invoke, client_id, cancellation)
        };

        let (completed, completion) = oneshot::channel();
        let invoke = {
            let mut state = self.lock();
            let context_id = state.allocate_context_id();
            let task_token = Uuid::new_v4().as_bytes().to_vec();
            state.activities.insert(
                task_token.clone(),
                ActivityEntry {
                    client_id,
                    context_id,
                    activity_id: context_id.to_string(),
                    heartbeat: None,
                    completion: Some(completed),
                },
            );
            ActivityInvokeRequest {
                context_id,
                activity_id: context_id.to_string(),
                task_token: Some(task_token),
                ..invoke
            }
        };
        let task_token = invoke.task_token.clone().unwrap_or_default();
        debug!(activity = %invoke.activity, activity_id = %invoke.activity_id, client_id, "Activity scheduled");

        let attempt = async {
            let reply = self
                .call_client(client_id, &invoke)
                .await
                .map_err(WorkerError::into_proxy_error)?;
            if !reply.pending {
                return Ok(reply.result.unwrap_or_default());
            }
            match completion.await {
                Ok(result) => result,
                Err(_) => Err(ProxyError::cancelled("activity dropped before completing")),
            }
        };
        let outcome = tokio::select! {
            biased;

            _ = cancellation.cancelled() => Err(ProxyError::cancelled("activity cancelled")),

            outcome = bounded(attempt_timeout(&request.options), "activity timed out", attempt) => outcome,
        };
        self.lock().activities.remove(&task_token);

        if let Err(err) = &outcome
            && matches!(err.kind, ErrorKind::Cancelled | ErrorKind::Timeout)
        {
            self.stop_activity(client_id, &invoke).await;
        }
        self.record_activity(&invoke.workflow_id, &invoke.run_id, &outcome);

        outcome.map(|result| ActivityExecuteReply {
            result: Some(result),
            error: None,
        })
    }

    /// Ask the worker running an abandoned attempt to stop it.
    async fn stop_activity(&self, client_id: u64, invoke: &ActivityInvokeRequest) {
        let request = ActivityStoppingRequest {
            context_id: invoke.context_id,
            activity_id: invoke.activity_id.clone(),
        };
        if let Err(err) = self.call_client(client_id, &request).await {
            debug!(activity_id = %invoke.activity_id, error = %err, "Activity stop not delivered");
        }
    }

    fn record_activity(&self, workflow_id: &str, run_id: &str, outcome: &Answer<Vec<u8>>) {
        if let Some(workflow) = self.lock().workflows.get_mut(workflow_id)
            && workflow.execution.run_id == run_id
        {
            workflow.history.record_activity(outcome.clone());
        }
    }

    fn record_heartbeat(
        &self,
        request: ActivityRecordHeartbeatRequest,
    ) -> Answer<ActivityRecordHeartbeatReply> {
        let mut state = self.lock();
        let entry = state.activity_mut(request.task_token.as_deref())?;
        entry.heartbeat = request.details;
        Ok(ActivityRecordHeartbeatReply::default())
    }

    fn heartbeat_details(
        &self,
        request: ActivityGetHeartbeatDetailsRequest,
    ) -> Answer<ActivityGetHeartbeatDetailsReply> {
        let mut state = self.lock();
        let entry = state.activity_mut(request.task_token.as_deref())?;
        Ok(ActivityGetHeartbeatDetailsReply {
            details: entry.heartbeat.clone(),
            error: None,
        })
    }

    fn has_heartbeat_details(
        &self,
        request: ActivityHasHeartbeatDetailsRequest,
    ) -> Answer<ActivityHasHeartbeatDetailsReply> {
        let mut state = self.lock();
        let entry = state.activity_mut(request.task_token.as_deref())?;
        Ok(ActivityHasHeartbeatDetailsReply {
            has_details: entry.heartbeat.is_some(),
            error: None,
        })
    }

    /// Report the result of an attempt its worker left pending.
    fn complete_activity(&self, request: ActivityCompleteRequest) -> Answer<ActivityCompleteReply> {
        let mut state = self.lock();
        let entry = state.activity_mut(request.task_token.as_deref())?;
        let completed = entry
            .completion
            .take()
            .ok_or_else(|| ProxyError::bad_request("activity was already completed"))?;
        info!(
            activity_id = %entry.activity_id,
            client_id = entry.client_id,
            context_id = entry.context_id,
            "Activity completed externally"
        );
        let result = match request.error {
            Some(err) => Err(err),
            None => Ok(request.result.unwrap_or_default()),
        };
        let _ = completed.send(result);
        Ok(ActivityCompleteReply::default())
    }

    // ========== Local activities ==========

    async fn execute_local_activity(
        &self,
        request: ActivityExecuteLocalRequest,
    ) -> Answer<ActivityExecuteLocalReply> {
        let (client_id, workflow_id, run_id) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let (entry, workflow) = state.context_mut(request.context_id)?;
            if let Some(recorded) = workflow.history.replay_activity(&mut entry.cursor) {
                return recorded.map(|result| ActivityExecuteLocalReply {
                    result: Some(result),
                    error: None,
                });
            }
            (entry.client_id, entry.workflow_id.clone(), entry.run_id.clone())
        };
        let activity_context_id = self.lock().allocate_context_id();

        let invoke = ActivityInvokeLocalRequest {
            context_id: request.context_id,
            activity_type_id: request.activity_type_id,
            args: request.args,
            activity_context_id,
        };
        let call = async {
            self.call_client(client_id, &invoke)
                .await
                .map(|reply| reply.result.unwrap_or_default())
                .map_err(WorkerError::into_proxy_error)
        };
        let outcome = bounded(
            request.options.schedule_to_close_timeout,
            "local activity timed out",
            call,
        )
        .await;
        self.record_activity(&workflow_id, &run_id, &outcome);

        outcome.map(|result| ActivityExecuteLocalReply {
            result: Some(result),
            error: None,
        })
    }
}
