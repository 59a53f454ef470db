// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound message routing.
//!
//! Every message received from the proxy goes through [`Dispatcher::on_message`]:
//!
//! ```text
//!   inbound ──► reply? ──yes──► CorrelationTable::complete_with_reply
//!                 │
//!                 no
//!                 ▼
//!          handler by type ──► typed reply (errors folded into the reply)
//! ```
//!
//! Nothing a handler or user code does can escape this boundary: parse
//! failures, unknown types, user errors and panics all become error replies.
//!
//! Workflow and activity invocations stay tracked by request id while they
//! run. A cancel request naming one of them stops it: user code is aborted
//! and the invocation replies with a `Cancelled` error.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Weak};

use cadenza_protocol::payloads::*;
use cadenza_protocol::{ErrorKind, MessageType, ProxyError, ProxyMessage, ProxyReply, ProxyRequest};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::activity::{ActivityContext, ActivityExit};
use crate::client::ClientInner;
use crate::error::WorkerError;
use crate::registry::ContextKey;
use crate::workflow::{
    InstanceState, WorkflowContext, WorkflowInfo, WorkflowInstance, WorkflowOutcome,
};

/// Routes inbound messages for one client.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<ClientInner>,
}

/// A dispatcher that does not keep its client alive.
#[derive(Clone)]
pub struct WeakDispatcher {
    inner: Weak<ClientInner>,
}

impl WeakDispatcher {
    pub fn upgrade(&self) -> Option<Dispatcher> {
        self.inner.upgrade().map(|inner| Dispatcher { inner })
    }
}

/// Text of a panic payload, when it has one.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Convert a failed user task into a structured error.
fn task_failure(err: JoinError) -> ProxyError {
    if err.is_panic() {
        ProxyError::new(ErrorKind::Panic, panic_message(err.into_panic()))
    } else {
        ProxyError::cancelled("task cancelled")
    }
}

/// Await a user task unless `stop` fires first, in which case the task is aborted.
async fn join_or_stop<T>(
    mut task: JoinHandle<T>,
    stop: &CancellationToken,
) -> Result<T, ProxyError> {
    tokio::select! {
        biased;

        _ = stop.cancelled() => {
            task.abort();
            Err(ProxyError::cancelled("invocation cancelled by the proxy"))
        }

        joined = &mut task => joined.map_err(task_failure),
    }
}

/// Encode `reply` as the answer to `request`.
fn encode_reply<P: ProxyReply>(request: &ProxyMessage, reply: &P) -> Option<ProxyMessage> {
    match ProxyMessage::reply_to(request, reply) {
        Ok(message) => Some(message),
        Err(err) => {
            error!(message_type = %request.message_type(), error = %err, "Failed to encode reply");
            error_reply(request, ProxyError::generic(format!("failed to encode reply: {err}")))
        }
    }
}

pub(crate) fn error_reply(request: &ProxyMessage, error: ProxyError) -> Option<ProxyMessage> {
    match ProxyMessage::error_reply(request, &error) {
        Ok(reply) => reply,
        Err(err) => {
            error!(message_type = %request.message_type(), error = %err, "Failed to encode error reply");
            None
        }
    }
}

/// Parse `request` as `R`, run `handler` and encode its reply.
pub(crate) async fn handle<R, F, Fut>(request: &ProxyMessage, handler: F) -> Option<ProxyMessage>
where
    R: ProxyRequest,
    F: FnOnce(R) -> Fut,
    Fut: Future<Output = R::Reply>,
{
    let reply = match request.to_payload::<R>() {
        Ok(payload) => handler(payload).await,
        Err(err) => {
            warn!(message_type = %request.message_type(), error = %err, "Malformed request");
            R::Reply::from_error(ProxyError::bad_request(format!(
                "malformed {}: {err}",
                request.message_type()
            )))
        }
    };
    encode_reply(request, &reply)
}

impl Dispatcher {
    pub(crate) fn new(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub fn client_id(&self) -> u64 {
        self.inner.client_id
    }

    pub fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Handle `message` in the background and send its reply, if any, to the proxy.
    pub fn dispatch(&self, message: ProxyMessage) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Some(reply) = dispatcher.on_message(message).await {
                let _ = dispatcher.inner.send_reply(reply).await;
            }
        });
    }

    /// Handle one inbound message.
    ///
    /// Replies are correlated with pending calls and yield `None`. Requests
    /// yield the reply to send back.
    pub async fn on_message(&self, message: ProxyMessage) -> Option<ProxyMessage> {
        let message_type = message.message_type();
        if message.is_reply() {
            let request_id = message.request_id();
            if let Err(err) = self.inner.operations.complete_with_reply(message) {
                warn!(%message_type, request_id, error = %err, "Rejected reply");
            }
            return None;
        }
        if !message.is_request() {
            warn!(%message_type, "Dropping message that is neither a request nor a reply");
            return None;
        }

        debug!(%message_type, request_id = message.request_id(), "Dispatching request");
        self.handle_request(message).await
    }

    async fn handle_request(&self, request: ProxyMessage) -> Option<ProxyMessage> {
        match request.message_type() {
            MessageType::WorkflowInvokeRequest => {
                let request_id = request.request_id();
                handle(&request, |r: WorkflowInvokeRequest| self.invoke(request_id, r)).await
            }
            MessageType::WorkflowSignalInvokeRequest => {
                handle(&request, |r: WorkflowSignalInvokeRequest| self.signal(r)).await
            }
            MessageType::WorkflowQueryInvokeRequest => {
                handle(&request, |r: WorkflowQueryInvokeRequest| self.query(r)).await
            }
            MessageType::ActivityInvokeLocalRequest => {
                handle(&request, |r: ActivityInvokeLocalRequest| {
                    self.invoke_local_activity(r)
                })
                .await
            }
            MessageType::ActivityInvokeRequest => {
                let request_id = request.request_id();
                handle(&request, |r: ActivityInvokeRequest| {
                    self.invoke_activity(request_id, r)
                })
                .await
            }
            MessageType::ActivityStoppingRequest => {
                handle(&request, |r: ActivityStoppingRequest| async move {
                    self.stop_activity(r)
                })
                .await
            }
            MessageType::CancelRequest => {
                handle(&request, |r: CancelRequest| async move { self.cancel(r) }).await
            }
            MessageType::HeartbeatRequest => {
                handle(&request, |_: HeartbeatRequest| async { HeartbeatReply::default() }).await
            }
            MessageType::PingRequest => {
                handle(&request, |_: PingRequest| async { PingReply::default() }).await
            }
            MessageType::TerminateRequest => {
                handle(&request, |_: TerminateRequest| self.terminate()).await
            }
            other => {
                warn!(message_type = %other, "Unsupported request");
                error_reply(
                    &request,
                    ProxyError::bad_request(format!("unsupported message type {other}")),
                )
            }
        }
    }

    fn key(&self, context_id: i64) -> ContextKey {
        ContextKey::new(self.inner.client_id, context_id)
    }

    // ========== Workflows ==========

    #[instrument(skip(self, request), fields(context_id = request.context_id, workflow_type = %request.workflow_type))]
    async fn invoke(&self, request_id: u64, request: WorkflowInvokeRequest) -> WorkflowInvokeReply {
        let key = self.key(request.context_id);
        if self.inner.contexts.lookup(key).is_some() {
            return WorkflowInvokeReply::from_error(ProxyError::already_exists(format!(
                "workflow context {key} is already running"
            )));
        }
        let Some(factory) = self.inner.workflow_types.factory(&request.workflow_type) else {
            return WorkflowInvokeReply::from_error(ProxyError::bad_request(format!(
                "workflow type '{}' is not registered",
                request.workflow_type
            )));
        };

        let info = WorkflowInfo {
            context_id: request.context_id,
            domain: request.domain,
            workflow_id: request.workflow_id,
            run_id: request.run_id,
            task_list: request.task_list,
            workflow_type: request.workflow_type,
        };
        let instance = Arc::new(WorkflowInstance::new(
            key,
            info,
            factory(),
            request.is_replaying,
            self.inner.shutdown_token().child_token(),
        ));
        if !self.inner.contexts.try_register(key, instance.clone()) {
            return WorkflowInvokeReply::from_error(ProxyError::already_exists(format!(
                "workflow context {key} is already running"
            )));
        }

        let inbound = self.inner.inbound.track(request_id);
        let outcome = self
            .run_instance(&instance, request.args, inbound.stop_token())
            .await;
        drop(inbound);
        if let Err(err) = instance.advance(outcome.state()) {
            warn!(error = %err, "Unexpected workflow state");
        }
        self.inner.contexts.remove(key);

        match &outcome {
            WorkflowOutcome::Completed(_) => info!("Workflow completed"),
            WorkflowOutcome::ContinueAsNew(_) => info!("Workflow continued as new"),
            WorkflowOutcome::Failed(err) => info!(error = %err, "Workflow failed"),
        }
        outcome.into_reply()
    }

    async fn run_instance(
        &self,
        instance: &Arc<WorkflowInstance>,
        args: Vec<u8>,
        stop: &CancellationToken,
    ) -> WorkflowOutcome {
        if let Err(err) = self.start_instance(instance).await {
            return WorkflowOutcome::Failed(err.into_proxy_error());
        }

        let ctx = WorkflowContext::new(instance.clone(), self.inner.clone());
        let running = instance.clone();
        let task = tokio::spawn(
            async move { running.workflow().run(&ctx, args).await }.in_current_span(),
        );
        match join_or_stop(task, stop).await {
            Ok(result) => WorkflowOutcome::from(result),
            Err(err) => {
                if stop.is_cancelled() {
                    instance.cancellation_token().cancel();
                    info!("Workflow invocation stopped");
                }
                WorkflowOutcome::Failed(err)
            }
        }
    }

    async fn start_instance(&self, instance: &WorkflowInstance) -> Result<(), WorkerError> {
        instance.advance(InstanceState::Registered)?;
        self.subscribe_methods(instance).await?;
        instance.advance(InstanceState::Running)
    }

    /// Tell the proxy which signals and queries the instance answers.
    async fn subscribe_methods(&self, instance: &WorkflowInstance) -> Result<(), WorkerError> {
        let context_id = instance.key().context_id;
        for signal_name in instance.workflow().signal_names() {
            self.inner
                .call(&WorkflowSignalSubscribeRequest {
                    context_id,
                    signal_name,
                })
                .await?;
        }
        for query_name in instance.workflow().query_names() {
            self.inner
                .call(&WorkflowSetQueryHandlerRequest {
                    context_id,
                    query_name,
                })
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self, request), fields(context_id = request.context_id, signal = %request.signal_name))]
    async fn signal(&self, request: WorkflowSignalInvokeRequest) -> WorkflowSignalInvokeReply {
        let Some(instance) = self.inner.contexts.lookup(self.key(request.context_id)) else {
            // Signals may race workflow start and teardown.
            debug!("Signal for unknown context ignored");
            return WorkflowSignalInvokeReply::default();
        };

        let ctx = WorkflowContext::new(instance.clone(), self.inner.clone());
        let args = request.signal_args.unwrap_or_default();
        let Some(handler) = instance.workflow().signal(&request.signal_name, ctx, args) else {
            warn!("No handler for signal");
            return WorkflowSignalInvokeReply::from_error(ProxyError::bad_request(format!(
                "workflow has no signal handler named '{}'",
                request.signal_name
            )));
        };

        match tokio::spawn(handler.in_current_span()).await {
            Ok(Ok(())) => WorkflowSignalInvokeReply::default(),
            Ok(Err(err)) => {
                warn!(error = %err, "Signal handler failed");
                WorkflowSignalInvokeReply::from_error(err.into_proxy_error())
            }
            Err(err) => WorkflowSignalInvokeReply::from_error(task_failure(err)),
        }
    }

    #[instrument(skip(self, request), fields(context_id = request.context_id, query = %request.query_name))]
    async fn query(&self, request: WorkflowQueryInvokeRequest) -> WorkflowQueryInvokeReply {
        let key = self.key(request.context_id);
        let Some(instance) = self.inner.contexts.lookup(key) else {
            return WorkflowQueryInvokeReply::from_error(ProxyError::entity_not_exists(format!(
                "workflow context {key} not found"
            )));
        };

        let ctx = WorkflowContext::new(instance.clone(), self.inner.clone());
        let args = request.query_args.unwrap_or_default();
        let Some(handler) = instance.workflow().query(&request.query_name, ctx, args) else {
            return WorkflowQueryInvokeReply::from_error(ProxyError::entity_not_exists(format!(
                "query handler '{}' not found",
                request.query_name
            )));
        };

        match tokio::spawn(handler.in_current_span()).await {
            Ok(Ok(result)) => WorkflowQueryInvokeReply {
                result: Some(result),
                error: None,
            },
            Ok(Err(err)) => WorkflowQueryInvokeReply::from_error(err.into_proxy_error()),
            Err(err) => WorkflowQueryInvokeReply::from_error(task_failure(err)),
        }
    }

    // ========== Activities ==========

    #[instrument(skip(self, request), fields(context_id = request.context_id, activity = %request.activity))]
    async fn invoke_activity(&self, request_id: u64, request: ActivityInvokeRequest) -> ActivityInvokeReply {
        let Some(factory) = self.inner.activity_types.factory(&request.activity) else {
            return ActivityInvokeReply::from_error(ProxyError::entity_not_exists(format!(
                "activity type '{}' is not registered",
                request.activity
            )));
        };
        let key = self.key(request.context_id);
        let cancellation = self.inner.shutdown_token().child_token();
        if !self
            .inner
            .activities
            .try_register(key, Arc::new(cancellation.clone()))
        {
            return ActivityInvokeReply::from_error(ProxyError::already_exists(format!(
                "activity context {key} is already running"
            )));
        }

        let ctx = ActivityContext::regular(self.inner.clone(), &request, cancellation.clone());
        let activity = factory.create();
        let args = request.args.unwrap_or_default();
        debug!(activity_type = factory.type_name(), attempt = request.attempt, "Running activity");

        let inbound = self.inner.inbound.track(request_id);
        let task = tokio::spawn(async move { activity.run(&ctx, args).await }.in_current_span());
        let outcome = join_or_stop(task, inbound.stop_token()).await;
        drop(inbound);
        cancellation.cancel();
        self.inner.activities.remove(key);

        match outcome {
            Ok(Ok(ActivityExit::Completed(result))) => ActivityInvokeReply {
                result: Some(result),
                ..Default::default()
            },
            Ok(Ok(ActivityExit::CompleteExternally)) => {
                debug!("Activity will be completed externally");
                ActivityInvokeReply {
                    pending: true,
                    ..Default::default()
                }
            }
            Ok(Err(err)) => {
                info!(error = %err, "Activity failed");
                ActivityInvokeReply::from_error(err.into_proxy_error())
            }
            Err(err) => ActivityInvokeReply::from_error(err),
        }
    }

    /// Cancel the token of a running activity; the activity decides how to stop.
    fn stop_activity(&self, request: ActivityStoppingRequest) -> ActivityStoppingReply {
        match self.inner.activities.lookup(self.key(request.context_id)) {
            Some(cancellation) => {
                cancellation.cancel();
                info!(
                    context_id = request.context_id,
                    activity_id = %request.activity_id,
                    "Activity asked to stop"
                );
            }
            None => debug!(context_id = request.context_id, "Stop for unknown activity ignored"),
        }
        ActivityStoppingReply::default()
    }

    #[instrument(skip(self, request), fields(context_id = request.context_id, activity_type_id = request.activity_type_id))]
    async fn invoke_local_activity(
        &self,
        request: ActivityInvokeLocalRequest,
    ) -> ActivityInvokeLocalReply {
        let key = self.key(request.context_id);
        let Some(instance) = self.inner.contexts.lookup(key) else {
            return ActivityInvokeLocalReply::from_error(ProxyError::entity_not_exists(format!(
                "workflow context {key} not found"
            )));
        };
        let Some(factory) = instance.local_activity(request.activity_type_id) else {
            return ActivityInvokeLocalReply::from_error(ProxyError::entity_not_exists(format!(
                "local activity type {} is not registered",
                request.activity_type_id
            )));
        };

        let ctx = ActivityContext::local(
            request.activity_context_id,
            request.activity_type_id,
            instance.info().clone(),
            instance.cancellation_token().child_token(),
        );
        let activity = factory.create();
        let args = request.args.unwrap_or_default();
        debug!(activity = factory.type_name(), "Running local activity");

        let task = tokio::spawn(async move { activity.run(&ctx, args).await }.in_current_span());
        match task.await {
            Ok(Ok(result)) => ActivityInvokeLocalReply {
                result: Some(result),
                error: None,
            },
            Ok(Err(err)) => ActivityInvokeLocalReply::from_error(err.into_proxy_error()),
            Err(err) => ActivityInvokeLocalReply::from_error(task_failure(err)),
        }
    }

    // ========== Connection ==========

    /// Cancel the request named by `target_request_id`.
    ///
    /// An invocation the proxy is still waiting on is stopped first; otherwise
    /// the id names one of this client's own pending operations.
    fn cancel(&self, request: CancelRequest) -> CancelReply {
        let target = request.target_request_id;
        let was_cancelled =
            self.inner.inbound.stop(target) || self.inner.operations.cancel_and_remove(target);
        debug!(
            target_request_id = request.target_request_id,
            was_cancelled, "Cancel request"
        );
        CancelReply {
            was_cancelled,
            error: None,
        }
    }

    async fn terminate(&self) -> TerminateReply {
        info!(client_id = self.inner.client_id, "Proxy requested termination");
        self.inner.close().await;
        TerminateReply::default()
    }
}
