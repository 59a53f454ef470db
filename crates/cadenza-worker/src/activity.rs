// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Regular and local activities.
//!
//! A regular activity is registered by name with
//! [`WorkerClient::register_activity`](crate::WorkerClient::register_activity)
//! and runs on whichever worker polls its task list. The proxy calls it with an
//! `ActivityInvoke` request carrying a task token; the activity may heartbeat
//! through that token and may leave its completion to an external party.
//!
//! A local activity runs inside the worker that hosts the calling workflow.
//! The workflow schedules it with
//! [`WorkflowContext::execute_local_activity`](crate::WorkflowContext::execute_local_activity);
//! the proxy then calls back with an `ActivityInvokeLocal` request naming the
//! activity type by the id the workflow assigned to it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cadenza_protocol::payloads::{
    ActivityGetHeartbeatDetailsRequest, ActivityHasHeartbeatDetailsRequest, ActivityInvokeRequest,
    ActivityRecordHeartbeatRequest,
};
use cadenza_protocol::{ErrorKind, ProxyError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::client::ClientInner;
use crate::error::WorkerError;
use crate::workflow::WorkflowInfo;

/// User-supplied regular activity logic.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    async fn run(&self, ctx: &ActivityContext, args: Vec<u8>) -> Result<ActivityExit, ActivityError>;
}

/// How a regular activity attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityExit {
    Completed(Vec<u8>),
    /// The result will be reported later with
    /// [`WorkerClient::complete_activity`](crate::WorkerClient::complete_activity),
    /// using the attempt's task token.
    CompleteExternally,
}

/// User-supplied local activity logic.
#[async_trait]
pub trait LocalActivity: Send + Sync + 'static {
    async fn run(&self, ctx: &ActivityContext, args: Vec<u8>) -> Result<Vec<u8>, ActivityError>;
}

/// Errors raised by activity code.
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("activity cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl ActivityError {
    pub fn failed(message: impl Into<String>) -> Self {
        ActivityError::Failed(message.into())
    }

    pub fn into_proxy_error(self) -> ProxyError {
        match self {
            ActivityError::Proxy(err) => err,
            ActivityError::Cancelled => ProxyError::cancelled("activity cancelled"),
            ActivityError::Failed(message) => ProxyError::new(ErrorKind::Custom, message),
        }
    }
}

impl From<WorkerError> for ActivityError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Cancelled => ActivityError::Cancelled,
            other => ActivityError::Proxy(other.into_proxy_error()),
        }
    }
}

/// What a running activity knows about itself.
#[derive(Clone)]
pub struct ActivityContext {
    activity_context_id: i64,
    activity_type_id: i64,
    activity_id: String,
    task_token: Option<Vec<u8>>,
    attempt: i32,
    workflow: WorkflowInfo,
    cancellation: CancellationToken,
    /// Present for regular activities, which heartbeat through the proxy.
    client: Option<Arc<ClientInner>>,
}

impl ActivityContext {
    pub(crate) fn local(
        activity_context_id: i64,
        activity_type_id: i64,
        workflow: WorkflowInfo,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            activity_context_id,
            activity_type_id,
            activity_id: String::new(),
            task_token: None,
            attempt: 0,
            workflow,
            cancellation,
            client: None,
        }
    }

    pub(crate) fn regular(
        client: Arc<ClientInner>,
        request: &ActivityInvokeRequest,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            activity_context_id: request.context_id,
            activity_type_id: 0,
            activity_id: request.activity_id.clone(),
            task_token: request.task_token.clone(),
            attempt: request.attempt,
            workflow: WorkflowInfo {
                context_id: 0,
                domain: request.domain.clone(),
                workflow_id: request.workflow_id.clone(),
                run_id: request.run_id.clone(),
                task_list: request.task_list.clone(),
                workflow_type: request.workflow_type.clone(),
            },
            cancellation,
            client: Some(client),
        }
    }

    pub fn activity_context_id(&self) -> i64 {
        self.activity_context_id
    }

    /// Per-workflow id of a local activity type; zero for regular activities.
    pub fn activity_type_id(&self) -> i64 {
        self.activity_type_id
    }

    /// Server-assigned activity id; empty for local activities.
    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    pub fn task_token(&self) -> Option<&[u8]> {
        self.task_token.as_deref()
    }

    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn is_local(&self) -> bool {
        self.client.is_none()
    }

    /// The workflow that scheduled this activity.
    pub fn workflow(&self) -> &WorkflowInfo {
        &self.workflow
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    fn heartbeat_client(&self) -> Result<&ClientInner, ActivityError> {
        self.client.as_deref().ok_or_else(|| {
            ActivityError::Proxy(ProxyError::bad_request(
                "local activities cannot record heartbeats",
            ))
        })
    }

    /// Report progress; `details` are readable by later attempts.
    pub async fn record_heartbeat(&self, details: Vec<u8>) -> Result<(), ActivityError> {
        self.heartbeat_client()?
            .call(&ActivityRecordHeartbeatRequest {
                task_token: self.task_token.clone(),
                details: Some(details),
            })
            .await?;
        Ok(())
    }

    /// Details of the last recorded heartbeat, if any.
    pub async fn heartbeat_details(&self) -> Result<Option<Vec<u8>>, ActivityError> {
        let reply = self
            .heartbeat_client()?
            .call(&ActivityGetHeartbeatDetailsRequest {
                task_token: self.task_token.clone(),
            })
            .await?;
        Ok(reply.details)
    }

    pub async fn has_heartbeat_details(&self) -> Result<bool, ActivityError> {
        let reply = self
            .heartbeat_client()?
            .call(&ActivityHasHeartbeatDetailsRequest {
                task_token: self.task_token.clone(),
            })
            .await?;
        Ok(reply.has_details)
    }
}

impl fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityContext")
            .field("activity_context_id", &self.activity_context_id)
            .field("activity_type_id", &self.activity_type_id)
            .field("activity_id", &self.activity_id)
            .field("attempt", &self.attempt)
            .field("workflow", &self.workflow)
            .finish_non_exhaustive()
    }
}

/// Creates fresh regular activity objects of one type.
#[derive(Clone)]
pub(crate) struct ActivityFactory {
    type_name: &'static str,
    create: Arc<dyn Fn() -> Box<dyn Activity> + Send + Sync>,
}

impl ActivityFactory {
    pub(crate) fn of<A: Activity + Default>() -> Self {
        Self {
            type_name: std::any::type_name::<A>(),
            create: Arc::new(|| Box::new(A::default())),
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn create(&self) -> Box<dyn Activity> {
        (self.create)()
    }
}

/// Creates fresh local activity objects of one type.
#[derive(Clone)]
pub struct LocalActivityFactory {
    type_name: &'static str,
    create: Arc<dyn Fn() -> Box<dyn LocalActivity> + Send + Sync>,
}

impl LocalActivityFactory {
    pub fn of<A: LocalActivity + Default>() -> Self {
        Self {
            type_name: std::any::type_name::<A>(),
            create: Arc::new(|| Box::new(A::default())),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn create(&self) -> Box<dyn LocalActivity> {
        (self.create)()
    }
}

impl fmt::Debug for LocalActivityFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalActivityFactory")
            .field("type_name", &self.type_name)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    #[derive(Default)]
    pub(crate) struct EchoActivity;

    #[async_trait]
    impl LocalActivity for EchoActivity {
        async fn run(
            &self,
            _ctx: &ActivityContext,
            args: Vec<u8>,
        ) -> Result<Vec<u8>, ActivityError> {
            Ok(args)
        }
    }

    #[async_trait]
    impl Activity for EchoActivity {
        async fn run(
            &self,
            _ctx: &ActivityContext,
            args: Vec<u8>,
        ) -> Result<ActivityExit, ActivityError> {
            Ok(ActivityExit::Completed(args))
        }
    }

    pub(crate) fn echo_factory() -> LocalActivityFactory {
        LocalActivityFactory::of::<EchoActivity>()
    }
}
