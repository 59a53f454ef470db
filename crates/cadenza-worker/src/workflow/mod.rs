// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow authoring surface.
//!
//! A workflow implements [`Workflow`]. Its `run` entry point must be
//! deterministic: time, sleeps, version checks and non-deterministic values
//! all go through [`WorkflowContext`], whose calls are recorded in history and
//! replay identically.
//!
//! `run` ends in one of three ways, folded by the dispatcher into a
//! [`WorkflowOutcome`]:
//! - `Ok(WorkflowExit::Completed(bytes))`
//! - `Ok(WorkflowExit::ContinueAsNew(..))`, restarting with fresh history
//! - `Err(WorkflowError)`
//!
//! # Example
//!
//! ```ignore
//! use cadenza_worker::{MethodMapBuilder, Workflow, WorkflowContext, WorkflowError, WorkflowExit};
//!
//! #[derive(Default)]
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Workflow for Echo {
//!     fn register_methods(methods: &mut MethodMapBuilder<Self>) {
//!         methods.query("ping", |_, _, _| async { Ok(b"pong".to_vec()) });
//!     }
//!
//!     async fn run(&self, _ctx: &WorkflowContext, args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
//!         Ok(WorkflowExit::Completed(args))
//!     }
//! }
//! ```

mod context;
mod instance;

use std::time::Duration;

use async_trait::async_trait;
use cadenza_protocol::payloads::{RetryPolicy, WorkflowInvokeReply};
use cadenza_protocol::{ErrorKind, ProxyError};
use thiserror::Error;

use crate::error::WorkerError;
use crate::method_map::MethodMapBuilder;

pub use context::{ChildWorkflow, WorkflowContext};
pub use instance::{InstanceState, WorkflowInfo, WorkflowInstance};
pub(crate) use instance::{ErasedWorkflow, WorkflowFactory, bind};

/// User-supplied workflow logic.
#[async_trait]
pub trait Workflow: Sized + Send + Sync + 'static {
    /// Declare signal and query handlers. Called once per type.
    fn register_methods(_methods: &mut MethodMapBuilder<Self>) {}

    /// Entry point of one run.
    async fn run(&self, ctx: &WorkflowContext, args: Vec<u8>)
    -> Result<WorkflowExit, WorkflowError>;
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowExit {
    Completed(Vec<u8>),
    ContinueAsNew(ContinueAsNew),
}

impl From<ContinueAsNew> for WorkflowExit {
    fn from(value: ContinueAsNew) -> Self {
        WorkflowExit::ContinueAsNew(value)
    }
}

/// Restart the workflow with new arguments and a clean history.
///
/// Unset fields keep the values of the current run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContinueAsNew {
    pub args: Vec<u8>,
    pub workflow: Option<String>,
    pub domain: Option<String>,
    pub task_list: Option<String>,
    pub execution_start_to_close_timeout: Option<Duration>,
    pub schedule_to_close_timeout: Option<Duration>,
    pub schedule_to_start_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
}

impl ContinueAsNew {
    pub fn new(args: Vec<u8>) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }

    /// Continue as a different workflow type.
    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = Some(workflow.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_task_list(mut self, task_list: impl Into<String>) -> Self {
        self.task_list = Some(task_list.into());
        self
    }

    pub fn with_execution_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.execution_start_to_close_timeout = Some(timeout);
        self
    }

    pub fn with_schedule_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_close_timeout = Some(timeout);
        self
    }

    pub fn with_schedule_to_start_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_start_timeout = Some(timeout);
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Errors raised by workflow code and its handlers.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A structured error, either returned by a routed call or raised by user code
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// A local worker failure (transport, protocol)
    #[error(transparent)]
    Worker(WorkerError),

    /// The workflow was cancelled
    #[error("workflow cancelled")]
    Cancelled,

    /// Any other failure, reported with a generic error kind
    #[error("{0}")]
    Failed(String),
}

impl WorkflowError {
    pub fn failed(message: impl Into<String>) -> Self {
        WorkflowError::Failed(message.into())
    }

    /// Whether this is a structured error of the given kind.
    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        matches!(self, WorkflowError::Proxy(err) if err.kind == kind)
    }

    /// Convert into the structured error carried in a reply.
    pub fn into_proxy_error(self) -> ProxyError {
        match self {
            WorkflowError::Proxy(err) => err,
            WorkflowError::Worker(err) => err.into_proxy_error(),
            WorkflowError::Cancelled => ProxyError::cancelled("workflow cancelled"),
            WorkflowError::Failed(message) => ProxyError::generic(message),
        }
    }
}

impl From<WorkerError> for WorkflowError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Proxy(err) => WorkflowError::Proxy(err),
            WorkerError::Cancelled => WorkflowError::Cancelled,
            other => WorkflowError::Worker(other),
        }
    }
}

/// The three ways a run can end.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    Completed(Vec<u8>),
    ContinueAsNew(ContinueAsNew),
    Failed(ProxyError),
}

impl From<Result<WorkflowExit, WorkflowError>> for WorkflowOutcome {
    fn from(result: Result<WorkflowExit, WorkflowError>) -> Self {
        match result {
            Ok(WorkflowExit::Completed(result)) => WorkflowOutcome::Completed(result),
            Ok(WorkflowExit::ContinueAsNew(next)) => WorkflowOutcome::ContinueAsNew(next),
            Err(err) => WorkflowOutcome::Failed(err.into_proxy_error()),
        }
    }
}

impl WorkflowOutcome {
    pub fn state(&self) -> InstanceState {
        match self {
            WorkflowOutcome::Completed(_) => InstanceState::Completed,
            WorkflowOutcome::ContinueAsNew(_) => InstanceState::ContinuedAsNew,
            WorkflowOutcome::Failed(_) => InstanceState::Failed,
        }
    }

    /// Build the invoke reply for this outcome.
    pub fn into_reply(self) -> WorkflowInvokeReply {
        match self {
            WorkflowOutcome::Completed(result) => WorkflowInvokeReply {
                result: Some(result),
                ..Default::default()
            },
            WorkflowOutcome::ContinueAsNew(next) => WorkflowInvokeReply {
                continue_as_new: true,
                continue_as_new_args: Some(next.args),
                continue_as_new_workflow: next.workflow,
                continue_as_new_domain: next.domain,
                continue_as_new_task_list: next.task_list,
                continue_as_new_execution_start_to_close_timeout: next
                    .execution_start_to_close_timeout
                    .unwrap_or_default(),
                continue_as_new_schedule_to_close_timeout: next
                    .schedule_to_close_timeout
                    .unwrap_or_default(),
                continue_as_new_schedule_to_start_timeout: next
                    .schedule_to_start_timeout
                    .unwrap_or_default(),
                continue_as_new_start_to_close_timeout: next
                    .start_to_close_timeout
                    .unwrap_or_default(),
                continue_as_new_retry_policy: next.retry_policy,
                ..Default::default()
            },
            WorkflowOutcome::Failed(error) => WorkflowInvokeReply {
                error: Some(error),
                ..Default::default()
            },
        }
    }
}
