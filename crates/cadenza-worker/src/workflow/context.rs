// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replay-safe primitives available to running workflows.
//!
//! Every call here is routed through the proxy and recorded in the workflow's
//! history, so a replayed run observes exactly the values the original run did.

use std::sync::Arc;
use std::time::Duration;

use cadenza_protocol::ProxyError;
use cadenza_protocol::payloads::*;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::{ContinueAsNew, WorkflowError, WorkflowInfo, WorkflowInstance};
use crate::activity::{LocalActivity, LocalActivityFactory};
use crate::client::ClientInner;

/// Prefix of the mutable ids that back workflow variables.
const VARIABLE_PREFIX: &str = "var:";

/// A child workflow started by [`WorkflowContext::start_child_workflow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildWorkflow {
    pub child_id: i64,
    pub execution: WorkflowExecution,
}

/// Handle a workflow uses to talk to the proxy.
///
/// Cheap to clone; every clone refers to the same execution context.
#[derive(Clone)]
pub struct WorkflowContext {
    instance: Arc<WorkflowInstance>,
    client: Arc<ClientInner>,
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("key", &self.instance.key())
            .finish_non_exhaustive()
    }
}

type Result<T> = std::result::Result<T, WorkflowError>;

impl WorkflowContext {
    pub(crate) fn new(instance: Arc<WorkflowInstance>, client: Arc<ClientInner>) -> Self {
        Self { instance, client }
    }

    fn context_id(&self) -> i64 {
        self.instance.key().context_id
    }

    pub fn info(&self) -> &WorkflowInfo {
        self.instance.info()
    }

    /// Whether this run is replaying recorded history.
    pub fn is_replaying(&self) -> bool {
        self.instance.is_replaying()
    }

    pub fn instance(&self) -> &Arc<WorkflowInstance> {
        &self.instance
    }

    /// Token cancelled when the workflow is cancelled or the client shuts down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.instance.cancellation_token()
    }

    /// Build a continue-as-new exit with the current run's settings.
    pub fn continue_as_new(&self, args: Vec<u8>) -> ContinueAsNew {
        ContinueAsNew::new(args)
    }

    // ========== Time ==========

    /// Workflow time, as recorded in history.
    pub async fn utc_now(&self) -> Result<DateTime<Utc>> {
        let reply = self
            .client
            .call(&WorkflowGetTimeRequest {
                context_id: self.context_id(),
            })
            .await?;
        reply
            .time
            .ok_or_else(|| WorkflowError::failed("time reply has no time"))
    }

    /// Durable sleep. Returns [`WorkflowError::Cancelled`] if the workflow is cancelled first.
    #[instrument(skip(self), fields(context_id = self.context_id()))]
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        let token = self.cancellation_token();
        let request = WorkflowSleepRequest {
            context_id: self.context_id(),
            duration,
        };

        tokio::select! {
            biased;

            _ = token.cancelled() => {
                debug!("Sleep cancelled");
                Err(WorkflowError::Cancelled)
            }

            result = self.client.call(&request) => {
                result?;
                Ok(())
            }
        }
    }

    /// Sleep until `wake_time` in workflow time. Returns at once if it has passed.
    pub async fn sleep_until(&self, wake_time: DateTime<Utc>) -> Result<()> {
        let now = self.utc_now().await?;
        if wake_time <= now {
            return Ok(());
        }
        let remaining = (wake_time - now).to_std().unwrap_or_default();
        self.sleep(remaining).await
    }

    // ========== Versioning ==========

    /// Version to use for `change_id`.
    ///
    /// New executions record `max_supported`; replays return the recorded value.
    pub async fn get_version(
        &self,
        change_id: &str,
        min_supported: i32,
        max_supported: i32,
    ) -> Result<i32> {
        if min_supported > max_supported {
            return Err(ProxyError::bad_request(format!(
                "invalid version range [{min_supported}, {max_supported}] for '{change_id}'"
            ))
            .into());
        }
        let reply = self
            .client
            .call(&WorkflowGetVersionRequest {
                context_id: self.context_id(),
                change_id: change_id.to_string(),
                min_supported,
                max_supported,
            })
            .await?;
        Ok(reply.version)
    }

    // ========== Side effects ==========

    /// Record a non-deterministic value under `mutable_id`.
    ///
    /// On replay the recorded value is returned and `value` is ignored.
    pub async fn mutable_side_effect(&self, mutable_id: &str, value: Vec<u8>) -> Result<Vec<u8>> {
        let reply = self
            .client
            .call(&WorkflowMutableRequest {
                context_id: self.context_id(),
                mutable_id: mutable_id.to_string(),
                result: Some(value),
                update: true,
            })
            .await?;
        Ok(reply.result.unwrap_or_default())
    }

    /// Store a workflow variable. Returns the value recorded in history.
    pub async fn set_variable(&self, name: &str, value: Vec<u8>) -> Result<Vec<u8>> {
        let recorded = self
            .mutable_side_effect(&format!("{VARIABLE_PREFIX}{name}"), value)
            .await?;
        self.instance.cache_variable(name, Some(recorded.clone()));
        Ok(recorded)
    }

    /// Read a workflow variable, or `None` if it was never set.
    pub async fn get_variable(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let reply = self
            .client
            .call(&WorkflowMutableRequest {
                context_id: self.context_id(),
                mutable_id: format!("{VARIABLE_PREFIX}{name}"),
                result: None,
                update: false,
            })
            .await?;
        self.instance.cache_variable(name, reply.result.clone());
        Ok(reply.result)
    }

    /// Whether a previous cron run left a result.
    pub async fn has_last_result(&self) -> Result<bool> {
        let reply = self
            .client
            .call(&WorkflowHasLastResultRequest {
                context_id: self.context_id(),
            })
            .await?;
        Ok(reply.has_result)
    }

    pub async fn get_last_result(&self) -> Result<Vec<u8>> {
        let reply = self
            .client
            .call(&WorkflowGetLastResultRequest {
                context_id: self.context_id(),
            })
            .await?;
        Ok(reply.result.unwrap_or_default())
    }

    // ========== Activities ==========

    /// Schedule the regular activity registered as `activity` and wait for its result.
    ///
    /// The activity runs on whichever worker polls the task list in `options`,
    /// defaulting to this workflow's task list.
    #[instrument(skip(self, args, options), fields(context_id = self.context_id()))]
    pub async fn execute_activity(
        &self,
        activity: &str,
        args: Vec<u8>,
        options: ActivityOptions,
    ) -> Result<Vec<u8>> {
        let reply = self
            .client
            .call(&ActivityExecuteRequest {
                context_id: self.context_id(),
                activity: activity.to_string(),
                args: Some(args),
                options,
                domain: None,
            })
            .await?;
        Ok(reply.result.unwrap_or_default())
    }

    /// Run `A` as a local activity and wait for its result.
    #[instrument(skip(self, args, options), fields(context_id = self.context_id(), activity = std::any::type_name::<A>()))]
    pub async fn execute_local_activity<A: LocalActivity + Default>(
        &self,
        args: Vec<u8>,
        options: LocalActivityOptions,
    ) -> Result<Vec<u8>> {
        let activity_type_id = self
            .instance
            .register_local_activity(LocalActivityFactory::of::<A>());
        let reply = self
            .client
            .call(&ActivityExecuteLocalRequest {
                context_id: self.context_id(),
                activity_type_id,
                args: Some(args),
                options,
            })
            .await?;
        Ok(reply.result.unwrap_or_default())
    }

    // ========== Child workflows ==========

    /// Start a child workflow without waiting for it.
    #[instrument(skip(self, args, options), fields(context_id = self.context_id()))]
    pub async fn start_child_workflow(
        &self,
        workflow: &str,
        args: Vec<u8>,
        options: ChildWorkflowOptions,
    ) -> Result<ChildWorkflow> {
        let reply = self
            .client
            .call(&WorkflowExecuteChildRequest {
                context_id: self.context_id(),
                workflow: workflow.to_string(),
                args: Some(args),
                options,
            })
            .await?;
        let execution = reply
            .execution
            .ok_or_else(|| WorkflowError::failed("child reply has no execution"))?;
        debug!(child_id = reply.child_id, workflow_id = %execution.workflow_id, "Child workflow started");
        Ok(ChildWorkflow {
            child_id: reply.child_id,
            execution,
        })
    }

    /// Wait for a child started by this workflow and return its result.
    pub async fn wait_for_child(&self, child: &ChildWorkflow) -> Result<Vec<u8>> {
        let reply = self
            .client
            .call(&WorkflowWaitForChildRequest {
                context_id: self.context_id(),
                child_id: child.child_id,
            })
            .await?;
        Ok(reply.result.unwrap_or_default())
    }

    /// Send a signal to a child started by this workflow.
    pub async fn signal_child_workflow(
        &self,
        child: &ChildWorkflow,
        signal_name: &str,
        args: Vec<u8>,
    ) -> Result<()> {
        self.client
            .call(&WorkflowSignalChildRequest {
                context_id: self.context_id(),
                child_id: child.child_id,
                signal_name: signal_name.to_string(),
                signal_args: Some(args),
            })
            .await?;
        Ok(())
    }

    /// Ask a child started by this workflow to cancel.
    ///
    /// A later [`WorkflowContext::wait_for_child`] fails with a `Cancelled` error.
    pub async fn cancel_child_workflow(&self, child: &ChildWorkflow) -> Result<()> {
        self.client
            .call(&WorkflowCancelChildRequest {
                context_id: self.context_id(),
                child_id: child.child_id,
            })
            .await?;
        debug!(child_id = child.child_id, "Child workflow cancellation requested");
        Ok(())
    }

    /// Start a child workflow and wait for its result.
    pub async fn execute_child_workflow(
        &self,
        workflow: &str,
        args: Vec<u8>,
        options: ChildWorkflowOptions,
    ) -> Result<Vec<u8>> {
        let child = self.start_child_workflow(workflow, args, options).await?;
        self.wait_for_child(&child).await
    }

    // ========== Cancellation ==========

    /// Detach from cancellation so cleanup code can keep calling the proxy.
    ///
    /// Only the first call reaches the proxy.
    pub async fn disconnect_context(&self) -> Result<()> {
        if !self.instance.disconnect() {
            return Ok(());
        }
        self.client
            .call(&WorkflowDisconnectContextRequest {
                context_id: self.context_id(),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
impl WorkflowContext {
    /// A context whose proxy calls all fail with a transport error.
    pub(crate) fn detached_for_tests() -> Self {
        use crate::config::WorkerConfig;
        use crate::error::WorkerError;
        use crate::registry::ContextKey;
        use crate::transport::ProxyTransport;

        struct Unreachable;

        #[async_trait::async_trait]
        impl ProxyTransport for Unreachable {
            async fn send(&self, _message: cadenza_protocol::ProxyMessage) -> crate::error::Result<()> {
                Err(WorkerError::Transport("no proxy in tests".to_string()))
            }
        }

        #[derive(Default)]
        struct Idle;

        #[async_trait::async_trait]
        impl super::Workflow for Idle {
            async fn run(
                &self,
                _ctx: &WorkflowContext,
                args: Vec<u8>,
            ) -> std::result::Result<super::WorkflowExit, WorkflowError> {
                Ok(super::WorkflowExit::Completed(args))
            }
        }

        let client = Arc::new(ClientInner::new(
            WorkerConfig::localhost(),
            Arc::new(Unreachable),
        ));
        let instance = Arc::new(WorkflowInstance::new(
            ContextKey::new(client.client_id, 1),
            WorkflowInfo::default(),
            super::bind::<Idle>()(),
            false,
            client.shutdown_token().child_token(),
        ));
        Self::new(instance, client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_protocol::ErrorKind;

    #[tokio::test]
    async fn test_invalid_version_range_fails_without_call() {
        let ctx = WorkflowContext::detached_for_tests();
        let err = ctx.get_version("change", 3, 1).await.unwrap_err();
        assert!(err.is_kind(ErrorKind::BadRequest));
        assert_eq!(ctx.client.operations.len(), 0);
    }

    #[tokio::test]
    async fn test_sleep_returns_cancelled_when_token_fires() {
        let ctx = WorkflowContext::detached_for_tests();
        ctx.cancellation_token().cancel();
        let err = ctx.sleep(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled));
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces_as_worker_error() {
        let ctx = WorkflowContext::detached_for_tests();
        let err = ctx.utc_now().await.unwrap_err();
        assert!(matches!(err, WorkflowError::Worker(_)));
        // The failed call must not linger in the correlation table.
        assert!(ctx.client.operations.is_empty());
    }

    #[tokio::test]
    async fn test_second_disconnect_is_local() {
        let ctx = WorkflowContext::detached_for_tests();
        // The first disconnect reaches the (unreachable) proxy and fails...
        assert!(ctx.disconnect_context().await.is_err());
        // ...the second is a no-op.
        assert!(ctx.disconnect_context().await.is_ok());
        assert!(ctx.instance().is_disconnected());
    }
}
