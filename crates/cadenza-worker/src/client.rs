// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker client: the owned runtime state of one proxy connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cadenza_protocol::payloads::*;
use cadenza_protocol::{ProxyMessage, ProxyReply, ProxyRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::activity::{Activity, ActivityError};
use crate::config::WorkerConfig;
use crate::correlation::{CorrelationTable, InboundTable};
use crate::dispatcher::Dispatcher;
use crate::error::{Result, WorkerError};
use crate::registry::{ActivityTypeRegistry, ContextRegistry, WorkflowTypeRegistry};
use crate::transport::ProxyTransport;
use crate::workflow::{Workflow, WorkflowInstance};

/// State shared by the client, its dispatcher and every workflow context.
pub(crate) struct ClientInner {
    pub(crate) client_id: u64,
    pub(crate) config: WorkerConfig,
    transport: Arc<dyn ProxyTransport>,
    pub(crate) operations: CorrelationTable,
    /// Proxy requests running user code, stoppable by a cancel request.
    pub(crate) inbound: InboundTable,
    pub(crate) contexts: ContextRegistry<WorkflowInstance>,
    /// Stop tokens of running regular activities, by activity context.
    pub(crate) activities: ContextRegistry<CancellationToken>,
    pub(crate) workflow_types: WorkflowTypeRegistry,
    pub(crate) activity_types: ActivityTypeRegistry,
    closing: AtomicBool,
    shutdown: CancellationToken,
}

/// Removes an operation from the table if its caller stops waiting early.
struct OperationGuard<'a> {
    table: &'a CorrelationTable,
    request_id: u64,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if self.table.cancel_and_remove(self.request_id) {
            debug!(request_id = self.request_id, "Abandoned pending operation");
        }
    }
}

impl ClientInner {
    pub(crate) fn new(config: WorkerConfig, transport: Arc<dyn ProxyTransport>) -> Self {
        Self {
            client_id: config.client_id,
            config,
            transport,
            operations: CorrelationTable::new(),
            inbound: InboundTable::new(),
            contexts: ContextRegistry::new(),
            activities: ContextRegistry::new(),
            workflow_types: WorkflowTypeRegistry::new(),
            activity_types: ActivityTypeRegistry::new(),
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Root token; workflow cancellation tokens are children of it.
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn mark_closing(&self, reason: &WorkerError) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            error!(client_id = self.client_id, error = %reason, "Proxy connection failed, closing");
        }
    }

    /// Send a request and wait for its correlated reply.
    ///
    /// A reply that carries an error is returned as [`WorkerError::Proxy`].
    pub(crate) async fn call<R: ProxyRequest>(&self, request: &R) -> Result<R::Reply> {
        if self.is_closing() {
            return Err(WorkerError::ConnectionClosed);
        }

        let mut message = ProxyMessage::from_payload(request)?.with_client_id(self.client_id);
        let pending = self.operations.enqueue(&mut message)?;
        let guard = OperationGuard {
            table: &self.operations,
            request_id: pending.request_id(),
        };

        if let Err(err) = self.transport.send(message).await {
            self.mark_closing(&err);
            return Err(err);
        }

        let reply = pending.wait().await?;
        drop(guard);
        let reply: R::Reply = reply.to_payload()?;
        Ok(reply.into_result()?)
    }

    /// Deliver a dispatcher-produced reply.
    pub(crate) async fn send_reply(&self, reply: ProxyMessage) -> Result<()> {
        let message_type = reply.message_type();
        if let Err(err) = self.transport.send(reply).await {
            self.mark_closing(&err);
            warn!(%message_type, error = %err, "Failed to send reply");
            return Err(err);
        }
        Ok(())
    }

    /// Stop the client: no new calls, every context evicted, every pending call failed.
    pub(crate) async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        let evicted = self.contexts.remove_all_for_client(self.client_id)
            + self.activities.remove_all_for_client(self.client_id);
        let failed = self.operations.fail_all();
        self.transport.close().await;
        info!(
            client_id = self.client_id,
            evicted, failed, "Worker client shut down"
        );
    }
}

/// Owned runtime for one proxy connection.
///
/// Holds the correlation table, the live workflow contexts and the registered
/// workflow types. Clones share the same state.
///
/// # Example
///
/// ```ignore
/// use cadenza_worker::{WorkerClient, WorkerConfig};
///
/// let client = WorkerClient::from_env()?;
/// client.connect().await?;
/// client.register_workflow::<Echo>("Echo", None).await?;
/// let worker_id = client.start_worker("default-domain", "default").await?;
///
/// cadenza_worker::listener::serve(client.config().listen_addr, client.dispatcher(), shutdown).await?;
/// ```
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<ClientInner>,
}

impl WorkerClient {
    // ========== Construction ==========

    /// Create a client that reaches the proxy through `transport`.
    pub fn new(config: WorkerConfig, transport: Arc<dyn ProxyTransport>) -> Self {
        Self {
            inner: Arc::new(ClientInner::new(config, transport)),
        }
    }

    /// Create a client that talks HTTP to the proxy described by `config`.
    #[cfg(feature = "http")]
    pub fn http(config: WorkerConfig) -> Result<Self> {
        let transport = crate::transport::http::HttpTransport::new(&config)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    /// Create an HTTP client from environment variables.
    ///
    /// See [`WorkerConfig::from_env`] for the variables read.
    #[cfg(feature = "http")]
    pub fn from_env() -> Result<Self> {
        Self::http(WorkerConfig::from_env()?)
    }

    /// Create a client wired to an in-process [`Emulator`](crate::emulator::Emulator).
    pub fn emulated(config: WorkerConfig, emulator: &crate::emulator::Emulator) -> Self {
        let transport = emulator.transport_for(config.client_id);
        let client = Self::new(config, transport);
        emulator.attach(client.dispatcher());
        client
    }

    pub fn client_id(&self) -> u64 {
        self.inner.client_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// The dispatcher bound to this client.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.inner.clone())
    }

    pub fn is_closing(&self) -> bool {
        self.inner.is_closing()
    }

    /// Number of workflow contexts currently executing.
    pub fn active_contexts(&self) -> usize {
        self.inner.contexts.len()
    }

    /// Number of regular activities currently executing.
    pub fn active_activities(&self) -> usize {
        self.inner.activities.len()
    }

    /// Number of calls waiting for a reply.
    pub fn pending_operations(&self) -> usize {
        self.inner.operations.len()
    }

    // ========== Connection ==========

    /// Send a request and wait for its reply.
    pub async fn call_proxy<R: ProxyRequest>(&self, request: &R) -> Result<R::Reply> {
        self.inner.call(request).await
    }

    /// Initialize the proxy, connect it to the orchestration server and start heartbeats.
    #[instrument(skip(self), fields(client_id = self.inner.client_id))]
    pub async fn connect(&self) -> Result<()> {
        let config = &self.inner.config;

        self.call_proxy(&InitializeRequest {
            library_address: config.listen_addr.ip().to_string(),
            library_port: config.listen_addr.port(),
        })
        .await?;

        self.call_proxy(&ConnectRequest {
            endpoints: config.endpoints.clone(),
            identity: config.identity.clone(),
            client_timeout: config.client_timeout(),
            domain: config.domain.clone(),
            create_domain: false,
        })
        .await?;

        self.set_cache_size(config.workflow_cache_size).await?;
        self.spawn_heartbeat();

        info!(proxy_url = %config.proxy_url, "Connected to proxy");
        Ok(())
    }

    fn spawn_heartbeat(&self) {
        let interval_ms = self.inner.config.heartbeat_interval_ms;
        if interval_ms == 0 {
            return;
        }

        let inner = Arc::downgrade(&self.inner);
        let cancel_token = self.inner.shutdown.clone();
        let interval = Duration::from_millis(interval_ms);

        tokio::spawn(async move {
            debug!(interval_ms, "Background heartbeat task started");

            loop {
                tokio::select! {
                    biased;

                    _ = cancel_token.cancelled() => {
                        debug!("Background heartbeat task cancelled");
                        break;
                    }

                    _ = tokio::time::sleep(interval) => {
                        let Some(inner) = inner.upgrade() else { break };
                        match inner.call(&HeartbeatRequest {}).await {
                            Ok(_) => debug!("Background heartbeat sent"),
                            Err(WorkerError::ConnectionClosed) => break,
                            Err(e) => warn!(error = %e, "Failed to send background heartbeat"),
                        }
                    }
                }
            }
        });
    }

    /// Check the proxy is responsive.
    pub async fn ping(&self) -> Result<()> {
        self.call_proxy(&PingRequest {}).await.map(|_| ())
    }

    /// Stop heartbeats, evict every context and fail every pending call.
    pub async fn shutdown(&self) {
        self.inner.close().await;
    }

    // ========== Workers ==========

    fn domain_or_default(&self, domain: Option<&str>) -> Option<String> {
        domain
            .map(str::to_string)
            .or_else(|| self.inner.config.domain.clone())
    }

    /// Register a workflow type under `name`, locally and with the proxy.
    ///
    /// Registering the same type twice is a no-op; registering a different
    /// type under a taken name fails with [`WorkerError::TypeConflict`]. If
    /// the proxy rejects the registration the local entry is dropped again,
    /// so a retry reaches the proxy.
    #[instrument(skip(self), fields(workflow_type = name))]
    pub async fn register_workflow<W: Workflow + Default>(
        &self,
        name: &str,
        domain: Option<&str>,
    ) -> Result<()> {
        if !self.inner.workflow_types.register::<W>(name)? {
            debug!("Workflow type already registered");
            return Ok(());
        }
        let registered = self
            .call_proxy(&WorkflowRegisterRequest {
                name: name.to_string(),
                domain: self.domain_or_default(domain),
            })
            .await;
        if let Err(err) = registered {
            self.inner.workflow_types.unregister(name);
            warn!(error = %err, "Proxy rejected workflow registration");
            return Err(err);
        }
        info!("Registered workflow type");
        Ok(())
    }

    /// Register a regular activity type under `name`, locally and with the proxy.
    ///
    /// Follows the same rules as [`WorkerClient::register_workflow`].
    #[instrument(skip(self), fields(activity_type = name))]
    pub async fn register_activity<A: Activity + Default>(
        &self,
        name: &str,
        domain: Option<&str>,
    ) -> Result<()> {
        if !self.inner.activity_types.register::<A>(name)? {
            debug!("Activity type already registered");
            return Ok(());
        }
        let registered = self
            .call_proxy(&ActivityRegisterRequest {
                name: name.to_string(),
                domain: self.domain_or_default(domain),
            })
            .await;
        if let Err(err) = registered {
            self.inner.activity_types.unregister(name);
            warn!(error = %err, "Proxy rejected activity registration");
            return Err(err);
        }
        info!("Registered activity type");
        Ok(())
    }

    /// Start polling `task_list` in `domain` for workflow tasks. Returns the worker id.
    #[instrument(skip(self))]
    pub async fn start_worker(&self, domain: &str, task_list: &str) -> Result<i64> {
        self.new_worker(domain, task_list, true).await
    }

    /// Start polling `task_list` in `domain` for activity tasks. Returns the worker id.
    #[instrument(skip(self))]
    pub async fn start_activity_worker(&self, domain: &str, task_list: &str) -> Result<i64> {
        self.new_worker(domain, task_list, false).await
    }

    async fn new_worker(&self, domain: &str, task_list: &str, is_workflow_worker: bool) -> Result<i64> {
        let reply = self
            .call_proxy(&NewWorkerRequest {
                domain: domain.to_string(),
                task_list: task_list.to_string(),
                is_workflow_worker,
            })
            .await?;
        info!(worker_id = reply.worker_id, is_workflow_worker, "Worker started");
        Ok(reply.worker_id)
    }

    pub async fn stop_worker(&self, worker_id: i64) -> Result<()> {
        self.call_proxy(&StopWorkerRequest { worker_id }).await?;
        info!(worker_id, "Worker stopped");
        Ok(())
    }

    pub async fn set_cache_size(&self, size: i32) -> Result<()> {
        self.call_proxy(&WorkflowSetCacheSizeRequest { size })
            .await
            .map(|_| ())
    }

    // ========== Domains ==========

    pub async fn register_domain(&self, request: DomainRegisterRequest) -> Result<()> {
        self.call_proxy(&request).await.map(|_| ())
    }

    pub async fn describe_domain(&self, name: &str) -> Result<DomainInfo> {
        let reply = self
            .call_proxy(&DomainDescribeRequest {
                name: name.to_string(),
            })
            .await?;
        reply
            .domain_info
            .ok_or_else(|| WorkerError::Internal("describe reply has no domain info".to_string()))
    }

    pub async fn update_domain(&self, request: DomainUpdateRequest) -> Result<()> {
        self.call_proxy(&request).await.map(|_| ())
    }

    // ========== Workflows ==========

    /// Start a workflow execution.
    #[instrument(skip(self, args, options), fields(workflow_type = workflow))]
    pub async fn start_workflow(
        &self,
        domain: Option<&str>,
        workflow: &str,
        args: Vec<u8>,
        options: StartWorkflowOptions,
    ) -> Result<WorkflowExecution> {
        let reply = self
            .call_proxy(&WorkflowExecuteRequest {
                domain: domain.map(str::to_string),
                workflow: workflow.to_string(),
                args: Some(args),
                options,
            })
            .await?;
        let execution = reply
            .execution
            .ok_or_else(|| WorkerError::Internal("execute reply has no execution".to_string()))?;
        info!(workflow_id = %execution.workflow_id, run_id = %execution.run_id, "Workflow started");
        Ok(execution)
    }

    /// Wait for a workflow to finish and return its result.
    pub async fn get_workflow_result(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> Result<Vec<u8>> {
        let reply = self
            .call_proxy(&WorkflowGetResultRequest {
                workflow_id: workflow_id.to_string(),
                run_id: run_id.map(str::to_string),
                domain: None,
            })
            .await?;
        Ok(reply.result.unwrap_or_default())
    }

    pub async fn signal_workflow(
        &self,
        workflow_id: &str,
        signal_name: &str,
        args: Vec<u8>,
    ) -> Result<()> {
        self.call_proxy(&WorkflowSignalRequest {
            workflow_id: workflow_id.to_string(),
            run_id: None,
            signal_name: signal_name.to_string(),
            signal_args: Some(args),
            domain: None,
        })
        .await
        .map(|_| ())
    }

    pub async fn query_workflow(
        &self,
        workflow_id: &str,
        query_name: &str,
        args: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let reply = self
            .call_proxy(&WorkflowQueryRequest {
                workflow_id: workflow_id.to_string(),
                run_id: None,
                query_name: query_name.to_string(),
                query_args: Some(args),
                domain: None,
            })
            .await?;
        Ok(reply.result.unwrap_or_default())
    }

    /// Signal a workflow, starting it first when it is not running.
    #[instrument(skip(self, signal_args, workflow_args, options), fields(workflow_type = workflow))]
    #[allow(clippy::too_many_arguments)]
    pub async fn signal_with_start_workflow(
        &self,
        domain: Option<&str>,
        workflow: &str,
        workflow_id: &str,
        signal_name: &str,
        signal_args: Vec<u8>,
        workflow_args: Vec<u8>,
        options: StartWorkflowOptions,
    ) -> Result<WorkflowExecution> {
        let reply = self
            .call_proxy(&WorkflowSignalWithStartRequest {
                workflow: workflow.to_string(),
                workflow_id: workflow_id.to_string(),
                signal_name: signal_name.to_string(),
                signal_args: Some(signal_args),
                workflow_args: Some(workflow_args),
                options,
                domain: domain.map(str::to_string),
            })
            .await?;
        reply.execution.ok_or_else(|| {
            WorkerError::Internal("signal-with-start reply has no execution".to_string())
        })
    }

    pub async fn terminate_workflow(&self, workflow_id: &str, reason: Option<&str>) -> Result<()> {
        self.call_proxy(&WorkflowTerminateRequest {
            workflow_id: workflow_id.to_string(),
            reason: reason.map(str::to_string),
            ..Default::default()
        })
        .await
        .map(|_| ())
    }

    // ========== Activities ==========

    /// Complete an activity that returned [`ActivityExit::CompleteExternally`](crate::ActivityExit).
    pub async fn complete_activity(&self, task_token: Vec<u8>, result: Vec<u8>) -> Result<()> {
        self.call_proxy(&ActivityCompleteRequest {
            task_token: Some(task_token),
            result: Some(result),
            error: None,
        })
        .await
        .map(|_| ())
    }

    /// Fail an activity that returned [`ActivityExit::CompleteExternally`](crate::ActivityExit).
    pub async fn fail_activity(&self, task_token: Vec<u8>, error: ActivityError) -> Result<()> {
        self.call_proxy(&ActivityCompleteRequest {
            task_token: Some(task_token),
            result: None,
            error: Some(error.into_proxy_error()),
        })
        .await
        .map(|_| ())
    }

    /// Record a heartbeat for an externally completed activity.
    pub async fn record_activity_heartbeat(&self, task_token: Vec<u8>, details: Vec<u8>) -> Result<()> {
        self.call_proxy(&ActivityRecordHeartbeatRequest {
            task_token: Some(task_token),
            details: Some(details),
        })
        .await
        .map(|_| ())
    }
}
