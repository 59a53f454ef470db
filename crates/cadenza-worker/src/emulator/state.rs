// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tables kept by the emulator.

use std::collections::{HashMap, VecDeque};

use cadenza_protocol::ProxyError;
use cadenza_protocol::payloads::{DomainInfo, WorkflowExecution, WorkflowInvokeRequest};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::history::{Cursor, History};
use crate::dispatcher::WeakDispatcher;

/// Final result of a workflow, as seen by `GetResult` and `WaitForChild`.
pub(crate) type Completion = Option<Result<Vec<u8>, ProxyError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    Canceled,
}

impl WorkflowStatus {
    pub fn is_active(self) -> bool {
        matches!(self, WorkflowStatus::Pending | WorkflowStatus::Running)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WorkerEntry {
    pub client_id: u64,
    pub domain: String,
    pub task_list: String,
    pub is_workflow_worker: bool,
}

pub(crate) struct PendingQuery {
    pub name: String,
    pub args: Option<Vec<u8>>,
    pub reply: oneshot::Sender<Result<Vec<u8>, ProxyError>>,
}

/// One workflow id and its current run.
pub(crate) struct EmulatedWorkflow {
    pub execution: WorkflowExecution,
    pub workflow_type: String,
    pub domain: String,
    pub task_list: String,
    pub args: Vec<u8>,
    /// Top-level workflows are terminated on shutdown; children follow their parent.
    pub is_global: bool,
    pub status: WorkflowStatus,
    /// Client and context of the current invocation.
    pub client_id: Option<u64>,
    pub context_id: Option<i64>,
    /// Request id of the `WorkflowInvoke` the worker is answering.
    pub invoke_request_id: Option<u64>,
    pub history: History,
    pub cancellation: CancellationToken,
    pub completion: watch::Sender<Completion>,
    pub signals: VecDeque<(String, Option<Vec<u8>>)>,
    pub queries: VecDeque<PendingQuery>,
    pub children: HashMap<i64, String>,
    next_child_id: i64,
}

impl EmulatedWorkflow {
    pub fn new(
        workflow_id: String,
        workflow_type: String,
        domain: String,
        task_list: String,
        args: Vec<u8>,
        is_global: bool,
    ) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            execution: WorkflowExecution::new(workflow_id, Uuid::new_v4().to_string()),
            workflow_type,
            domain,
            task_list,
            args,
            is_global,
            status: WorkflowStatus::Pending,
            client_id: None,
            context_id: None,
            invoke_request_id: None,
            history: History::default(),
            cancellation: CancellationToken::new(),
            completion,
            signals: VecDeque::new(),
            queries: VecDeque::new(),
            children: HashMap::new(),
            next_child_id: 0,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.execution.workflow_id
    }

    pub fn allocate_child_id(&mut self) -> i64 {
        self.next_child_id += 1;
        self.next_child_id
    }

    /// Start a new run under the same workflow id with a clean history.
    pub fn restart(&mut self, args: Vec<u8>) {
        self.execution.run_id = Uuid::new_v4().to_string();
        self.args = args;
        self.history = History::default();
        self.status = WorkflowStatus::Pending;
        self.client_id = None;
        self.context_id = None;
        self.invoke_request_id = None;
        self.children.clear();
        self.next_child_id = 0;
    }

    /// Record the final result and wake every waiter.
    pub fn finish(&mut self, status: WorkflowStatus, result: Result<Vec<u8>, ProxyError>) {
        self.status = status;
        self.client_id = None;
        self.context_id = None;
        self.invoke_request_id = None;
        self.completion.send_replace(Some(result));
        for query in self.queries.drain(..) {
            let _ = query.reply.send(Err(ProxyError::bad_request(
                "workflow closed before the query was answered",
            )));
        }
        self.signals.clear();
    }

    pub fn invoke_request(&self, context_id: i64, is_replaying: bool) -> WorkflowInvokeRequest {
        WorkflowInvokeRequest {
            context_id,
            domain: self.domain.clone(),
            workflow_id: self.execution.workflow_id.clone(),
            run_id: self.execution.run_id.clone(),
            workflow_type: self.workflow_type.clone(),
            task_list: self.task_list.clone(),
            args: self.args.clone(),
            is_replaying,
        }
    }
}

/// A regular activity attempt handed to a worker.
pub(crate) struct ActivityEntry {
    pub client_id: u64,
    pub context_id: i64,
    pub activity_id: String,
    pub heartbeat: Option<Vec<u8>>,
    /// Taken by `ActivityComplete` for attempts the worker left pending.
    pub completion: Option<oneshot::Sender<Result<Vec<u8>, ProxyError>>>,
}

/// An invocation a worker must be told to abandon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stop {
    pub client_id: u64,
    pub request_id: u64,
}

/// A context id handed to a client, bound to one run.
pub(crate) struct ContextEntry {
    pub workflow_id: String,
    pub run_id: String,
    pub client_id: u64,
    pub cursor: Cursor,
    pub cancellation: CancellationToken,
}

#[derive(Default)]
pub(crate) struct EmulatorState {
    pub domains: HashMap<String, DomainInfo>,
    pub workers: HashMap<i64, WorkerEntry>,
    pub workflows: HashMap<String, EmulatedWorkflow>,
    pub pending: VecDeque<String>,
    pub contexts: HashMap<i64, ContextEntry>,
    pub clients: HashMap<u64, WeakDispatcher>,
    /// Domain each client named on Connect.
    pub client_domains: HashMap<u64, String>,
    pub registered_types: HashMap<String, Option<String>>,
    pub activity_types: HashMap<String, Option<String>>,
    /// Attempts in flight, by task token.
    pub activities: HashMap<Vec<u8>, ActivityEntry>,
    /// Invocations of closed runs, sent to their workers once the lock is released.
    pub stops: Vec<Stop>,
    next_worker_id: i64,
    next_context_id: i64,
}

impl EmulatorState {
    pub fn allocate_worker_id(&mut self) -> i64 {
        self.next_worker_id += 1;
        self.next_worker_id
    }

    pub fn allocate_context_id(&mut self) -> i64 {
        self.next_context_id += 1;
        self.next_context_id
    }

    fn find_worker(&self, domain: &str, task_list: &str, is_workflow_worker: bool) -> Option<u64> {
        let mut matching: Vec<(&i64, &WorkerEntry)> = self
            .workers
            .iter()
            .filter(|(_, w)| {
                w.is_workflow_worker == is_workflow_worker
                    && w.domain == domain
                    && w.task_list == task_list
            })
            .collect();
        matching.sort_by_key(|(id, _)| **id);
        matching.first().map(|(_, w)| w.client_id)
    }

    /// The oldest workflow worker polling `domain`/`task_list`.
    pub fn find_workflow_worker(&self, domain: &str, task_list: &str) -> Option<u64> {
        self.find_worker(domain, task_list, true)
    }

    /// The oldest activity worker polling `domain`/`task_list`.
    pub fn find_activity_worker(&self, domain: &str, task_list: &str) -> Option<u64> {
        self.find_worker(domain, task_list, false)
    }

    /// Bind a new context id to the current run of `workflow_id`.
    pub fn open_context(&mut self, workflow_id: &str, client_id: u64, replaying: bool) -> Option<i64> {
        let context_id = self.allocate_context_id();
        let workflow = self.workflows.get(workflow_id)?;
        self.contexts.insert(
            context_id,
            ContextEntry {
                workflow_id: workflow_id.to_string(),
                run_id: workflow.execution.run_id.clone(),
                client_id,
                cursor: Cursor::new(replaying),
                cancellation: workflow.cancellation.child_token(),
            },
        );
        Some(context_id)
    }

    /// The context entry and the workflow it belongs to.
    pub fn context_mut(
        &mut self,
        context_id: i64,
    ) -> Result<(&mut ContextEntry, &mut EmulatedWorkflow), ProxyError> {
        let entry = self
            .contexts
            .get_mut(&context_id)
            .ok_or_else(|| ProxyError::entity_not_exists(format!("context {context_id} not found")))?;
        let workflow = self.workflows.get_mut(&entry.workflow_id).ok_or_else(|| {
            ProxyError::entity_not_exists(format!("workflow '{}' not found", entry.workflow_id))
        })?;
        Ok((entry, workflow))
    }

    pub fn activity_mut(&mut self, task_token: Option<&[u8]>) -> Result<&mut ActivityEntry, ProxyError> {
        let task_token = task_token.ok_or_else(|| ProxyError::bad_request("task token is required"))?;
        self.activities
            .get_mut(task_token)
            .ok_or_else(|| ProxyError::entity_not_exists("no running activity has this task token"))
    }
}
