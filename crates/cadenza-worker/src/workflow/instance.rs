// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One running workflow execution context.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Workflow, WorkflowContext, WorkflowError, WorkflowExit};
use crate::activity::LocalActivityFactory;
use crate::error::WorkerError;
use crate::method_map::MethodMap;
use crate::registry::ContextKey;

/// A workflow bound to its method map, with the concrete type erased.
#[async_trait]
pub(crate) trait ErasedWorkflow: Send + Sync {
    async fn run(&self, ctx: &WorkflowContext, args: Vec<u8>)
    -> Result<WorkflowExit, WorkflowError>;

    fn signal_names(&self) -> Vec<String>;

    fn query_names(&self) -> Vec<String>;

    fn signal(
        &self,
        name: &str,
        ctx: WorkflowContext,
        args: Vec<u8>,
    ) -> Option<BoxFuture<'static, Result<(), WorkflowError>>>;

    fn query(
        &self,
        name: &str,
        ctx: WorkflowContext,
        args: Vec<u8>,
    ) -> Option<BoxFuture<'static, Result<Vec<u8>, WorkflowError>>>;
}

struct Bound<W: Workflow> {
    workflow: Arc<W>,
    methods: Arc<MethodMap<W>>,
}

#[async_trait]
impl<W: Workflow> ErasedWorkflow for Bound<W> {
    async fn run(
        &self,
        ctx: &WorkflowContext,
        args: Vec<u8>,
    ) -> Result<WorkflowExit, WorkflowError> {
        self.workflow.run(ctx, args).await
    }

    fn signal_names(&self) -> Vec<String> {
        self.methods.signal_names().map(str::to_string).collect()
    }

    fn query_names(&self) -> Vec<String> {
        self.methods.query_names().map(str::to_string).collect()
    }

    fn signal(
        &self,
        name: &str,
        ctx: WorkflowContext,
        args: Vec<u8>,
    ) -> Option<BoxFuture<'static, Result<(), WorkflowError>>> {
        let handler = self.methods.signal_handler(name)?;
        Some(handler(self.workflow.clone(), ctx, args))
    }

    fn query(
        &self,
        name: &str,
        ctx: WorkflowContext,
        args: Vec<u8>,
    ) -> Option<BoxFuture<'static, Result<Vec<u8>, WorkflowError>>> {
        let handler = self.methods.query_handler(name)?;
        Some(handler(self.workflow.clone(), ctx, args))
    }
}

/// Creates fresh, type-erased workflow objects.
pub(crate) type WorkflowFactory = Arc<dyn Fn() -> Box<dyn ErasedWorkflow> + Send + Sync>;

/// Factory for `W`, sharing the cached method map of the type.
pub(crate) fn bind<W: Workflow + Default>() -> WorkflowFactory {
    Arc::new(|| {
        Box::new(Bound::<W> {
            workflow: Arc::new(W::default()),
            methods: MethodMap::<W>::for_type(),
        })
    })
}

/// Identifying fields of a workflow run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowInfo {
    pub context_id: i64,
    pub domain: String,
    pub workflow_id: String,
    pub run_id: String,
    pub task_list: String,
    pub workflow_type: String,
}

/// Lifecycle of a workflow instance.
///
/// `Created -> Registered -> Running -> {Completed | ContinuedAsNew | Failed}`.
/// A registered instance that fails before running goes straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Registered,
    Running,
    Completed,
    ContinuedAsNew,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceState::Completed | InstanceState::ContinuedAsNew | InstanceState::Failed
        )
    }

    fn can_advance_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Created, Registered)
                | (Registered, Running)
                | (Registered, Failed)
                | (Running, Completed)
                | (Running, ContinuedAsNew)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Default)]
struct LocalActivityTable {
    next_id: i64,
    types: HashMap<i64, LocalActivityFactory>,
}

/// A live workflow execution on this worker.
pub struct WorkflowInstance {
    key: ContextKey,
    info: WorkflowInfo,
    workflow: Box<dyn ErasedWorkflow>,
    is_replaying: bool,
    state: Mutex<InstanceState>,
    local_activities: Mutex<LocalActivityTable>,
    variables: Mutex<HashMap<String, Vec<u8>>>,
    disconnected: AtomicBool,
    cancellation: Mutex<CancellationToken>,
}

impl fmt::Debug for WorkflowInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("key", &self.key)
            .field("info", &self.info)
            .field("is_replaying", &self.is_replaying)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl WorkflowInstance {
    pub(crate) fn new(
        key: ContextKey,
        info: WorkflowInfo,
        workflow: Box<dyn ErasedWorkflow>,
        is_replaying: bool,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            key,
            info,
            workflow,
            is_replaying,
            state: Mutex::new(InstanceState::Created),
            local_activities: Mutex::new(LocalActivityTable::default()),
            variables: Mutex::new(HashMap::new()),
            disconnected: AtomicBool::new(false),
            cancellation: Mutex::new(cancellation),
        }
    }

    pub fn key(&self) -> ContextKey {
        self.key
    }

    pub fn info(&self) -> &WorkflowInfo {
        &self.info
    }

    pub fn is_replaying(&self) -> bool {
        self.is_replaying
    }

    pub fn state(&self) -> InstanceState {
        *lock(&self.state)
    }

    pub(crate) fn workflow(&self) -> &dyn ErasedWorkflow {
        self.workflow.as_ref()
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub(crate) fn advance(&self, next: InstanceState) -> Result<(), WorkerError> {
        let mut state = lock(&self.state);
        let current = *state;
        if !current.can_advance_to(next) {
            return Err(WorkerError::Internal(format!(
                "invalid workflow state transition {current} -> {next}"
            )));
        }
        debug!(context_id = self.key.context_id, from = %current, to = %next, "Workflow state");
        *state = next;
        Ok(())
    }

    /// Record a local activity type and return the id the proxy will echo back.
    pub(crate) fn register_local_activity(&self, factory: LocalActivityFactory) -> i64 {
        let mut table = lock(&self.local_activities);
        table.next_id += 1;
        let id = table.next_id;
        table.types.insert(id, factory);
        id
    }

    pub(crate) fn local_activity(&self, id: i64) -> Option<LocalActivityFactory> {
        lock(&self.local_activities).types.get(&id).cloned()
    }

    pub(crate) fn cache_variable(&self, name: &str, value: Option<Vec<u8>>) {
        let mut variables = lock(&self.variables);
        match value {
            Some(value) => variables.insert(name.to_string(), value),
            None => variables.remove(name),
        };
    }

    /// Last value seen for a variable during this run.
    pub fn variable(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.variables).get(name).cloned()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Detach from the parent's cancellation. Returns `false` if already detached.
    pub(crate) fn disconnect(&self) -> bool {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return false;
        }
        *lock(&self.cancellation) = CancellationToken::new();
        true
    }

    /// The token that is cancelled when this workflow should stop.
    pub fn cancellation_token(&self) -> CancellationToken {
        lock(&self.cancellation).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Noop;

    #[async_trait]
    impl Workflow for Noop {
        async fn run(
            &self,
            _ctx: &WorkflowContext,
            args: Vec<u8>,
        ) -> Result<WorkflowExit, WorkflowError> {
            Ok(WorkflowExit::Completed(args))
        }
    }

    fn instance(parent: &CancellationToken) -> WorkflowInstance {
        WorkflowInstance::new(
            ContextKey::new(1, 10),
            WorkflowInfo::default(),
            bind::<Noop>()(),
            false,
            parent.child_token(),
        )
    }

    #[test]
    fn test_lifecycle_transitions() {
        let parent = CancellationToken::new();
        let inst = instance(&parent);
        assert_eq!(inst.state(), InstanceState::Created);
        assert!(inst.advance(InstanceState::Running).is_err());

        inst.advance(InstanceState::Registered).unwrap();
        inst.advance(InstanceState::Running).unwrap();
        inst.advance(InstanceState::Completed).unwrap();
        assert!(inst.state().is_terminal());

        assert!(inst.advance(InstanceState::Running).is_err());
        assert!(inst.advance(InstanceState::Failed).is_err());
    }

    #[test]
    fn test_local_activity_ids_increase() {
        let parent = CancellationToken::new();
        let inst = instance(&parent);
        let factory = crate::activity::tests_support::echo_factory();
        let a = inst.register_local_activity(factory.clone());
        let b = inst.register_local_activity(factory);
        assert!(b > a);
        assert!(inst.local_activity(a).is_some());
        assert!(inst.local_activity(b + 1).is_none());
    }

    #[test]
    fn test_disconnect_is_idempotent_and_detaches() {
        let parent = CancellationToken::new();
        let inst = instance(&parent);
        assert!(!inst.is_disconnected());

        assert!(inst.disconnect());
        assert!(!inst.disconnect());
        assert!(inst.is_disconnected());

        parent.cancel();
        assert!(!inst.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_cancellation_follows_parent_until_disconnect() {
        let parent = CancellationToken::new();
        let inst = instance(&parent);
        parent.cancel();
        assert!(inst.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_variable_cache() {
        let parent = CancellationToken::new();
        let inst = instance(&parent);
        inst.cache_variable("seed", Some(vec![4]));
        assert_eq!(inst.variable("seed"), Some(vec![4]));
        inst.cache_variable("seed", None);
        assert_eq!(inst.variable("seed"), None);
    }
}
