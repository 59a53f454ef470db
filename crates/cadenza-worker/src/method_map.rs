// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Signal and query handler tables.
//!
//! Each workflow type declares its handlers once, in
//! [`Workflow::register_methods`](crate::Workflow::register_methods). The
//! resulting [`MethodMap`] is built on first use and cached for the lifetime
//! of the process, keyed by type.
//!
//! When two handlers are registered under the same name the later one
//! replaces the earlier one.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::workflow::{Workflow, WorkflowContext, WorkflowError};

/// A signal handler: one byte payload in, no value out.
pub type SignalHandler<W> = Arc<
    dyn Fn(Arc<W>, WorkflowContext, Vec<u8>) -> BoxFuture<'static, Result<(), WorkflowError>>
        + Send
        + Sync,
>;

/// A query handler: one byte payload in, one byte payload out.
pub type QueryHandler<W> = Arc<
    dyn Fn(Arc<W>, WorkflowContext, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, WorkflowError>>
        + Send
        + Sync,
>;

/// What a method was declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Signal,
    Query,
}

/// A handler of either shape.
pub enum MethodHandler<W> {
    Signal(SignalHandler<W>),
    Query(QueryHandler<W>),
}

impl<W> MethodHandler<W> {
    fn kind(&self) -> MethodKind {
        match self {
            MethodHandler::Signal(_) => MethodKind::Signal,
            MethodHandler::Query(_) => MethodKind::Query,
        }
    }
}

/// Collects the handlers a workflow type declares.
pub struct MethodMapBuilder<W> {
    type_name: &'static str,
    signals: HashMap<String, SignalHandler<W>>,
    queries: HashMap<String, QueryHandler<W>>,
}

impl<W: Send + Sync + 'static> MethodMapBuilder<W> {
    fn new() -> Self {
        Self {
            type_name: std::any::type_name::<W>(),
            signals: HashMap::new(),
            queries: HashMap::new(),
        }
    }

    /// Register a signal handler.
    pub fn signal<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Arc<W>, WorkflowContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkflowError>> + Send + 'static,
    {
        let handler: SignalHandler<W> = Arc::new(
            move |wf: Arc<W>, ctx: WorkflowContext, args: Vec<u8>| -> BoxFuture<'static, _> {
                Box::pin(handler(wf, ctx, args))
            },
        );
        self.add(MethodKind::Signal, name, MethodHandler::Signal(handler))
    }

    /// Register a query handler.
    pub fn query<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Arc<W>, WorkflowContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, WorkflowError>> + Send + 'static,
    {
        let handler: QueryHandler<W> = Arc::new(
            move |wf: Arc<W>, ctx: WorkflowContext, args: Vec<u8>| -> BoxFuture<'static, _> {
                Box::pin(handler(wf, ctx, args))
            },
        );
        self.add(MethodKind::Query, name, MethodHandler::Query(handler))
    }

    /// Register a handler declared as `kind`.
    ///
    /// A handler whose shape does not match its declared kind, or one with an
    /// empty name, is skipped with a warning.
    pub fn add(
        &mut self,
        kind: MethodKind,
        name: impl Into<String>,
        handler: MethodHandler<W>,
    ) -> &mut Self {
        let name = name.into();
        if name.is_empty() {
            warn!(workflow_type = self.type_name, ?kind, "Skipping handler with empty name");
            return self;
        }
        if handler.kind() != kind {
            warn!(
                workflow_type = self.type_name,
                name = %name,
                declared = ?kind,
                actual = ?handler.kind(),
                "Skipping handler with the wrong shape"
            );
            return self;
        }

        let replaced = match handler {
            MethodHandler::Signal(h) => self.signals.insert(name.clone(), h).is_some(),
            MethodHandler::Query(h) => self.queries.insert(name.clone(), h).is_some(),
        };
        if replaced {
            debug!(
                workflow_type = self.type_name,
                name = %name,
                ?kind,
                "Handler name registered twice, keeping the later one"
            );
        }
        self
    }

    fn build(self) -> MethodMap<W> {
        MethodMap {
            signals: self.signals,
            queries: self.queries,
        }
    }
}

/// Name to handler lookup for one workflow type. Immutable once built.
pub struct MethodMap<W> {
    signals: HashMap<String, SignalHandler<W>>,
    queries: HashMap<String, QueryHandler<W>>,
}

static METHOD_MAPS: Lazy<Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl<W: Workflow> MethodMap<W> {
    /// The cached method map for `W`, built on first use.
    pub fn for_type() -> Arc<MethodMap<W>> {
        let type_id = TypeId::of::<W>();
        let mut cache = METHOD_MAPS.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.get(&type_id)
            && let Ok(map) = cached.clone().downcast::<MethodMap<W>>()
        {
            return map;
        }

        let mut builder = MethodMapBuilder::new();
        W::register_methods(&mut builder);
        let map = Arc::new(builder.build());
        debug!(
            workflow_type = std::any::type_name::<W>(),
            signals = map.signals.len(),
            queries = map.queries.len(),
            "Built method map"
        );
        cache.insert(type_id, map.clone());
        map
    }
}

impl<W> MethodMap<W> {
    pub fn signal_handler(&self, name: &str) -> Option<SignalHandler<W>> {
        self.signals.get(name).cloned()
    }

    pub fn query_handler(&self, name: &str) -> Option<QueryHandler<W>> {
        self.queries.get(name).cloned()
    }

    pub fn signal_names(&self) -> impl Iterator<Item = &str> {
        self.signals.keys().map(String::as_str)
    }

    pub fn query_names(&self) -> impl Iterator<Item = &str> {
        self.queries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowExit;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static BUILDS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Approvals;

    #[async_trait]
    impl Workflow for Approvals {
        fn register_methods(methods: &mut MethodMapBuilder<Self>) {
            BUILDS.fetch_add(1, Ordering::SeqCst);
            methods
                .signal("approve", |_, _, _| async { Ok(()) })
                .query("status", |_, _, _| async { Ok(b"first".to_vec()) })
                // Intentional quirk: a duplicate name replaces the earlier handler
                .query("status", |_, _, _| async { Ok(b"second".to_vec()) });
        }

        async fn run(
            &self,
            _ctx: &WorkflowContext,
            args: Vec<u8>,
        ) -> Result<WorkflowExit, WorkflowError> {
            Ok(WorkflowExit::Completed(args))
        }
    }

    #[derive(Default)]
    struct Misdeclared;

    #[async_trait]
    impl Workflow for Misdeclared {
        fn register_methods(methods: &mut MethodMapBuilder<Self>) {
            let query: QueryHandler<Self> = Arc::new(
                |_: Arc<Self>, _: WorkflowContext, _: Vec<u8>| -> BoxFuture<'static, _> {
                    Box::pin(async { Ok(vec![]) })
                },
            );
            methods
                .add(MethodKind::Signal, "notify", MethodHandler::Query(query))
                .signal("", |_, _, _| async { Ok(()) })
                .signal("ok", |_, _, _| async { Ok(()) });
        }

        async fn run(
            &self,
            _ctx: &WorkflowContext,
            args: Vec<u8>,
        ) -> Result<WorkflowExit, WorkflowError> {
            Ok(WorkflowExit::Completed(args))
        }
    }

    #[test]
    fn test_map_is_built_once_per_type() {
        let first = MethodMap::<Approvals>::for_type();
        let second = MethodMap::<Approvals>::for_type();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(BUILDS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lookup_by_name() {
        let map = MethodMap::<Approvals>::for_type();
        assert!(map.signal_handler("approve").is_some());
        assert!(map.signal_handler("status").is_none());
        assert!(map.query_handler("status").is_some());
        assert!(map.query_handler("approve").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_last_registration_wins() {
        // Intentional quirk, kept as-is: no error on duplicate names.
        let map = MethodMap::<Approvals>::for_type();
        let handler = map.query_handler("status").unwrap();
        let ctx = WorkflowContext::detached_for_tests();
        let result = handler(Arc::new(Approvals), ctx, vec![]).await.unwrap();
        assert_eq!(result, b"second");
        assert_eq!(map.query_names().count(), 1);
    }

    #[test]
    fn test_wrong_shape_and_empty_name_are_skipped() {
        let map = MethodMap::<Misdeclared>::for_type();
        assert!(map.signal_handler("notify").is_none());
        assert!(map.query_handler("notify").is_none());
        assert!(map.signal_handler("").is_none());
        assert!(map.signal_handler("ok").is_some());
    }
}
