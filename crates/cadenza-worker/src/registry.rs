// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live context and type registries.
//!
//! Both registries are owned by a [`WorkerClient`](crate::WorkerClient) and
//! guarded by their own short-lived lock. No lock is ever held while user
//! code runs or while waiting on the proxy.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::activity::{Activity, ActivityFactory};
use crate::error::{Result, WorkerError};
use crate::workflow::{Workflow, WorkflowFactory, bind};

/// Identifies one workflow (or local activity) execution within one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey {
    pub client_id: u64,
    pub context_id: i64,
}

impl ContextKey {
    pub fn new(client_id: u64, context_id: i64) -> Self {
        Self {
            client_id,
            context_id,
        }
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.context_id)
    }
}

/// Maps context keys to the live instances executing under them.
pub struct ContextRegistry<T> {
    entries: Mutex<HashMap<ContextKey, Arc<T>>>,
}

impl<T> Default for ContextRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> ContextRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ContextKey, Arc<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `instance` under `key` unless the key is already taken.
    ///
    /// Returns `false` and leaves the existing instance in place when it is.
    pub fn try_register(&self, key: ContextKey, instance: Arc<T>) -> bool {
        let mut entries = self.entries();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, instance);
        true
    }

    pub fn lookup(&self, key: ContextKey) -> Option<Arc<T>> {
        self.entries().get(&key).cloned()
    }

    pub fn remove(&self, key: ContextKey) -> Option<Arc<T>> {
        self.entries().remove(&key)
    }

    /// Evict every instance registered for `client_id`.
    pub fn remove_all_for_client(&self, client_id: u64) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| key.client_id != client_id);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(client_id, removed, "Evicted contexts for client");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
struct RegisteredType<F> {
    type_id: TypeId,
    type_name: &'static str,
    factory: F,
}

/// Maps type names to the Rust types that implement them.
///
/// Used for workflow types ([`WorkflowTypeRegistry`]) and regular activity
/// types ([`ActivityTypeRegistry`]).
pub(crate) struct TypeRegistry<F> {
    types: Mutex<HashMap<String, RegisteredType<F>>>,
}

pub(crate) type WorkflowTypeRegistry = TypeRegistry<WorkflowFactory>;
pub(crate) type ActivityTypeRegistry = TypeRegistry<ActivityFactory>;

impl<F> Default for TypeRegistry<F> {
    fn default() -> Self {
        Self {
            types: Mutex::new(HashMap::new()),
        }
    }
}

impl<F: Clone> TypeRegistry<F> {
    pub fn new() -> Self {
        Self::default()
    }

    fn types(&self) -> MutexGuard<'_, HashMap<String, RegisteredType<F>>> {
        self.types.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the type `T` under `name`.
    ///
    /// Registering the same type again is a no-op and returns `Ok(false)`; a
    /// different type under an existing name is a [`WorkerError::TypeConflict`].
    fn insert<T: 'static>(&self, name: &str, factory: impl FnOnce() -> F) -> Result<bool> {
        let type_id = TypeId::of::<T>();
        let mut types = self.types();
        if let Some(existing) = types.get(name) {
            if existing.type_id == type_id {
                return Ok(false);
            }
            debug!(
                name,
                existing = existing.type_name,
                requested = std::any::type_name::<T>(),
                "Type name conflict"
            );
            return Err(WorkerError::TypeConflict(name.to_string()));
        }
        types.insert(
            name.to_string(),
            RegisteredType {
                type_id,
                type_name: std::any::type_name::<T>(),
                factory: factory(),
            },
        );
        Ok(true)
    }

    /// Forget `name`. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.types().remove(name).is_some()
    }

    pub(crate) fn factory(&self, name: &str) -> Option<F> {
        self.types().get(name).map(|t| t.factory.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types().keys().cloned().collect();
        names.sort();
        names
    }
}

impl TypeRegistry<WorkflowFactory> {
    /// Register workflow type `W` under `name`.
    pub fn register<W: Workflow + Default>(&self, name: &str) -> Result<bool> {
        self.insert::<W>(name, bind::<W>)
    }
}

impl TypeRegistry<ActivityFactory> {
    /// Register activity type `A` under `name`.
    pub fn register<A: Activity + Default>(&self, name: &str) -> Result<bool> {
        self.insert::<A>(name, ActivityFactory::of::<A>)
    }
}
