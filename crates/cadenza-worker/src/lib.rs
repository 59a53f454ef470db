// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cadenza worker - workflow execution and replay runtime.
//!
//! This crate hosts workflows on behalf of an orchestration server reached
//! through a sidecar proxy. The proxy pushes invoke, signal, query and
//! activity requests; workflows call back into it for every non-deterministic
//! value, so a replayed run observes what the original run did.
//!
//! # Features
//!
//! - **Correlation**: Every outbound request is matched to its reply by request id
//! - **Context registry**: Live workflow executions keyed by client and context id
//! - **Method maps**: Signal and query handlers declared once per workflow type
//! - **Replay-safe context**: Time, sleeps, versions, variables, activities, child workflows
//! - **Activities**: Registered activity types with heartbeats and external completion
//! - **Dispatcher**: Inbound routing that turns every failure into an error reply
//! - **Emulator**: In-process proxy and server stand-in for tests
//!
//! # Quick Start
//!
//! ```ignore
//! use cadenza_worker::{Workflow, WorkflowContext, WorkflowError, WorkflowExit, WorkerClient};
//!
//! #[derive(Default)]
//! struct Greeter;
//!
//! #[async_trait::async_trait]
//! impl Workflow for Greeter {
//!     async fn run(&self, ctx: &WorkflowContext, args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
//!         let version = ctx.get_version("greeting-format", 1, 2).await?;
//!         let mut greeting = if version == 1 { b"hello ".to_vec() } else { b"hi ".to_vec() };
//!         greeting.extend(args);
//!         Ok(WorkflowExit::Completed(greeting))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> cadenza_worker::Result<()> {
//!     let client = WorkerClient::from_env()?;
//!     client.connect().await?;
//!     client.register_workflow::<Greeter>("Greeter", None).await?;
//!     client.start_worker("default-domain", "default").await?;
//!     Ok(())
//! }
//! ```

mod activity;
mod client;
mod config;
mod correlation;
mod dispatcher;
mod error;
mod method_map;
mod registry;
mod workflow;

pub mod emulator;
#[cfg(feature = "http")]
pub mod listener;
pub mod transport;

// Main types
pub use client::WorkerClient;
pub use config::{EmulatorConfig, WorkerConfig};
pub use dispatcher::{Dispatcher, WeakDispatcher};
pub use emulator::{Emulator, WorkflowStatus};
pub use error::{Result, WorkerError};
pub use transport::ProxyTransport;

// Workflow authoring
pub use activity::{Activity, ActivityContext, ActivityError, ActivityExit, LocalActivity};
pub use method_map::{MethodHandler, MethodKind, MethodMap, MethodMapBuilder};
pub use workflow::{
    ChildWorkflow, ContinueAsNew, InstanceState, Workflow, WorkflowContext, WorkflowError,
    WorkflowExit, WorkflowInfo, WorkflowInstance, WorkflowOutcome,
};

// Runtime building blocks
pub use correlation::{CorrelationTable, PendingReply};
pub use registry::{ContextKey, ContextRegistry};

// Re-export the wire layer
pub use cadenza_protocol as protocol;
