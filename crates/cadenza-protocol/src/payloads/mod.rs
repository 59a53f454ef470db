// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed payloads for every message type.
//!
//! Each struct is named after its [`MessageType`](crate::MessageType) variant. Requests implement
//! [`ProxyRequest`](crate::ProxyRequest) so the reply type is known statically; replies implement
//! [`ProxyReply`](crate::ProxyReply) and carry an optional `Error` property.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serde_helpers::nanos;

/// Implements [`Payload`](crate::Payload) for a struct named after its message type.
macro_rules! payload {
    ($name:ident) => {
        impl $crate::message::Payload for $name {
            const MESSAGE_TYPE: $crate::message_type::MessageType =
                $crate::message_type::MessageType::$name;
        }
    };
}

/// Pairs a request payload with its reply payload.
macro_rules! request_reply {
    ($($request:ident => $reply:ident),+ $(,)?) => {
        $(
            payload!($request);
            payload!($reply);

            impl $crate::message::ProxyRequest for $request {
                type Reply = $reply;
            }

            impl $crate::message::ProxyReply for $reply {
                fn error(&self) -> Option<&$crate::error::ProxyError> {
                    self.error.as_ref()
                }

                fn set_error(&mut self, error: Option<$crate::error::ProxyError>) {
                    self.error = error;
                }
            }
        )+
    };
}

/// Declares replies whose only property is the optional error.
macro_rules! empty_replies {
    ($($name:ident),+ $(,)?) => {
        $(
            #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
            #[serde(rename_all = "PascalCase", default)]
            pub struct $name {
                pub error: Option<$crate::error::ProxyError>,
            }
        )+
    };
}

mod activity;
mod global;
mod workflow;

pub use activity::*;
pub use global::*;
pub use workflow::*;

/// Identifies one run of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

/// Retry policy for workflows and activities. Zero durations mean "server default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RetryPolicy {
    #[serde(with = "nanos")]
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    #[serde(with = "nanos")]
    pub maximum_interval: Duration,
    #[serde(with = "nanos")]
    pub expiration_interval: Duration,
    pub maximum_attempts: i32,
    pub non_retriable_error_reasons: Vec<String>,
}

/// Options for starting a top-level workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StartWorkflowOptions {
    /// Workflow id; the proxy generates one when absent
    pub id: Option<String>,
    pub task_list: String,
    #[serde(with = "nanos")]
    pub execution_start_to_close_timeout: Duration,
    #[serde(with = "nanos")]
    pub decision_task_start_to_close_timeout: Duration,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: Option<String>,
}

/// Options for starting a child workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ChildWorkflowOptions {
    /// Defaults to the parent's domain
    pub domain: Option<String>,
    pub workflow_id: Option<String>,
    /// Defaults to the parent's task list
    pub task_list: Option<String>,
    #[serde(with = "nanos")]
    pub execution_start_to_close_timeout: Duration,
    #[serde(with = "nanos")]
    pub task_start_to_close_timeout: Duration,
    pub retry_policy: Option<RetryPolicy>,
}

/// Options for a local activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LocalActivityOptions {
    #[serde(with = "nanos")]
    pub schedule_to_close_timeout: Duration,
    pub retry_policy: Option<RetryPolicy>,
}

/// Options for a regular activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityOptions {
    /// Defaults to the workflow's task list
    pub task_list: Option<String>,
    #[serde(with = "nanos")]
    pub schedule_to_close_timeout: Duration,
    #[serde(with = "nanos")]
    pub schedule_to_start_timeout: Duration,
    #[serde(with = "nanos")]
    pub start_to_close_timeout: Duration,
    #[serde(with = "nanos")]
    pub heartbeat_timeout: Duration,
    pub retry_policy: Option<RetryPolicy>,
}
