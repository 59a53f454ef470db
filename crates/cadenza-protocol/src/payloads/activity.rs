// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity messages.
//!
//! Regular activities are registered by name and may run on any worker that
//! polls the activity's task list. Local activities run inside the worker that
//! hosts the calling workflow.

use serde::{Deserialize, Serialize};

use super::{ActivityOptions, LocalActivityOptions};
use crate::error::ProxyError;
use crate::serde_helpers::opt_b64;

// ============================================================================
// Regular activities
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityRegisterRequest {
    pub name: String,
    pub domain: Option<String>,
}

/// Schedules a regular activity from inside a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityExecuteRequest {
    pub context_id: i64,
    pub activity: String,
    #[serde(with = "opt_b64")]
    pub args: Option<Vec<u8>>,
    pub options: ActivityOptions,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityExecuteReply {
    #[serde(with = "opt_b64")]
    pub result: Option<Vec<u8>>,
    pub error: Option<ProxyError>,
}

/// Runs one attempt of a regular activity on this worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityInvokeRequest {
    /// Context assigned to this activity execution
    pub context_id: i64,
    pub activity: String,
    #[serde(with = "opt_b64")]
    pub args: Option<Vec<u8>>,
    pub activity_id: String,
    /// Opaque token naming this attempt in heartbeat and completion calls
    #[serde(with = "opt_b64")]
    pub task_token: Option<Vec<u8>>,
    pub attempt: i32,
    pub domain: String,
    pub task_list: String,
    pub workflow_id: String,
    pub run_id: String,
    pub workflow_type: String,
}

/// Outcome of an activity attempt.
///
/// `Pending` means the activity will be completed later through
/// [`ActivityCompleteRequest`]; `Result` is ignored in that case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityInvokeReply {
    #[serde(with = "opt_b64")]
    pub result: Option<Vec<u8>>,
    pub pending: bool,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityRecordHeartbeatRequest {
    #[serde(with = "opt_b64")]
    pub task_token: Option<Vec<u8>>,
    #[serde(with = "opt_b64")]
    pub details: Option<Vec<u8>>,
}

/// Details recorded by the last heartbeat of the attempt named by `TaskToken`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityGetHeartbeatDetailsRequest {
    #[serde(with = "opt_b64")]
    pub task_token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityGetHeartbeatDetailsReply {
    #[serde(with = "opt_b64")]
    pub details: Option<Vec<u8>>,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityHasHeartbeatDetailsRequest {
    #[serde(with = "opt_b64")]
    pub task_token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityHasHeartbeatDetailsReply {
    pub has_details: bool,
    pub error: Option<ProxyError>,
}

/// Asks the worker to stop a running activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityStoppingRequest {
    pub context_id: i64,
    pub activity_id: String,
}

/// Completes an activity whose invocation replied `Pending`.
///
/// `Error` fails the activity; otherwise `Result` is its result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityCompleteRequest {
    #[serde(with = "opt_b64")]
    pub task_token: Option<Vec<u8>>,
    #[serde(with = "opt_b64")]
    pub result: Option<Vec<u8>>,
    pub error: Option<ProxyError>,
}

// ============================================================================
// Local activities
// ============================================================================

/// Schedules a local activity from inside a workflow.
///
/// `ActivityTypeId` is the per-workflow id the worker assigned to the activity
/// type; the proxy echoes it back in [`ActivityInvokeLocalRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityExecuteLocalRequest {
    pub context_id: i64,
    pub activity_type_id: i64,
    #[serde(with = "opt_b64")]
    pub args: Option<Vec<u8>>,
    pub options: LocalActivityOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityExecuteLocalReply {
    #[serde(with = "opt_b64")]
    pub result: Option<Vec<u8>>,
    pub error: Option<ProxyError>,
}

/// Runs a previously scheduled local activity on this worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityInvokeLocalRequest {
    /// Context of the owning workflow
    pub context_id: i64,
    pub activity_type_id: i64,
    #[serde(with = "opt_b64")]
    pub args: Option<Vec<u8>>,
    /// Context assigned to this activity execution
    pub activity_context_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityInvokeLocalReply {
    #[serde(with = "opt_b64")]
    pub result: Option<Vec<u8>>,
    pub error: Option<ProxyError>,
}

empty_replies! {
    ActivityRegisterReply,
    ActivityRecordHeartbeatReply,
    ActivityStoppingReply,
    ActivityCompleteReply,
}

request_reply! {
    ActivityRegisterRequest => ActivityRegisterReply,
    ActivityExecuteRequest => ActivityExecuteReply,
    ActivityInvokeRequest => ActivityInvokeReply,
    ActivityRecordHeartbeatRequest => ActivityRecordHeartbeatReply,
    ActivityGetHeartbeatDetailsRequest => ActivityGetHeartbeatDetailsReply,
    ActivityHasHeartbeatDetailsRequest => ActivityHasHeartbeatDetailsReply,
    ActivityStoppingRequest => ActivityStoppingReply,
    ActivityCompleteRequest => ActivityCompleteReply,
    ActivityExecuteLocalRequest => ActivityExecuteLocalReply,
    ActivityInvokeLocalRequest => ActivityInvokeLocalReply,
}
