// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow messages.
//!
//! Messages with a `ContextId` are routed calls made from inside a running
//! workflow, or invocations the proxy makes into one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ChildWorkflowOptions, RetryPolicy, StartWorkflowOptions, WorkflowExecution};
use crate::error::ProxyError;
use crate::serde_helpers::{b64, nanos, opt_b64};

// ============================================================================
// Client-side operations
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowRegisterRequest {
    pub name: String,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowExecuteRequest {
    pub domain: Option<String>,
    pub workflow: String,
    #[serde(with = "opt_b64")]
    pub args: Option<Vec<u8>>,
    pub options: StartWorkflowOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowExecuteReply {
    pub execution: Option<WorkflowExecution>,
    pub error: Option<ProxyError>,
}

/// Signals a workflow, starting it first when it is not running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowSignalWithStartRequest {
    pub workflow: String,
    pub workflow_id: String,
    pub signal_name: String,
    #[serde(with = "opt_b64")]
    pub signal_args: Option<Vec<u8>>,
    #[serde(with = "opt_b64")]
    pub workflow_args: Option<Vec<u8>>,
    pub options: StartWorkflowOptions,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowSignalWithStartReply {
    pub execution: Option<WorkflowExecution>,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowSetCacheSizeRequest {
    pub size: i32,
}

/// Waits for a workflow to finish and returns its result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowGetResultRequest {
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowGetResultReply {
    #[serde(with = "opt_b64")]
    pub result: Option<Vec<u8>>,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowSignalRequest {
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub signal_name: String,
    #[serde(with = "opt_b64")]
    pub signal_args: Option<Vec<u8>>,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowQueryRequest {
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub query_name: String,
    #[serde(with = "opt_b64")]
    pub query_args: Option<Vec<u8>>,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowQueryReply {
    #[serde(with = "opt_b64")]
    pub result: Option<Vec<u8>>,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowTerminateRequest {
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub reason: Option<String>,
    #[serde(with = "opt_b64")]
    pub details: Option<Vec<u8>>,
    pub domain: Option<String>,
}

// ============================================================================
// Proxy -> worker invocations
// ============================================================================

/// Starts (or replays) a workflow on this worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowInvokeRequest {
    pub context_id: i64,
    pub domain: String,
    pub workflow_id: String,
    pub run_id: String,
    pub workflow_type: String,
    pub task_list: String,
    #[serde(with = "b64")]
    pub args: Vec<u8>,
    pub is_replaying: bool,
}

/// Outcome of a workflow run.
///
/// Exactly one of `Result`, `ContinueAsNew` or `Error` is meaningful. When
/// `ContinueAsNew` is set the remaining `ContinueAsNew*` properties describe
/// the next run; zero timeouts and absent names mean "same as this run".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowInvokeReply {
    #[serde(with = "opt_b64")]
    pub result: Option<Vec<u8>>,
    pub continue_as_new: bool,
    #[serde(with = "opt_b64")]
    pub continue_as_new_args: Option<Vec<u8>>,
    pub continue_as_new_workflow: Option<String>,
    pub continue_as_new_domain: Option<String>,
    pub continue_as_new_task_list: Option<String>,
    #[serde(with = "nanos")]
    pub continue_as_new_execution_start_to_close_timeout: Duration,
    #[serde(with = "nanos")]
    pub continue_as_new_schedule_to_close_timeout: Duration,
    #[serde(with = "nanos")]
    pub continue_as_new_schedule_to_start_timeout: Duration,
    #[serde(with = "nanos")]
    pub continue_as_new_start_to_close_timeout: Duration,
    pub continue_as_new_retry_policy: Option<RetryPolicy>,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowSignalInvokeRequest {
    pub context_id: i64,
    pub signal_name: String,
    #[serde(with = "opt_b64")]
    pub signal_args: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowQueryInvokeRequest {
    pub context_id: i64,
    pub query_name: String,
    #[serde(with = "opt_b64")]
    pub query_args: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowQueryInvokeReply {
    #[serde(with = "opt_b64")]
    pub result: Option<Vec<u8>>,
    pub error: Option<ProxyError>,
}

// ============================================================================
// Routed calls made from inside a workflow
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowSignalSubscribeRequest {
    pub context_id: i64,
    pub signal_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowSetQueryHandlerRequest {
    pub context_id: i64,
    pub query_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowDisconnectContextRequest {
    pub context_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowGetTimeRequest {
    pub context_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowGetTimeReply {
    pub time: Option<DateTime<Utc>>,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowSleepRequest {
    pub context_id: i64,
    #[serde(with = "nanos")]
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowGetVersionRequest {
    pub context_id: i64,
    pub change_id: String,
    pub min_supported: i32,
    pub max_supported: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowGetVersionReply {
    pub version: i32,
    pub error: Option<ProxyError>,
}

/// Records (or reads back) a value in the workflow history.
///
/// With `Update` set, the first execution records `Result` and replays return
/// the recorded value instead. Without it, the latest recorded value is read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowMutableRequest {
    pub context_id: i64,
    pub mutable_id: String,
    #[serde(with = "opt_b64")]
    pub result: Option<Vec<u8>>,
    pub update: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowMutableReply {
    #[serde(with = "opt_b64")]
    pub result: Option<Vec<u8>>,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowHasLastResultRequest {
    pub context_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowHasLastResultReply {
    pub has_result: bool,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowGetLastResultRequest {
    pub context_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowGetLastResultReply {
    #[serde(with = "opt_b64")]
    pub result: Option<Vec<u8>>,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowExecuteChildRequest {
    pub context_id: i64,
    pub workflow: String,
    #[serde(with = "opt_b64")]
    pub args: Option<Vec<u8>>,
    pub options: ChildWorkflowOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowExecuteChildReply {
    pub child_id: i64,
    pub execution: Option<WorkflowExecution>,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowWaitForChildRequest {
    pub context_id: i64,
    pub child_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowWaitForChildReply {
    #[serde(with = "opt_b64")]
    pub result: Option<Vec<u8>>,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowSignalChildRequest {
    pub context_id: i64,
    pub child_id: i64,
    pub signal_name: String,
    #[serde(with = "opt_b64")]
    pub signal_args: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkflowCancelChildRequest {
    pub context_id: i64,
    pub child_id: i64,
}

empty_replies! {
    WorkflowRegisterReply,
    WorkflowSetCacheSizeReply,
    WorkflowSignalReply,
    WorkflowTerminateReply,
    WorkflowSignalInvokeReply,
    WorkflowSignalSubscribeReply,
    WorkflowSetQueryHandlerReply,
    WorkflowDisconnectContextReply,
    WorkflowSleepReply,
    WorkflowSignalChildReply,
    WorkflowCancelChildReply,
}

request_reply! {
    WorkflowRegisterRequest => WorkflowRegisterReply,
    WorkflowExecuteRequest => WorkflowExecuteReply,
    WorkflowSetCacheSizeRequest => WorkflowSetCacheSizeReply,
    WorkflowGetResultRequest => WorkflowGetResultReply,
    WorkflowSignalRequest => WorkflowSignalReply,
    WorkflowQueryRequest => WorkflowQueryReply,
    WorkflowTerminateRequest => WorkflowTerminateReply,
    WorkflowInvokeRequest => WorkflowInvokeReply,
    WorkflowSignalInvokeRequest => WorkflowSignalInvokeReply,
    WorkflowQueryInvokeRequest => WorkflowQueryInvokeReply,
    WorkflowSignalSubscribeRequest => WorkflowSignalSubscribeReply,
    WorkflowSetQueryHandlerRequest => WorkflowSetQueryHandlerReply,
    WorkflowDisconnectContextRequest => WorkflowDisconnectContextReply,
    WorkflowGetTimeRequest => WorkflowGetTimeReply,
    WorkflowSleepRequest => WorkflowSleepReply,
    WorkflowGetVersionRequest => WorkflowGetVersionReply,
    WorkflowMutableRequest => WorkflowMutableReply,
    WorkflowHasLastResultRequest => WorkflowHasLastResultReply,
    WorkflowGetLastResultRequest => WorkflowGetLastResultReply,
    WorkflowExecuteChildRequest => WorkflowExecuteChildReply,
    WorkflowWaitForChildRequest => WorkflowWaitForChildReply,
    WorkflowSignalWithStartRequest => WorkflowSignalWithStartReply,
    WorkflowSignalChildRequest => WorkflowSignalChildReply,
    WorkflowCancelChildRequest => WorkflowCancelChildReply,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ProxyMessage;

    #[test]
    fn test_continue_as_new_timeouts_travel_as_nanos() {
        let reply = WorkflowInvokeReply {
            continue_as_new: true,
            continue_as_new_args: Some(vec![9, 9]),
            continue_as_new_start_to_close_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let msg = ProxyMessage::from_payload(&reply).unwrap();
        assert_eq!(msg.property("ContinueAsNew"), Some("true"));
        assert_eq!(
            msg.property("ContinueAsNewStartToCloseTimeout"),
            Some("30000000000")
        );
        assert_eq!(msg.property("Result"), None);
        assert_eq!(msg.property("Error"), None);
    }

    #[test]
    fn test_get_time_reply_parses_rfc3339() {
        let mut msg = ProxyMessage::new(crate::MessageType::WorkflowGetTimeReply);
        msg.set_property("Time", Some("\"2024-05-01T12:00:00Z\"".to_string()));
        let reply: WorkflowGetTimeReply = msg.to_payload().unwrap();
        assert_eq!(
            reply.time.map(|t| t.to_rfc3339()),
            Some("2024-05-01T12:00:00+00:00".to_string())
        );
    }
}
