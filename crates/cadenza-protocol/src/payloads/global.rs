// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection, domain and worker management messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;
use crate::serde_helpers::nanos;

/// Tells the proxy where to POST messages destined for this worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InitializeRequest {
    pub library_address: String,
    pub library_port: u16,
}

/// Connects the proxy to the orchestration server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConnectRequest {
    pub endpoints: String,
    pub identity: String,
    #[serde(with = "nanos")]
    pub client_timeout: Duration,
    pub domain: Option<String>,
    pub create_domain: bool,
}

/// Asks the proxy process to exit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TerminateRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HeartbeatRequest {}

/// Cancels an outstanding request identified by its request id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CancelRequest {
    pub target_request_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CancelReply {
    /// `false` when the target had already completed
    pub was_cancelled: bool,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NewWorkerRequest {
    pub domain: String,
    pub task_list: String,
    pub is_workflow_worker: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NewWorkerReply {
    pub worker_id: i64,
    pub error: Option<ProxyError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StopWorkerRequest {
    pub worker_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PingRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DomainRegisterRequest {
    pub name: String,
    pub description: Option<String>,
    pub owner_email: Option<String>,
    pub emit_metrics: bool,
    pub retention_days: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DomainDescribeRequest {
    pub name: String,
}

/// Lifecycle status of a domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainStatus {
    #[default]
    Registered,
    Deprecated,
    Deleted,
}

/// Domain information returned by a describe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DomainInfo {
    pub name: String,
    pub description: Option<String>,
    pub status: DomainStatus,
    pub owner_email: Option<String>,
    pub uuid: String,
    pub emit_metrics: bool,
    pub retention_days: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DomainDescribeReply {
    pub domain_info: Option<DomainInfo>,
    pub error: Option<ProxyError>,
}

/// Updates a domain. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DomainUpdateRequest {
    pub name: String,
    pub description: Option<String>,
    pub owner_email: Option<String>,
    pub emit_metrics: Option<bool>,
    pub retention_days: Option<i32>,
}

empty_replies! {
    InitializeReply,
    ConnectReply,
    TerminateReply,
    HeartbeatReply,
    StopWorkerReply,
    PingReply,
    DomainRegisterReply,
    DomainUpdateReply,
}

request_reply! {
    InitializeRequest => InitializeReply,
    ConnectRequest => ConnectReply,
    TerminateRequest => TerminateReply,
    HeartbeatRequest => HeartbeatReply,
    CancelRequest => CancelReply,
    NewWorkerRequest => NewWorkerReply,
    StopWorkerRequest => StopWorkerReply,
    PingRequest => PingReply,
    DomainRegisterRequest => DomainRegisterReply,
    DomainDescribeRequest => DomainDescribeReply,
    DomainUpdateRequest => DomainUpdateReply,
}
