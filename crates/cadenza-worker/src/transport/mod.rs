// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound transports.
//!
//! This module provides different ways of reaching the proxy:
//! - `http`: POSTs encoded messages to a sidecar proxy (feature `http`)
//! - the [`Emulator`](crate::emulator::Emulator), an in-process stand-in for tests

#[cfg(feature = "http")]
pub mod http;

use async_trait::async_trait;
use cadenza_protocol::ProxyMessage;

use crate::error::Result;

/// Delivers messages to the proxy.
///
/// Requests and replies travel the same way: the transport only moves a
/// message across, and correlation happens above it. A failed send is fatal
/// for the connection.
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    /// Send one message. Returns once the proxy has accepted it.
    async fn send(&self, message: ProxyMessage) -> Result<()>;

    /// Release transport resources.
    async fn close(&self) {}
}
