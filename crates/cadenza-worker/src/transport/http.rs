// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP transport to a sidecar proxy.

use std::time::Duration;

use async_trait::async_trait;
use cadenza_protocol::{CONTENT_TYPE, ProxyMessage, codec};
use reqwest::header::CONTENT_TYPE as CONTENT_TYPE_HEADER;
use tracing::{debug, warn};

use super::ProxyTransport;
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};

/// POSTs encoded messages to the proxy URL.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.client_timeout() + Duration::from_secs(5))
            .build()
            .map_err(|e| WorkerError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.proxy_url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ProxyTransport for HttpTransport {
    async fn send(&self, message: ProxyMessage) -> Result<()> {
        let message_type = message.message_type();
        let request_id = message.request_id();
        let body = codec::encode(&message)?;

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE_HEADER, CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, url = %self.url, %message_type, "HTTP request failed");
                WorkerError::Transport(format!("HTTP request failed: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(status = status.as_u16(), url = %self.url, %message_type, "Proxy rejected message");
            return Err(WorkerError::Transport(format!(
                "proxy returned status {status}"
            )));
        }

        debug!(%message_type, request_id, "Message delivered to proxy");
        Ok(())
    }
}
