// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the HTTP listener and transport.
//!
//! Run with:
//! ```bash
//! cargo test -p cadenza-worker --test listener_test
//! ```

#![cfg(feature = "http")]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadenza_protocol::payloads::PingRequest;
use cadenza_protocol::{CONTENT_TYPE, MessageType, ProxyMessage, codec};
use cadenza_worker::transport::http::HttpTransport;
use cadenza_worker::{ProxyTransport, WorkerClient, WorkerConfig, WorkerError, listener};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Records everything the client sends.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<ProxyMessage>>,
}

#[async_trait]
impl ProxyTransport for RecordingTransport {
    async fn send(&self, message: ProxyMessage) -> cadenza_worker::Result<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

struct Served {
    addr: SocketAddr,
    transport: Arc<RecordingTransport>,
    shutdown: CancellationToken,
    handle: JoinHandle<cadenza_worker::Result<()>>,
    _client: WorkerClient,
}

async fn serve() -> Served {
    let transport = Arc::new(RecordingTransport::default());
    let client = WorkerClient::new(
        WorkerConfig::localhost().with_heartbeat_interval_ms(0),
        transport.clone(),
    );
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(listener::serve_on(tcp, client.dispatcher(), shutdown.clone()));

    Served {
        addr,
        transport,
        shutdown,
        handle,
        _client: client,
    }
}

fn ping_bytes(request_id: u64) -> Vec<u8> {
    let message = ProxyMessage::from_payload(&PingRequest {})
        .unwrap()
        .with_request_id(request_id);
    codec::encode(&message).unwrap().to_vec()
}

#[tokio::test]
async fn test_post_is_dispatched_and_answered() {
    let served = serve().await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://{}/", served.addr))
        .header("content-type", CONTENT_TYPE)
        .body(ping_bytes(77))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // The reply leaves through the client's transport, not the HTTP response.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let sent = served.transport.sent.lock().unwrap().clone();
            if let Some(reply) = sent.first() {
                assert_eq!(reply.message_type(), MessageType::PingReply);
                assert_eq!(reply.request_id(), 77);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reply never sent");

    served.shutdown.cancel();
    served.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_requests() {
    let served = serve().await;
    let http = reqwest::Client::new();
    let url = format!("http://{}/", served.addr);

    let response = http.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 405);

    let response = http
        .post(&url)
        .header("content-type", "application/json")
        .body(ping_bytes(1))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 415);

    let response = http
        .post(&url)
        .header("content-type", CONTENT_TYPE)
        .body(vec![1, 2, 3])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = http
        .post(format!("http://{}/elsewhere", served.addr))
        .header("content-type", CONTENT_TYPE)
        .body(ping_bytes(2))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    assert!(served.transport.sent.lock().unwrap().is_empty());

    served.shutdown.cancel();
    served.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_http_transport_delivers_to_listener() {
    let served = serve().await;

    let transport = HttpTransport::new(&WorkerConfig::new(format!("http://{}/", served.addr))).unwrap();
    let message = ProxyMessage::from_payload(&PingRequest {})
        .unwrap()
        .with_request_id(5);
    transport.send(message).await.unwrap();

    served.shutdown.cancel();
    served.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_http_transport_reports_unreachable_proxy() {
    // Bind and drop to get a port nobody listens on.
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    drop(tcp);

    let transport = HttpTransport::new(&WorkerConfig::new(format!("http://{addr}/"))).unwrap();
    let message = ProxyMessage::from_payload(&PingRequest {})
        .unwrap()
        .with_request_id(6);

    let err = transport.send(message).await.unwrap_err();
    assert!(matches!(err, WorkerError::Transport(_)));
}
