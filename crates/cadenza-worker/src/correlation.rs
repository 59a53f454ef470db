// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request/reply correlation.
//!
//! Every outbound request is assigned a fresh request id and parked in the
//! [`CorrelationTable`] as an [`Operation`]. The matching reply completes the
//! operation's single-assignment reply slot; the caller awaits the slot
//! without holding the table lock.
//!
//! Inbound requests that run user code are tracked the other way round in an
//! [`InboundTable`], keyed by the id the proxy assigned, so the proxy can stop
//! them with a cancel request.

use std::collections::HashMap;
use std::sync::Mutex;

use cadenza_protocol::{MessageType, ProxyMessage};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};

type ReplySlot = oneshot::Sender<Result<ProxyMessage>>;

/// An in-flight outbound request.
#[derive(Debug)]
pub struct Operation {
    request: ProxyMessage,
    expected_reply: MessageType,
    reply_slot: ReplySlot,
}

impl Operation {
    pub fn request(&self) -> &ProxyMessage {
        &self.request
    }

    pub fn expected_reply(&self) -> MessageType {
        self.expected_reply
    }
}

/// Awaits the reply of an enqueued operation.
#[derive(Debug)]
pub struct PendingReply {
    request_id: u64,
    receiver: oneshot::Receiver<Result<ProxyMessage>>,
}

impl PendingReply {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Wait for the reply. Resolves to an error if the operation is cancelled
    /// or the table is torn down.
    pub async fn wait(self) -> Result<ProxyMessage> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::ConnectionClosed),
        }
    }
}

#[derive(Debug)]
struct Inner {
    next_id: u64,
    pending: HashMap<u64, Operation>,
}

/// Maps request ids to in-flight operations.
#[derive(Debug)]
pub struct CorrelationTable {
    inner: Mutex<Inner>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                pending: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned table still holds consistent entries: every mutation is a
        // single map insert or remove.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate the next request id, stamp it on `request` and park the operation.
    pub fn enqueue(&self, request: &mut ProxyMessage) -> Result<PendingReply> {
        let expected_reply = request.message_type().reply_type().ok_or_else(|| {
            WorkerError::Internal(format!(
                "{} is not a request and cannot be correlated",
                request.message_type()
            ))
        })?;
        let (reply_slot, receiver) = oneshot::channel();

        let mut inner = self.lock();
        let request_id = inner.next_id;
        inner.next_id += 1;
        request.set_request_id(request_id);
        inner.pending.insert(
            request_id,
            Operation {
                request: request.clone(),
                expected_reply,
                reply_slot,
            },
        );
        drop(inner);

        debug!(request_id, message_type = %request.message_type(), "Enqueued operation");
        Ok(PendingReply {
            request_id,
            receiver,
        })
    }

    /// Complete the operation addressed by the reply's request id.
    ///
    /// Returns `Ok(true)` when the reply was delivered and `Ok(false)` when no
    /// operation was waiting for it (already completed or cancelled). A reply
    /// of the wrong type is rejected and leaves the operation pending.
    pub fn complete_with_reply(&self, reply: ProxyMessage) -> Result<bool> {
        let request_id = reply.request_id();

        let mut inner = self.lock();
        let expected = match inner.pending.get(&request_id) {
            Some(op) => op.expected_reply,
            None => {
                drop(inner);
                warn!(
                    request_id,
                    message_type = %reply.message_type(),
                    "Dropping reply with no pending operation"
                );
                return Ok(false);
            }
        };
        if expected != reply.message_type() {
            return Err(WorkerError::ReplyTypeMismatch {
                expected,
                actual: reply.message_type(),
            });
        }
        let op = inner.pending.remove(&request_id);
        drop(inner);

        match op {
            Some(op) => {
                let delivered = op.reply_slot.send(Ok(reply)).is_ok();
                if !delivered {
                    debug!(request_id, "Caller stopped waiting before the reply arrived");
                }
                Ok(delivered)
            }
            None => Ok(false),
        }
    }

    /// Remove an operation, failing its caller with [`WorkerError::Cancelled`].
    ///
    /// Returns whether the operation was still pending.
    pub fn cancel_and_remove(&self, request_id: u64) -> bool {
        let op = self.lock().pending.remove(&request_id);
        match op {
            Some(op) => {
                let _ = op.reply_slot.send(Err(WorkerError::Cancelled));
                debug!(request_id, "Cancelled pending operation");
                true
            }
            None => false,
        }
    }

    /// Fail every pending operation with [`WorkerError::ConnectionClosed`].
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Operation> = self.lock().pending.drain().map(|(_, op)| op).collect();
        let count = drained.len();
        for op in drained {
            let _ = op.reply_slot.send(Err(WorkerError::ConnectionClosed));
        }
        count
    }

    pub fn contains(&self, request_id: u64) -> bool {
        self.lock().pending.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inbound requests still being handled, keyed by the proxy's request id.
#[derive(Debug, Default)]
pub struct InboundTable {
    running: Mutex<HashMap<u64, CancellationToken>>,
}

/// Keeps an inbound request tracked until dropped.
#[derive(Debug)]
pub struct InboundGuard<'a> {
    table: &'a InboundTable,
    request_id: u64,
    stop: CancellationToken,
}

impl InboundGuard<'_> {
    /// Cancelled when the proxy asks to stop this request.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }
}

impl Drop for InboundGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().remove(&self.request_id);
    }
}

impl InboundTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn track(&self, request_id: u64) -> InboundGuard<'_> {
        let stop = CancellationToken::new();
        self.lock().insert(request_id, stop.clone());
        InboundGuard {
            table: self,
            request_id,
            stop,
        }
    }

    /// Signal the handler of `request_id` to stop. Returns whether it was still running.
    pub fn stop(&self, request_id: u64) -> bool {
        let stop = self.lock().remove(&request_id);
        match stop {
            Some(stop) => {
                stop.cancel();
                debug!(request_id, "Stopping inbound request");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
