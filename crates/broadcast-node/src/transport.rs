//! Transport over the node's stdout, with replies routed back from stdin.
//!
//! Outgoing envelopes go through an unbounded channel drained by a single
//! writer task, so lines are never interleaved. Every RPC registers a
//! one-shot slot under its `msg_id`; the dispatch loop hands matching
//! `in_reply_to` messages to [`NodeTransport::resolve`].

use crate::config::{calculate_backoff, RetryConfig};
use crate::message::{stamp_body, Envelope, ErrorBody};
use async_trait::async_trait;
use broadcast_core::transport::Result;
use broadcast_core::{NodeId, Reply, Request, Submit, Transport, TransportError};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub struct NodeTransport {
    local: NodeId,
    cluster: HashSet<NodeId>,
    outbox: mpsc::UnboundedSender<Envelope>,
    next_msg_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>,
    retry: RetryConfig,
}

impl NodeTransport {
    pub fn new(
        local: NodeId,
        cluster: impl IntoIterator<Item = NodeId>,
        outbox: mpsc::UnboundedSender<Envelope>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            local,
            cluster: cluster.into_iter().collect(),
            outbox,
            next_msg_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            retry,
        }
    }

    fn allocate_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push(&self, envelope: Envelope) -> Result<()> {
        self.outbox
            .send(envelope)
            .map_err(|_| TransportError::Closed)
    }

    /// Answer `request`, echoing its `msg_id` as `in_reply_to`.
    pub fn reply(&self, request: &Envelope, body: serde_json::Value) -> Result<()> {
        let body = stamp_body(body, self.allocate_msg_id(), request.msg_id());
        self.push(Envelope::new(self.local.clone(), request.src.clone(), body))
    }

    /// Send one request and wait up to the configured timeout for its reply.
    pub async fn rpc(&self, dest: &NodeId, body: serde_json::Value) -> Result<serde_json::Value> {
        let msg_id = self.allocate_msg_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(msg_id, tx);

        let body = stamp_body(body, msg_id, None);
        if let Err(e) = self.push(Envelope::new(self.local.clone(), dest.clone(), body)) {
            self.forget(msg_id);
            return Err(e);
        }

        match tokio::time::timeout(self.retry.timeout(), rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.forget(msg_id);
                Err(TransportError::Timeout {
                    dest: dest.clone(),
                    attempts: 1,
                })
            }
        }
    }

    fn forget(&self, msg_id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&msg_id);
    }

    /// Route a reply to the RPC waiting on it.
    ///
    /// Returns false for replies nobody is waiting for (late or unknown).
    pub fn resolve(&self, envelope: Envelope) -> bool {
        let Some(request_id) = envelope.in_reply_to() else {
            return false;
        };
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);

        match waiter {
            Some(tx) => tx.send(envelope.body).is_ok(),
            None => {
                debug!("Dropping reply to {} from {}: no pending request", request_id, envelope.src);
                false
            }
        }
    }

    /// Number of RPCs still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let delay = calculate_backoff(attempt, &self.retry);
        if !self.retry.jitter {
            return delay;
        }
        let ms = delay.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(ms / 2..=ms))
    }
}

#[async_trait]
impl Transport for NodeTransport {
    fn local_id(&self) -> &NodeId {
        &self.local
    }

    async fn forward(&self, dest: &NodeId, submit: Submit) -> Result<()> {
        if !self.cluster.contains(dest) {
            return Err(TransportError::Unreachable(dest.clone()));
        }

        let body = Request::Submit(submit).to_body();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let failure = match self.rpc(dest, body.clone()).await {
                Ok(reply) => {
                    if let Some(error) = ErrorBody::from_body(&reply) {
                        let rejected = TransportError::Rejected {
                            dest: dest.clone(),
                            code: error.code,
                            text: error.text.clone(),
                        };
                        if !error.is_retryable() {
                            return Err(rejected);
                        }
                        rejected
                    } else if Reply::from_body(&reply) == Some(Reply::SubmitOk) {
                        return Ok(());
                    } else {
                        return Err(TransportError::SendFailed(format!(
                            "unexpected reply from {}: {}",
                            dest, reply
                        )));
                    }
                }
                Err(TransportError::Timeout { .. }) => TransportError::Timeout {
                    dest: dest.clone(),
                    attempts,
                },
                Err(e) => return Err(e),
            };

            if self.retry.exhausted(attempts) {
                return Err(failure);
            }

            let delay = self.retry_delay(attempts);
            warn!(
                "Forward to {} failed (attempt {}): {}. Retrying in {:?}",
                dest, attempts, failure, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
