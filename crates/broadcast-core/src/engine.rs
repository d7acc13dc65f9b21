//! Disseminator: forwards a newly learned value to the current neighbors.
//!
//! The fan-out works as follows:
//!
//! 1. Take a snapshot of the neighbor set from the `TopologyStore`
//! 2. Drop the local node and the peer that delivered the value
//! 3. Spawn one task per remaining neighbor, each sending a submit-shaped forward
//! 4. Join every task; the fan-out succeeds only if every forward was acknowledged
//!
//! There is no retry here. A failed forward is reported, the others still run
//! to completion, and the local append that preceded the fan-out stands.

use crate::events::{DisseminationEvent, EventBus};
use crate::node_id::NodeId;
use crate::protocol::Submit;
use crate::topology::TopologyStore;
use crate::transport::{Transport, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("Forward to {dest} failed ({failed} of {attempted} forwards failed): {source}")]
    Forward {
        dest: NodeId,
        #[source]
        source: TransportError,
        failed: usize,
        attempted: usize,
    },

    #[error("Forward task did not complete: {0}")]
    Join(#[from] JoinError),
}

/// Immediate source of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Submitted by a client; every neighbor is a target.
    Client(NodeId),
    /// Forwarded by a peer, which is excluded from the re-forward.
    Peer(NodeId),
}

impl Origin {
    /// The node or client that sent the delivery.
    pub fn sender(&self) -> &NodeId {
        match self {
            Origin::Client(id) | Origin::Peer(id) => id,
        }
    }

    /// The peer to leave out of the fan-out, if any.
    pub fn excluded_peer(&self) -> Option<&NodeId> {
        match self {
            Origin::Client(_) => None,
            Origin::Peer(id) => Some(id),
        }
    }
}

/// Outcome of a fully successful fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    /// Neighbors that acknowledged the forward.
    pub targets: Vec<NodeId>,
}

/// Handle to a fan-out running in the background.
///
/// Dropping the handle detaches the fan-out; it still runs to completion and
/// logs its outcome.
#[derive(Debug)]
pub struct FanoutHandle(JoinHandle<Result<FanoutReport, FanoutError>>);

impl FanoutHandle {
    /// Wait for the fan-out to finish.
    pub async fn wait(self) -> Result<FanoutReport, FanoutError> {
        self.0.await?
    }
}

/// Flood-broadcast fan-out over a `Transport`.
pub struct Disseminator<T> {
    transport: Arc<T>,
    topology: Arc<TopologyStore>,
    events: Arc<EventBus>,
}

impl<T> Clone for Disseminator<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            topology: Arc::clone(&self.topology),
            events: Arc::clone(&self.events),
        }
    }
}

impl<T: Transport> Disseminator<T> {
    pub fn new(transport: Arc<T>, topology: Arc<TopologyStore>, events: Arc<EventBus>) -> Self {
        Self {
            transport,
            topology,
            events,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Neighbors a delivery from `origin` is forwarded to.
    pub fn targets(&self, origin: &Origin) -> Vec<NodeId> {
        let local = self.transport.local_id();
        let excluded = origin.excluded_peer();

        self.topology
            .neighbors()
            .iter()
            .filter(|n| *n != local && Some(*n) != excluded)
            .cloned()
            .collect()
    }

    /// Forward `submit` to every target concurrently and wait for all of them.
    ///
    /// Returns the first failure in completion order, after every forward has
    /// resolved.
    pub async fn fan_out(&self, submit: Submit, origin: &Origin) -> Result<FanoutReport, FanoutError> {
        let targets = self.targets(origin);
        let attempted = targets.len();

        debug!(
            "Fanning out {} from {} to {} neighbor(s)",
            submit.value,
            origin.sender(),
            attempted
        );

        let mut tasks = JoinSet::new();
        for dest in targets.iter().cloned() {
            let transport = Arc::clone(&self.transport);
            let submit = submit.clone();
            tasks.spawn(async move {
                let result = transport.forward(&dest, submit).await;
                (dest, result)
            });
        }

        let mut failed = 0;
        let mut first_failure: Option<FanoutError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((dest, Ok(()))) => {
                    debug!("Forwarded {} to {}", submit.value, dest);
                    self.events.emit(DisseminationEvent::ForwardSucceeded {
                        dest,
                        value: submit.value.clone(),
                    });
                }
                Ok((dest, Err(e))) => {
                    failed += 1;
                    warn!("Failed to forward {} to {}: {}", submit.value, dest, e);
                    self.events.emit(DisseminationEvent::ForwardFailed {
                        dest: dest.clone(),
                        value: submit.value.clone(),
                        error: e.to_string(),
                    });
                    first_failure.get_or_insert(FanoutError::Forward {
                        dest,
                        source: e,
                        failed: 0,
                        attempted,
                    });
                }
                Err(e) => {
                    failed += 1;
                    error!("Forward task for {} aborted: {}", submit.value, e);
                    first_failure.get_or_insert(FanoutError::Join(e));
                }
            }
        }

        self.events.emit(DisseminationEvent::FanoutCompleted {
            value: submit.value.clone(),
            attempted,
            failed,
        });

        match first_failure {
            Some(FanoutError::Forward {
                dest,
                source,
                attempted,
                ..
            }) => Err(FanoutError::Forward {
                dest,
                source,
                failed,
                attempted,
            }),
            Some(other) => Err(other),
            None => Ok(FanoutReport { targets }),
        }
    }

    /// Run `fan_out` as a detached background task.
    pub fn spawn_fan_out(&self, submit: Submit, origin: Origin) -> FanoutHandle {
        let engine = self.clone();
        FanoutHandle(tokio::spawn(async move {
            let result = engine.fan_out(submit, &origin).await;
            if let Err(e) = &result {
                warn!("Background fan-out from {} failed: {}", origin.sender(), e);
            }
            result
        }))
    }
}
