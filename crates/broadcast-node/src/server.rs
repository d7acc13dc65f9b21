//! Dispatch loop: reads envelopes line by line and routes them.
//!
//! - `init` creates the transport and the node, then replies `init_ok`
//! - messages carrying `in_reply_to` resolve a pending RPC
//! - everything else is a request, handled on its own task so a slow
//!   fan-out never holds up the next line
//!
//! Output is written by a single task draining the transport's outbox.

use crate::config::NodeConfig;
use crate::message::{Envelope, InitMessage, MAX_MESSAGE_SIZE};
use crate::transport::NodeTransport;
use anyhow::{Context, Result};
use broadcast_core::BroadcastNode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How long in-flight requests may keep running once input is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// State created by the `init` handshake.
struct Initialized {
    transport: Arc<NodeTransport>,
    node: Arc<BroadcastNode<NodeTransport>>,
}

pub struct NodeServer {
    config: NodeConfig,
    outbox: mpsc::UnboundedSender<Envelope>,
    state: Option<Initialized>,
    handlers: JoinSet<()>,
}

impl NodeServer {
    pub fn new(config: NodeConfig, outbox: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            config,
            outbox,
            state: None,
            handlers: JoinSet::new(),
        }
    }

    /// The node, once `init` has been received.
    pub fn node(&self) -> Option<&Arc<BroadcastNode<NodeTransport>>> {
        self.state.as_ref().map(|s| &s.node)
    }

    /// Number of requests still being handled.
    pub fn in_flight(&self) -> usize {
        self.handlers.len()
    }

    /// Process one input line. Invalid input is logged and dropped.
    pub fn handle_line(&mut self, line: &str) {
        if line.len() > MAX_MESSAGE_SIZE {
            warn!(
                "Dropping oversized message: {} bytes (max {})",
                line.len(),
                MAX_MESSAGE_SIZE
            );
            return;
        }
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let envelope = match Envelope::from_line(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                return;
            }
        };

        if envelope.in_reply_to().is_some() {
            match &self.state {
                Some(state) => {
                    state.transport.resolve(envelope);
                }
                None => debug!("Dropping reply from {} before init", envelope.src),
            }
            return;
        }

        if let Some(init) = InitMessage::from_body(&envelope.body) {
            self.init(&envelope, init);
            return;
        }

        let Some(state) = &self.state else {
            warn!(
                "Dropping {:?} from {}: node not initialized",
                envelope.msg_type(),
                envelope.src
            );
            return;
        };

        if envelope.dest != *state.node.id() {
            warn!(
                "Dropping message for {} (this node is {})",
                envelope.dest,
                state.node.id()
            );
            return;
        }

        let node = Arc::clone(&state.node);
        let transport = Arc::clone(&state.transport);
        self.handlers.spawn(async move {
            match node.handle(&envelope.src, &envelope.body).await {
                Ok(reply) => {
                    if let Err(e) = transport.reply(&envelope, reply.to_body()) {
                        debug!("Could not reply to {}: {}", envelope.src, e);
                    }
                }
                Err(e) => {
                    // No reply: the client sees a timeout
                    warn!(
                        "Request {:?} from {} failed: {}",
                        envelope.msg_type(),
                        envelope.src,
                        e
                    );
                }
            }
        });
    }

    fn init(&mut self, envelope: &Envelope, init: InitMessage) {
        if let Some(state) = &self.state {
            warn!(
                "Ignoring repeated init for {} (already initialized as {})",
                init.node_id,
                state.node.id()
            );
            return;
        }

        let transport = Arc::new(NodeTransport::new(
            init.node_id.clone(),
            init.node_ids.iter().cloned(),
            self.outbox.clone(),
            self.config.rpc.clone(),
        ));
        let node = Arc::new(BroadcastNode::new(
            Arc::clone(&transport),
            self.config.engine.clone(),
        ));
        node.set_cluster(init.node_ids.iter().cloned());

        info!(
            "Initialized as {} in a cluster of {} node(s)",
            init.node_id,
            init.node_ids.len()
        );

        if let Err(e) = transport.reply(envelope, InitMessage::ok_body()) {
            error!("Failed to acknowledge init: {}", e);
        }
        self.state = Some(Initialized { transport, node });
    }

    /// Wait for in-flight requests (bounded by `grace`), then abort the rest.
    pub async fn shutdown(&mut self, grace: Duration) {
        let drain = async { while self.handlers.join_next().await.is_some() {} };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Aborting {} unfinished request(s)", self.handlers.len());
        }
        self.handlers.shutdown().await;

        if let Some(state) = &self.state {
            let pending = state.transport.pending_count();
            if pending > 0 {
                warn!("{} forward(s) still awaiting acknowledgement", pending);
            }
        }
    }
}

async fn write_envelope<W: AsyncWrite + Unpin>(output: &mut W, envelope: &Envelope) -> std::io::Result<()> {
    let mut line = envelope.to_line();
    line.push('\n');
    output.write_all(line.as_bytes()).await?;
    output.flush().await
}

/// Drain the outbox to `output` until it closes or shutdown is signalled.
///
/// On shutdown, whatever is already queued is still written.
async fn write_lines<W: AsyncWrite + Unpin>(
    mut output: W,
    mut outbox: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            biased;
            envelope = outbox.recv() => match envelope {
                Some(envelope) => write_envelope(&mut output, &envelope).await?,
                None => break,
            },
            _ = &mut shutdown => {
                while let Ok(envelope) = outbox.try_recv() {
                    write_envelope(&mut output, &envelope).await?;
                }
                break;
            }
        }
    }
    Ok(())
}

/// Run a node until `input` reaches EOF.
pub async fn run<R, W>(config: NodeConfig, input: R, output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let writer = tokio::spawn(write_lines(output, outbox_rx, shutdown_rx));

    let mut server = NodeServer::new(config, outbox_tx);
    let mut lines = input.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read input")? {
                    Some(line) => server.handle_line(&line),
                    None => break,
                }
            }
            Some(result) = server.handlers.join_next(), if !server.handlers.is_empty() => {
                if let Err(e) = result {
                    error!("Request handler panicked: {}", e);
                }
            }
        }
    }

    info!("Input closed, shutting down");
    server.shutdown(SHUTDOWN_GRACE).await;

    let _ = shutdown_tx.send(());
    writer
        .await
        .context("Writer task failed")?
        .context("Failed to write output")?;

    Ok(())
}
