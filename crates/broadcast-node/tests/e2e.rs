//! End-to-end tests for broadcast-node.
//!
//! Drives the full dispatch loop over in-process pipes: init handshake,
//! request handling, forwards to other nodes and their retries.

use std::collections::HashMap;
use std::time::Duration;

use broadcast_core::{AckMode, NodeId};
use broadcast_node::{message::stamp_body, run, Envelope, NodeConfig, RetryConfig};
use serde_json::json;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// A node running `run` with its stdin/stdout replaced by pipes.
struct TestNode {
    input: DuplexStream,
    output: Lines<BufReader<DuplexStream>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestNode {
    fn start(config: NodeConfig) -> Self {
        let (input, node_in) = duplex(64 * 1024);
        let (node_out, output) = duplex(64 * 1024);
        let handle = tokio::spawn(run(config, BufReader::new(node_in), node_out));

        Self {
            input,
            output: BufReader::new(output).lines(),
            handle,
        }
    }

    /// Start a node and complete the init handshake.
    async fn started(config: NodeConfig, node_id: &str, node_ids: &[&str]) -> Self {
        let mut node = Self::start(config);
        node.send(
            "c0",
            node_id,
            json!({"type": "init", "msg_id": 1, "node_id": node_id, "node_ids": node_ids}),
        )
        .await;

        let reply = node.recv().await;
        assert_eq!(reply.msg_type(), Some("init_ok"));
        node
    }

    async fn send(&mut self, src: &str, dest: &str, body: serde_json::Value) {
        let envelope = Envelope::new(id(src), id(dest), body);
        self.send_line(&envelope.to_line()).await;
    }

    async fn send_line(&mut self, line: &str) {
        self.input
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .expect("Failed to write to node");
    }

    async fn recv(&mut self) -> Envelope {
        self.recv_timeout(Duration::from_secs(2))
            .await
            .expect("Timeout waiting for message")
    }

    async fn recv_timeout(&mut self, duration: Duration) -> Option<Envelope> {
        let line = timeout(duration, self.output.next_line()).await.ok()?;
        let line = line.expect("Failed to read node output")?;
        Some(Envelope::from_line(&line).expect("Node wrote an invalid envelope"))
    }
}

fn id(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

fn values_of(envelope: &Envelope) -> Vec<i64> {
    let mut values: Vec<i64> = envelope.body["values"]
        .as_array()
        .expect("query_ok without values")
        .iter()
        .filter_map(|v| v.as_i64())
        .collect();
    values.sort_unstable();
    values
}

fn config_with(ack_mode: AckMode, timeout_ms: u64) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.engine.ack_mode = ack_mode;
    config.rpc = RetryConfig {
        timeout_ms,
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
        ..Default::default()
    };
    config
}

/// Reply to `request` as its destination would.
fn answer(request: &Envelope, body: serde_json::Value) -> String {
    let body = stamp_body(body, 1000, request.msg_id());
    Envelope::new(request.dest.clone(), request.src.clone(), body).to_line()
}

// ============================================================================
// Single node
// ============================================================================

#[tokio::test]
async fn test_init_handshake() {
    let mut node = TestNode::start(NodeConfig::default());
    node.send(
        "c0",
        "n1",
        json!({"type": "init", "msg_id": 1, "node_id": "n1", "node_ids": ["n1"]}),
    )
    .await;

    let reply = node.recv().await;
    assert_eq!(reply.src, id("n1"));
    assert_eq!(reply.dest, id("c0"));
    assert_eq!(reply.msg_type(), Some("init_ok"));
    assert_eq!(reply.in_reply_to(), Some(1));
}

#[tokio::test]
async fn test_submit_and_query() {
    let mut node = TestNode::started(NodeConfig::default(), "n1", &["n1"]).await;

    for (msg_id, value) in [(2, 3), (3, 1), (4, 3)] {
        node.send("c1", "n1", json!({"type": "submit", "msg_id": msg_id, "value": value}))
            .await;
        let reply = node.recv().await;
        assert_eq!(reply.msg_type(), Some("submit_ok"));
        assert_eq!(reply.in_reply_to(), Some(msg_id));
    }

    node.send("c1", "n1", json!({"type": "query", "msg_id": 5})).await;
    let reply = node.recv().await;
    assert_eq!(reply.msg_type(), Some("query_ok"));
    assert_eq!(values_of(&reply), vec![1, 3, 3]);
}

#[tokio::test]
async fn test_configure_topology_is_acknowledged() {
    let mut node = TestNode::started(NodeConfig::default(), "n1", &["n1", "n2"]).await;

    node.send(
        "c0",
        "n1",
        json!({"type": "configure-topology", "msg_id": 2, "topology": {"n1": ["n2"], "n2": ["n1"]}}),
    )
    .await;

    let reply = node.recv().await;
    assert_eq!(reply.msg_type(), Some("configure-topology_ok"));
    assert_eq!(reply.in_reply_to(), Some(2));
}

#[tokio::test]
async fn test_malformed_submit_gets_no_reply() {
    let mut node = TestNode::started(NodeConfig::default(), "n1", &["n1"]).await;

    node.send("c1", "n1", json!({"type": "submit", "msg_id": 2, "value": "abc"}))
        .await;
    node.send_line("{ this is not json").await;
    assert!(node.recv_timeout(Duration::from_millis(200)).await.is_none());

    // The node keeps serving, and nothing was stored
    node.send("c1", "n1", json!({"type": "query", "msg_id": 3})).await;
    let reply = node.recv().await;
    assert_eq!(reply.in_reply_to(), Some(3));
    assert!(values_of(&reply).is_empty());
}

#[tokio::test]
async fn test_run_returns_when_input_closes() {
    let node = TestNode::started(NodeConfig::default(), "n1", &["n1"]).await;
    let TestNode { input, handle, .. } = node;
    drop(input);

    let result = timeout(Duration::from_secs(5), handle)
        .await
        .expect("run did not stop on EOF")
        .expect("run task panicked");
    assert!(result.is_ok());
}

// ============================================================================
// Forwards
// ============================================================================

async fn node_with_neighbor(config: NodeConfig) -> TestNode {
    let mut node = TestNode::started(config, "n1", &["n1", "n2"]).await;
    node.send(
        "c0",
        "n1",
        json!({"type": "configure-topology", "msg_id": 2, "topology": {"n1": ["n2"]}}),
    )
    .await;
    assert_eq!(node.recv().await.msg_type(), Some("configure-topology_ok"));
    node
}

#[tokio::test]
async fn test_submit_is_forwarded_with_broadcast_id() {
    let mut node = node_with_neighbor(config_with(AckMode::Immediate, 1000)).await;

    node.send("c1", "n1", json!({"type": "submit", "msg_id": 3, "value": 7}))
        .await;

    let first = node.recv().await;
    let second = node.recv().await;
    let (ok, forward) = if first.dest == id("c1") {
        (first, second)
    } else {
        (second, first)
    };

    assert_eq!(ok.msg_type(), Some("submit_ok"));
    assert_eq!(ok.in_reply_to(), Some(3));

    assert_eq!(forward.src, id("n1"));
    assert_eq!(forward.dest, id("n2"));
    assert_eq!(forward.msg_type(), Some("submit"));
    assert!(forward.msg_id().is_some());
    assert_eq!(forward.body["value"], json!(7));
    assert_eq!(forward.body["id"], json!({"origin": "n1", "seq": 0}));
}

#[tokio::test]
async fn test_after_fanout_acks_only_once_forward_is_acked() {
    let mut node = node_with_neighbor(config_with(AckMode::AfterFanout, 5000)).await;

    node.send("c1", "n1", json!({"type": "submit", "msg_id": 3, "value": 7}))
        .await;

    let forward = node.recv().await;
    assert_eq!(forward.dest, id("n2"));
    assert!(node.recv_timeout(Duration::from_millis(200)).await.is_none());

    node.send_line(&answer(&forward, json!({"type": "submit_ok"}))).await;

    let ok = node.recv().await;
    assert_eq!(ok.dest, id("c1"));
    assert_eq!(ok.msg_type(), Some("submit_ok"));
    assert_eq!(ok.in_reply_to(), Some(3));
}

#[tokio::test]
async fn test_unanswered_forward_does_not_hold_up_other_requests() {
    let mut node = node_with_neighbor(config_with(AckMode::AfterFanout, 5000)).await;

    node.send("c1", "n1", json!({"type": "submit", "msg_id": 3, "value": 7}))
        .await;
    let forward = node.recv().await;
    assert_eq!(forward.dest, id("n2"));

    node.send("c2", "n1", json!({"type": "query", "msg_id": 4})).await;
    let query = node.recv().await;
    assert_eq!(query.dest, id("c2"));
    assert_eq!(values_of(&query), vec![7]);

    node.send(
        "c0",
        "n1",
        json!({"type": "configure-topology", "msg_id": 5, "topology": {"n1": []}}),
    )
    .await;
    let topology = node.recv().await;
    assert_eq!(topology.msg_type(), Some("configure-topology_ok"));
    assert_eq!(topology.in_reply_to(), Some(5));

    node.send_line(&answer(&forward, json!({"type": "submit_ok"}))).await;
    let ok = node.recv().await;
    assert_eq!(ok.dest, id("c1"));
    assert_eq!(ok.in_reply_to(), Some(3));
}

#[tokio::test]
async fn test_unacknowledged_forward_is_retried() {
    let mut node = node_with_neighbor(config_with(AckMode::AfterFanout, 100)).await;

    node.send("c1", "n1", json!({"type": "submit", "msg_id": 3, "value": 9}))
        .await;

    let first = node.recv().await;
    let retry = node.recv().await;
    assert_eq!(retry.dest, id("n2"));
    assert_ne!(first.msg_id(), retry.msg_id());
    assert_eq!(first.body["id"], retry.body["id"]);

    // A late reply to the first attempt is ignored
    node.send_line(&answer(&first, json!({"type": "submit_ok"}))).await;
    node.send_line(&answer(&retry, json!({"type": "submit_ok"}))).await;

    let mut ok = node.recv().await;
    while ok.dest != id("c1") {
        // A further retry raced with the acknowledgement
        node.send_line(&answer(&ok, json!({"type": "submit_ok"}))).await;
        ok = node.recv().await;
    }
    assert_eq!(ok.msg_type(), Some("submit_ok"));
}

#[tokio::test]
async fn test_duplicate_forward_is_acked_but_not_stored_twice() {
    let mut node = TestNode::started(NodeConfig::default(), "n1", &["n1", "n2"]).await;

    for msg_id in [2, 3] {
        node.send(
            "n2",
            "n1",
            json!({"type": "submit", "msg_id": msg_id, "value": 4, "id": {"origin": "n2", "seq": 0}}),
        )
        .await;
        let reply = node.recv().await;
        assert_eq!(reply.msg_type(), Some("submit_ok"));
        assert_eq!(reply.in_reply_to(), Some(msg_id));
    }

    node.send("c1", "n1", json!({"type": "query", "msg_id": 4})).await;
    assert_eq!(values_of(&node.recv().await), vec![4]);
}

// ============================================================================
// Cluster
// ============================================================================

/// Nodes wired together: envelopes addressed to a node are piped to its
/// input, everything else is collected as client traffic.
struct Cluster {
    inputs: HashMap<NodeId, mpsc::UnboundedSender<String>>,
    client_rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Cluster {
    async fn start(names: &[&str]) -> Self {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let mut nodes = Vec::new();
        let mut inputs = HashMap::new();
        let mut input_rxs = Vec::new();

        for name in names {
            nodes.push(TestNode::started(NodeConfig::default(), name, names).await);
            let (tx, rx) = mpsc::unbounded_channel::<String>();
            inputs.insert(id(name), tx);
            input_rxs.push(rx);
        }

        for (node, mut input_rx) in nodes.into_iter().zip(input_rxs) {
            let TestNode {
                mut input,
                mut output,
                ..
            } = node;

            tokio::spawn(async move {
                while let Some(line) = input_rx.recv().await {
                    if input.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });

            let routes = inputs.clone();
            let client_tx = client_tx.clone();
            tokio::spawn(async move {
                while let Ok(Some(line)) = output.next_line().await {
                    let envelope = Envelope::from_line(&line).expect("invalid envelope");
                    match routes.get(&envelope.dest) {
                        Some(tx) => {
                            let _ = tx.send(format!("{}\n", line));
                        }
                        None => {
                            let _ = client_tx.send(envelope);
                        }
                    }
                }
            });
        }

        Self { inputs, client_rx }
    }

    fn send(&self, src: &str, dest: &str, body: serde_json::Value) {
        let line = Envelope::new(id(src), id(dest), body).to_line();
        self.inputs[&id(dest)]
            .send(format!("{}\n", line))
            .expect("node input closed");
    }

    async fn recv(&mut self) -> Envelope {
        timeout(Duration::from_secs(2), self.client_rx.recv())
            .await
            .expect("Timeout waiting for client reply")
            .expect("cluster stopped")
    }
}

#[tokio::test]
async fn test_three_node_line_cluster_converges() {
    let names = ["n1", "n2", "n3"];
    let mut cluster = Cluster::start(&names).await;

    let topology = json!({"n1": ["n2"], "n2": ["n1", "n3"], "n3": ["n2"]});
    for (i, name) in names.iter().enumerate() {
        cluster.send(
            "c0",
            name,
            json!({"type": "configure-topology", "msg_id": i, "topology": topology}),
        );
        assert_eq!(cluster.recv().await.msg_type(), Some("configure-topology_ok"));
    }

    for (i, name) in names.iter().enumerate() {
        cluster.send("c1", name, json!({"type": "submit", "msg_id": 10 + i, "value": 100 + i}));
        assert_eq!(cluster.recv().await.msg_type(), Some("submit_ok"));
    }

    let converge = async {
        loop {
            let mut all = Vec::new();
            for name in names {
                cluster.send("c2", name, json!({"type": "query", "msg_id": 20}));
                all.push(values_of(&cluster.recv().await));
            }
            if all.iter().all(|values| values == &vec![100, 101, 102]) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    timeout(Duration::from_secs(5), converge)
        .await
        .expect("cluster did not converge");
}
