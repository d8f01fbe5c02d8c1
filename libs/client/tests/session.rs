//! End-to-end client behavior against in-process partitions.

use logplane_client::{
    CommunicationStrategy, PartitionedClientBuilder, RecoveryStrategy, SessionBuilder,
};
use logplane_consensus::{
    LocalTransport, NodeId, RaftMember, RaftNode, ReadConsistency, Role, StateMachine,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Tiny text-protocol store: commands are `set:key:value`, queries are
/// `get:key`.
#[derive(Default)]
struct KvMachine {
    data: HashMap<String, String>,
}

impl StateMachine for KvMachine {
    fn apply(&mut self, op: &[u8]) -> Result<Vec<u8>, String> {
        let op = String::from_utf8_lossy(op);
        let mut parts = op.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("set"), Some(key), Some(value)) => {
                self.data.insert(key.to_string(), value.to_string());
                Ok(b"ok".to_vec())
            }
            _ => Err(format!("bad command: {op}")),
        }
    }

    fn query(&self, op: &[u8]) -> Result<Vec<u8>, String> {
        let op = String::from_utf8_lossy(op);
        match op.strip_prefix("get:") {
            Some(key) => Ok(self.data.get(key).cloned().unwrap_or_default().into_bytes()),
            None => Err(format!("bad query: {op}")),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(&self.data).unwrap_or_default()
    }

    fn restore(&mut self, data: &[u8]) {
        if let Ok(restored) = serde_json::from_slice(data) {
            self.data = restored;
        }
    }
}

async fn start_partition(transport: &Arc<LocalTransport>, ids: &[u64]) -> Vec<RaftNode> {
    let members: Vec<RaftMember> = ids.iter().map(|&id| RaftMember::active(NodeId(id))).collect();
    let mut nodes = vec![];
    for &id in ids {
        let node = RaftNode::builder(NodeId(id))
            .members(members.clone())
            .protocol(transport.handle_for(NodeId(id)))
            .build(KvMachine::default())
            .unwrap();
        transport.register(node.clone());
        nodes.push(node);
    }
    for node in &nodes {
        node.bootstrap().await.unwrap();
    }
    // Let a leader settle before handing the partition to a client.
    'outer: loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        for node in &nodes {
            if node.status().await.unwrap().role == Role::Leader {
                break 'outer;
            }
        }
    }
    nodes
}

#[tokio::test(start_paused = true)]
async fn test_session_command_and_query_round_trip() {
    let transport = LocalTransport::new();
    let nodes = start_partition(&transport, &[1, 2, 3]).await;

    let session = SessionBuilder::new("tester")
        .nodes(nodes.clone())
        .read_consistency(ReadConsistency::Linearizable)
        .build()
        .await
        .unwrap();

    let reply = session.command(b"set:color:teal".to_vec()).await.unwrap();
    assert_eq!(reply, b"ok");

    let value = session.query(b"get:color".to_vec()).await.unwrap();
    assert_eq!(value, b"teal");

    session.close().await.unwrap();
    for node in &nodes {
        node.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_session_survives_leader_change() {
    let transport = LocalTransport::new();
    let nodes = start_partition(&transport, &[1, 2, 3]).await;

    let session = SessionBuilder::new("tester")
        .nodes(nodes.clone())
        .retry_delay(Duration::from_millis(50))
        .build()
        .await
        .unwrap();

    session.command(b"set:a:1".to_vec()).await.unwrap();

    // Knock the leader over; the session retries onto its successor.
    for node in &nodes {
        if node.status().await.unwrap().role == Role::Leader {
            node.shutdown();
            break;
        }
    }

    session.command(b"set:b:2".to_vec()).await.unwrap();
    let value = session.query(b"get:b".to_vec()).await.unwrap();
    assert_eq!(value, b"2");

    session.close().await.unwrap();
    for node in &nodes {
        node.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_sequential_reads_resolve_on_any_node() {
    let transport = LocalTransport::new();
    let nodes = start_partition(&transport, &[1, 2, 3]).await;

    let session = SessionBuilder::new("tester")
        .nodes(nodes.clone())
        .read_consistency(ReadConsistency::Sequential)
        .communication_strategy(CommunicationStrategy::Any)
        .build()
        .await
        .unwrap();

    session.command(b"set:x:42".to_vec()).await.unwrap();

    // Wherever the rotation lands, the session index keeps reads from
    // running behind the write.
    for _ in 0..6 {
        let value = session.query(b"get:x".to_vec()).await.unwrap();
        assert_eq!(value, b"42");
    }

    session.close().await.unwrap();
    for node in &nodes {
        node.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_close_strategy_surfaces_session_loss() {
    let transport = LocalTransport::new();
    let nodes = start_partition(&transport, &[1]).await;

    let session = SessionBuilder::new("tester")
        .nodes(nodes.clone())
        .recovery_strategy(RecoveryStrategy::Close)
        .timeout(Duration::from_millis(300))
        .build()
        .await
        .unwrap();

    // External close: the next command reports the loss, no recovery.
    nodes[0].close_session(session.session_id().await).await.unwrap();

    let err = session.command(b"set:k:v".to_vec()).await.unwrap_err();
    assert!(err.needs_new_session());

    for node in &nodes {
        node.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_recover_strategy_reopens_session() {
    let transport = LocalTransport::new();
    let nodes = start_partition(&transport, &[1]).await;

    let session = SessionBuilder::new("tester")
        .nodes(nodes.clone())
        .recovery_strategy(RecoveryStrategy::Recover)
        .build()
        .await
        .unwrap();

    let original = session.session_id().await;
    nodes[0].close_session(original).await.unwrap();

    // The command transparently lands on a replacement session.
    session.command(b"set:k:v".to_vec()).await.unwrap();
    assert_ne!(session.session_id().await, original);

    session.close().await.unwrap();
    for node in &nodes {
        node.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_client_routes_by_key() {
    let transport = LocalTransport::new();
    let p0 = start_partition(&transport, &[10, 11, 12]).await;
    let p1 = start_partition(&transport, &[20, 21, 22]).await;

    let client = PartitionedClientBuilder::new("tester")
        .partition(p0.clone())
        .partition(p1.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(client.partition_count(), 2);

    for key in [b"alpha".as_slice(), b"beta", b"gamma", b"delta"] {
        let op = format!("set:{}:v", String::from_utf8_lossy(key)).into_bytes();
        client.command(key, op).await.unwrap();
    }

    // Reads route to the same partition the writes went to.
    for key in [b"alpha".as_slice(), b"beta", b"gamma", b"delta"] {
        let op = format!("get:{}", String::from_utf8_lossy(key)).into_bytes();
        assert_eq!(client.query(key, op).await.unwrap(), b"v");
    }

    let results = client
        .broadcast_query(b"get:alpha".to_vec())
        .await;
    assert_eq!(results.len(), 2);
    // Exactly one partition owns the key.
    let owners = results
        .iter()
        .filter(|r| r.as_deref().map(|v| v == b"v").unwrap_or(false))
        .count();
    assert_eq!(owners, 1);

    client.close().await.unwrap();
    for node in p0.iter().chain(p1.iter()) {
        node.shutdown();
    }
}
