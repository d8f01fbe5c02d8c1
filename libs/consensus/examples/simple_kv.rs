//! A replicated key-value store on a three node in-process cluster.
//!
//! Run with: cargo run --example simple_kv

use logplane_consensus::{
    LocalTransport, NodeId, RaftMember, RaftNode, ReadConsistency, Role, StateMachine,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

#[derive(Serialize, Deserialize)]
enum KvOp {
    Set { key: String, value: String },
    Delete { key: String },
    Get { key: String },
}

#[derive(Default, Serialize, Deserialize)]
struct KvStore {
    data: HashMap<String, String>,
}

impl StateMachine for KvStore {
    fn apply(&mut self, op: &[u8]) -> Result<Vec<u8>, String> {
        match serde_json::from_slice(op).map_err(|e| e.to_string())? {
            KvOp::Set { key, value } => {
                self.data.insert(key, value);
                Ok(b"ok".to_vec())
            }
            KvOp::Delete { key } => {
                self.data.remove(&key);
                Ok(b"ok".to_vec())
            }
            KvOp::Get { .. } => Err("get is a query, not a command".to_string()),
        }
    }

    fn query(&self, op: &[u8]) -> Result<Vec<u8>, String> {
        match serde_json::from_slice(op).map_err(|e| e.to_string())? {
            KvOp::Get { key } => Ok(self
                .data
                .get(&key)
                .map(|v| v.clone().into_bytes())
                .unwrap_or_default()),
            _ => Err("commands must go through apply".to_string()),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    fn restore(&mut self, data: &[u8]) {
        if let Ok(restored) = serde_json::from_slice(data) {
            *self = restored;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let ids = [NodeId(1), NodeId(2), NodeId(3)];
    let members: Vec<RaftMember> = ids.iter().map(|&id| RaftMember::active(id)).collect();

    let transport = LocalTransport::new();
    let mut nodes = Vec::new();
    for &id in &ids {
        let node = RaftNode::builder(id)
            .members(members.clone())
            .protocol(transport.handle_for(id))
            .build(KvStore::default())?;
        transport.register(node.clone());
        nodes.push(node);
    }
    for node in &nodes {
        node.bootstrap().await?;
    }

    // Wait for a leader to emerge.
    let leader = loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut found = None;
        for node in &nodes {
            if node.status().await?.role == Role::Leader {
                found = Some(node.clone());
            }
        }
        if let Some(leader) = found {
            break leader;
        }
    };
    info!("leader is {}", leader.id());

    let session = leader
        .open_session("simple-kv", Duration::from_secs(10))
        .await?;
    info!("opened session {session}");

    let set = serde_json::to_vec(&KvOp::Set {
        key: "greeting".into(),
        value: "hello from a replicated log".into(),
    })?;
    let output = leader.command(session, 1, set).await?;
    info!("set committed at index {}", output.index);

    let get = serde_json::to_vec(&KvOp::Get {
        key: "greeting".into(),
    })?;
    let output = leader
        .query(ReadConsistency::Linearizable, get, output.index)
        .await?;
    info!("read back: {}", String::from_utf8_lossy(&output.data));

    leader.close_session(session).await?;
    for node in &nodes {
        node.shutdown();
    }
    Ok(())
}
