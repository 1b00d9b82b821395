use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::directory::Directory;

pub const SERVICE_SIGNAL: &str = "signal";
pub const SERVICE_SFU: &str = "sfu";
pub const SERVICE_REGISTER: &str = "register";

/// One service node as stored in the cluster directory.
///
/// The directory value is JSON with the legacy field names; `payload` is
/// carried as a numeric string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "NodeDC")]
    pub dc: String,
    #[serde(rename = "NodeID")]
    pub id: String,
    #[serde(rename = "NodeName")]
    pub name: String,
    #[serde(rename = "NODEPAYLOAD", with = "payload_string")]
    pub payload: u64,
}

impl Node {
    pub fn new(dc: impl Into<String>, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            dc: dc.into(),
            id: id.into(),
            name: name.into(),
            payload: 0,
        }
    }

    /// RPC subject this node serves requests on.
    pub fn rpc_subject(&self) -> String {
        rpc_subject(&self.id)
    }

    /// Broadcast topic this node publishes events on.
    pub fn event_topic(&self) -> String {
        event_topic(&self.id)
    }

    pub fn encode(&self) -> String {
        // Only fails on non-string map keys, which this struct cannot produce.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a directory value into a node. Values that are not well-formed
    /// node entries (session keys share the watched keyspace) yield `None`.
    pub fn decode(value: &str) -> Option<Self> {
        let node: Node = serde_json::from_str(value).ok()?;
        if node.id.is_empty() { None } else { Some(node) }
    }
}

pub fn rpc_subject(node_id: &str) -> String {
    format!("rpc-{node_id}")
}

pub fn event_topic(node_id: &str) -> String {
    format!("event-{node_id}")
}

const REGISTER_BACKOFF: Duration = Duration::from_secs(5);

/// This process's own directory registration.
///
/// The node entry lives under its bare id, kept alive by the directory lease;
/// it disappears automatically if the process dies.
pub struct ServiceNode {
    dir: Directory,
    node: Mutex<Node>,
}

impl ServiceNode {
    pub fn new(dir: Directory, node: Node) -> Self {
        Self {
            dir,
            node: Mutex::new(node),
        }
    }

    pub fn node(&self) -> Node {
        self.node.lock().unwrap().clone()
    }

    pub fn rpc_subject(&self) -> String {
        self.node().rpc_subject()
    }

    pub fn event_topic(&self) -> String {
        self.node().event_topic()
    }

    /// Register the node entry, retrying until the first keep succeeds so the
    /// service never comes up unregistered.
    pub async fn register(&self) -> Result<()> {
        let node = self.node();
        if node.dc.is_empty() || node.id.is_empty() || node.name.is_empty() {
            bail!("node dc, id and name must be non-empty");
        }
        loop {
            match self.dir.keep(&node.id, &node.encode()).await {
                Ok(()) => {
                    info!(id = %node.id, name = %node.name, "service node registered");
                    return Ok(());
                }
                Err(e) => {
                    warn!(id = %node.id, "node registration failed, retrying: {e}");
                    tokio::time::sleep(REGISTER_BACKOFF).await;
                }
            }
        }
    }

    /// Re-put the node entry when the load metric changed.
    pub async fn update_payload(&self, payload: u64) {
        let node = {
            let mut node = self.node.lock().unwrap();
            if node.payload == payload {
                return;
            }
            node.payload = payload;
            node.clone()
        };
        if let Err(e) = self.dir.update(&node.id, &node.encode()).await {
            warn!(id = %node.id, payload, "payload update failed: {e}");
        }
    }

    /// Deregister and stop lease renewals.
    pub async fn close(&self) {
        self.dir.close().await;
    }
}

mod payload_string {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(payload: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&payload.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(0);
        }
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names() {
        let node = Node {
            dc: "dc1".into(),
            id: "sfu-1".into(),
            name: "sfu".into(),
            payload: 42,
        };
        let json = node.encode();
        assert!(json.contains(r#""NodeDC":"dc1""#));
        assert!(json.contains(r#""NodeID":"sfu-1""#));
        assert!(json.contains(r#""NodeName":"sfu""#));
        assert!(json.contains(r#""NODEPAYLOAD":"42""#));
    }

    #[test]
    fn decode_roundtrip() {
        let node = Node::new("dc1", "signal-1", SERVICE_SIGNAL);
        let parsed = Node::decode(&node.encode()).unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn decode_rejects_non_node_values() {
        // Session index values share the watched keyspace.
        assert!(Node::decode("signal-1").is_none());
        assert!(Node::decode(r#"{"audio":true,"video":false}"#).is_none());
        assert!(Node::decode(r#"{"NodeID":""}"#).is_none());
    }

    #[test]
    fn empty_payload_decodes_to_zero() {
        let parsed = Node::decode(
            r#"{"NodeDC":"dc1","NodeID":"n1","NodeName":"sfu","NODEPAYLOAD":""}"#,
        )
        .unwrap();
        assert_eq!(parsed.payload, 0);
    }

    #[test]
    fn subject_and_topic_naming() {
        let node = Node::new("dc1", "reg-1", SERVICE_REGISTER);
        assert_eq!(node.rpc_subject(), "rpc-reg-1");
        assert_eq!(node.event_topic(), "event-reg-1");
    }
}
