use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::directory::{DirEvent, Directory};
use crate::node::Node;

const REWATCH_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    Up,
    Down,
}

pub type ServiceCallback = Arc<dyn Fn(ServiceEvent, Node) + Send + Sync>;

/// In-memory view of the cluster's service nodes, maintained from a directory
/// bootstrap scan plus a live watch.
pub struct ServiceWatcher {
    dir: Directory,
    nodes: Arc<Mutex<HashMap<String, Node>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceWatcher {
    pub fn new(dir: Directory) -> Self {
        Self {
            dir,
            nodes: Arc::new(Mutex::new(HashMap::new())),
            task: Mutex::new(None),
        }
    }

    /// Bootstrap from a descending prefix scan (newest entries first), then
    /// tail watch events until `close`. The callback fires for every node
    /// that comes up or goes down, including those found during bootstrap.
    pub async fn watch<F>(&self, prefix: &str, callback: F) -> Result<()>
    where
        F: Fn(ServiceEvent, Node) + Send + Sync + 'static,
    {
        let callback: ServiceCallback = Arc::new(callback);

        for (key, value) in self.dir.get_by_prefix_desc(prefix).await? {
            let put = DirEvent::Put { key, value };
            if let Some((event, node)) = apply_event(&self.nodes, put) {
                callback(event, node);
            }
        }

        let mut watch = self.dir.watch(prefix).await?;
        let dir = self.dir.clone();
        let prefix = prefix.to_string();
        let nodes = Arc::clone(&self.nodes);
        let handle = tokio::spawn(async move {
            loop {
                match watch.next().await {
                    Ok(Some(events)) => {
                        for ev in events {
                            if let Some((event, node)) = apply_event(&nodes, ev) {
                                callback(event, node);
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("service watch closed");
                        return;
                    }
                    Err(e) => {
                        warn!("service watch error, re-watching: {e}");
                        loop {
                            tokio::time::sleep(REWATCH_BACKOFF).await;
                            match dir.watch(&prefix).await {
                                Ok(w) => {
                                    watch = w;
                                    break;
                                }
                                Err(e) => warn!("re-watch failed: {e}"),
                            }
                        }
                    }
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn node_by_id(&self, id: &str) -> Option<Node> {
        self.nodes.lock().unwrap().get(id).cloned()
    }

    pub fn nodes_by_name(&self, name: &str) -> Vec<Node> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.name == name)
            .cloned()
            .collect()
    }

    /// Lowest-payload node of a service within a datacenter. Ties break on
    /// whichever node is found first; callers must tolerate that.
    pub fn node_by_payload(&self, dc: &str, name: &str) -> Option<Node> {
        lowest_payload(&self.nodes.lock().unwrap(), dc, name)
    }

    pub fn close(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for ServiceWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fold one directory event into the node table. Malformed values and node
/// entries whose key does not match their id are dropped silently; deletes of
/// unknown keys fire nothing.
fn apply_event(
    nodes: &Mutex<HashMap<String, Node>>,
    event: DirEvent,
) -> Option<(ServiceEvent, Node)> {
    match event {
        DirEvent::Put { key, value } => {
            let node = Node::decode(&value)?;
            if node.id != key {
                return None;
            }
            nodes
                .lock()
                .unwrap()
                .insert(node.id.clone(), node.clone());
            Some((ServiceEvent::Up, node))
        }
        DirEvent::Delete { key } => {
            let node = nodes.lock().unwrap().remove(&key)?;
            Some((ServiceEvent::Down, node))
        }
    }
}

fn lowest_payload(nodes: &HashMap<String, Node>, dc: &str, name: &str) -> Option<Node> {
    nodes
        .values()
        .filter(|n| n.dc == dc && n.name == name)
        .min_by_key(|n| n.payload)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::SERVICE_SFU;

    fn put(node: &Node) -> DirEvent {
        DirEvent::Put {
            key: node.id.clone(),
            value: node.encode(),
        }
    }

    #[test]
    fn put_inserts_and_fires_up() {
        let nodes = Mutex::new(HashMap::new());
        let node = Node::new("dc1", "sfu-1", SERVICE_SFU);
        let (event, seen) = apply_event(&nodes, put(&node)).unwrap();
        assert_eq!(event, ServiceEvent::Up);
        assert_eq!(seen, node);
        assert!(nodes.lock().unwrap().contains_key("sfu-1"));
    }

    #[test]
    fn malformed_value_is_dropped() {
        let nodes = Mutex::new(HashMap::new());
        let ev = DirEvent::Put {
            key: "/node/rid/r1/uid/alice".into(),
            value: "signal-1".into(),
        };
        assert!(apply_event(&nodes, ev).is_none());
        assert!(nodes.lock().unwrap().is_empty());
    }

    #[test]
    fn mismatched_key_is_dropped() {
        let nodes = Mutex::new(HashMap::new());
        let node = Node::new("dc1", "sfu-1", SERVICE_SFU);
        let ev = DirEvent::Put {
            key: "something-else".into(),
            value: node.encode(),
        };
        assert!(apply_event(&nodes, ev).is_none());
    }

    #[test]
    fn delete_removes_and_fires_down() {
        let nodes = Mutex::new(HashMap::new());
        let node = Node::new("dc1", "sfu-1", SERVICE_SFU);
        apply_event(&nodes, put(&node)).unwrap();

        let (event, seen) = apply_event(
            &nodes,
            DirEvent::Delete {
                key: "sfu-1".into(),
            },
        )
        .unwrap();
        assert_eq!(event, ServiceEvent::Down);
        assert_eq!(seen.id, "sfu-1");
        assert!(nodes.lock().unwrap().is_empty());
    }

    #[test]
    fn delete_of_unknown_key_fires_nothing() {
        let nodes = Mutex::new(HashMap::new());
        assert!(
            apply_event(
                &nodes,
                DirEvent::Delete {
                    key: "ghost".into()
                }
            )
            .is_none()
        );
    }

    #[test]
    fn overwrite_updates_payload() {
        let nodes = Mutex::new(HashMap::new());
        let mut node = Node::new("dc1", "sfu-1", SERVICE_SFU);
        apply_event(&nodes, put(&node)).unwrap();
        node.payload = 9;
        apply_event(&nodes, put(&node)).unwrap();
        assert_eq!(nodes.lock().unwrap()["sfu-1"].payload, 9);
    }

    #[test]
    fn lowest_payload_selects_within_dc_and_name() {
        let mut nodes = HashMap::new();
        for (id, dc, payload) in [
            ("sfu-1", "dc1", 5u64),
            ("sfu-2", "dc1", 2),
            ("sfu-3", "dc2", 0),
        ] {
            let mut n = Node::new(dc, id, SERVICE_SFU);
            n.payload = payload;
            nodes.insert(n.id.clone(), n);
        }
        let mut other = Node::new("dc1", "signal-1", "signal");
        other.payload = 0;
        nodes.insert(other.id.clone(), other);

        let best = lowest_payload(&nodes, "dc1", SERVICE_SFU).unwrap();
        assert_eq!(best.id, "sfu-2");
        assert!(lowest_payload(&nodes, "dc3", SERVICE_SFU).is_none());
    }
}
