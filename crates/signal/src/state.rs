use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use chorus_fabric::{
    Broadcaster, Bus, Directory, EventSubscription, Node, Requestor, SERVICE_REGISTER,
    SERVICE_SFU, SERVICE_SIGNAL, ServiceEvent, ServiceNode, ServiceWatcher, rpc_subject,
};
use chorus_protocol::{RoomPub, RoomPubs, RoomUser, RoomUsers, method};

use crate::internal;
use crate::room::Rooms;

/// Everything one signal node owns: its registration, the local rooms, the
/// cluster view, and the live RPC/broadcast links to its peers.
pub struct SignalService {
    node: Node,
    service_node: Arc<ServiceNode>,
    pub rooms: Rooms,
    watcher: ServiceWatcher,
    bus: Bus,
    caster: Broadcaster,
    rpcs: Mutex<HashMap<String, Requestor>>,
    event_subs: Mutex<HashMap<String, EventSubscription>>,
}

impl SignalService {
    pub fn new(node: Node, dir: Directory, bus: Bus) -> Arc<Self> {
        let service_node = Arc::new(ServiceNode::new(dir.clone(), node.clone()));
        let caster = bus.broadcaster(&node.event_topic());
        Arc::new(Self {
            node,
            service_node,
            rooms: Rooms::new(),
            watcher: ServiceWatcher::new(dir),
            bus,
            caster,
            rpcs: Mutex::new(HashMap::new()),
            event_subs: Mutex::new(HashMap::new()),
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Register this node and start following the cluster: every node that
    /// comes up gets a requestor, and peer signal / sfu nodes additionally
    /// get their event topics subscribed.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.service_node.register().await?;

        let service = Arc::clone(self);
        self.watcher
            .watch("", move |event, node| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    service.on_node_event(event, node).await;
                });
            })
            .await?;

        internal::start_room_sweeper(self);
        Ok(())
    }

    async fn on_node_event(self: Arc<Self>, event: ServiceEvent, node: Node) {
        match event {
            ServiceEvent::Up => {
                let follow_events = match node.name.as_str() {
                    SERVICE_SIGNAL => node.id != self.node.id,
                    SERVICE_SFU => true,
                    _ => false,
                };
                if follow_events && !self.event_subs.lock().unwrap().contains_key(&node.id) {
                    let topic = node.event_topic();
                    let service = Arc::clone(&self);
                    let handler: chorus_fabric::EventHandler = Arc::new(move |method, data| {
                        let service = Arc::clone(&service);
                        Box::pin(async move {
                            internal::handle_broadcast(&service, &method, data).await;
                        })
                    });
                    match self.bus.subscribe_events(&topic, handler).await {
                        Ok(sub) => {
                            info!(id = %node.id, %topic, "following peer events");
                            self.event_subs.lock().unwrap().insert(node.id.clone(), sub);
                        }
                        Err(e) => warn!(id = %node.id, "event subscribe failed: {e}"),
                    }
                }
                self.rpcs
                    .lock()
                    .unwrap()
                    .entry(node.id.clone())
                    .or_insert_with(|| self.bus.requestor(&rpc_subject(&node.id)));
                debug!(id = %node.id, name = %node.name, "node up");
            }
            ServiceEvent::Down => {
                info!(id = %node.id, name = %node.name, "node down");
                self.rpcs.lock().unwrap().remove(&node.id);
                self.event_subs.lock().unwrap().remove(&node.id);
            }
        }
    }

    pub fn rpc_by_id(&self, node_id: &str) -> Option<Requestor> {
        if self.watcher.node_by_id(node_id).is_none() {
            return None;
        }
        self.rpcs.lock().unwrap().get(node_id).cloned()
    }

    /// Any live node of a service, typically the register.
    pub fn rpc_by_name(&self, name: &str) -> Option<Requestor> {
        let node = self.watcher.nodes_by_name(name).into_iter().next()?;
        self.rpcs.lock().unwrap().get(&node.id).cloned()
    }

    /// Lowest-payload node of a service within this node's datacenter.
    pub fn rpc_by_payload(&self, name: &str) -> Option<(Requestor, String)> {
        let node = self.watcher.node_by_payload(&self.node.dc, name)?;
        let rpc = self.rpcs.lock().unwrap().get(&node.id).cloned()?;
        Some((rpc, node.id))
    }

    pub fn register_rpc(&self) -> Option<Requestor> {
        self.rpc_by_name(SERVICE_REGISTER)
    }

    /// Sfu requestor for a mid: an explicit sfuid wins, otherwise the
    /// register's `/pub/...` index resolves it.
    pub async fn sfu_rpc_for_mid(
        &self,
        rid: &str,
        mid: &str,
        sfuid: Option<&str>,
    ) -> Option<Requestor> {
        if let Some(sfuid) = sfuid.filter(|s| !s.is_empty()) {
            return self.rpc_by_id(sfuid);
        }
        let register = self.register_rpc()?;
        let resp = register
            .sync_request(method::GET_SFU_INFO, json!({"rid": rid, "mid": mid}))
            .await
            .ok()?;
        let sfuid = resp.get("sfuid").and_then(Value::as_str)?;
        self.rpc_by_id(sfuid)
    }

    /// Whether the user is reachable somewhere in the cluster: registered,
    /// and its signal node is either us or still alive.
    pub async fn user_online(&self, rid: &str, uid: &str) -> bool {
        let Some(register) = self.register_rpc() else {
            return false;
        };
        let Ok(resp) = register
            .sync_request(method::GET_SIGNAL_INFO, json!({"rid": rid, "uid": uid}))
            .await
        else {
            return false;
        };
        match resp.get("signalid").and_then(Value::as_str) {
            Some(signalid) if !signalid.is_empty() => {
                signalid == self.node.id || self.rpc_by_id(signalid).is_some()
            }
            _ => false,
        }
    }

    pub async fn find_room_users(&self, rid: &str, uid: &str) -> Vec<RoomUser> {
        let Some(register) = self.register_rpc() else {
            return Vec::new();
        };
        match register
            .sync_request(method::GET_ROOM_USERS, json!({"rid": rid, "uid": uid}))
            .await
        {
            Ok(resp) => serde_json::from_value::<RoomUsers>(resp)
                .map(|r| r.users)
                .unwrap_or_default(),
            Err(e) => {
                warn!(%rid, "getRoomUsers failed: {e}");
                Vec::new()
            }
        }
    }

    pub async fn find_room_pubs(&self, rid: &str, uid: &str) -> Vec<RoomPub> {
        let Some(register) = self.register_rpc() else {
            return Vec::new();
        };
        match register
            .sync_request(method::GET_ROOM_PUBS, json!({"rid": rid, "uid": uid}))
            .await
        {
            Ok(resp) => serde_json::from_value::<RoomPubs>(resp)
                .map(|r| r.pubs)
                .unwrap_or_default(),
            Err(e) => {
                warn!(%rid, "getRoomPubs failed: {e}");
                Vec::new()
            }
        }
    }

    /// Notify the local room (excluding `skip_uid`) and every peer signal
    /// node via the broadcast topic.
    pub async fn send_notify(&self, rid: &str, skip_uid: &str, method: &str, data: Value) {
        self.rooms.notify_without(rid, skip_uid, method, &data);
        self.caster.say(method, data).await;
    }

    /// Fan a list of event documents out one by one, preserving order.
    pub async fn send_notify_batch(
        &self,
        rid: &str,
        skip_uid: &str,
        method: &str,
        msgs: Vec<Value>,
    ) {
        for msg in msgs {
            self.send_notify(rid, skip_uid, method, msg).await;
        }
    }

    /// Ask the register to drop every publication of a user, returning the
    /// removal documents to broadcast. Errors degrade to an empty list.
    pub async fn remove_user_streams(&self, rid: &str, uid: &str, mid: &str) -> Vec<Value> {
        let Some(register) = self.register_rpc() else {
            warn!(%rid, %uid, "no register node for stream_remove");
            return Vec::new();
        };
        match register
            .sync_request(
                method::STREAM_REMOVE,
                json!({"rid": rid, "uid": uid, "mid": mid}),
            )
            .await
        {
            Ok(resp) => resp
                .get("rmPubs")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            Err(e) => {
                warn!(%rid, %uid, "stream_remove failed: {e}");
                Vec::new()
            }
        }
    }

    pub async fn close(&self) {
        self.watcher.close();
        self.event_subs.lock().unwrap().clear();
        self.service_node.close().await;
    }
}
