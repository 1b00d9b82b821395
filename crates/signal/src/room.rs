use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use crate::ws::Peer;

/// One named room: uid -> peer. The lock is held only for map work; all
/// notification I/O happens on a snapshot taken under the lock.
pub struct Room {
    id: String,
    peers: Mutex<HashMap<String, Arc<Peer>>>,
}

impl Room {
    pub fn new(rid: &str) -> Arc<Self> {
        Arc::new(Self {
            id: rid.to_string(),
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Insert a peer, replacing (and closing) any previous session with the
    /// same uid.
    pub fn add_peer(&self, peer: Arc<Peer>) {
        let old = self
            .peers
            .lock()
            .unwrap()
            .insert(peer.uid().to_string(), peer);
        if let Some(old) = old {
            old.close();
        }
    }

    pub fn del_peer(&self, uid: &str) {
        let peer = self.peers.lock().unwrap().remove(uid);
        if let Some(peer) = peer {
            peer.close();
        }
    }

    pub fn get_peer(&self, uid: &str) -> Option<Arc<Peer>> {
        self.peers.lock().unwrap().get(uid).cloned()
    }

    pub fn uids(&self) -> Vec<String> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    /// Notify every peer except `skip_uid`.
    pub fn notify_without(&self, skip_uid: &str, method: &str, data: &Value) {
        for peer in self.snapshot() {
            if peer.uid() != skip_uid {
                peer.notify(method, data.clone());
            }
        }
    }

    /// Notify one peer.
    pub fn notify_to(&self, uid: &str, method: &str, data: &Value) {
        if let Some(peer) = self.get_peer(uid) {
            peer.notify(method, data.clone());
        }
    }

    pub fn close(&self) {
        debug!(rid = %self.id, "room close");
        let peers: Vec<Arc<Peer>> = {
            let mut peers = self.peers.lock().unwrap();
            peers.drain().map(|(_, p)| p).collect()
        };
        for peer in peers {
            peer.close();
        }
    }
}

/// All rooms of this signal node.
#[derive(Default)]
pub struct Rooms {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, rid: &str) -> Option<Arc<Room>> {
        self.rooms.lock().unwrap().get(rid).cloned()
    }

    pub fn get_or_create(&self, rid: &str) -> Arc<Room> {
        self.rooms
            .lock()
            .unwrap()
            .entry(rid.to_string())
            .or_insert_with(|| {
                debug!(%rid, "room created");
                Room::new(rid)
            })
            .clone()
    }

    pub fn del_room(&self, rid: &str) {
        let room = self.rooms.lock().unwrap().remove(rid);
        if let Some(room) = room {
            room.close();
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.lock().unwrap().values().cloned().collect()
    }

    pub fn notify_without(&self, rid: &str, skip_uid: &str, method: &str, data: &Value) {
        if let Some(room) = self.get(rid) {
            room.notify_without(skip_uid, method, data);
        }
    }

    pub fn notify_to(&self, rid: &str, uid: &str, method: &str, data: &Value) {
        if let Some(room) = self.get(rid) {
            room.notify_to(uid, method, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use chorus_protocol::Envelope;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_peer(uid: &str) -> (Arc<Peer>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(Peer::new(uid, tx)), rx)
    }

    fn recv_notification(rx: &mut mpsc::Receiver<Message>) -> Option<(String, Value)> {
        match rx.try_recv().ok()? {
            Message::Text(text) => match serde_json::from_str(&text).ok()? {
                Envelope::Notification(n) => Some((n.method, n.data)),
                _ => None,
            },
            _ => None,
        }
    }

    #[test]
    fn add_peer_replaces_previous_session() {
        let room = Room::new("r1");
        let (first, _rx1) = test_peer("alice");
        let (second, _rx2) = test_peer("alice");
        room.add_peer(Arc::clone(&first));
        room.add_peer(Arc::clone(&second));
        assert_eq!(room.peer_count(), 1);
        assert!(first.is_closed());
        assert!(!second.is_closed());
    }

    #[test]
    fn notify_without_skips_sender() {
        let room = Room::new("r1");
        let (alice, mut alice_rx) = test_peer("alice");
        let (bob, mut bob_rx) = test_peer("bob");
        room.add_peer(alice);
        room.add_peer(bob);

        room.notify_without("alice", "peer_join", &json!({"rid": "r1", "uid": "alice"}));

        let (method, data) = recv_notification(&mut bob_rx).unwrap();
        assert_eq!(method, "peer_join");
        assert_eq!(data["uid"], "alice");
        assert!(recv_notification(&mut alice_rx).is_none());
    }

    #[test]
    fn notify_to_targets_single_peer() {
        let room = Room::new("r1");
        let (alice, mut alice_rx) = test_peer("alice");
        let (bob, mut bob_rx) = test_peer("bob");
        room.add_peer(alice);
        room.add_peer(bob);

        room.notify_to("bob", "stream_remove", &json!({"mid": "alice#a1b2c3"}));

        assert!(recv_notification(&mut bob_rx).is_some());
        assert!(recv_notification(&mut alice_rx).is_none());
    }

    #[test]
    fn join_then_leave_restores_empty_room() {
        let rooms = Rooms::new();
        let (alice, _rx) = test_peer("alice");
        rooms.get_or_create("r1").add_peer(alice);
        assert_eq!(rooms.get("r1").unwrap().peer_count(), 1);

        rooms.get("r1").unwrap().del_peer("alice");
        assert_eq!(rooms.get("r1").unwrap().peer_count(), 0);
        rooms.del_room("r1");
        assert!(rooms.get("r1").is_none());
    }

    #[test]
    fn room_close_closes_every_peer() {
        let room = Room::new("r1");
        let (alice, _rx1) = test_peer("alice");
        let (bob, _rx2) = test_peer("bob");
        room.add_peer(Arc::clone(&alice));
        room.add_peer(Arc::clone(&bob));
        room.close();
        assert!(alice.is_closed());
        assert!(bob.is_closed());
        assert_eq!(room.peer_count(), 0);
    }
}
