use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use chorus_protocol::{RpcError, method};

use crate::state::SignalService;

/// Room sweep interval.
const SWEEP_CYCLE: Duration = Duration::from_secs(10);

/// Signal-to-signal RPC surface; today that is only `peer_kick`.
pub async fn handle_rpc(
    service: &Arc<SignalService>,
    req_method: &str,
    data: Value,
) -> Result<Value, RpcError> {
    match req_method {
        method::PEER_KICK => peer_kick(service, data).await,
        _ => Err(RpcError::unknown_method(req_method)),
    }
}

/// Another signal node won a duplicate join for this uid: tear down the
/// local session, clean the index, and tell everyone. Idempotent against a
/// peer that is already gone.
async fn peer_kick(service: &Arc<SignalService>, data: Value) -> Result<Value, RpcError> {
    let rid = data
        .get("rid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let uid = data
        .get("uid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    info!(%rid, %uid, "peer_kick");

    let register = service
        .register_rpc()
        .ok_or_else(|| RpcError::new(-1, "cannot get available register rpc node"))?;

    let removed = service.remove_user_streams(&rid, &uid, "").await;
    service
        .send_notify_batch(&rid, &uid, method::STREAM_REMOVE, removed)
        .await;
    if let Err(e) = register
        .sync_request(method::PEER_LEAVE, json!({"rid": rid, "uid": uid}))
        .await
    {
        warn!(%rid, %uid, "peer_leave on kick failed: {e}");
    }
    service
        .send_notify(&rid, &uid, method::PEER_LEAVE, json!({"rid": rid, "uid": uid}))
        .await;

    // Tell the kicked client why it is going away, then drop it.
    service
        .rooms
        .notify_to(&rid, &uid, method::PEER_KICK, &json!({"rid": rid, "uid": uid}));
    if let Some(room) = service.rooms.get(&rid) {
        room.del_peer(&uid);
    }
    Ok(json!({}))
}

/// Events arriving from peer signal nodes and from sfu nodes.
pub async fn handle_broadcast(service: &Arc<SignalService>, event_method: &str, data: Value) {
    debug!(method = %event_method, "bus event");
    let rid = data
        .get("rid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let uid = data
        .get("uid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match event_method {
        method::PEER_JOIN
        | method::PEER_LEAVE
        | method::STREAM_ADD
        | method::STREAM_REMOVE
        | method::BROADCAST => {
            service
                .rooms
                .notify_without(&rid, &uid, event_method, &data);
        }
        method::SFU_STREAM_REMOVE => {
            let mid = data
                .get("mid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            sfu_stream_remove(service, &rid, &uid, &mid).await;
        }
        _ => debug!(method = %event_method, "unhandled bus event"),
    }
}

/// An sfu reaped a router (publisher died or went silent). Treat it like an
/// unpublish: purge the index and notify the local clients.
async fn sfu_stream_remove(service: &Arc<SignalService>, rid: &str, uid: &str, mid: &str) {
    info!(%rid, %uid, %mid, "sfu removed stream");
    let removed = service.remove_user_streams(rid, uid, mid).await;
    for msg in removed {
        service
            .rooms
            .notify_without(rid, uid, method::STREAM_REMOVE, &msg);
    }
}

/// Periodically drop users whose registration expired or whose signal node
/// is gone, then collect empty rooms.
pub fn start_room_sweeper(service: &Arc<SignalService>) {
    let service = Arc::clone(service);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_CYCLE);
        loop {
            tick.tick().await;
            sweep_rooms(&service).await;
        }
    });
}

async fn sweep_rooms(service: &Arc<SignalService>) {
    for room in service.rooms.snapshot() {
        let rid = room.id().to_string();
        for uid in room.uids() {
            if service.user_online(&rid, &uid).await {
                continue;
            }
            info!(%rid, %uid, "sweeping stale peer");
            let Some(register) = service.register_rpc() else {
                continue;
            };
            let removed = service.remove_user_streams(&rid, &uid, "").await;
            for msg in removed {
                room.notify_to(&uid, method::STREAM_REMOVE, &msg);
            }
            if let Err(e) = register
                .sync_request(method::PEER_LEAVE, json!({"rid": rid, "uid": uid}))
                .await
            {
                warn!(%rid, %uid, "peer_leave on sweep failed: {e}");
            }
            room.notify_to(&uid, method::PEER_LEAVE, &json!({"rid": rid, "uid": uid}));
            room.del_peer(&uid);
        }
        if room.peer_count() == 0 {
            debug!(%rid, "no peers left, dropping room");
            service.rooms.del_room(&rid);
        }
    }
}
