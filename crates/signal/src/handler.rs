use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use chorus_fabric::SERVICE_SFU;
use chorus_protocol::{ErrorCode, Request, Response, RpcError, method};

use crate::errors::invalid;
use crate::state::SignalService;
use crate::ws::Peer;

/// Dispatch one client request. Every request is answered exactly once.
pub async fn handle_request(
    service: &Arc<SignalService>,
    peer: &Arc<Peer>,
    request: Request,
) -> Response {
    let result = dispatch(service, peer, &request.method, &request.data).await;
    match result {
        Ok(data) => Response::accept(request.id, data),
        Err(err) => Response::reject(request.id, err),
    }
}

async fn dispatch(
    service: &Arc<SignalService>,
    peer: &Arc<Peer>,
    req_method: &str,
    data: &Value,
) -> Result<Value, RpcError> {
    match req_method {
        method::JOIN => join(service, peer, data).await,
        method::LEAVE => leave(service, peer, data).await,
        method::KEEPALIVE => keepalive(service, peer, data).await,
        method::PUBLISH => publish(service, peer, data).await,
        method::UNPUBLISH => unpublish(service, peer, data).await,
        method::SUBSCRIBE => subscribe(service, peer, data).await,
        method::UNSUBSCRIBE => unsubscribe(service, peer, data).await,
        method::BROADCAST => broadcast(service, peer, data).await,
        method::GET_USERS => getusers(service, peer, data).await,
        method::GET_PUBS => getpubs(service, peer, data).await,
        _ => Err(ErrorCode::Unknown.into()),
    }
}

fn required(data: &Value, key: &str) -> Result<(), RpcError> {
    match invalid(data, key) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn opt_str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/*
  "request":true "id":3764139 "method":"join"
  "data":{"rid":"room"}
*/
async fn join(
    service: &Arc<SignalService>,
    peer: &Arc<Peer>,
    data: &Value,
) -> Result<Value, RpcError> {
    required(data, "rid")?;
    let rid = str_field(data, "rid");
    let uid = peer.uid().to_string();
    info!(%rid, %uid, "join");

    let register = service
        .register_rpc()
        .ok_or(RpcError::from(ErrorCode::RegisterRpc))?;

    // The uid may already be in the room, here or on another signal node.
    if let Ok(resp) = register
        .sync_request(method::GET_SIGNAL_INFO, json!({"rid": rid, "uid": uid}))
        .await
    {
        let signalid = resp
            .get("signalid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !signalid.is_empty() && signalid != service.node().id {
            // Duplicate on another node: ask it to kick, best-effort.
            if let Some(rpc) = service.rpc_by_id(&signalid) {
                if let Err(e) = rpc
                    .sync_request(method::PEER_KICK, json!({"rid": rid, "uid": uid}))
                    .await
                {
                    warn!(%rid, %uid, %signalid, "peer_kick failed: {e}");
                }
            }
        } else if !signalid.is_empty() {
            // Duplicate on this node: reclaim it locally.
            let removed = service.remove_user_streams(&rid, &uid, "").await;
            service
                .send_notify_batch(&rid, &uid, method::STREAM_REMOVE, removed)
                .await;
            if let Err(e) = register
                .sync_request(method::PEER_LEAVE, json!({"rid": rid, "uid": uid}))
                .await
            {
                warn!(%rid, %uid, "peer_leave on rejoin failed: {e}");
            }
            service
                .send_notify(&rid, &uid, method::PEER_LEAVE, json!({"rid": rid, "uid": uid}))
                .await;
            if let Some(room) = service.rooms.get(&rid) {
                room.del_peer(&uid);
            }
        }
    }

    // Enter the room and record our node as the user's home.
    let room = service.rooms.get_or_create(&rid);
    room.add_peer(Arc::clone(peer));
    let joined = register
        .sync_request(
            method::PEER_JOIN,
            json!({"rid": rid, "uid": uid, "signalId": service.node().id}),
        )
        .await?;
    service
        .send_notify(&rid, &uid, method::PEER_JOIN, joined)
        .await;

    let users = service.find_room_users(&rid, &uid).await;
    let pubs = service.find_room_pubs(&rid, &uid).await;
    Ok(json!({"users": users, "pubs": pubs}))
}

/*
  "request":true "id":3764139 "method":"leave"
  "data":{"rid":"room"}
*/
async fn leave(
    service: &Arc<SignalService>,
    peer: &Arc<Peer>,
    data: &Value,
) -> Result<Value, RpcError> {
    required(data, "rid")?;
    let rid = str_field(data, "rid");
    let uid = peer.uid().to_string();
    info!(%rid, %uid, "leave");

    let register = service
        .register_rpc()
        .ok_or(RpcError::from(ErrorCode::RegisterRpc))?;

    let removed = service.remove_user_streams(&rid, &uid, "").await;
    service
        .send_notify_batch(&rid, &uid, method::STREAM_REMOVE, removed)
        .await;
    if let Err(e) = register
        .sync_request(method::PEER_LEAVE, json!({"rid": rid, "uid": uid}))
        .await
    {
        warn!(%rid, %uid, "peer_leave failed: {e}");
    }
    service
        .send_notify(&rid, &uid, method::PEER_LEAVE, json!({"rid": rid, "uid": uid}))
        .await;
    if let Some(room) = service.rooms.get(&rid) {
        room.del_peer(&uid);
    }
    Ok(json!({}))
}

/*
  "request":true "id":3764139 "method":"keepalive"
  "data":{"rid":"room"}
*/
async fn keepalive(
    service: &Arc<SignalService>,
    peer: &Arc<Peer>,
    data: &Value,
) -> Result<Value, RpcError> {
    required(data, "rid")?;
    let rid = str_field(data, "rid");
    let uid = peer.uid();

    if service
        .rooms
        .get(&rid)
        .and_then(|room| room.get_peer(uid))
        .is_none()
    {
        return Err(ErrorCode::Rid.into());
    }
    let register = service
        .register_rpc()
        .ok_or(RpcError::from(ErrorCode::RegisterRpc))?;
    register
        .sync_request(method::KEEPALIVE, json!({"rid": rid, "uid": uid}))
        .await?;
    Ok(json!({}))
}

/*
  "request":true "id":3764139 "method":"publish"
  "data":{
    "rid":"room",
    "jsep":{"type":"offer","sdp":"..."},
    "minfo":{"audio":true,"video":true,"audiotype":0,"videotype":0}
  }
*/
async fn publish(
    service: &Arc<SignalService>,
    peer: &Arc<Peer>,
    data: &Value,
) -> Result<Value, RpcError> {
    required(data, "rid")?;
    required(data, "jsep")?;
    required(data, "minfo")?;
    let rid = str_field(data, "rid");
    let uid = peer.uid().to_string();

    let (sfu, sfuid) = service
        .rpc_by_payload(SERVICE_SFU)
        .ok_or(RpcError::from(ErrorCode::Sfu))?;
    let published = sfu
        .sync_request(
            method::PUBLISH,
            json!({"rid": rid, "uid": uid, "jsep": data["jsep"]}),
        )
        .await?;
    let mid = str_field(&published, "mid");
    info!(%rid, %uid, %mid, %sfuid, "published");

    let register = service
        .register_rpc()
        .ok_or(RpcError::from(ErrorCode::RegisterRpc))?;
    let added = register
        .sync_request(
            method::STREAM_ADD,
            json!({
                "rid": rid,
                "uid": uid,
                "mid": mid,
                "sfuid": sfuid,
                "minfo": data["minfo"],
            }),
        )
        .await?;
    service
        .send_notify(&rid, &uid, method::STREAM_ADD, added)
        .await;

    Ok(json!({
        "mid": mid,
        "sfuid": sfuid,
        "jsep": published["jsep"],
    }))
}

/*
  "request":true "id":3764139 "method":"unpublish"
  "data":{"rid":"room","mid":"<uid>#ABCDEF","sfuid":"dc1-sfu-1" (optional)}
*/
async fn unpublish(
    service: &Arc<SignalService>,
    peer: &Arc<Peer>,
    data: &Value,
) -> Result<Value, RpcError> {
    required(data, "rid")?;
    required(data, "mid")?;
    let rid = str_field(data, "rid");
    let mid = str_field(data, "mid");
    let uid = peer.uid().to_string();
    let sfuid = opt_str_field(data, "sfuid");

    let sfu = service
        .sfu_rpc_for_mid(&rid, &mid, sfuid.as_deref())
        .await
        .ok_or(RpcError::from(ErrorCode::Sfu))?;
    sfu.sync_request(method::UNPUBLISH, json!({"rid": rid, "mid": mid}))
        .await?;

    let removed = service.remove_user_streams(&rid, &uid, &mid).await;
    service
        .send_notify_batch(&rid, &uid, method::STREAM_REMOVE, removed)
        .await;
    Ok(json!({}))
}

/*
  "request":true "id":3764139 "method":"subscribe"
  "data":{
    "rid":"room",
    "mid":"<uid>#ABCDEF",
    "jsep":{"type":"offer","sdp":"..."},
    "sfuid":"dc1-sfu-1" (optional)
  }
*/
async fn subscribe(
    service: &Arc<SignalService>,
    peer: &Arc<Peer>,
    data: &Value,
) -> Result<Value, RpcError> {
    required(data, "rid")?;
    required(data, "mid")?;
    required(data, "jsep")?;
    let rid = str_field(data, "rid");
    let mid = str_field(data, "mid");
    let suid = peer.uid().to_string();
    let sfuid = opt_str_field(data, "sfuid");

    let sfu = service
        .sfu_rpc_for_mid(&rid, &mid, sfuid.as_deref())
        .await
        .ok_or(RpcError::from(ErrorCode::Sfu))?;
    match sfu
        .sync_request(
            method::SUBSCRIBE,
            json!({"rid": rid, "mid": mid, "suid": suid, "jsep": data["jsep"]}),
        )
        .await
    {
        Ok(subscribed) => Ok(subscribed),
        Err(err) => {
            if err.code == 403 {
                // The stream is gone on the sfu; purge the index and tell
                // everyone in the room.
                let uid = chorus_protocol::keys::uid_from_mid(&mid).to_string();
                let removed = service.remove_user_streams(&rid, &uid, &mid).await;
                service
                    .send_notify_batch(&rid, "", method::STREAM_REMOVE, removed)
                    .await;
            }
            Err(err)
        }
    }
}

/*
  "request":true "id":3764139 "method":"unsubscribe"
  "data":{"rid":"room","mid":"<uid>#ABCDEF","sid":"<uid>#ABCDEF","sfuid":"dc1-sfu-1" (optional)}
*/
async fn unsubscribe(
    service: &Arc<SignalService>,
    _peer: &Arc<Peer>,
    data: &Value,
) -> Result<Value, RpcError> {
    required(data, "rid")?;
    required(data, "mid")?;
    required(data, "sid")?;
    let rid = str_field(data, "rid");
    let mid = str_field(data, "mid");
    let sid = str_field(data, "sid");
    let sfuid = opt_str_field(data, "sfuid");

    let sfu = service
        .sfu_rpc_for_mid(&rid, &mid, sfuid.as_deref())
        .await
        .ok_or(RpcError::from(ErrorCode::Sfu))?;
    sfu.sync_request(
        method::UNSUBSCRIBE,
        json!({"rid": rid, "mid": mid, "sid": sid}),
    )
    .await?;
    Ok(json!({}))
}

/*
  "request":true "id":3764139 "method":"broadcast"
  "data":{"rid":"room","data":...}
*/
async fn broadcast(
    service: &Arc<SignalService>,
    peer: &Arc<Peer>,
    data: &Value,
) -> Result<Value, RpcError> {
    required(data, "rid")?;
    let rid = str_field(data, "rid");
    let uid = peer.uid().to_string();
    service
        .send_notify(
            &rid,
            &uid,
            method::BROADCAST,
            json!({"rid": rid, "uid": uid, "data": data.get("data").cloned().unwrap_or(Value::Null)}),
        )
        .await;
    Ok(json!({}))
}

/*
  "request":true "id":3764139 "method":"getusers"
  "data":{"rid":"room"}
*/
async fn getusers(
    service: &Arc<SignalService>,
    peer: &Arc<Peer>,
    data: &Value,
) -> Result<Value, RpcError> {
    required(data, "rid")?;
    let rid = str_field(data, "rid");
    let users = service.find_room_users(&rid, peer.uid()).await;
    Ok(json!({"users": users}))
}

/*
  "request":true "id":3764139 "method":"getpubs"
  "data":{"rid":"room"}
*/
async fn getpubs(
    service: &Arc<SignalService>,
    peer: &Arc<Peer>,
    data: &Value,
) -> Result<Value, RpcError> {
    required(data, "rid")?;
    let rid = str_field(data, "rid");
    let pubs = service.find_room_pubs(&rid, peer.uid()).await;
    Ok(json!({"pubs": pubs}))
}
