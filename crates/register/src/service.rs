use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use chorus_fabric::Directory;
use chorus_protocol::{
    GetRoomPubs, GetRoomUsers, GetSfuInfo, GetSignalInfo, KeepAlive, MediaInfo, PeerJoin,
    PeerJoinEvent, PeerLeave, RemovedPub, RemovedPubs, RoomPub, RoomPubs, RoomUser, RoomUsers,
    RpcError, SfuInfo, SignalInfo, StreamAdd, StreamAddEvent, StreamRemove, keys, method,
};

/// TTL of `/node/...` presence entries; extended by client keepalives.
const NODE_TTL: Duration = Duration::from_secs(60);
/// TTL of `/media/...` and `/pub/...` stream entries.
const STREAM_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// The session index. Owns no mutable in-process state: every method is a
/// pure function over the directory, so any register node can serve any
/// request.
pub struct Register {
    dir: Directory,
}

impl Register {
    pub fn new(dir: Directory) -> Self {
        Self { dir }
    }

    pub async fn handle(&self, method: &str, data: Value) -> Result<Value, RpcError> {
        debug!(%method, "register rpc");
        match method {
            method::PEER_JOIN => encode(self.peer_join(parse(data)?).await?),
            method::PEER_LEAVE => encode(self.peer_leave(parse(data)?).await?),
            method::KEEPALIVE => encode(self.keepalive(parse(data)?).await?),
            method::STREAM_ADD => encode(self.stream_add(parse(data)?).await?),
            method::STREAM_REMOVE => encode(self.stream_remove(parse(data)?).await?),
            method::GET_SIGNAL_INFO => encode(self.get_signal_info(parse(data)?).await?),
            method::GET_SFU_INFO => encode(self.get_sfu_info(parse(data)?).await?),
            method::GET_ROOM_USERS => encode(self.get_room_users(parse(data)?).await?),
            method::GET_ROOM_PUBS => encode(self.get_room_pubs(parse(data)?).await?),
            _ => Err(RpcError::unknown_method(method)),
        }
    }

    async fn peer_join(&self, req: PeerJoin) -> Result<PeerJoinEvent, RpcError> {
        let key = keys::user_node_key(&req.rid, &req.uid);
        self.dir
            .put_with_ttl(&key, &req.signal_id, NODE_TTL)
            .await
            .map_err(|e| RpcError::new(401, format!("client join err is {e}")))?;
        Ok(PeerJoinEvent {
            rid: req.rid,
            uid: req.uid,
            signalid: req.signal_id,
        })
    }

    async fn peer_leave(&self, req: PeerLeave) -> Result<PeerLeave, RpcError> {
        let key = keys::user_node_key(&req.rid, &req.uid);
        if let Ok(Some(_)) = self.dir.get(&key).await
            && let Err(e) = self.dir.delete(&key, false).await
        {
            warn!(%key, "peer_leave delete failed: {e}");
        }
        Ok(req)
    }

    async fn keepalive(&self, req: KeepAlive) -> Result<KeepAlive, RpcError> {
        let key = keys::user_node_key(&req.rid, &req.uid);
        self.dir
            .refresh(&key, NODE_TTL)
            .await
            .map_err(|e| RpcError::new(402, format!("keep alive err is {e}")))?;
        Ok(req)
    }

    async fn stream_add(&self, req: StreamAdd) -> Result<StreamAddEvent, RpcError> {
        let minfo = serde_json::to_string(&req.minfo)
            .map_err(|e| RpcError::new(405, format!("streamAdd err, err is {e}")))?;
        let media_key = keys::media_info_key(&req.rid, &req.uid, &req.mid);
        self.dir
            .put_with_ttl(&media_key, &minfo, STREAM_TTL)
            .await
            .map_err(|e| RpcError::new(405, format!("streamAdd err, err is {e}")))?;

        let pub_key = keys::media_pub_key(&req.rid, &req.uid, &req.mid);
        self.dir
            .put_with_ttl(&pub_key, &req.sfuid, STREAM_TTL)
            .await
            .map_err(|e| RpcError::new(406, format!("streamAdd err, err is {e}")))?;

        Ok(StreamAddEvent {
            rid: req.rid,
            uid: req.uid,
            mid: req.mid,
            sfuid: req.sfuid,
            minfo: req.minfo,
        })
    }

    /// Remove one publication, or every publication of the user when `mid`
    /// is empty. The reply enumerates each removed mid so the signal can
    /// broadcast the removals; a repeat call finds nothing and returns an
    /// empty list.
    async fn stream_remove(&self, req: StreamRemove) -> Result<RemovedPubs, RpcError> {
        let mut removed = RemovedPubs::default();
        if req.mid.is_empty() {
            let media_prefix = keys::media_info_prefix(&req.rid, &req.uid);
            if let Err(e) = self.dir.delete(&media_prefix, true).await {
                warn!(prefix = %media_prefix, "stream_remove media delete failed: {e}");
            }
            let pub_prefix = keys::media_pub_prefix(&req.rid, &req.uid);
            let entries = self
                .dir
                .get_by_prefix(&pub_prefix)
                .await
                .map_err(|e| RpcError::new(407, format!("streamRemove err, err is {e}")))?;
            for (key, _) in entries {
                let Some((rid, uid, mid)) = keys::parse_media_key(&key) else {
                    continue;
                };
                if let Err(e) = self.dir.delete(&key, false).await {
                    warn!(%key, "stream_remove pub delete failed: {e}");
                }
                removed.rm_pubs.push(RemovedPub { rid, uid, mid });
            }
        } else {
            let media_key = keys::media_info_key(&req.rid, &req.uid, &req.mid);
            if let Err(e) = self.dir.delete(&media_key, false).await {
                warn!(key = %media_key, "stream_remove media delete failed: {e}");
            }
            let pub_key = keys::media_pub_key(&req.rid, &req.uid, &req.mid);
            if let Err(e) = self.dir.delete(&pub_key, false).await {
                warn!(key = %pub_key, "stream_remove pub delete failed: {e}");
            }
            removed.rm_pubs.push(RemovedPub {
                rid: req.rid,
                uid: req.uid,
                mid: req.mid,
            });
        }
        Ok(removed)
    }

    async fn get_signal_info(&self, req: GetSignalInfo) -> Result<SignalInfo, RpcError> {
        let key = keys::user_node_key(&req.rid, &req.uid);
        match self.dir.get(&key).await {
            Ok(Some(signalid)) => Ok(SignalInfo {
                rid: req.rid,
                uid: req.uid,
                signalid,
            }),
            _ => Err(RpcError::new(
                410,
                format!("cannot find signal node by key: {key}"),
            )),
        }
    }

    async fn get_sfu_info(&self, req: GetSfuInfo) -> Result<SfuInfo, RpcError> {
        let uid = keys::uid_from_mid(&req.mid);
        let key = keys::media_pub_key(&req.rid, uid, &req.mid);
        match self.dir.get(&key).await {
            Ok(Some(sfuid)) => Ok(SfuInfo {
                rid: req.rid,
                sfuid,
            }),
            _ => Err(RpcError::new(
                410,
                format!("cannot find sfu node by key: {key}"),
            )),
        }
    }

    async fn get_room_users(&self, req: GetRoomUsers) -> Result<RoomUsers, RpcError> {
        let prefix = keys::room_node_prefix(&req.rid);
        let entries = self
            .dir
            .get_by_prefix(&prefix)
            .await
            .map_err(|e| RpcError::new(410, format!("getRoomUsers err, err is {e}")))?;
        let mut users = RoomUsers::default();
        for (key, signalid) in entries {
            let Some((rid, uid)) = keys::parse_user_node_key(&key) else {
                continue;
            };
            if uid == req.uid {
                continue;
            }
            users.users.push(RoomUser { rid, uid, signalid });
        }
        Ok(users)
    }

    async fn get_room_pubs(&self, req: GetRoomPubs) -> Result<RoomPubs, RpcError> {
        let prefix = keys::room_pub_prefix(&req.rid);
        let entries = self
            .dir
            .get_by_prefix(&prefix)
            .await
            .map_err(|e| RpcError::new(410, format!("getRoomPubs err, err is {e}")))?;
        let mut pubs = RoomPubs::default();
        for (key, sfuid) in entries {
            let Some((rid, uid, mid)) = keys::parse_media_key(&key) else {
                continue;
            };
            if uid == req.uid {
                continue;
            }
            let minfo = match self
                .dir
                .get(&keys::media_info_key(&rid, &uid, &mid))
                .await
            {
                Ok(Some(raw)) => serde_json::from_str::<MediaInfo>(&raw).unwrap_or_default(),
                _ => MediaInfo::default(),
            };
            pubs.pubs.push(RoomPub {
                rid,
                uid,
                mid,
                sfuid,
                minfo,
            });
        }
        Ok(pubs)
    }
}

fn parse<T: DeserializeOwned>(data: Value) -> Result<T, RpcError> {
    serde_json::from_value(data).map_err(|e| RpcError::new(400, format!("invalid request: {e}")))
}

fn encode<T: serde::Serialize>(reply: T) -> Result<Value, RpcError> {
    serde_json::to_value(reply).map_err(|e| RpcError::new(500, format!("encode reply: {e}")))
}
