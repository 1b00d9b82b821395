use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::RpcError;

/// Wire method names, shared by the WebSocket API, the inter-service RPC
/// subjects, and the broadcast topics.
pub mod method {
    // client -> signal
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const KEEPALIVE: &str = "keepalive";
    pub const PUBLISH: &str = "publish";
    pub const UNPUBLISH: &str = "unpublish";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const BROADCAST: &str = "broadcast";
    pub const GET_USERS: &str = "getusers";
    pub const GET_PUBS: &str = "getpubs";

    // signal -> client notifications, also reused signal -> signal
    pub const PEER_JOIN: &str = "peer_join";
    pub const PEER_LEAVE: &str = "peer_leave";
    pub const STREAM_ADD: &str = "stream_add";
    pub const STREAM_REMOVE: &str = "stream_remove";
    pub const PEER_KICK: &str = "peer_kick";

    // sfu -> signal
    pub const SFU_STREAM_REMOVE: &str = "sfu_stream_remove";

    // signal -> register (peer_join/peer_leave/keepalive/stream_add/
    // stream_remove reuse the names above)
    pub const GET_SIGNAL_INFO: &str = "getSignalInfo";
    pub const GET_SFU_INFO: &str = "getSfuInfo";
    pub const GET_ROOM_USERS: &str = "getRoomUsers";
    pub const GET_ROOM_PUBS: &str = "getRoomPubs";
}

/// Marker that serializes as the literal `true`.
///
/// The client envelope tags its three shapes with `"request":true`,
/// `"response":true` and `"notification":true`; deserializing `false` into a
/// marker fails so the untagged enum below picks the right variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Marker;

impl Serialize for Marker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for Marker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if bool::deserialize(deserializer)? {
            Ok(Marker)
        } else {
            Err(D::Error::custom("envelope marker must be true"))
        }
    }
}

/// One client WebSocket frame: a request, a response, or a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request: Marker,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub response: Marker,
    pub ok: bool,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub notification: Marker,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    pub fn accept(id: u64, data: Value) -> Self {
        Self {
            response: Marker,
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn reject(id: u64, error: RpcError) -> Self {
        Self {
            response: Marker,
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

impl Notification {
    pub fn new(method: &str, data: Value) -> Self {
        Self {
            notification: Marker,
            method: method.to_string(),
            data,
        }
    }
}

/// An SDP offer or answer as exchanged over signaling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl Jsep {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// Publisher media descriptor, stored in the directory next to the pub key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaInfo {
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub video: bool,
    #[serde(default)]
    pub audiotype: i32,
    #[serde(default)]
    pub videotype: i32,
}

// ---------------------------------------------------------------------------
// signal -> register documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerJoin {
    pub rid: String,
    pub uid: String,
    #[serde(rename = "signalId")]
    pub signal_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLeave {
    pub rid: String,
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAlive {
    pub rid: String,
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAdd {
    pub rid: String,
    pub uid: String,
    pub mid: String,
    pub sfuid: String,
    pub minfo: MediaInfo,
}

/// `mid` empty means "remove every publication of this user".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRemove {
    pub rid: String,
    pub uid: String,
    #[serde(default)]
    pub mid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSignalInfo {
    pub rid: String,
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSfuInfo {
    pub rid: String,
    pub mid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRoomUsers {
    pub rid: String,
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRoomPubs {
    pub rid: String,
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalInfo {
    pub rid: String,
    pub uid: String,
    pub signalid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuInfo {
    pub rid: String,
    pub sfuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomUser {
    pub rid: String,
    pub uid: String,
    pub signalid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomUsers {
    pub users: Vec<RoomUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomPub {
    pub rid: String,
    pub uid: String,
    pub mid: String,
    pub sfuid: String,
    pub minfo: MediaInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomPubs {
    pub pubs: Vec<RoomPub>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemovedPub {
    pub rid: String,
    pub uid: String,
    pub mid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemovedPubs {
    #[serde(rename = "rmPubs")]
    pub rm_pubs: Vec<RemovedPub>,
}

// ---------------------------------------------------------------------------
// signal -> sfu documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuPublish {
    pub rid: String,
    pub uid: String,
    pub jsep: Jsep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuPublished {
    pub mid: String,
    pub jsep: Jsep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuUnpublish {
    pub rid: String,
    pub mid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuSubscribe {
    pub rid: String,
    pub mid: String,
    pub suid: String,
    pub jsep: Jsep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuSubscribed {
    pub sid: String,
    pub jsep: Jsep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuUnsubscribe {
    pub rid: String,
    pub mid: String,
    pub sid: String,
}

// ---------------------------------------------------------------------------
// signal <-> signal and broadcast documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerKick {
    pub rid: String,
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerJoinEvent {
    pub rid: String,
    pub uid: String,
    pub signalid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLeaveEvent {
    pub rid: String,
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAddEvent {
    pub rid: String,
    pub uid: String,
    pub mid: String,
    pub sfuid: String,
    pub minfo: MediaInfo,
}

/// Also the shape published by sfu nodes as `sfu_stream_remove`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRemoveEvent {
    pub rid: String,
    pub uid: String,
    pub mid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub rid: String,
    pub uid: String,
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_envelope_roundtrip() {
        let json = r#"{"request":true,"id":3764139,"method":"join","data":{"rid":"room"}}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        match env {
            Envelope::Request(req) => {
                assert_eq!(req.id, 3764139);
                assert_eq!(req.method, "join");
                assert_eq!(req.data["rid"], "room");
            }
            _ => panic!("Expected Request"),
        }
    }

    #[test]
    fn response_accept_shape() {
        let resp = Response::accept(7, json!({"users": []}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""response":true"#));
        assert!(json.contains(r#""ok":true"#));
        assert!(!json.contains("error"));
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, Envelope::Response(_)));
    }

    #[test]
    fn response_reject_carries_code_and_reason() {
        let resp = Response::reject(9, RpcError::new(2, "rid not found"));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""ok":false"#));
        assert!(json.contains(r#""code":2"#));
        assert!(json.contains("rid not found"));
    }

    #[test]
    fn notification_envelope_shape() {
        let n = Notification::new(method::STREAM_ADD, json!({"rid": "r1", "mid": "u1#abc123"}));
        let json = serde_json::to_string(&n).unwrap();
        assert!(json.contains(r#""notification":true"#));
        assert!(json.contains(r#""method":"stream_add""#));
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, Envelope::Notification(_)));
    }

    #[test]
    fn marker_rejects_false() {
        let json = r#"{"request":false,"id":1,"method":"join","data":{}}"#;
        assert!(serde_json::from_str::<Request>(json).is_err());
    }

    #[test]
    fn jsep_uses_type_key() {
        let jsep = Jsep::answer("v=0\r\n");
        let json = serde_json::to_string(&jsep).unwrap();
        assert!(json.contains(r#""type":"answer""#));
        let parsed: Jsep = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, jsep);
    }

    #[test]
    fn peer_join_uses_camel_case_signal_id() {
        let doc = PeerJoin {
            rid: "r1".into(),
            uid: "alice".into(),
            signal_id: "signal-1".into(),
        };
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains(r#""signalId":"signal-1""#));
    }

    #[test]
    fn removed_pubs_renames_to_rm_pubs() {
        let doc = RemovedPubs {
            rm_pubs: vec![RemovedPub {
                rid: "r1".into(),
                uid: "alice".into(),
                mid: "alice#a1b2c3".into(),
            }],
        };
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains(r#""rmPubs""#));
        let parsed: RemovedPubs = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.rm_pubs.len(), 1);
        assert_eq!(parsed.rm_pubs[0].mid, "alice#a1b2c3");
    }

    #[test]
    fn stream_remove_mid_defaults_to_empty() {
        let doc: StreamRemove = serde_json::from_str(r#"{"rid":"r1","uid":"alice"}"#).unwrap();
        assert!(doc.mid.is_empty());
    }

    #[test]
    fn media_info_from_client_payload() {
        let minfo: MediaInfo =
            serde_json::from_str(r#"{"audio":true,"video":true,"audiotype":0,"videotype":0}"#)
                .unwrap();
        assert!(minfo.audio);
        assert!(minfo.video);
    }
}
