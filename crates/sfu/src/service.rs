use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info};

use chorus_fabric::{Broadcaster, ServiceNode};
use chorus_protocol::{Jsep, RpcError, SfuPublished, SfuSubscribed, keys, method};

use crate::rtc::RouterTable;

/// How often this node's load is recomputed and re-published.
const PAYLOAD_CYCLE: Duration = Duration::from_secs(10);

/// RPC surface of the sfu: publish, unpublish, subscribe, unsubscribe.
pub struct SfuService {
    table: Arc<RouterTable>,
}

impl SfuService {
    pub fn new(table: Arc<RouterTable>) -> Self {
        Self { table }
    }

    pub async fn handle(&self, method: &str, data: Value) -> Result<Value, RpcError> {
        debug!(%method, "sfu rpc");
        match method {
            method::PUBLISH => self.publish(data).await,
            method::UNPUBLISH => self.unpublish(data).await,
            method::SUBSCRIBE => self.subscribe(data).await,
            method::UNSUBSCRIBE => self.unsubscribe(data).await,
            _ => Err(RpcError::unknown_method(method)),
        }
    }

    async fn publish(&self, data: Value) -> Result<Value, RpcError> {
        let sdp = jsep_sdp(&data)?;
        let rid = str_field(&data, "rid");
        let uid = str_field(&data, "uid");
        let mid = keys::new_mid(&uid);
        let key = keys::media_pub_key(&rid, &uid, &mid);

        let router = self.table.get_or_create(&key);
        match router
            .add_pub(
                self.table.engine(),
                &mid,
                &sdp,
                self.table.capture().open,
            )
            .await
        {
            Ok(answer) => encode(SfuPublished {
                mid,
                jsep: Jsep::answer(answer),
            }),
            Err(e) => {
                self.table.delete(&key).await;
                Err(RpcError::new(403, format!("add pub err, err is: {e:#}")))
            }
        }
    }

    async fn unpublish(&self, data: Value) -> Result<Value, RpcError> {
        let rid = str_field(&data, "rid");
        let mid = str_field(&data, "mid");
        let uid = keys::uid_from_mid(&mid).to_string();
        let key = keys::media_pub_key(&rid, &uid, &mid);
        self.table.delete(&key).await;
        Ok(json!({}))
    }

    async fn subscribe(&self, data: Value) -> Result<Value, RpcError> {
        let sdp = jsep_sdp(&data)?;
        let rid = str_field(&data, "rid");
        let mid = str_field(&data, "mid");
        let suid = str_field(&data, "suid");
        let uid = keys::uid_from_mid(&mid).to_string();
        let sid = keys::new_sid(&suid);
        let key = keys::media_pub_key(&rid, &uid, &mid);

        // Absence means the stream does not exist here; never create one.
        let router = self
            .table
            .get(&key)
            .ok_or_else(|| RpcError::new(403, format!("cannot get router: {key}")))?;
        match router.add_sub(self.table.engine(), &sid, &sdp).await {
            Ok(answer) => encode(SfuSubscribed {
                sid,
                jsep: Jsep::answer(answer),
            }),
            Err(e) => Err(RpcError::new(403, format!("add sub error: {e:#}"))),
        }
    }

    async fn unsubscribe(&self, data: Value) -> Result<Value, RpcError> {
        let rid = str_field(&data, "rid");
        let mid = str_field(&data, "mid");
        let sid = str_field(&data, "sid");
        let uid = keys::uid_from_mid(&mid).to_string();
        let key = keys::media_pub_key(&rid, &uid, &mid);
        let router = self
            .table
            .get(&key)
            .ok_or_else(|| RpcError::new(410, format!("cannot get router: {key}")))?;
        router.del_sub(&sid).await;
        Ok(json!({}))
    }
}

fn jsep_sdp(data: &Value) -> Result<String, RpcError> {
    let jsep = data
        .get("jsep")
        .filter(|j| !j.is_null())
        .ok_or_else(|| RpcError::new(401, "cannot find jsep"))?;
    if !jsep.is_object() {
        return Err(RpcError::new(402, "jsep is not an object"));
    }
    Ok(jsep
        .get("sdp")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn encode<T: serde::Serialize>(reply: T) -> Result<Value, RpcError> {
    serde_json::to_value(reply).map_err(|e| RpcError::new(500, format!("encode reply: {e}")))
}

/// Drain the clean channel: every reaped router key becomes a
/// `sfu_stream_remove` broadcast that the signal nodes translate for their
/// clients.
pub fn start_clean_notifier(mut clean_rx: mpsc::Receiver<String>, caster: Broadcaster) {
    tokio::spawn(async move {
        while let Some(key) = clean_rx.recv().await {
            let Some((rid, uid, mid)) = keys::parse_media_key(&key) else {
                continue;
            };
            info!(%rid, %uid, %mid, "notifying stream removal");
            caster
                .say(
                    method::SFU_STREAM_REMOVE,
                    json!({"rid": rid, "uid": uid, "mid": mid}),
                )
                .await;
        }
    });
}

/// Re-publish this node's load metric every 10 s.
pub fn start_payload_reporter(table: Arc<RouterTable>, node: Arc<ServiceNode>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(PAYLOAD_CYCLE);
        loop {
            tick.tick().await;
            node.update_payload(table.payload()).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_jsep_is_code_401() {
        let err = jsep_sdp(&json!({"rid": "r1"})).unwrap_err();
        assert_eq!(err.code, 401);
        let err = jsep_sdp(&json!({"rid": "r1", "jsep": null})).unwrap_err();
        assert_eq!(err.code, 401);
    }

    #[test]
    fn non_object_jsep_is_code_402() {
        let err = jsep_sdp(&json!({"jsep": "v=0"})).unwrap_err();
        assert_eq!(err.code, 402);
    }

    #[test]
    fn jsep_sdp_extracts_sdp() {
        let sdp = jsep_sdp(&json!({"jsep": {"type": "offer", "sdp": "v=0\r\n"}})).unwrap();
        assert_eq!(sdp, "v=0\r\n");
    }

    #[test]
    fn absent_fields_default_to_empty() {
        assert_eq!(str_field(&json!({}), "rid"), "");
        assert_eq!(str_field(&json!({"rid": 7}), "rid"), "");
    }
}
