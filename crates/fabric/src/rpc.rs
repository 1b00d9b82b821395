use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_nats::Client;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use chorus_protocol::RpcError;

/// Default deadline for request/reply calls.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RpcReply {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl RpcReply {
    fn accept(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn reject(error: RpcError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

/// One broadcast message on a node's event topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

pub type RpcHandler =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

pub type EventHandler = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Request/reply and broadcast messaging over NATS.
///
/// Requests are at-most-once: a lost request or reply surfaces as a timeout
/// at the caller. Broadcasts are best-effort, FIFO per publisher and topic.
#[derive(Clone)]
pub struct Bus {
    client: Client,
}

impl Bus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("NATS connect to {url} failed"))?;
        Ok(Self { client })
    }

    /// Serve RPC requests on a subject. Every request is answered exactly
    /// once: accepted with the handler's value or rejected with its error; a
    /// panicking handler rejects with code 500 and is logged.
    pub async fn serve(&self, subject: &str, handler: RpcHandler) -> Result<RpcServer> {
        let mut sub = self.client.subscribe(subject.to_string()).await?;
        let client = self.client.clone();
        let subject = subject.to_string();
        let task = tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let client = client.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handle_request(client, handler, msg).await;
                });
            }
            debug!(%subject, "rpc subscription closed");
        });
        Ok(RpcServer { task })
    }

    /// Requestor for a peer's `rpc-<nodeId>` subject.
    pub fn requestor(&self, subject: &str) -> Requestor {
        Requestor {
            client: self.client.clone(),
            subject: subject.to_string(),
        }
    }

    /// Broadcaster for this node's `event-<nodeId>` topic.
    pub fn broadcaster(&self, topic: &str) -> Broadcaster {
        Broadcaster {
            client: self.client.clone(),
            topic: topic.to_string(),
        }
    }

    /// Subscribe to a peer's event topic. The subscription ends when the
    /// returned guard is dropped.
    pub async fn subscribe_events(
        &self,
        topic: &str,
        handler: EventHandler,
    ) -> Result<EventSubscription> {
        let mut sub = self.client.subscribe(topic.to_string()).await?;
        let topic = topic.to_string();
        let task = tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                match serde_json::from_slice::<BusEvent>(&msg.payload) {
                    Ok(event) => handler(event.method, event.data).await,
                    Err(e) => warn!(%topic, "invalid bus event: {e}"),
                }
            }
        });
        Ok(EventSubscription { task })
    }
}

async fn handle_request(client: Client, handler: RpcHandler, msg: async_nats::Message) {
    let Some(reply_to) = msg.reply else {
        warn!(subject = %msg.subject, "rpc request without reply subject dropped");
        return;
    };
    let reply = match serde_json::from_slice::<RpcRequest>(&msg.payload) {
        Ok(req) => {
            let fut = handler(req.method.clone(), req.data);
            match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(data)) => RpcReply::accept(data),
                Ok(Err(err)) => RpcReply::reject(err),
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(method = %req.method, %reason, "rpc handler panicked");
                    RpcReply::reject(RpcError::new(500, "internal error"))
                }
            }
        }
        Err(e) => RpcReply::reject(RpcError::new(400, format!("malformed request: {e}"))),
    };
    let payload = match serde_json::to_vec(&reply) {
        Ok(p) => p,
        Err(e) => {
            error!("failed to encode rpc reply: {e}");
            return;
        }
    };
    if let Err(e) = client.publish(reply_to, payload.into()).await {
        warn!("failed to publish rpc reply: {e}");
    }
}

/// Handle to a running RPC server; aborting it stops serving.
pub struct RpcServer {
    task: JoinHandle<()>,
}

impl RpcServer {
    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Client half of request/reply, bound to one peer subject.
#[derive(Clone)]
pub struct Requestor {
    client: Client,
    subject: String,
}

impl Requestor {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Request with the default 5 s deadline.
    pub async fn sync_request(&self, method: &str, data: Value) -> Result<Value, RpcError> {
        self.sync_request_timeout(method, data, RPC_TIMEOUT).await
    }

    pub async fn sync_request_timeout(
        &self,
        method: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let req = RpcRequest {
            method: method.to_string(),
            data,
        };
        let payload =
            serde_json::to_vec(&req).map_err(|e| RpcError::new(500, format!("encode: {e}")))?;
        let msg = tokio::time::timeout(
            timeout,
            self.client.request(self.subject.clone(), payload.into()),
        )
        .await
        .map_err(|_| RpcError::new(408, format!("request [{method}] timed out")))?
        .map_err(|e| RpcError::new(502, format!("request [{method}] failed: {e}")))?;

        let reply: RpcReply = serde_json::from_slice(&msg.payload)
            .map_err(|e| RpcError::new(500, format!("malformed reply: {e}")))?;
        if reply.ok {
            Ok(reply.data.unwrap_or(Value::Null))
        } else {
            Err(reply
                .error
                .unwrap_or_else(|| RpcError::new(500, "rejected without error body")))
        }
    }
}

/// Publisher half of the broadcast topic.
#[derive(Clone)]
pub struct Broadcaster {
    client: Client,
    topic: String,
}

impl Broadcaster {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn say(&self, method: &str, data: Value) {
        let event = BusEvent {
            method: method.to_string(),
            data,
        };
        let payload = match serde_json::to_vec(&event) {
            Ok(p) => p,
            Err(e) => {
                error!("failed to encode bus event: {e}");
                return;
            }
        };
        if let Err(e) = self.client.publish(self.topic.clone(), payload.into()).await {
            warn!(topic = %self.topic, method, "broadcast failed: {e}");
        }
    }
}

/// Guard for a live event subscription; dropping it unsubscribes.
pub struct EventSubscription {
    task: JoinHandle<()>,
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rpc_request_shape() {
        let req = RpcRequest {
            method: "publish".into(),
            data: json!({"rid": "r1"}),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""method":"publish""#));
        let parsed: RpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.data["rid"], "r1");
    }

    #[test]
    fn rpc_request_data_defaults_to_null() {
        let parsed: RpcRequest = serde_json::from_str(r#"{"method":"leave"}"#).unwrap();
        assert!(parsed.data.is_null());
    }

    #[test]
    fn accept_and_reject_are_exclusive() {
        let accept = RpcReply::accept(json!({"mid": "u#abc123"}));
        assert!(accept.ok && accept.error.is_none());

        let reject = RpcReply::reject(RpcError::new(403, "cannot get router"));
        assert!(!reject.ok && reject.data.is_none());
        let json = serde_json::to_string(&reject).unwrap();
        assert!(json.contains(r#""code":403"#));
    }

    #[test]
    fn bus_event_roundtrip() {
        let event = BusEvent {
            method: "sfu_stream_remove".into(),
            data: json!({"rid": "r1", "uid": "alice", "mid": "alice#a1b2c3"}),
        };
        let bytes = serde_json::to_vec(&event).unwrap();
        let parsed: BusEvent = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.method, "sfu_stream_remove");
        assert_eq!(parsed.data["mid"], "alice#a1b2c3");
    }
}
