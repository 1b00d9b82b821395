use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, Instant, interval};
use tracing::{debug, info, warn};

use chorus_protocol::{Envelope, Notification, Request, RpcError};

use crate::handler;
use crate::state::SignalService;

/// Interval between WebSocket ping frames.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum time to wait for a pong before considering the connection dead.
/// Allows 3 missed pings.
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// Bound of the per-peer outbound queue; overflow drops notifications.
const OUTBOX_SIZE: usize = 64;

/// One connected client. Owned by exactly one room at a time; everything the
/// server pushes to the client goes through the bounded outbox.
pub struct Peer {
    uid: String,
    outbox: mpsc::Sender<Message>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl Peer {
    pub fn new(uid: impl Into<String>, outbox: mpsc::Sender<Message>) -> Self {
        Self {
            uid: uid.into(),
            outbox,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Push a one-way notification. Best-effort: a peer that cannot keep up
    /// loses notifications rather than blocking the sender.
    pub fn notify(&self, method: &str, data: Value) {
        let note = Notification::new(method, data);
        let Ok(json) = serde_json::to_string(&note) else {
            return;
        };
        if self.outbox.try_send(Message::Text(json.into())).is_err() {
            debug!(uid = %self.uid, method, "peer outbox full, notification dropped");
        }
    }

    fn send_response(&self, response: chorus_protocol::Response) {
        let Ok(json) = serde_json::to_string(&response) else {
            return;
        };
        let _ = self.outbox.try_send(Message::Text(json.into()));
    }

    /// Mark the peer for teardown; the socket pump drains the outbox and
    /// closes. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(uid = %self.uid, "peer close");
            self.close_signal.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// GET /ws?peer=<uid>
pub async fn ws_upgrade(
    State(service): State<Arc<SignalService>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(uid) = params.get("peer").filter(|uid| !uid.is_empty()).cloned() else {
        return (StatusCode::BAD_REQUEST, "missing peer query parameter").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, uid, service))
}

async fn handle_socket(mut socket: WebSocket, uid: String, service: Arc<SignalService>) {
    info!(%uid, "client WebSocket connected");

    let (outbox_tx, mut outbox_rx) = mpsc::channel(OUTBOX_SIZE);
    let peer = Arc::new(Peer::new(uid.clone(), outbox_tx));

    // Requests are processed strictly in arrival order, but off the socket
    // pump so slow upstream RPCs never delay pings or notifications.
    let (req_tx, mut req_rx) = mpsc::channel::<Request>(OUTBOX_SIZE);
    let dispatcher = {
        let service = Arc::clone(&service);
        let peer = Arc::clone(&peer);
        tokio::spawn(async move {
            while let Some(request) = req_rx.recv().await {
                let response = handler::handle_request(&service, &peer, request).await;
                peer.send_response(response);
            }
        })
    };

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await; // consume the immediate first tick
    let mut last_pong = Instant::now();

    let closed = peer.close_signal.notified();
    tokio::pin!(closed);

    loop {
        tokio::select! {
            // Torn down server-side: kicked, swept, or left the room
            _ = &mut closed => {
                // give the dispatcher a beat to queue the final response
                tokio::time::sleep(Duration::from_millis(20)).await;
                while let Ok(out) = outbox_rx.try_recv() {
                    if socket.send(out).await.is_err() {
                        break;
                    }
                }
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    debug!(%uid, "client WebSocket ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            Some(out) = outbox_rx.recv() => {
                if socket.send(out).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_frame(&peer, &req_tx, &text);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(%uid, "client WebSocket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(%uid, "client WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    dispatcher.abort();
    peer.close();
    info!(%uid, "client WebSocket disconnected");
}

fn dispatch_frame(peer: &Arc<Peer>, req_tx: &mpsc::Sender<Request>, text: &str) {
    match serde_json::from_str::<Envelope>(text) {
        Ok(Envelope::Request(request)) => {
            if req_tx.try_send(request).is_err() {
                warn!(uid = %peer.uid(), "request queue full, request dropped");
            }
        }
        Ok(Envelope::Notification(note)) => {
            // Clients have no notification methods today; log and move on.
            debug!(uid = %peer.uid(), method = %note.method, "client notification ignored");
        }
        Ok(Envelope::Response(_)) => {
            debug!(uid = %peer.uid(), "unexpected response frame from client");
        }
        Err(e) => {
            warn!(uid = %peer.uid(), "invalid frame: {e}");
            peer.send_response(chorus_protocol::Response::reject(
                0,
                RpcError::new(400, format!("invalid frame: {e}")),
            ));
        }
    }
}
