pub mod publisher;
pub mod router;
pub mod subscriber;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

use chorus_protocol::{CaptureConfig, WebRtcConfig};

pub use router::{Router, RouterState};

/// Sweep interval for dead routers.
const SWEEP_CYCLE: Duration = Duration::from_secs(5);
/// Bound of the dead-router notification channel.
const MAX_CLEAN_SIZE: usize = 100;

/// Builds publisher/subscriber peer connections with the process-wide ICE
/// configuration and the fixed Opus + VP8 codec set.
#[derive(Clone)]
pub struct RtcEngine {
    ice_servers: Vec<RTCIceServer>,
    port_range: Option<(u16, u16)>,
}

impl RtcEngine {
    pub fn new(config: &WebRtcConfig) -> Self {
        let ice_servers = config
            .iceserver
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
            })
            .collect();
        let port_range = match config.portrange.as_slice() {
            [min, max] => Some((*min, *max)),
            _ => None,
        };
        Self {
            ice_servers,
            port_range,
        }
    }

    /// One peer connection with its own media engine and interceptor chain.
    pub async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media = MediaEngine::default();
        media.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1;stereo=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        media.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![
                        RTCPFeedback {
                            typ: "nack".into(),
                            parameter: String::new(),
                        },
                        RTCPFeedback {
                            typ: "nack".into(),
                            parameter: "pli".into(),
                        },
                    ],
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)?;

        let mut setting = SettingEngine::default();
        if let Some((min, max)) = self.port_range {
            setting.set_udp_network(UDPNetwork::Ephemeral(EphemeralUDP::new(min, max)?));
        }

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_setting_engine(setting)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        Ok(Arc::new(api.new_peer_connection(config).await?))
    }
}

/// All live routers of this sfu node, keyed by their `/pub/...` key.
pub struct RouterTable {
    engine: RtcEngine,
    capture: CaptureConfig,
    routers: Mutex<HashMap<String, Arc<Router>>>,
    clean_tx: mpsc::Sender<String>,
    stopped: AtomicBool,
}

impl RouterTable {
    /// Returns the table plus the receiving end of the clean channel, which
    /// carries the router key of every reaped router.
    pub fn new(engine: RtcEngine, capture: CaptureConfig) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (clean_tx, clean_rx) = mpsc::channel(MAX_CLEAN_SIZE);
        let table = Arc::new(Self {
            engine,
            capture,
            routers: Mutex::new(HashMap::new()),
            clean_tx,
            stopped: AtomicBool::new(false),
        });
        (table, clean_rx)
    }

    pub fn engine(&self) -> &RtcEngine {
        &self.engine
    }

    pub fn capture(&self) -> &CaptureConfig {
        &self.capture
    }

    pub fn get(&self, key: &str) -> Option<Arc<Router>> {
        self.routers.lock().unwrap().get(key).cloned()
    }

    pub fn get_or_create(&self, key: &str) -> Arc<Router> {
        let mut routers = self.routers.lock().unwrap();
        routers
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(%key, "add router");
                Router::new(key)
            })
            .clone()
    }

    pub async fn delete(&self, key: &str) {
        let router = self.routers.lock().unwrap().remove(key);
        if let Some(router) = router {
            debug!(%key, "del router");
            router.close().await;
        }
    }

    /// Load metric: one per live publisher plus one per subscriber.
    pub fn payload(&self) -> u64 {
        let routers = self.routers.lock().unwrap();
        routers
            .values()
            .map(|r| u64::from(r.has_publisher()) + r.sub_count() as u64)
            .sum()
    }

    /// Reap routers whose state machine reached Draining or Dead every 5 s,
    /// pushing each reaped key onto the clean channel.
    pub fn start_sweeper(self: &Arc<Self>) {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_CYCLE);
            loop {
                tick.tick().await;
                if table.stopped.load(Ordering::Relaxed) {
                    return;
                }
                let dead: Vec<(String, Arc<Router>)> = {
                    let mut routers = table.routers.lock().unwrap();
                    let keys: Vec<String> = routers
                        .iter()
                        .filter(|(_, r)| !r.is_live())
                        .map(|(k, _)| k.clone())
                        .collect();
                    keys.into_iter()
                        .filter_map(|k| routers.remove_entry(&k))
                        .collect()
                };
                for (key, router) in dead {
                    info!(%key, state = ?router.state(), "router is dead, reaping");
                    router.close().await;
                    // Blocking here applies backpressure when the drainer
                    // falls behind; the sweeper just runs late.
                    if table.clean_tx.send(key).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    pub async fn close_all(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        let routers: Vec<Arc<Router>> = {
            let mut map = self.routers.lock().unwrap();
            map.drain().map(|(_, r)| r).collect()
        };
        for router in routers {
            router.close().await;
        }
    }
}
