use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;

use super::RtcEngine;

/// Bound of the per-track RTP channels. A full channel blocks the track
/// reader, which is the intended backpressure towards the network.
const MAX_RTP_CHAN: usize = 100;

/// The receive side of one published stream: a recvonly peer connection
/// whose audio/video tracks feed two bounded RTP channels.
pub struct Publisher {
    pub id: String,
    pc: Arc<RTCPeerConnection>,
    stopped: AtomicBool,
    alive: AtomicBool,
    audio_track: Mutex<Option<Arc<TrackRemote>>>,
    video_track: Mutex<Option<Arc<TrackRemote>>>,
    audio_tx: mpsc::Sender<Packet>,
    video_tx: mpsc::Sender<Packet>,
    audio_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    video_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
}

impl Publisher {
    pub async fn new(engine: &RtcEngine, mid: &str) -> Result<Arc<Self>> {
        let pc = engine.new_peer_connection().await?;
        let recvonly = || RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        };
        pc.add_transceiver_from_kind(RTPCodecType::Audio, Some(recvonly()))
            .await
            .context("pub add audio transceiver")?;
        pc.add_transceiver_from_kind(RTPCodecType::Video, Some(recvonly()))
            .await
            .context("pub add video transceiver")?;

        let (audio_tx, audio_rx) = mpsc::channel(MAX_RTP_CHAN);
        let (video_tx, video_rx) = mpsc::channel(MAX_RTP_CHAN);
        let publisher = Arc::new(Self {
            id: mid.to_string(),
            pc: Arc::clone(&pc),
            stopped: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            audio_track: Mutex::new(None),
            video_track: Mutex::new(None),
            audio_tx,
            video_tx,
            audio_rx: Mutex::new(Some(audio_rx)),
            video_rx: Mutex::new(Some(video_rx)),
        });

        let weak = Arc::downgrade(&publisher);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            if let Some(p) = weak.upgrade() {
                match state {
                    RTCPeerConnectionState::Connected => {
                        debug!(mid = %p.id, "pub peer connected");
                        p.alive.store(true, Ordering::Relaxed);
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                        debug!(mid = %p.id, ?state, "pub peer lost");
                        p.alive.store(false, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(&publisher);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(p) = weak.upgrade() else { return };
                match track.kind() {
                    RTPCodecType::Audio => {
                        debug!(mid = %p.id, "pub audio track up");
                        *p.audio_track.lock().unwrap() = Some(Arc::clone(&track));
                        let tx = p.audio_tx.clone();
                        tokio::spawn(Arc::clone(&p).read_loop(track, tx));
                    }
                    RTPCodecType::Video => {
                        debug!(mid = %p.id, "pub video track up");
                        *p.video_track.lock().unwrap() = Some(Arc::clone(&track));
                        let tx = p.video_tx.clone();
                        tokio::spawn(Arc::clone(&p).read_loop(track, tx));
                    }
                    _ => {}
                }
            })
        }));

        Ok(publisher)
    }

    /// Pump one remote track into its RTP channel until the publisher dies.
    async fn read_loop(self: Arc<Self>, track: Arc<TrackRemote>, tx: mpsc::Sender<Packet>) {
        loop {
            if self.is_stopped() || !self.is_alive() {
                return;
            }
            match track.read_rtp().await {
                Ok((pkt, _)) => {
                    if tx.send(pkt).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    // EOF when the peer connection closes
                    debug!(mid = %self.id, "pub track read ended: {e}");
                    self.alive.store(false, Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    /// Apply the client's offer, answer with a fully gathered local
    /// description (the signaling path carries no trickle candidates).
    pub async fn answer(&self, sdp: &str) -> Result<String> {
        let offer =
            RTCSessionDescription::offer(sdp.to_string()).context("pub parse offer")?;
        self.pc
            .set_remote_description(offer)
            .await
            .context("pub set remote description")?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("pub create answer")?;
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .context("pub set local description")?;
        let _ = gather_complete.recv().await;
        let local = self
            .pc
            .local_description()
            .await
            .context("pub local description missing")?;
        Ok(local.sdp)
    }

    pub fn audio_track(&self) -> Option<Arc<TrackRemote>> {
        self.audio_track.lock().unwrap().clone()
    }

    pub fn video_track(&self) -> Option<Arc<TrackRemote>> {
        self.video_track.lock().unwrap().clone()
    }

    /// Hand the audio RTP channel to the router's fan-out task. One take.
    pub fn take_audio_rx(&self) -> Option<mpsc::Receiver<Packet>> {
        self.audio_rx.lock().unwrap().take()
    }

    pub fn take_video_rx(&self) -> Option<mpsc::Receiver<Packet>> {
        self.video_rx.lock().unwrap().take()
    }

    /// Send RTCP feedback (PLI, NACK) upstream to the publishing client.
    pub async fn write_rtcp(&self, pkt: Box<dyn rtcp::packet::Packet + Send + Sync>) {
        if let Err(e) = self.pc.write_rtcp(&[pkt]).await {
            warn!(mid = %self.id, "pub write rtcp failed: {e}");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Idempotent. Closing the peer connection unblocks the track readers
    /// with an error, which ends the read loops.
    pub async fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(mid = %self.id, "pub close");
        if let Err(e) = self.pc.close().await {
            warn!(mid = %self.id, "pub close failed: {e}");
        }
    }
}
