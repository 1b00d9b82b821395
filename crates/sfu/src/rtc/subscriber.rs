use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use super::RtcEngine;

/// Bound of the per-subscriber inboxes and the RTCP feedback channel.
const MAX_INBOX: usize = 100;

type RtcpPacket = Box<dyn rtcp::packet::Packet + Send + Sync>;

/// The send side towards one subscriber: a sendonly peer connection fed by
/// bounded per-track inboxes.
///
/// The router posts packets with a non-blocking try-send; each inbox is
/// drained by this subscriber's own writer task. A slow subscriber fills its
/// inbox and is disconnected rather than stalling the fan-out.
pub struct Subscriber {
    pub id: String,
    pc: Arc<RTCPeerConnection>,
    stopped: AtomicBool,
    alive: AtomicBool,
    audio_out: Mutex<Option<Arc<TrackLocalStaticRTP>>>,
    video_out: Mutex<Option<Arc<TrackLocalStaticRTP>>>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    audio_inbox_tx: mpsc::Sender<Packet>,
    video_inbox_tx: mpsc::Sender<Packet>,
    audio_inbox_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    video_inbox_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    rtcp_tx: mpsc::Sender<RtcpPacket>,
    rtcp_rx: Mutex<Option<mpsc::Receiver<RtcpPacket>>>,
}

impl Subscriber {
    pub async fn new(engine: &RtcEngine, sid: &str) -> Result<Arc<Self>> {
        let pc = engine.new_peer_connection().await?;
        let (audio_inbox_tx, audio_inbox_rx) = mpsc::channel(MAX_INBOX);
        let (video_inbox_tx, video_inbox_rx) = mpsc::channel(MAX_INBOX);
        let (rtcp_tx, rtcp_rx) = mpsc::channel(MAX_INBOX);
        let sub = Arc::new(Self {
            id: sid.to_string(),
            pc: Arc::clone(&pc),
            stopped: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            audio_out: Mutex::new(None),
            video_out: Mutex::new(None),
            video_sender: Mutex::new(None),
            audio_inbox_tx,
            video_inbox_tx,
            audio_inbox_rx: Mutex::new(Some(audio_inbox_rx)),
            video_inbox_rx: Mutex::new(Some(video_inbox_rx)),
            rtcp_tx,
            rtcp_rx: Mutex::new(Some(rtcp_rx)),
        });

        let weak = Arc::downgrade(&sub);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            if let Some(s) = weak.upgrade() {
                match state {
                    RTCPeerConnectionState::Connected => {
                        debug!(sid = %s.id, "sub peer connected");
                        s.alive.store(true, Ordering::Relaxed);
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                        debug!(sid = %s.id, ?state, "sub peer lost");
                        s.alive.store(false, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
            Box::pin(async {})
        }));

        Ok(sub)
    }

    /// Mirror one of the publisher's tracks: a local track with the remote's
    /// codec, id and stream id, attached to this peer connection.
    pub async fn add_track(&self, remote: &TrackRemote) -> Result<()> {
        let local = Arc::new(TrackLocalStaticRTP::new(
            remote.codec().capability,
            remote.id(),
            remote.stream_id(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("sub add track")?;
        match remote.kind() {
            RTPCodecType::Audio => {
                *self.audio_out.lock().unwrap() = Some(local);
            }
            RTPCodecType::Video => {
                *self.video_out.lock().unwrap() = Some(local);
                *self.video_sender.lock().unwrap() = Some(sender);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn has_track(&self) -> bool {
        self.audio_out.lock().unwrap().is_some() || self.video_out.lock().unwrap().is_some()
    }

    pub async fn answer(&self, sdp: &str) -> Result<String> {
        let offer =
            RTCSessionDescription::offer(sdp.to_string()).context("sub parse offer")?;
        self.pc
            .set_remote_description(offer)
            .await
            .context("sub set remote description")?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("sub create answer")?;
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .context("sub set local description")?;
        let _ = gather_complete.recv().await;
        let local = self
            .pc
            .local_description()
            .await
            .context("sub local description missing")?;
        Ok(local.sdp)
    }

    /// Start the inbox writer tasks and the RTCP reader.
    pub fn start(self: &Arc<Self>) {
        if self.audio_out.lock().unwrap().is_some() {
            let rx = self.audio_inbox_rx.lock().unwrap().take();
            if let Some(rx) = rx {
                tokio::spawn(Arc::clone(self).write_loop(rx, TrackKind::Audio));
            }
        }
        if self.video_out.lock().unwrap().is_some() {
            let rx = self.video_inbox_rx.lock().unwrap().take();
            if let Some(rx) = rx {
                tokio::spawn(Arc::clone(self).write_loop(rx, TrackKind::Video));
            }
            tokio::spawn(Arc::clone(self).rtcp_loop());
        }
    }

    /// Post an audio packet. `false` means the inbox is full or gone; the
    /// caller disconnects the subscriber.
    pub fn forward_audio(&self, pkt: Packet) -> bool {
        self.post(&self.audio_inbox_tx, pkt)
    }

    pub fn forward_video(&self, pkt: Packet) -> bool {
        self.post(&self.video_inbox_tx, pkt)
    }

    fn post(&self, tx: &mpsc::Sender<Packet>, pkt: Packet) -> bool {
        match tx.try_send(pkt) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(sid = %self.id, "sub inbox full, disconnecting slow subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Hand the RTCP feedback channel to the router. One take.
    pub fn take_rtcp_rx(&self) -> Option<mpsc::Receiver<RtcpPacket>> {
        self.rtcp_rx.lock().unwrap().take()
    }

    /// Drain one inbox into its local track. Packets arriving while the peer
    /// is not connected are dropped; writes happen only while the subscriber
    /// is connected and not stopped.
    async fn write_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Packet>, kind: TrackKind) {
        let track = match kind {
            TrackKind::Audio => self.audio_out.lock().unwrap().clone(),
            TrackKind::Video => self.video_out.lock().unwrap().clone(),
        };
        let Some(track) = track else { return };
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                pkt = rx.recv() => {
                    let Some(pkt) = pkt else { return };
                    if self.is_stopped() {
                        return;
                    }
                    if !self.is_alive() {
                        continue;
                    }
                    if let Err(e) = track.write_rtp(&pkt).await {
                        if webrtc::Error::ErrClosedPipe == e {
                            self.alive.store(false, Ordering::Relaxed);
                            return;
                        }
                        debug!(sid = %self.id, "sub write rtp: {e}");
                    }
                }
                _ = tick.tick() => {
                    if self.is_stopped() {
                        return;
                    }
                }
            }
        }
    }

    /// Read RTCP from the video sender and queue it for the router's
    /// feedback task. Overflow is dropped; feedback is best-effort.
    async fn rtcp_loop(self: Arc<Self>) {
        let sender = self.video_sender.lock().unwrap().clone();
        let Some(sender) = sender else { return };
        loop {
            if self.is_stopped() {
                return;
            }
            match sender.read_rtcp().await {
                Ok((pkts, _)) => {
                    for pkt in pkts {
                        let _ = self.rtcp_tx.try_send(pkt);
                    }
                }
                Err(e) => {
                    debug!(sid = %self.id, "sub rtcp read ended: {e}");
                    return;
                }
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Idempotent.
    pub async fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(sid = %self.id, "sub close");
        if let Err(e) = self.pc.close().await {
            warn!(sid = %self.id, "sub close failed: {e}");
        }
    }
}

#[derive(Clone, Copy)]
enum TrackKind {
    Audio,
    Video,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_protocol::WebRtcConfig;

    #[tokio::test]
    async fn full_inbox_reports_slow_subscriber() {
        let engine = RtcEngine::new(&WebRtcConfig::default());
        let sub = Subscriber::new(&engine, "bob#a1b2c3").await.unwrap();

        // Writer tasks are not started, so nothing drains the inbox: this is
        // the never-draining subscriber. The first MAX_INBOX posts buffer,
        // the next one reports the overflow that gets the sub disconnected.
        for _ in 0..MAX_INBOX {
            assert!(sub.forward_audio(Packet::default()));
        }
        assert!(!sub.forward_audio(Packet::default()));

        sub.close().await;
        assert!(sub.is_stopped());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let engine = RtcEngine::new(&WebRtcConfig::default());
        let sub = Subscriber::new(&engine, "bob#a1b2c3").await.unwrap();
        sub.close().await;
        sub.close().await;
        assert!(sub.is_stopped());
    }
}
