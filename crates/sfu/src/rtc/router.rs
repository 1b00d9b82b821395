use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::rtp::packet::Packet;

use super::RtcEngine;
use super::publisher::Publisher;
use super::subscriber::Subscriber;
use crate::capture::AudioCapture;

/// A track is considered live for this long after its last packet.
pub const LIVE_CYCLE: Duration = Duration::from_secs(6);

/// Retransmission window: how many recent video packets are kept for NACK.
const PKT_BUFFER_CAP: usize = 512;

/// Liveness of one published stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    /// Created, no publisher attached yet
    Idle,
    /// Publisher attached and at least one track recently carried media
    Publishing,
    /// Publisher up but both tracks silent past their deadline
    Draining,
    /// Stopped, or the publisher is stopped or disconnected
    Dead,
}

/// Recent video packets indexed by sequence number, for local NACK
/// retransmission. Written only by the video fan-out task.
struct PacketBuffer {
    packets: HashMap<u16, Packet>,
    order: VecDeque<u16>,
}

impl PacketBuffer {
    fn new() -> Self {
        Self {
            packets: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, pkt: Packet) {
        let seq = pkt.header.sequence_number;
        if self.packets.insert(seq, pkt).is_none() {
            self.order.push_back(seq);
            if self.order.len() > PKT_BUFFER_CAP
                && let Some(old) = self.order.pop_front()
            {
                self.packets.remove(&old);
            }
        }
    }

    fn get(&self, seq: u16) -> Option<Packet> {
        self.packets.get(&seq).cloned()
    }

    fn clear(&mut self) {
        self.packets.clear();
        self.order.clear();
    }
}

/// Per-stream forwarding state machine: one publisher, any number of
/// subscribers, audio and video fan-out tasks, and per-subscriber RTCP
/// feedback.
pub struct Router {
    pub id: String,
    stopped: AtomicBool,
    created: Instant,
    publisher: Mutex<Option<Arc<Publisher>>>,
    subs: Mutex<HashMap<String, Arc<Subscriber>>>,
    audio_alive: Mutex<Instant>,
    video_alive: Mutex<Instant>,
    pkt_buffer: RwLock<PacketBuffer>,
    capture: Mutex<Option<AudioCapture>>,
}

impl Router {
    pub fn new(id: &str) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id: id.to_string(),
            stopped: AtomicBool::new(false),
            created: now,
            publisher: Mutex::new(None),
            subs: Mutex::new(HashMap::new()),
            audio_alive: Mutex::new(now + LIVE_CYCLE),
            video_alive: Mutex::new(now + LIVE_CYCLE),
            pkt_buffer: RwLock::new(PacketBuffer::new()),
            capture: Mutex::new(None),
        })
    }

    /// Attach the publisher: peer connection, offer/answer, then the audio
    /// and video forwarding tasks. Returns the answer SDP.
    pub async fn add_pub(
        self: &Arc<Self>,
        engine: &RtcEngine,
        mid: &str,
        sdp: &str,
        capture_audio: bool,
    ) -> Result<String> {
        let publisher = Publisher::new(engine, mid).await?;
        let answer = match publisher.answer(sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                publisher.close().await;
                return Err(e).context("pub offer/answer");
            }
        };
        if capture_audio {
            match AudioCapture::create(mid) {
                Ok(capture) => *self.capture.lock().unwrap() = Some(capture),
                Err(e) => warn!(%mid, "audio capture disabled: {e}"),
            }
        }
        *self.publisher.lock().unwrap() = Some(Arc::clone(&publisher));
        debug!(id = %self.id, %mid, "router add pub");

        tokio::spawn(Arc::clone(self).audio_work(Arc::clone(&publisher)));
        tokio::spawn(Arc::clone(self).video_work(Arc::clone(&publisher)));
        Ok(answer)
    }

    /// Attach one subscriber to the published tracks. Returns the answer SDP.
    pub async fn add_sub(
        self: &Arc<Self>,
        engine: &RtcEngine,
        sid: &str,
        sdp: &str,
    ) -> Result<String> {
        let publisher = self
            .publisher()
            .ok_or_else(|| anyhow!("router {} has no publisher", self.id))?;
        let sub = Subscriber::new(engine, sid).await?;
        let built: Result<String> = async {
            if let Some(track) = publisher.audio_track() {
                sub.add_track(&track).await?;
            }
            if let Some(track) = publisher.video_track() {
                sub.add_track(&track).await?;
            }
            if !sub.has_track() {
                bail!("no audio or video track to subscribe");
            }
            sub.answer(sdp).await
        }
        .await;

        match built {
            Ok(answer) => {
                sub.start();
                self.subs
                    .lock()
                    .unwrap()
                    .insert(sid.to_string(), Arc::clone(&sub));
                debug!(id = %self.id, %sid, "router add sub");
                tokio::spawn(Arc::clone(self).rtcp_work(sub));
                Ok(answer)
            }
            Err(e) => {
                sub.close().await;
                Err(e)
            }
        }
    }

    pub fn publisher(&self) -> Option<Arc<Publisher>> {
        self.publisher.lock().unwrap().clone()
    }

    pub fn has_publisher(&self) -> bool {
        self.publisher.lock().unwrap().is_some()
    }

    pub fn sub_count(&self) -> usize {
        self.subs.lock().unwrap().len()
    }

    pub async fn del_sub(&self, sid: &str) {
        let sub = self.subs.lock().unwrap().remove(sid);
        if let Some(sub) = sub {
            sub.close().await;
        }
    }

    pub fn state(&self) -> RouterState {
        let publisher = self
            .publisher()
            .map(|p| (p.is_stopped(), p.is_alive()));
        let now = Instant::now();
        let media_live = *self.audio_alive.lock().unwrap() >= now
            || *self.video_alive.lock().unwrap() >= now;
        compute_state(self.stopped.load(Ordering::Relaxed), publisher, media_live)
    }

    /// Whether the sweeper should keep this router. Idle routers get a grace
    /// period so a freshly created router is not reaped before its publisher
    /// attaches.
    pub fn is_live(&self) -> bool {
        match self.state() {
            RouterState::Publishing => true,
            RouterState::Idle => self.created.elapsed() < LIVE_CYCLE,
            RouterState::Draining | RouterState::Dead => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Close the publisher and every subscriber. Idempotent; no forwarding
    /// task survives this.
    pub async fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(id = %self.id, "router close");
        let publisher = self.publisher.lock().unwrap().take();
        if let Some(publisher) = publisher {
            publisher.close().await;
        }
        let subs: Vec<Arc<Subscriber>> = {
            let mut subs = self.subs.lock().unwrap();
            subs.drain().map(|(_, s)| s).collect()
        };
        for sub in subs {
            sub.close().await;
        }
        self.pkt_buffer.write().unwrap().clear();
        if let Some(capture) = self.capture.lock().unwrap().take() {
            capture.close();
        }
    }

    /// Audio fan-out: drain the publisher's audio channel into every
    /// subscriber inbox, feeding the optional Opus capture on the way.
    async fn audio_work(self: Arc<Self>, publisher: Arc<Publisher>) {
        let Some(mut rx) = publisher.take_audio_rx() else {
            return;
        };
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                pkt = rx.recv() => {
                    let Some(pkt) = pkt else { return };
                    if self.forwarding_done(&publisher) {
                        return;
                    }
                    *self.audio_alive.lock().unwrap() = Instant::now() + LIVE_CYCLE;
                    if let Some(capture) = self.capture.lock().unwrap().as_mut() {
                        capture.write(&pkt);
                    }
                    self.fan_out(&pkt, Direction::Audio);
                }
                _ = tick.tick() => {
                    if self.forwarding_done(&publisher) {
                        return;
                    }
                }
            }
        }
    }

    /// Video fan-out: like audio, but each packet is first stored in the
    /// retransmission buffer.
    async fn video_work(self: Arc<Self>, publisher: Arc<Publisher>) {
        let Some(mut rx) = publisher.take_video_rx() else {
            return;
        };
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                pkt = rx.recv() => {
                    let Some(pkt) = pkt else { return };
                    if self.forwarding_done(&publisher) {
                        return;
                    }
                    self.pkt_buffer.write().unwrap().insert(pkt.clone());
                    *self.video_alive.lock().unwrap() = Instant::now() + LIVE_CYCLE;
                    self.fan_out(&pkt, Direction::Video);
                }
                _ = tick.tick() => {
                    if self.forwarding_done(&publisher) {
                        return;
                    }
                }
            }
        }
    }

    fn forwarding_done(&self, publisher: &Publisher) -> bool {
        self.is_stopped() || publisher.is_stopped() || !publisher.is_alive()
    }

    /// Post one packet to every subscriber. Dead or lagging subscribers are
    /// removed here and closed off-task, so one slow consumer never stalls
    /// the others.
    fn fan_out(&self, pkt: &Packet, direction: Direction) {
        let mut dropped: Vec<Arc<Subscriber>> = Vec::new();
        {
            let mut subs = self.subs.lock().unwrap();
            subs.retain(|_, sub| {
                if sub.is_stopped() || !sub.is_alive() {
                    dropped.push(Arc::clone(sub));
                    return false;
                }
                let posted = match direction {
                    Direction::Audio => sub.forward_audio(pkt.clone()),
                    Direction::Video => sub.forward_video(pkt.clone()),
                };
                if !posted {
                    dropped.push(Arc::clone(sub));
                }
                posted
            });
        }
        for sub in dropped {
            tokio::spawn(async move { sub.close().await });
        }
    }

    /// Per-subscriber RTCP feedback: PLI goes upstream unchanged; NACKed
    /// packets are retransmitted from the buffer when possible, otherwise a
    /// single-pair NACK is forwarded upstream.
    async fn rtcp_work(self: Arc<Self>, sub: Arc<Subscriber>) {
        let Some(mut rx) = sub.take_rtcp_rx() else {
            return;
        };
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                pkt = rx.recv() => {
                    let Some(pkt) = pkt else { return };
                    self.handle_feedback(&sub, pkt.as_ref()).await;
                }
                _ = tick.tick() => {
                    if self.is_stopped() || sub.is_stopped() || !sub.is_alive() {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_feedback(&self, sub: &Subscriber, pkt: &(dyn rtcp::packet::Packet + Send + Sync)) {
        let any = pkt.as_any();
        if let Some(pli) = any.downcast_ref::<PictureLossIndication>() {
            if let Some(publisher) = self.publisher() {
                publisher.write_rtcp(Box::new(pli.clone())).await;
            }
            return;
        }
        let Some(nack) = any.downcast_ref::<TransportLayerNack>() else {
            return;
        };
        for pair in &nack.nacks {
            for seq in pair.packet_list() {
                let buffered = self.pkt_buffer.read().unwrap().get(seq);
                match buffered {
                    Some(pkt) => {
                        sub.forward_video(pkt);
                    }
                    None => {
                        if let Some(publisher) = self.publisher() {
                            publisher
                                .write_rtcp(Box::new(TransportLayerNack {
                                    sender_ssrc: nack.sender_ssrc,
                                    media_ssrc: nack.media_ssrc,
                                    nacks: vec![NackPair {
                                        packet_id: seq,
                                        lost_packets: 0,
                                    }],
                                }))
                                .await;
                        }
                    }
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Audio,
    Video,
}

/// Pure liveness decision: `publisher` is `(stopped, alive)` when attached,
/// `media_live` is true while either track's deadline is in the future.
fn compute_state(
    stopped: bool,
    publisher: Option<(bool, bool)>,
    media_live: bool,
) -> RouterState {
    if stopped {
        return RouterState::Dead;
    }
    match publisher {
        None => RouterState::Idle,
        Some((pub_stopped, pub_alive)) if pub_stopped || !pub_alive => RouterState::Dead,
        Some(_) if !media_live => RouterState::Draining,
        Some(_) => RouterState::Publishing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp::header::Header;

    fn packet(seq: u16) -> Packet {
        Packet {
            header: Header {
                sequence_number: seq,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn state_machine_transitions() {
        // no publisher yet
        assert_eq!(compute_state(false, None, true), RouterState::Idle);
        // healthy publisher with recent media
        assert_eq!(
            compute_state(false, Some((false, true)), true),
            RouterState::Publishing
        );
        // both tracks silent past their deadline
        assert_eq!(
            compute_state(false, Some((false, true)), false),
            RouterState::Draining
        );
        // publisher disconnected or stopped
        assert_eq!(
            compute_state(false, Some((false, false)), true),
            RouterState::Dead
        );
        assert_eq!(
            compute_state(false, Some((true, true)), true),
            RouterState::Dead
        );
        // explicit close wins over everything
        assert_eq!(
            compute_state(true, Some((false, true)), true),
            RouterState::Dead
        );
    }

    #[test]
    fn fresh_router_is_idle_and_live() {
        let router = Router::new("/pub/rid/r1/uid/alice/mid/alice#a1b2c3");
        assert_eq!(router.state(), RouterState::Idle);
        assert!(router.is_live());
    }

    #[tokio::test]
    async fn closed_router_is_dead() {
        let router = Router::new("/pub/rid/r1/uid/alice/mid/alice#a1b2c3");
        router.close().await;
        assert_eq!(router.state(), RouterState::Dead);
        assert!(!router.is_live());
    }

    #[test]
    fn packet_buffer_serves_nacked_sequences() {
        let mut buffer = PacketBuffer::new();
        for seq in 1000..=1010 {
            buffer.insert(packet(seq));
        }
        assert_eq!(buffer.get(1005).unwrap().header.sequence_number, 1005);
        assert!(buffer.get(999).is_none());
    }

    #[test]
    fn packet_buffer_evicts_oldest() {
        let mut buffer = PacketBuffer::new();
        for seq in 0..(PKT_BUFFER_CAP as u16 + 10) {
            buffer.insert(packet(seq));
        }
        assert!(buffer.get(5).is_none());
        assert!(buffer.get(PKT_BUFFER_CAP as u16 + 9).is_some());
        assert_eq!(buffer.order.len(), PKT_BUFFER_CAP);
    }

    #[test]
    fn packet_buffer_overwrites_duplicate_seq() {
        let mut buffer = PacketBuffer::new();
        buffer.insert(packet(7));
        buffer.insert(packet(7));
        assert_eq!(buffer.order.len(), 1);
    }
}
