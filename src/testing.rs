//! Фейковый WebRTC движок для тестов и окружений без медиастека.
//!
//! Ведёт себя как настоящий в том, что важно сигнальному слою:
//! - кандидат до remote description отклоняется (и считается);
//! - после set_local_description выдаёт локальные кандидаты;
//! - CONNECTED наступает, когда есть обе description и применён хотя
//!   бы один удалённый кандидат;
//! - у зрителя перед CONNECTED появляется входящий поток.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{Result, SignalError};
use crate::peer::engine::{
    LinkEvent, LinkEvents, LinkState, LocalMedia, PeerEngine, PeerLink, RemoteStream,
};
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};

/// VP8 видео + Opus аудио без источника: треки только подключаются к
/// соединениям, сэмплы в них никто не пишет
pub fn synthetic_media(stream_id: &str) -> LocalMedia {
    let video: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
        "video".to_owned(),
        stream_id.to_owned(),
    ));
    let audio: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            ..Default::default()
        },
        "audio".to_owned(),
        stream_id.to_owned(),
    ));
    LocalMedia::new(vec![video, audio])
}

#[derive(Default)]
struct Behaviour {
    unavailable: bool,
    manual_connect: bool,
    local_candidates: Option<usize>,
    fail_attach: HashSet<String>,
    fail_offer: HashSet<String>,
    fail_remote: HashSet<String>,
}

#[derive(Default)]
pub struct FakeEngine {
    behaviour: Mutex<Behaviour>,
    links: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// new_link будет падать, как при недоступной камере/движке
    pub fn set_unavailable(&self, unavailable: bool) {
        self.behaviour().unavailable = unavailable;
    }

    /// CONNECTED только через `FakeLink::emit_state`
    pub fn set_manual_connect(&self, manual: bool) {
        self.behaviour().manual_connect = manual;
    }

    pub fn set_local_candidates(&self, n: usize) {
        self.behaviour().local_candidates = Some(n);
    }

    pub fn fail_attach_for(&self, label: &str) {
        self.behaviour().fail_attach.insert(label.to_string());
    }

    pub fn fail_offer_for(&self, label: &str) {
        self.behaviour().fail_offer.insert(label.to_string());
    }

    pub fn fail_remote_for(&self, label: &str) {
        self.behaviour().fail_remote.insert(label.to_string());
    }

    /// Последнее соединение с такой меткой
    pub fn link(&self, label: &str) -> Option<Arc<FakeLink>> {
        self.all_links()
            .into_iter()
            .rev()
            .find(|l| l.label == label)
    }

    pub fn all_links(&self) -> Vec<Arc<FakeLink>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn behaviour(&self) -> MutexGuard<'_, Behaviour> {
        self.behaviour.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PeerEngine for FakeEngine {
    async fn new_link(&self, label: &str) -> Result<(Arc<dyn PeerLink>, LinkEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = {
            let b = self.behaviour();
            if b.unavailable {
                return Err(SignalError::engine("media engine unavailable"));
            }
            Arc::new(FakeLink {
                label: label.to_string(),
                fail_attach: b.fail_attach.contains(label),
                fail_offer: b.fail_offer.contains(label),
                fail_remote: b.fail_remote.contains(label),
                manual_connect: b.manual_connect,
                local_candidates: b.local_candidates.unwrap_or(2),
                events: tx,
                closed: AtomicBool::new(false),
                inner: Mutex::new(FakeLinkState::default()),
            })
        };
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&link));
        let link: Arc<dyn PeerLink> = link;
        Ok((link, rx))
    }
}

#[derive(Default)]
struct FakeLinkState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    premature: Vec<IceCandidate>,
    attached_tracks: usize,
    connected: bool,
    stream_emitted: bool,
}

pub struct FakeLink {
    label: String,
    fail_attach: bool,
    fail_offer: bool,
    fail_remote: bool,
    manual_connect: bool,
    local_candidates: usize,
    events: mpsc::UnboundedSender<LinkEvent>,
    closed: AtomicBool,
    inner: Mutex<FakeLinkState>,
}

impl FakeLink {
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state().remote.clone()
    }

    /// Кандидаты, принятые после remote description, в порядке применения
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state().applied.clone()
    }

    /// Кандидаты, которые пытались применить до remote description
    pub fn premature_candidates(&self) -> Vec<IceCandidate> {
        self.state().premature.clone()
    }

    pub fn attached_tracks(&self) -> usize {
        self.state().attached_tracks
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected && !self.is_closed()
    }

    /// Имитация события движка (Failed, Disconnected, Connected ...)
    pub fn emit_state(&self, state: LinkState) {
        if state == LinkState::Connected {
            self.state().connected = true;
        }
        let _ = self.events.send(LinkEvent::StateChanged(state));
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(LinkEvent::LocalCandidate(candidate));
    }

    fn state(&self) -> MutexGuard<'_, FakeLinkState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SignalError::negotiation(format!("{} is closed", self.label)));
        }
        Ok(())
    }

    fn maybe_connect(&self) {
        let mut st = self.state();
        if st.connected || st.local.is_none() || st.remote.is_none() || st.applied.is_empty() {
            return;
        }
        let viewer_side = st.remote.as_ref().map(|d| d.kind) == Some(SdpKind::Offer);
        if viewer_side && !st.stream_emitted {
            st.stream_emitted = true;
            let _ = self.events.send(LinkEvent::RemoteStream(RemoteStream {
                stream_id: "fake-stream".into(),
                track_id: format!("{}-video", self.label),
                track: None,
            }));
        }
        if self.manual_connect {
            return;
        }
        st.connected = true;
        let _ = self.events.send(LinkEvent::StateChanged(LinkState::Connecting));
        let _ = self.events.send(LinkEvent::StateChanged(LinkState::Connected));
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    fn label(&self) -> &str {
        &self.label
    }

    async fn attach_media(&self, media: &LocalMedia) -> Result<()> {
        self.ensure_open()?;
        if self.fail_attach {
            return Err(SignalError::engine(format!("cannot attach tracks to {}", self.label)));
        }
        self.state().attached_tracks += media.tracks().len();
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        if self.fail_offer {
            return Err(SignalError::negotiation(format!("offer rejected for {}", self.label)));
        }
        Ok(SessionDescription::offer(format!("v=0 fake-offer {}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        if self.state().remote.is_none() {
            return Err(SignalError::negotiation("cannot answer without remote offer"));
        }
        Ok(SessionDescription::answer(format!("v=0 fake-answer {}", self.label)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        self.state().local = Some(desc);
        for n in 0..self.local_candidates {
            let _ = self.events.send(LinkEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{n} 1 udp 2122260223 127.0.0.1 {} typ host ufrag {}",
                50000 + n,
                self.label
            ))));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        if self.fail_remote || desc.sdp.contains("malformed") {
            return Err(SignalError::negotiation(format!(
                "remote description rejected by {}",
                self.label
            )));
        }
        self.state().remote = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        {
            let mut st = self.state();
            if st.remote.is_none() {
                st.premature.push(candidate);
                return Err(SignalError::negotiation("remote description not set"));
            }
            st.applied.push(candidate);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(LinkEvent::StateChanged(LinkState::Closed));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
