use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        RTCPeerConnection,
    },
    rtp_transceiver::rtp_codec::RTPCodecType,
};

use crate::config::SignalConfig;
use crate::error::{Result, SignalError};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::engine::{
    LinkEvent, LinkEvents, LinkState, LocalMedia, PeerEngine, PeerLink, RemoteStream,
};
use crate::peer::types::{IceCandidate, SdpKind, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;

/// Движок на webrtc-rs: одно RTCPeerConnection на зрителя
pub struct WebRtcEngine {
    config: SignalConfig,
}

impl WebRtcEngine {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn new_link(&self, label: &str) -> Result<(Arc<dyn PeerLink>, LinkEvents)> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(&self.config)).await?);
        let (tx, rx) = mpsc::unbounded_channel();
        install_handlers(&pc, label, tx);

        debug!(link = label, "peer connection created");
        let link = WebRtcLink {
            label: label.to_string(),
            pc,
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(link), rx))
    }
}

/// Обработчики событий peer connection пересылают всё в канал событий
fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    label: &str,
    tx: mpsc::UnboundedSender<LinkEvent>,
) {
    // Обработчик локальных кандидатов
    let cand_tx = tx.clone();
    let cand_label = label.to_string();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => {
                dump_candidate(&cand_label, &c);
                match c.to_json() {
                    Ok(init) => {
                        let _ = cand_tx.send(LinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => {
                        warn!(link = %cand_label, error = %e, "cannot serialize local candidate");
                    }
                }
            }
            // None означает конец сбора
            None => debug!(link = %cand_label, "ICE candidate gathering completed"),
        }
        Box::pin(async {})
    }));

    let track_tx = tx.clone();
    let track_label = label.to_string();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            info!(
                link = %track_label,
                kind = kind_name(track.kind()),
                ssrc = track.ssrc(),
                "remote track received"
            );
            let _ = track_tx.send(LinkEvent::RemoteStream(RemoteStream {
                stream_id: track.stream_id().to_string(),
                track_id: track.id().to_string(),
                track: Some(track),
            }));
            Box::pin(async {})
        },
    ));

    // слабая ссылка, чтобы обработчик не держал соединение живым
    let weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    let state_label = label.to_string();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        debug!(link = %state_label, state = ?st, "peer connection state changed");

        let mapped = match st {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => LinkState::New,
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
        };

        if mapped == LinkState::Failed {
            if let Some(pc) = weak.upgrade() {
                let label = state_label.clone();
                tokio::spawn(async move {
                    dump_selected_pair(&pc, &label, "BEFORE-FAIL").await;
                });
            }
        }

        let _ = tx.send(LinkEvent::StateChanged(mapped));
        Box::pin(async {})
    }));
}

pub struct WebRtcLink {
    label: String,
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    fn label(&self) -> &str {
        &self.label
    }

    async fn attach_media(&self, media: &LocalMedia) -> Result<()> {
        for track in media.tracks() {
            let sender = self.pc.add_track(Arc::clone(track)).await?;
            debug!(link = %self.label, track = track.id(), "local track attached");

            // RTCP нужно вычитывать, иначе interceptors не работают
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(SignalError::negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(SignalError::negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(SignalError::negotiation)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(SignalError::negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(SignalError::negotiation)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // закрытие посреди переговоров допустимо, ошибку только логируем
        if let Err(e) = self.pc.close().await {
            debug!(link = %self.label, error = %e, "peer connection close reported an error");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(SignalError::negotiation)
}

/// Создает конфигурацию для peer connection
fn rtc_config(config: &SignalConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(config.effective_ice_servers()),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Конфигурация серверов → RTCIceServer
pub fn ice_servers(servers: Vec<ServerConfig>) -> Vec<RTCIceServer> {
    servers
        .into_iter()
        .map(|config| {
            let url = add_ice_url_scheme(&config);

            RTCIceServer {
                urls: vec![url],
                username: config.username.unwrap_or_default(),
                credential: config.credential.unwrap_or_default(),
            }
        })
        .collect()
}

/// Вид медиа для логов
pub fn kind_name(kind: RTPCodecType) -> &'static str {
    match kind {
        RTPCodecType::Audio => "audio",
        RTPCodecType::Video => "video",
        _ => "unspecified",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::IceServerKind;

    #[test]
    fn ice_servers_carry_credentials_and_schemes() {
        let servers = ice_servers(vec![ServerConfig {
            id: "t".into(),
            r#type: IceServerKind::Turn,
            url: "relay.example.org:3478".into(),
            username: Some("user".into()),
            credential: Some("secret".into()),
        }]);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["turn:relay.example.org:3478".to_string()]);
        assert_eq!(servers[0].username, "user");
        assert_eq!(servers[0].credential, "secret");
    }

    #[test]
    fn garbage_sdp_is_a_negotiation_error() {
        let err = to_rtc(SessionDescription::offer("not an sdp")).unwrap_err();
        assert!(matches!(err, SignalError::Negotiation(_)));
    }
}
