use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::peer::types::{IceCandidate, SessionDescription};

/// Состояние соединения, как его сообщает движок
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Входящий медиапоток (один на зрителя)
#[derive(Clone)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    /// None у движков без реального медиа
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("has_track", &self.track.is_some())
            .finish()
    }
}

/// События от peer connection
#[derive(Debug)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    RemoteStream(RemoteStream),
    StateChanged(LinkState),
}

pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// Исходящее медиа хоста. Треки принадлежат тому, кто их создал:
/// сессия только подключает их к соединениям и никогда не останавливает.
#[derive(Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.tracks.iter().map(|t| t.id()).collect();
        f.debug_struct("LocalMedia").field("tracks", &ids).finish()
    }
}

/// Одно peer connection поверх WebRTC движка
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn label(&self) -> &str;

    async fn attach_media(&self, media: &LocalMedia) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Идемпотентно, безопасно на любой стадии переговоров
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Фабрика peer connections
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn new_link(&self, label: &str) -> Result<(Arc<dyn PeerLink>, LinkEvents)>;
}
