use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::session::{SessionId, ViewerId};

const EVENT_CAPACITY: usize = 128;

/// Уведомления хоста о зрителях
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ViewerJoined { viewer_id: ViewerId },
    ViewerConnected { viewer_id: ViewerId },
    ViewerLeft { viewer_id: ViewerId },
    /// Переговоры или соединение этого зрителя не удались; остальные
    /// зрители не затронуты
    ViewerFailed { viewer_id: ViewerId, reason: String },
}

/// Шина событий одной трансляции. Без подписчиков события только пишутся в лог.
#[derive(Clone)]
pub struct EventBus {
    session: SessionId,
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(session: SessionId) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { session, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        debug!(session = %self.session, ?event, "emit session event");
        let _ = self.tx.send(event);
    }

    pub fn emit_joined(&self, viewer_id: &ViewerId) {
        info!(session = %self.session, viewer = %viewer_id, "viewer joined");
        self.emit(SessionEvent::ViewerJoined {
            viewer_id: viewer_id.clone(),
        });
    }

    pub fn emit_connected(&self, viewer_id: &ViewerId) {
        info!(session = %self.session, viewer = %viewer_id, "viewer connected");
        self.emit(SessionEvent::ViewerConnected {
            viewer_id: viewer_id.clone(),
        });
    }

    pub fn emit_left(&self, viewer_id: &ViewerId) {
        info!(session = %self.session, viewer = %viewer_id, "viewer left");
        self.emit(SessionEvent::ViewerLeft {
            viewer_id: viewer_id.clone(),
        });
    }

    pub fn emit_failed(&self, viewer_id: &ViewerId, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(session = %self.session, viewer = %viewer_id, %reason, "viewer connection failed");
        self.emit(SessionEvent::ViewerFailed {
            viewer_id: viewer_id.clone(),
            reason,
        });
    }
}
