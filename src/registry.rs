//! Реестр соединений хоста: viewer id → живое соединение.
//!
//! Запись резервируется до создания соединения, поэтому повторное
//! уведомление о том же зрителе не создаёт второе соединение. Каждая
//! резервация получает поколение: задача зрителя может освободить только
//! свою запись, даже если зритель успел уйти и вернуться.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::peer::engine::PeerLink;
use crate::peer::state::NegotiationState;
use crate::session::ViewerId;

struct RegistryEntry {
    generation: u64,
    token: CancellationToken,
    link: Option<Arc<dyn PeerLink>>,
    state: watch::Receiver<NegotiationState>,
}

/// Выдаётся задаче зрителя при успешной резервации
pub struct Reservation {
    pub viewer_id: ViewerId,
    pub generation: u64,
    pub token: CancellationToken,
    pub state: watch::Sender<NegotiationState>,
}

/// Снятая с реестра запись
pub struct Detached {
    pub link: Option<Arc<dyn PeerLink>>,
}

impl Detached {
    pub async fn close(self) {
        if let Some(link) = self.link {
            link.close().await;
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<ViewerId, RegistryEntry>>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// None если для зрителя уже есть запись
    pub fn reserve(&self, viewer_id: &ViewerId, parent: &CancellationToken) -> Option<Reservation> {
        let mut entries = self.entries();
        if entries.contains_key(viewer_id) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let token = parent.child_token();
        let (state_tx, state_rx) = watch::channel(NegotiationState::Init);
        entries.insert(
            viewer_id.clone(),
            RegistryEntry {
                generation,
                token: token.clone(),
                link: None,
                state: state_rx,
            },
        );
        Some(Reservation {
            viewer_id: viewer_id.clone(),
            generation,
            token,
            state: state_tx,
        })
    }

    /// Привязывает готовое соединение. false если запись уже снята
    /// (зритель ушёл, пока соединение создавалось).
    pub fn attach_link(
        &self,
        viewer_id: &ViewerId,
        generation: u64,
        link: Arc<dyn PeerLink>,
    ) -> bool {
        match self.entries().get_mut(viewer_id) {
            Some(entry) if entry.generation == generation => {
                entry.link = Some(link);
                true
            }
            _ => false,
        }
    }

    /// Снимает запись указанного поколения, отдаёт соединение для закрытия
    pub fn release(&self, viewer_id: &ViewerId, generation: u64) -> Option<Arc<dyn PeerLink>> {
        let mut entries = self.entries();
        match entries.get(viewer_id) {
            Some(entry) if entry.generation == generation => entries
                .remove(viewer_id)
                .and_then(|entry| entry.link),
            _ => None,
        }
    }

    /// Снимает запись и отменяет задачу зрителя синхронно; соединение
    /// (если уже создано) отдаётся вызывающему для закрытия
    pub fn detach(&self, viewer_id: &ViewerId) -> Option<Detached> {
        let entry = self.entries().remove(viewer_id)?;
        entry.token.cancel();
        Some(Detached { link: entry.link })
    }

    /// Закрывает все соединения. Повторный вызов ничего не делает.
    pub async fn close_all(&self) {
        let drained: Vec<(ViewerId, RegistryEntry)> = self.entries().drain().collect();
        for (viewer_id, entry) in drained {
            entry.token.cancel();
            if let Some(link) = entry.link {
                link.close().await;
            }
            debug!(viewer = %viewer_id, "viewer connection closed");
        }
    }

    pub fn contains(&self, viewer_id: &ViewerId) -> bool {
        self.entries().contains_key(viewer_id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn viewer_ids(&self) -> Vec<ViewerId> {
        let mut ids: Vec<ViewerId> = self.entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn state_of(&self, viewer_id: &ViewerId) -> Option<NegotiationState> {
        self.entries().get(viewer_id).map(|e| *e.state.borrow())
    }

    pub fn watch_state(&self, viewer_id: &ViewerId) -> Option<watch::Receiver<NegotiationState>> {
        self.entries().get(viewer_id).map(|e| e.state.clone())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ViewerId, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
