//! In-process реализация сигнального канала.
//!
//! Экземпляр создаётся явно и передаётся участникам по ссылке; общего
//! глобального состояния нет. Удобна для тестов и локальных демо, а
//! `set_offline`/`fail_next_writes` позволяют имитировать недоступность
//! хранилища.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, trace};

use crate::error::{Result, SignalError};
use crate::peer::types::{
    CandidateDirection, IceCandidate, ViewerDocument, ViewerPatch, ViewerRecord,
};
use crate::session::{SessionId, ViewerId};
use crate::signaling::{SignalingChannel, Subscription, ViewerChange};

#[derive(Debug)]
struct ViewerEntry {
    record: ViewerRecord,
    creator_candidates: Vec<IceCandidate>,
    viewer_candidates: Vec<IceCandidate>,
}

impl ViewerEntry {
    fn candidates(&self, direction: CandidateDirection) -> &Vec<IceCandidate> {
        match direction {
            CandidateDirection::Creator => &self.creator_candidates,
            CandidateDirection::Viewer => &self.viewer_candidates,
        }
    }

    fn candidates_mut(&mut self, direction: CandidateDirection) -> &mut Vec<IceCandidate> {
        match direction {
            CandidateDirection::Creator => &mut self.creator_candidates,
            CandidateDirection::Viewer => &mut self.viewer_candidates,
        }
    }
}

#[derive(Default)]
struct SessionDocs {
    viewers: BTreeMap<ViewerId, ViewerEntry>,
    viewer_watchers: Vec<UnboundedSender<ViewerChange>>,
    record_watchers: HashMap<ViewerId, Vec<UnboundedSender<Option<ViewerRecord>>>>,
    candidate_watchers: HashMap<(ViewerId, CandidateDirection), Vec<UnboundedSender<IceCandidate>>>,
}

impl SessionDocs {
    /// Выбрасывает подписки, чьи receiver уже отброшены
    fn prune_watchers(&mut self) {
        self.viewer_watchers.retain(|tx| !tx.is_closed());
        self.record_watchers.retain(|_, subs| {
            subs.retain(|tx| !tx.is_closed());
            !subs.is_empty()
        });
        self.candidate_watchers.retain(|_, subs| {
            subs.retain(|tx| !tx.is_closed());
            !subs.is_empty()
        });
    }

    fn is_idle(&self) -> bool {
        self.viewers.is_empty()
            && self.viewer_watchers.is_empty()
            && self.record_watchers.is_empty()
            && self.candidate_watchers.is_empty()
    }
}

/// Снимает сессию, в которой не осталось ни записей, ни живых подписок
fn release_if_idle(sessions: &mut HashMap<SessionId, SessionDocs>, session: &SessionId) {
    if let Some(docs) = sessions.get_mut(session) {
        docs.prune_watchers();
        if docs.is_idle() {
            sessions.remove(session);
            trace!(%session, "idle session released");
        }
    }
}

fn record_missing(session: &SessionId, viewer: &ViewerId) -> SignalError {
    SignalError::RecordMissing {
        session: session.to_string(),
        viewer: viewer.to_string(),
    }
}

#[derive(Default)]
pub struct MemoryChannel {
    sessions: Mutex<HashMap<SessionId, SessionDocs>>,
    offline: AtomicBool,
    failing_writes: AtomicU32,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Пока offline, все записи и подписки завершаются ошибкой канала
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Следующие `n` записей завершатся временной ошибкой
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn viewer_record(&self, session: &SessionId, viewer: &ViewerId) -> Option<ViewerRecord> {
        self.docs()
            .get(session)
            .and_then(|s| s.viewers.get(viewer))
            .map(|e| e.record.clone())
    }

    /// Документ зрителя в плоской форме хранилища
    pub fn document(&self, session: &SessionId, viewer: &ViewerId) -> Option<ViewerDocument> {
        self.viewer_record(session, viewer)
            .map(|record| ViewerDocument::from(&record))
    }

    pub fn candidates(
        &self,
        session: &SessionId,
        viewer: &ViewerId,
        direction: CandidateDirection,
    ) -> Vec<IceCandidate> {
        self.docs()
            .get(session)
            .and_then(|s| s.viewers.get(viewer))
            .map(|e| e.candidates(direction).clone())
            .unwrap_or_default()
    }

    pub fn viewer_count(&self, session: &SessionId) -> usize {
        self.docs()
            .get(session)
            .map(|s| s.viewers.len())
            .unwrap_or(0)
    }

    fn docs(&self) -> MutexGuard<'_, HashMap<SessionId, SessionDocs>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_read(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SignalError::channel("backend unavailable"));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.check_read()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(SignalError::channel("injected write failure"));
        }
        Ok(())
    }
}

/// Рассылает событие живым подписчикам и выбрасывает отписавшихся
fn broadcast<T: Clone>(subs: &mut Vec<UnboundedSender<T>>, item: &T) {
    subs.retain(|tx| tx.send(item.clone()).is_ok());
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    async fn merge_viewer(
        &self,
        session: &SessionId,
        viewer: &ViewerId,
        patch: ViewerPatch,
    ) -> Result<()> {
        self.check_write()?;
        let field = patch.name();
        let mut sessions = self.docs();
        let docs = sessions.entry(session.clone()).or_default();

        let created = !docs.viewers.contains_key(viewer);
        // только join создаёт документ; offer/answer в удалённую запись
        // означают, что зритель уже ушёл
        if created && patch != ViewerPatch::Join {
            release_if_idle(&mut sessions, session);
            return Err(record_missing(session, viewer));
        }
        let updated = match docs.viewers.get(viewer) {
            Some(entry) => entry.record.apply(patch)?,
            None => ViewerRecord::Joined,
        };

        let entry = docs
            .viewers
            .entry(viewer.clone())
            .or_insert_with(|| ViewerEntry {
                record: ViewerRecord::Empty,
                creator_candidates: Vec::new(),
                viewer_candidates: Vec::new(),
            });
        let changed = entry.record != updated;
        entry.record = updated.clone();
        trace!(%session, %viewer, field, created, changed, "viewer record merged");

        if created {
            broadcast(&mut docs.viewer_watchers, &ViewerChange::Added(viewer.clone()));
        }
        if changed {
            if let Some(subs) = docs.record_watchers.get_mut(viewer) {
                broadcast(subs, &Some(updated));
            }
        }
        Ok(())
    }

    async fn delete_viewer(&self, session: &SessionId, viewer: &ViewerId) -> Result<()> {
        self.check_write()?;
        let mut sessions = self.docs();
        let Some(docs) = sessions.get_mut(session) else {
            return Ok(());
        };
        if docs.viewers.remove(viewer).is_none() {
            return Ok(());
        }
        debug!(%session, %viewer, "viewer record deleted");

        broadcast(&mut docs.viewer_watchers, &ViewerChange::Removed(viewer.clone()));
        if let Some(mut subs) = docs.record_watchers.remove(viewer) {
            broadcast(&mut subs, &None);
        }
        // подколлекции кандидатов уходят вместе с записью
        for direction in [CandidateDirection::Creator, CandidateDirection::Viewer] {
            docs.candidate_watchers.remove(&(viewer.clone(), direction));
        }
        release_if_idle(&mut sessions, session);
        Ok(())
    }

    async fn watch_viewers(&self, session: &SessionId) -> Result<Subscription<ViewerChange>> {
        self.check_read()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut docs = self.docs();
        let docs = docs.entry(session.clone()).or_default();
        docs.prune_watchers();
        for viewer in docs.viewers.keys() {
            let _ = tx.send(ViewerChange::Added(viewer.clone()));
        }
        docs.viewer_watchers.push(tx);
        Ok(rx)
    }

    async fn watch_viewer(
        &self,
        session: &SessionId,
        viewer: &ViewerId,
    ) -> Result<Subscription<Option<ViewerRecord>>> {
        self.check_read()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut docs = self.docs();
        let docs = docs.entry(session.clone()).or_default();
        docs.prune_watchers();
        if let Some(entry) = docs.viewers.get(viewer) {
            let _ = tx.send(Some(entry.record.clone()));
        }
        docs.record_watchers
            .entry(viewer.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn append_candidate(
        &self,
        session: &SessionId,
        viewer: &ViewerId,
        direction: CandidateDirection,
        candidate: IceCandidate,
    ) -> Result<()> {
        self.check_write()?;
        let mut sessions = self.docs();
        let Some(docs) = sessions.get_mut(session) else {
            return Err(record_missing(session, viewer));
        };
        let Some(entry) = docs.viewers.get_mut(viewer) else {
            return Err(record_missing(session, viewer));
        };
        entry.candidates_mut(direction).push(candidate.clone());
        trace!(%session, %viewer, collection = direction.collection(), "candidate appended");

        if let Some(subs) = docs.candidate_watchers.get_mut(&(viewer.clone(), direction)) {
            broadcast(subs, &candidate);
        }
        Ok(())
    }

    async fn watch_candidates(
        &self,
        session: &SessionId,
        viewer: &ViewerId,
        direction: CandidateDirection,
    ) -> Result<Subscription<IceCandidate>> {
        self.check_read()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut docs = self.docs();
        let docs = docs.entry(session.clone()).or_default();
        docs.prune_watchers();
        if let Some(entry) = docs.viewers.get(viewer) {
            for candidate in entry.candidates(direction) {
                let _ = tx.send(candidate.clone());
            }
        }
        docs.candidate_watchers
            .entry((viewer.clone(), direction))
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::SessionDescription;

    fn ids() -> (SessionId, ViewerId) {
        (SessionId::from("s1"), ViewerId::from("v1"))
    }

    #[tokio::test]
    async fn join_is_announced_and_delete_is_a_removal() {
        let store = MemoryChannel::new();
        let (s, v) = ids();
        let mut viewers = store.watch_viewers(&s).await.unwrap();

        store.merge_viewer(&s, &v, ViewerPatch::Join).await.unwrap();
        // повторный join не создаёт второе Added
        store.merge_viewer(&s, &v, ViewerPatch::Join).await.unwrap();
        store.delete_viewer(&s, &v).await.unwrap();
        store.delete_viewer(&s, &v).await.unwrap();

        assert_eq!(viewers.recv().await, Some(ViewerChange::Added(v.clone())));
        assert_eq!(viewers.recv().await, Some(ViewerChange::Removed(v.clone())));
        assert!(viewers.try_recv().is_err());
        assert_eq!(store.viewer_count(&s), 0);
    }

    #[tokio::test]
    async fn offer_merge_keeps_joined_flag() {
        let store = MemoryChannel::new();
        let (s, v) = ids();
        store.merge_viewer(&s, &v, ViewerPatch::Join).await.unwrap();
        store
            .merge_viewer(&s, &v, ViewerPatch::Offer(SessionDescription::offer("o")))
            .await
            .unwrap();
        let doc = store.document(&s, &v).unwrap();
        assert!(doc.joined);
        assert_eq!(doc.offer, Some(SessionDescription::offer("o")));
        assert_eq!(doc.answer, None);
    }

    #[tokio::test]
    async fn offer_to_missing_record_does_not_resurrect_it() {
        let store = MemoryChannel::new();
        let (s, v) = ids();
        let err = store
            .merge_viewer(&s, &v, ViewerPatch::Offer(SessionDescription::offer("o")))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::RecordMissing { .. }));
        assert!(store.viewer_record(&s, &v).is_none());
    }

    #[tokio::test]
    async fn record_watch_sees_snapshot_then_changes_then_deletion() {
        let store = MemoryChannel::new();
        let (s, v) = ids();
        store.merge_viewer(&s, &v, ViewerPatch::Join).await.unwrap();
        let mut rec = store.watch_viewer(&s, &v).await.unwrap();
        store
            .merge_viewer(&s, &v, ViewerPatch::Offer(SessionDescription::offer("o")))
            .await
            .unwrap();
        store.delete_viewer(&s, &v).await.unwrap();

        assert_eq!(rec.recv().await, Some(Some(ViewerRecord::Joined)));
        assert!(matches!(rec.recv().await, Some(Some(ViewerRecord::Offered { .. }))));
        assert_eq!(rec.recv().await, Some(None));
    }

    #[tokio::test]
    async fn candidates_replay_in_append_order() {
        let store = MemoryChannel::new();
        let (s, v) = ids();
        store.merge_viewer(&s, &v, ViewerPatch::Join).await.unwrap();
        for n in 0..3 {
            let candidate = IceCandidate::new(format!("c{n}"));
            store
                .append_candidate(&s, &v, CandidateDirection::Viewer, candidate)
                .await
                .unwrap();
        }
        let mut sub = store
            .watch_candidates(&s, &v, CandidateDirection::Viewer)
            .await
            .unwrap();
        store
            .append_candidate(&s, &v, CandidateDirection::Viewer, IceCandidate::new("c3"))
            .await
            .unwrap();

        for n in 0..4 {
            assert_eq!(sub.recv().await.unwrap().candidate, format!("c{n}"));
        }
        assert!(store
            .candidates(&s, &v, CandidateDirection::Creator)
            .is_empty());
    }

    fn record_watcher_entries(store: &MemoryChannel, session: &SessionId) -> usize {
        store
            .docs()
            .get(session)
            .map_or(0, |docs| docs.record_watchers.len())
    }

    #[tokio::test]
    async fn deleted_viewers_leave_no_watcher_entries() {
        let store = MemoryChannel::new();
        let s = SessionId::from("s1");
        let mut subs = Vec::new();

        for n in 0..100 {
            let v = ViewerId::from(format!("v{n}"));
            store.merge_viewer(&s, &v, ViewerPatch::Join).await.unwrap();
            subs.push(store.watch_viewer(&s, &v).await.unwrap());
            store
                .watch_candidates(&s, &v, CandidateDirection::Creator)
                .await
                .unwrap();
            store.delete_viewer(&s, &v).await.unwrap();
        }

        assert_eq!(record_watcher_entries(&store, &s), 0);
        assert!(store.docs().is_empty());
        // подписчик успел получить удаление
        assert_eq!(subs[0].recv().await, Some(Some(ViewerRecord::Joined)));
        assert_eq!(subs[0].recv().await, Some(None));
    }

    #[tokio::test]
    async fn idle_session_is_released_after_watchers_drop() {
        let store = MemoryChannel::new();
        let (s, v) = ids();

        let viewers = store.watch_viewers(&s).await.unwrap();
        let record = store.watch_viewer(&s, &ViewerId::from("never")).await.unwrap();
        drop(viewers);
        drop(record);
        assert_eq!(store.docs().len(), 1);

        // offer в несуществующую запись ничего не создаёт
        assert!(store
            .merge_viewer(&s, &v, ViewerPatch::Offer(SessionDescription::offer("o")))
            .await
            .is_err());
        assert!(store.docs().is_empty());

        assert!(store
            .append_candidate(&s, &v, CandidateDirection::Viewer, IceCandidate::new("c"))
            .await
            .is_err());
        assert!(store.docs().is_empty());

        let live = store.watch_viewers(&s).await.unwrap();
        store.merge_viewer(&s, &v, ViewerPatch::Join).await.unwrap();
        store.delete_viewer(&s, &v).await.unwrap();
        assert_eq!(store.docs().len(), 1);
        drop(live);
    }

    #[tokio::test]
    async fn offline_store_rejects_reads_and_writes() {
        let store = MemoryChannel::new();
        let (s, v) = ids();
        store.set_offline(true);
        assert!(store.merge_viewer(&s, &v, ViewerPatch::Join).await.unwrap_err().is_transient());
        assert!(store.watch_viewers(&s).await.is_err());
        store.set_offline(false);

        store.fail_next_writes(1);
        assert!(store.merge_viewer(&s, &v, ViewerPatch::Join).await.is_err());
        assert!(store.merge_viewer(&s, &v, ViewerPatch::Join).await.is_ok());
    }
}
