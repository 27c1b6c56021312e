//! Зритель: одно входящее соединение к хосту трансляции.
//!
//! Зритель сам создаёт и сам удаляет свою запись; удаление записи
//! единственный способ сообщить хосту об уходе.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SignalConfig;
use crate::error::{Result, SignalError};
use crate::peer::engine::{LinkEvent, LinkEvents, LinkState, PeerEngine, PeerLink, RemoteStream};
use crate::peer::ice::{apply_pending_candidates, deliver_remote_candidate};
use crate::peer::state::{NegotiationState, PeerSlot, Role};
use crate::peer::types::{
    CandidateDirection, IceCandidate, SessionDescription, ViewerPatch, ViewerRecord,
};
use crate::session::{SessionId, ViewerId};
use crate::signaling::{recv_or_pending, with_retry, RetryPolicy, SignalingChannel, Subscription};

type StreamCallback = Box<dyn FnOnce(RemoteStream) + Send>;

/// Подключается к трансляции. Возвращается после записи присутствия;
/// `on_stream` вызывается один раз, когда придёт медиапоток хоста.
pub async fn join_stream<F>(
    channel: Arc<dyn SignalingChannel>,
    engine: Arc<dyn PeerEngine>,
    session_id: SessionId,
    viewer_id: ViewerId,
    on_stream: F,
    config: SignalConfig,
) -> Result<ViewerSession>
where
    F: FnOnce(RemoteStream) + Send + 'static,
{
    config.validate()?;
    let (link, link_events) = engine.new_link(viewer_id.as_str()).await?;

    // подписки до записи join, чтобы offer хоста не проскочил мимо
    let subscribed = async {
        let record = channel.watch_viewer(&session_id, &viewer_id).await?;
        let candidates = channel
            .watch_candidates(&session_id, &viewer_id, CandidateDirection::Creator)
            .await?;
        Ok::<_, SignalError>((record, candidates))
    }
    .await;
    let (record, candidates) = match subscribed {
        Ok(subs) => subs,
        Err(e) => {
            link.close().await;
            return Err(e);
        }
    };

    let token = CancellationToken::new();
    let retry = RetryPolicy::from_config(&config);
    let joined = with_retry(&retry, "join", &token, || {
        channel.merge_viewer(&session_id, &viewer_id, ViewerPatch::Join)
    })
    .await;
    if let Err(e) = joined {
        link.close().await;
        return Err(e);
    }
    info!(session = %session_id, viewer = %viewer_id, "joined stream");

    let (state_tx, state_rx) = watch::channel(NegotiationState::Init);
    let task = ViewerTask {
        session_id: session_id.clone(),
        viewer_id: viewer_id.clone(),
        channel: Arc::clone(&channel),
        link: Arc::clone(&link),
        retry: retry.clone(),
        token: token.clone(),
        state: state_tx,
        slot: PeerSlot::new(Role::Viewer, config.max_pending_candidates),
        on_stream: Some(Box::new(on_stream)),
    };
    let handle = tokio::spawn(task.run(record, candidates, link_events));

    Ok(ViewerSession {
        session_id,
        viewer_id,
        channel,
        link,
        retry,
        token,
        state: state_rx,
        task: Mutex::new(Some(handle)),
        left: AtomicBool::new(false),
    })
}

/// Хэндл зрителя. `cancel` идемпотентен и удаляет запись зрителя ровно
/// один раз; drop делает то же самое в фоне, если есть runtime.
pub struct ViewerSession {
    session_id: SessionId,
    viewer_id: ViewerId,
    channel: Arc<dyn SignalingChannel>,
    link: Arc<dyn PeerLink>,
    retry: RetryPolicy,
    token: CancellationToken,
    state: watch::Receiver<NegotiationState>,
    task: Mutex<Option<JoinHandle<()>>>,
    left: AtomicBool,
}

impl ViewerSession {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn viewer_id(&self) -> &ViewerId {
        &self.viewer_id
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    /// Останавливает подписки, закрывает соединение и удаляет запись,
    /// чтобы хост освободил свою сторону
    pub async fn cancel(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                error!(viewer = %self.viewer_id, error = %e, "viewer task panicked");
            }
        }
        self.link.close().await;

        // свежий токен: отмена сессии не должна прерывать удаление
        let removed = with_retry(&self.retry, "leave", &CancellationToken::new(), || {
            self.channel.delete_viewer(&self.session_id, &self.viewer_id)
        })
        .await;
        match removed {
            Ok(()) => info!(session = %self.session_id, viewer = %self.viewer_id, "left stream"),
            Err(e) => warn!(
                session = %self.session_id,
                viewer = %self.viewer_id,
                error = %e,
                "failed to delete viewer record"
            ),
        }
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(viewer = %self.viewer_id, "viewer dropped outside runtime, record not deleted");
            return;
        };
        let channel = Arc::clone(&self.channel);
        let link = Arc::clone(&self.link);
        let session_id = self.session_id.clone();
        let viewer_id = self.viewer_id.clone();
        runtime.spawn(async move {
            link.close().await;
            if let Err(e) = channel.delete_viewer(&session_id, &viewer_id).await {
                warn!(viewer = %viewer_id, error = %e, "failed to delete viewer record on drop");
            }
        });
    }
}

struct ViewerTask {
    session_id: SessionId,
    viewer_id: ViewerId,
    channel: Arc<dyn SignalingChannel>,
    link: Arc<dyn PeerLink>,
    retry: RetryPolicy,
    token: CancellationToken,
    state: watch::Sender<NegotiationState>,
    slot: PeerSlot,
    on_stream: Option<StreamCallback>,
}

impl ViewerTask {
    async fn run(
        mut self,
        record: Subscription<Option<ViewerRecord>>,
        candidates: Subscription<IceCandidate>,
        mut link_events: LinkEvents,
    ) {
        let token = self.token.clone();
        let mut record = Some(record);
        let mut candidates = Some(candidates);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                update = recv_or_pending(&mut record) => match update {
                    Some(Some(rec)) => {
                        if let Err(e) = self.on_record(rec).await {
                            warn!(
                                session = %self.session_id,
                                viewer = %self.viewer_id,
                                error = %e,
                                "negotiation failed"
                            );
                            break;
                        }
                    }
                    Some(None) => {
                        info!(viewer = %self.viewer_id, "viewer record removed, stopping");
                        break;
                    }
                    None => record = None,
                },
                candidate = recv_or_pending(&mut candidates) => match candidate {
                    Some(candidate) => {
                        let link = self.link.as_ref();
                        deliver_remote_candidate(&mut self.slot, link, candidate).await;
                    }
                    None => candidates = None,
                },
                event = link_events.recv() => match event {
                    Some(LinkEvent::LocalCandidate(candidate)) => {
                        self.publish_candidate(candidate).await;
                    }
                    Some(LinkEvent::RemoteStream(stream)) => self.deliver_stream(stream),
                    Some(LinkEvent::StateChanged(LinkState::Connected)) => {
                        if self.slot.connected() {
                            self.set_state();
                            info!(viewer = %self.viewer_id, "connected to host");
                        }
                    }
                    Some(LinkEvent::StateChanged(LinkState::Closed)) | None => {
                        debug!(viewer = %self.viewer_id, "connection closed by engine");
                        break;
                    }
                    Some(LinkEvent::StateChanged(
                        st @ (LinkState::Disconnected | LinkState::Failed),
                    )) => {
                        warn!(viewer = %self.viewer_id, state = ?st, "connection to host lost");
                    }
                    Some(LinkEvent::StateChanged(st)) => {
                        debug!(viewer = %self.viewer_id, state = ?st, "link state");
                    }
                },
            }
        }

        self.link.close().await;
        self.slot.close();
        self.set_state();
    }

    async fn on_record(&mut self, record: ViewerRecord) -> Result<()> {
        // повторный offer (перепереговоры) не поддерживается
        if !self.slot.accepts_offer() {
            return Ok(());
        }
        match record.offer() {
            Some(offer) => self.accept_offer(offer.clone()).await,
            None => Ok(()),
        }
    }

    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<()> {
        self.link.set_remote_description(offer).await?;
        self.slot.remote_description_applied()?;
        self.set_state();

        let flushed = apply_pending_candidates(&mut self.slot, self.link.as_ref()).await;
        debug!(viewer = %self.viewer_id, flushed, "offer applied");

        let answer = self.link.create_answer().await?;
        self.link.set_local_description(answer.clone()).await?;

        let channel = &self.channel;
        let session_id = &self.session_id;
        let viewer_id = &self.viewer_id;
        with_retry(&self.retry, "answer", &self.token, || {
            channel.merge_viewer(session_id, viewer_id, ViewerPatch::Answer(answer.clone()))
        })
        .await?;

        self.slot.answer_sent()?;
        self.set_state();
        debug!(session = %session_id, viewer = %viewer_id, "answer written");
        Ok(())
    }

    async fn publish_candidate(&mut self, candidate: IceCandidate) {
        let written = with_retry(&self.retry, "viewer candidate", &self.token, || {
            self.channel.append_candidate(
                &self.session_id,
                &self.viewer_id,
                CandidateDirection::Viewer,
                candidate.clone(),
            )
        })
        .await;

        match written {
            Ok(()) => {}
            Err(SignalError::RecordMissing { .. }) => {
                debug!(viewer = %self.viewer_id, "own record gone, candidate not published");
            }
            Err(e) => {
                warn!(viewer = %self.viewer_id, error = %e, "failed to publish local candidate");
            }
        }
    }

    fn deliver_stream(&mut self, stream: RemoteStream) {
        match self.on_stream.take() {
            Some(callback) => {
                info!(
                    viewer = %self.viewer_id,
                    stream = %stream.stream_id,
                    track = %stream.track_id,
                    "remote stream received"
                );
                callback(stream);
            }
            None => debug!(viewer = %self.viewer_id, ?stream, "extra remote track ignored"),
        }
    }

    fn set_state(&self) {
        let _ = self.state.send(self.slot.state());
    }
}
