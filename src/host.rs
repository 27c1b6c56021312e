//! Хост трансляции: одно исходящее соединение на каждого зрителя.
//!
//! Супервизор слушает структурные изменения коллекции viewers и на каждого
//! нового зрителя запускает отдельную задачу со своим `PeerSlot`. Уход
//! зрителя (удаление записи) снимает запись реестра и отменяет задачу.
//! Хост никогда не пишет и не удаляет данные, принадлежащие зрителю,
//! кроме своего offer и своих кандидатов.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SignalConfig;
use crate::error::{Result, SignalError};
use crate::events::{EventBus, SessionEvent};
use crate::peer::engine::{LinkEvent, LinkEvents, LinkState, LocalMedia, PeerEngine, PeerLink};
use crate::peer::ice::{analyze_candidates, apply_pending_candidates, deliver_remote_candidate};
use crate::peer::state::{NegotiationState, PeerSlot, Role};
use crate::peer::types::{CandidateDirection, IceCandidate, ViewerPatch, ViewerRecord};
use crate::registry::{Reservation, SessionRegistry};
use crate::session::{Session, SessionId, ViewerId};
use crate::signaling::{
    recv_or_pending, with_retry, RetryPolicy, SignalingChannel, Subscription, ViewerChange,
};

struct HostContext {
    session_id: SessionId,
    channel: Arc<dyn SignalingChannel>,
    engine: Arc<dyn PeerEngine>,
    media: LocalMedia,
    config: SignalConfig,
    retry: RetryPolicy,
    registry: Arc<SessionRegistry>,
    events: EventBus,
}

/// Запускает трансляцию: подписывается на зрителей сессии и ведёт
/// переговоры с каждым. Ошибка подписки возвращается сразу.
pub async fn start_hosting(
    channel: Arc<dyn SignalingChannel>,
    engine: Arc<dyn PeerEngine>,
    session: Session,
    media: LocalMedia,
    config: SignalConfig,
) -> Result<HostSession> {
    config.validate()?;
    if media.is_empty() {
        return Err(SignalError::engine("no local media tracks to publish"));
    }

    let viewers = channel.watch_viewers(&session.id).await?;

    let token = CancellationToken::new();
    let registry = Arc::new(SessionRegistry::new());
    let events = EventBus::new(session.id.clone());

    info!(
        session = %session.id,
        host = %session.host_id,
        tracks = media.tracks().len(),
        "hosting started"
    );

    let ctx = Arc::new(HostContext {
        session_id: session.id.clone(),
        channel,
        engine,
        media,
        retry: RetryPolicy::from_config(&config),
        config,
        registry: Arc::clone(&registry),
        events: events.clone(),
    });
    let supervisor = tokio::spawn(supervise(ctx, viewers, token.clone()));

    Ok(HostSession {
        session,
        token,
        registry,
        events,
        supervisor: Mutex::new(Some(supervisor)),
    })
}

/// Хэндл трансляции. `cancel` идемпотентен; drop тоже отменяет
/// трансляцию, соединения при этом закрывают их задачи.
pub struct HostSession {
    session: Session,
    token: CancellationToken,
    registry: Arc<SessionRegistry>,
    events: EventBus,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl HostSession {
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Останавливает подписки и закрывает все соединения. После
    /// возврата ни одна задача трансляции больше не работает, в том
    /// числе для параллельных вызовов: они ждут того же завершения.
    pub async fn cancel(&self) {
        self.token.cancel();
        // замок держится до конца закрытия
        let mut supervisor = self.supervisor.lock().await;
        if let Some(handle) = supervisor.take() {
            if let Err(e) = handle.await {
                error!(session = %self.session.id, error = %e, "host supervisor panicked");
            }
            info!(session = %self.session.id, "hosting stopped");
        }
        self.registry.close_all().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn viewer_ids(&self) -> Vec<ViewerId> {
        self.registry.viewer_ids()
    }

    pub fn viewer_state(&self, viewer_id: &ViewerId) -> Option<NegotiationState> {
        self.registry.state_of(viewer_id)
    }

    pub fn watch_viewer_state(
        &self,
        viewer_id: &ViewerId,
    ) -> Option<watch::Receiver<NegotiationState>> {
        self.registry.watch_state(viewer_id)
    }

    /// Число живых записей реестра
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn supervise(
    ctx: Arc<HostContext>,
    mut viewers: Subscription<ViewerChange>,
    token: CancellationToken,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            change = viewers.recv() => match change {
                Some(ViewerChange::Added(viewer_id)) => {
                    match ctx.registry.reserve(&viewer_id, &token) {
                        Some(reservation) => {
                            ctx.events.emit_joined(&viewer_id);
                            tasks.spawn(run_viewer(Arc::clone(&ctx), reservation));
                        }
                        None => debug!(
                            session = %ctx.session_id,
                            viewer = %viewer_id,
                            "viewer already has a connection, ignoring"
                        ),
                    }
                }
                Some(ViewerChange::Removed(viewer_id)) => {
                    if let Some(detached) = ctx.registry.detach(&viewer_id) {
                        ctx.events.emit_left(&viewer_id);
                        tasks.spawn(detached.close());
                    }
                }
                None => {
                    warn!(session = %ctx.session_id, "viewer watch closed by channel");
                    break;
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!(session = %ctx.session_id, error = %e, "viewer task panicked");
                }
            }
        }
    }

    token.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(session = %ctx.session_id, error = %e, "viewer task panicked");
        }
    }
    ctx.registry.close_all().await;
}

enum Exit {
    Cancelled,
    /// Запись зрителя исчезла раньше, чем хост успел записать offer
    Left,
    Failed(String),
}

async fn run_viewer(ctx: Arc<HostContext>, reservation: Reservation) {
    let Reservation {
        viewer_id,
        generation,
        token,
        state,
    } = reservation;

    let (link, link_events) = match ctx.engine.new_link(viewer_id.as_str()).await {
        Ok(created) => created,
        Err(e) => {
            if !token.is_cancelled() {
                ctx.events.emit_failed(&viewer_id, e.to_string());
                ctx.registry.release(&viewer_id, generation);
            }
            let _ = state.send(NegotiationState::Closed);
            return;
        }
    };

    let attached = !token.is_cancelled()
        && ctx
            .registry
            .attach_link(&viewer_id, generation, Arc::clone(&link));
    if !attached {
        link.close().await;
        let _ = state.send(NegotiationState::Closed);
        return;
    }

    let mut task = ViewerTask {
        slot: PeerSlot::new(Role::Host, ctx.config.max_pending_candidates),
        ctx,
        viewer_id,
        token,
        state,
        link,
        published: Vec::new(),
    };

    match task.run(link_events).await {
        Exit::Cancelled => {
            debug!(
                session = %task.ctx.session_id,
                viewer = %task.viewer_id,
                "viewer task cancelled"
            );
        }
        Exit::Left => {
            debug!(
                session = %task.ctx.session_id,
                viewer = %task.viewer_id,
                "viewer left before offer was written"
            );
        }
        Exit::Failed(reason) => {
            if !task.token.is_cancelled() {
                task.ctx.events.emit_failed(&task.viewer_id, reason);
                task.ctx.registry.release(&task.viewer_id, generation);
            }
        }
    }

    task.link.close().await;
    task.slot.close();
    let _ = task.state.send(NegotiationState::Closed);
}

struct ViewerTask {
    ctx: Arc<HostContext>,
    viewer_id: ViewerId,
    token: CancellationToken,
    state: watch::Sender<NegotiationState>,
    link: Arc<dyn PeerLink>,
    slot: PeerSlot,
    /// Наши кандидаты, для диагностики после CONNECTED
    published: Vec<IceCandidate>,
}

type Timer = Option<Pin<Box<Sleep>>>;

async fn sleep_opt(timer: &mut Timer) {
    match timer {
        Some(t) => t.as_mut().await,
        None => pending().await,
    }
}

fn timer(duration: Duration) -> Timer {
    Some(Box::pin(sleep(duration)))
}

impl ViewerTask {
    async fn run(&mut self, mut link_events: LinkEvents) -> Exit {
        let token = self.token.clone();
        let mut deadline: Timer = self.ctx.config.negotiation_timeout().and_then(timer);
        let mut grace: Timer = None;

        let setup = tokio::select! {
            biased;
            _ = token.cancelled() => return Exit::Cancelled,
            _ = sleep_opt(&mut deadline) => return Exit::Failed("negotiation timed out".into()),
            setup = self.send_offer() => setup,
        };
        let (record, candidates) = match setup {
            Ok(subs) => subs,
            Err(SignalError::RecordMissing { .. }) => return Exit::Left,
            Err(e) => return Exit::Failed(e.to_string()),
        };
        let mut record = Some(record);
        let mut candidates = Some(candidates);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Exit::Cancelled,
                _ = sleep_opt(&mut deadline) => {
                    return Exit::Failed("negotiation timed out".into());
                }
                _ = sleep_opt(&mut grace) => {
                    return Exit::Failed("connection lost".into());
                }
                update = recv_or_pending(&mut record) => match update {
                    Some(Some(rec)) => {
                        if let Err(e) = self.on_record(rec).await {
                            return Exit::Failed(e.to_string());
                        }
                    }
                    // запись удалена: супервизор получит Removed и отменит задачу
                    Some(None) | None => {
                        record = None;
                        candidates = None;
                    }
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
                    Some(LinkEvent::StateChanged(LinkState::Connected)) => {
                        grace = None;
                        if self.slot.connected() {
                            deadline = None;
                            self.set_state();
                            self.ctx.events.emit_connected(&self.viewer_id);
                            analyze_candidates(self.link.label(), &self.published);
                        }
                    }
                    Some(LinkEvent::StateChanged(
                        st @ (LinkState::Disconnected | LinkState::Failed),
                    )) => {
                        if grace.is_none() {
                            warn!(
                                session = %self.ctx.session_id,
                                viewer = %self.viewer_id,
                                state = ?st,
                                grace_secs = self.ctx.config.disconnect_grace_secs,
                                "connection lost, waiting for recovery"
                            );
                            grace = timer(self.ctx.config.disconnect_grace());
                        }
                    }
                    Some(LinkEvent::StateChanged(LinkState::Closed)) => {
                        return Exit::Failed("connection closed by engine".into());
                    }
                    Some(LinkEvent::StateChanged(st)) => {
                        debug!(viewer = %self.viewer_id, state = ?st, "link state");
                    }
                    Some(LinkEvent::RemoteStream(stream)) => {
                        debug!(viewer = %self.viewer_id, ?stream, "inbound stream ignored");
                    }
                    None => return Exit::Failed("engine event stream ended".into()),
                },
            }
        }
    }

    /// Подключает медиа, подписывается на ответ и кандидаты зрителя,
    /// пишет offer. Подписки оформляются до записи offer, чтобы не
    /// пропустить быстрый ответ.
    async fn send_offer(
        &mut self,
    ) -> Result<(Subscription<Option<ViewerRecord>>, Subscription<IceCandidate>)> {
        let channel = &self.ctx.channel;
        let session_id = &self.ctx.session_id;
        let viewer_id = &self.viewer_id;

        self.link.attach_media(&self.ctx.media).await?;
        let record = channel.watch_viewer(session_id, viewer_id).await?;
        let candidates = channel
            .watch_candidates(session_id, viewer_id, CandidateDirection::Viewer)
            .await?;

        let offer = self.link.create_offer().await?;
        self.link.set_local_description(offer.clone()).await?;
        // запись не версионируется: если зритель успел уйти и вернуться с
        // тем же id, offer этой задачи может лечь в новую запись
        with_retry(&self.ctx.retry, "offer", &self.token, || {
            channel.merge_viewer(session_id, viewer_id, ViewerPatch::Offer(offer.clone()))
        })
        .await?;

        self.slot.offer_sent()?;
        self.set_state();
        debug!(session = %session_id, viewer = %viewer_id, "offer written");
        Ok((record, candidates))
    }

    async fn on_record(&mut self, record: ViewerRecord) -> Result<()> {
        if !self.slot.accepts_answer() {
            return Ok(());
        }
        let Some(answer) = record.answer() else {
            return Ok(());
        };

        self.link.set_remote_description(answer.clone()).await?;
        self.slot.remote_description_applied()?;
        self.set_state();

        let flushed = apply_pending_candidates(&mut self.slot, self.link.as_ref()).await;
        debug!(
            session = %self.ctx.session_id,
            viewer = %self.viewer_id,
            flushed,
            "answer applied"
        );
        Ok(())
    }

    async fn publish_candidate(&mut self, candidate: IceCandidate) {
        let channel = &self.ctx.channel;
        let session_id = &self.ctx.session_id;
        let viewer_id = &self.viewer_id;

        let written = with_retry(&self.ctx.retry, "creator candidate", &self.token, || {
            channel.append_candidate(
                session_id,
                viewer_id,
                CandidateDirection::Creator,
                candidate.clone(),
            )
        })
        .await;

        match written {
            Ok(()) => self.published.push(candidate),
            Err(SignalError::RecordMissing { .. }) => {
                debug!(viewer = %viewer_id, "viewer record gone, candidate not published");
            }
            Err(e) => {
                warn!(viewer = %viewer_id, error = %e, "failed to publish local candidate");
            }
        }
    }

    fn set_state(&self) {
        let _ = self.state.send(self.slot.state());
    }
}
