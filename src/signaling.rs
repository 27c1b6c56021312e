//! Сигнальный канал: общее документное хранилище, через которое хост и
//! зрители обмениваются offer/answer и ICE кандидатами.
//!
//! Раскладка документов:
//!
//! ```text
//! sessions/{session}/viewers/{viewer}                      { joined, offer?, answer? }
//! sessions/{session}/viewers/{viewer}/creatorCandidates/*  пишет хост
//! sessions/{session}/viewers/{viewer}/viewerCandidates/*   пишет зритель
//! ```
//!
//! Доставка внутри одной подписки at-least-once и в порядке записи;
//! между разными подписками порядок не гарантируется.

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::SignalConfig;
use crate::error::Result;
use crate::peer::types::{CandidateDirection, IceCandidate, ViewerPatch, ViewerRecord};
use crate::session::{SessionId, ViewerId};

/// Структурные изменения коллекции viewers (без модификаций полей)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerChange {
    Added(ViewerId),
    Removed(ViewerId),
}

/// Подписка живёт, пока жив receiver; drop = отписка
pub type Subscription<T> = mpsc::UnboundedReceiver<T>;

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Merge-запись в документ зрителя; чужие поля не затираются
    async fn merge_viewer(
        &self,
        session: &SessionId,
        viewer: &ViewerId,
        patch: ViewerPatch,
    ) -> Result<()>;

    /// Удаление записи зрителя: единственный сигнал ухода
    async fn delete_viewer(&self, session: &SessionId, viewer: &ViewerId) -> Result<()>;

    /// Текущие записи приходят как Added, затем живые изменения
    async fn watch_viewers(&self, session: &SessionId) -> Result<Subscription<ViewerChange>>;

    /// Снимок записи при подписке и после каждой записи; None = удалена
    async fn watch_viewer(
        &self,
        session: &SessionId,
        viewer: &ViewerId,
    ) -> Result<Subscription<Option<ViewerRecord>>>;

    async fn append_candidate(
        &self,
        session: &SessionId,
        viewer: &ViewerId,
        direction: CandidateDirection,
        candidate: IceCandidate,
    ) -> Result<()>;

    /// Уже записанные кандидаты, затем новые, в порядке добавления
    async fn watch_candidates(
        &self,
        session: &SessionId,
        viewer: &ViewerId,
        direction: CandidateDirection,
    ) -> Result<Subscription<IceCandidate>>;
}

/// Следующее событие подписки; закрытая (None) подписка никогда не
/// готова, чтобы ветка select! просто выключалась
pub async fn recv_or_pending<T>(sub: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match sub {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Повтор записи с экспоненциальной задержкой и jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SignalConfig) -> Self {
        Self {
            max_retries: config.write_retries,
            initial_backoff: config.retry_backoff(),
            max_backoff: Duration::from_secs(5),
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

/// Выполняет запись, повторяя только временные ошибки канала.
/// Отмена прерывает ожидание и возвращает последнюю ошибку.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    what: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() || attempt >= policy.max_retries => return Err(e),
            Err(e) => {
                attempt += 1;
                let delay = jitter(backoff);
                warn!(
                    write = what,
                    attempt,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "channel write failed, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(e),
                    _ = tokio::time::sleep(delay) => {}
                }
                backoff = (backoff * 2).min(policy.max_backoff);
            }
        }
    }
}

// ±30%
fn jitter(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let factor = rand::rng().random_range(0.7..1.3);
    base.mul_f64(factor)
}
