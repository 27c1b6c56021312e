//! Ошибки сигнального слоя.

use thiserror::Error;

/// Result type alias using the signaling error type.
pub type Result<T> = std::result::Result<T, SignalError>;

#[derive(Debug, Error)]
pub enum SignalError {
    /// Не удалось создать peer connection или подключить локальные треки
    #[error("media engine error: {0}")]
    Engine(String),

    /// Движок отклонил offer/answer/candidate
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Хранилище недоступно или запись не удалась
    #[error("signaling channel error: {0}")]
    Channel(String),

    /// Запись зрителя уже удалена (зритель ушёл)
    #[error("viewer record {session}/{viewer} does not exist")]
    RecordMissing { session: String, viewer: String },

    /// Запись нарушает правило "одно поле пишется один раз"
    #[error("illegal record write: {0}")]
    RecordConflict(String),

    /// Переход state machine, который не разрешён из текущего состояния
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition { from: &'static str, event: &'static str },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SignalError {
    pub fn engine(msg: impl std::fmt::Display) -> Self {
        Self::Engine(msg.to_string())
    }

    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    pub fn channel(msg: impl std::fmt::Display) -> Self {
        Self::Channel(msg.to_string())
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Ошибки, после которых повторная запись имеет смысл.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Channel(_))
    }
}

impl From<webrtc::Error> for SignalError {
    fn from(err: webrtc::Error) -> Self {
        Self::Engine(err.to_string())
    }
}
