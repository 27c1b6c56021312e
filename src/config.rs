// Конфигурация сигнального слоя.
// В режиме разработки по умолчанию подробное логирование.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SignalError};
use crate::peer::types::{IceServerKind, ServerConfig};

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "livecast_lib=debug,livecast_demo=debug,webrtc=warn";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "livecast_lib=info,livecast_demo=info,webrtc=error";

/// Переменная окружения, перекрывающая фильтр логов
pub const LOG_ENV: &str = "LIVECAST_LOG";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SignalConfig {
    /// STUN/TURN серверы; пустой список = публичные STUN по умолчанию
    pub ice_servers: Vec<ServerConfig>,
    /// Сколько удалённых кандидатов держать до remote description
    pub max_pending_candidates: usize,
    /// Сколько ждать CONNECTED после появления зрителя; 0 = без ограничения
    pub negotiation_timeout_secs: u64,
    /// Период ожидания перед закрытием упавшего соединения
    pub disconnect_grace_secs: u64,
    /// Повторы записи в канал
    pub write_retries: u32,
    pub retry_backoff_ms: u64,
    pub log_filter: Option<String>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            max_pending_candidates: 64,
            negotiation_timeout_secs: 30,
            disconnect_grace_secs: 10,
            write_retries: 3,
            retry_backoff_ms: 200,
            log_filter: None,
        }
    }
}

impl SignalConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SignalConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(SignalError::config(format!(
                    "ICE server '{}' has an empty URL",
                    server.id
                )));
            }
            if server.r#type == IceServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(SignalError::config(format!(
                    "TURN server '{}' requires username and credential",
                    server.id
                )));
            }
        }
        if self.max_pending_candidates == 0 {
            return Err(SignalError::config("max_pending_candidates must be > 0"));
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        match self.negotiation_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// ICE серверы, которые реально пойдут в RTCConfiguration
    pub fn effective_ice_servers(&self) -> Vec<ServerConfig> {
        if !self.ice_servers.is_empty() {
            return self.ice_servers.clone();
        }
        vec![
            ServerConfig {
                id: "default-stun".into(),
                r#type: IceServerKind::Stun,
                url: "stun:stun.l.google.com:19302".into(),
                username: None,
                credential: None,
            },
            ServerConfig {
                id: "default-stun-1".into(),
                r#type: IceServerKind::Stun,
                url: "stun:stun1.l.google.com:19302".into(),
                username: None,
                credential: None,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let cfg = SignalConfig::from_json("{}").unwrap();
        assert_eq!(cfg.max_pending_candidates, 64);
        assert_eq!(cfg.negotiation_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.disconnect_grace(), Duration::from_secs(10));
        assert_eq!(cfg.effective_ice_servers().len(), 2);
    }

    #[test]
    fn zero_timeout_disables_liveness_check() {
        let cfg = SignalConfig::from_json(r#"{"negotiation_timeout_secs": 0}"#).unwrap();
        assert_eq!(cfg.negotiation_timeout(), None);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let json = r#"{"ice_servers": [{"id": "t", "type": "turn", "url": "relay.example.org:3478"}]}"#;
        assert!(matches!(
            SignalConfig::from_json(json),
            Err(SignalError::Config(_))
        ));
    }

    #[test]
    fn custom_servers_replace_defaults() {
        let json = r#"{"ice_servers": [
            {"id": "t", "type": "turn", "url": "relay.example.org:3478", "username": "u", "credential": "c"}
        ]}"#;
        let cfg = SignalConfig::from_json(json).unwrap();
        let servers = cfg.effective_ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].r#type, IceServerKind::Turn);
    }

    #[test]
    fn empty_url_is_rejected() {
        let json = r#"{"ice_servers": [{"id": "s", "type": "stun", "url": ""}]}"#;
        assert!(SignalConfig::from_json(json).is_err());
    }
}
