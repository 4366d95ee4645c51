//! Error types for configuration, the engine and the reporting session.

use thiserror::Error;

/// Invalid configuration. Fatal at engine construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("endpoint cannot be empty")]
    MissingEndpoint,
    #[error("unsupported endpoint scheme in {0:?} (expected ws, wss, http or https)")]
    UnsupportedScheme(String),
    #[error("{0} must be greater than 0")]
    ZeroDuration(&'static str),
    #[error("backoff_min_ms ({min}) must not exceed backoff_max_ms ({max})")]
    BackoffBounds { min: u64, max: u64 },
    #[error("heartbeat_timeout_ms ({timeout}) must be greater than heartbeat_interval_ms ({interval})")]
    HeartbeatTimeout { interval: u64, timeout: u64 },
    #[error("close_timeout_ms ({close}) must not exceed heartbeat_interval_ms ({interval})")]
    CloseTimeout { close: u64, interval: u64 },
}

/// A native query that could not be answered right now.
///
/// Expected transiently (lock transitions, display server restarts) and
/// never propagated past the probe: the sample carries it instead.
#[derive(Debug, Clone, Error)]
#[error("{query} unavailable: {reason}")]
pub struct ProbeUnavailable {
    pub query: &'static str,
    pub reason: String,
}

impl ProbeUnavailable {
    pub fn new(query: &'static str, reason: impl std::fmt::Display) -> Self {
        Self {
            query,
            reason: reason.to_string(),
        }
    }
}

/// Failure of one connection attempt or of an established connection.
///
/// Every variant is recovered by the session itself through a backoff
/// transition; none of them terminate the engine.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Connection dropped, refused or timed out.
    #[error("transport error: {0}")]
    Transport(String),
    /// Malformed or unexpected message from the peer.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server rejected our credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// No traffic from the peer within the heartbeat timeout.
    #[error("no traffic from server for {0:?}")]
    HeartbeatTimeout(std::time::Duration),
}

impl SessionError {
    /// Stable classification label used in logs and the event journal.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Transport(_) => "transport",
            SessionError::Protocol(_) => "protocol",
            SessionError::Auth(_) => "auth",
            SessionError::HeartbeatTimeout(_) => "heartbeat_timeout",
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SessionError::Auth(_))
    }
}

/// Misuse of the engine's lifecycle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("engine already started")]
    AlreadyStarted,
    #[error("engine tasks did not stop within {0:?}")]
    ShutdownTimeout(std::time::Duration),
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::Http(response) => {
                let status = response.status().as_u16();
                if status == 401 || status == 403 {
                    SessionError::Auth(format!("upgrade refused with HTTP {status}"))
                } else {
                    SessionError::Protocol(format!("upgrade refused with HTTP {status}"))
                }
            }
            WsError::Protocol(e) => SessionError::Protocol(e.to_string()),
            WsError::Utf8 => SessionError::Protocol("invalid UTF-8 in frame".to_string()),
            other => SessionError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let errors = [
            SessionError::Transport("x".into()),
            SessionError::Protocol("x".into()),
            SessionError::Auth("x".into()),
            SessionError::HeartbeatTimeout(std::time::Duration::from_secs(1)),
        ];
        let mut kinds: Vec<_> = errors.iter().map(|e| e.kind()).collect();
        kinds.dedup();
        assert_eq!(kinds.len(), 4);
        assert!(errors[2].is_auth());
        assert!(!errors[0].is_auth());
    }

    #[test]
    fn connection_closed_is_transport() {
        let err: SessionError = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert_eq!(err.kind(), "transport");
    }
}
