//! JSON-object-per-frame wire protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::presence::PresenceState;

/// Kind of an outbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Hello,
    StateChanged,
    Heartbeat,
}

/// One message to the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub kind: EventKind,
    pub payload: Option<PresenceState>,
    /// Per-connection sequence; `hello` is always 0.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl OutboundEvent {
    pub fn hello() -> Self {
        Self {
            kind: EventKind::Hello,
            payload: None,
            sequence: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn state_changed(state: PresenceState, sequence: u64) -> Self {
        Self {
            kind: EventKind::StateChanged,
            payload: Some(state),
            sequence,
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat(sequence: u64) -> Self {
        Self {
            kind: EventKind::Heartbeat,
            payload: None,
            sequence,
            timestamp: Utc::now(),
        }
    }

    /// Serialize to the JSON text of one frame.
    pub fn encode(&self, identity: &ClientIdentity) -> Result<String, SessionError> {
        let message = match (self.kind, &self.payload) {
            (EventKind::Hello, _) => WireMessage::Hello {
                sequence: self.sequence,
                timestamp: self.timestamp,
                token: &identity.token,
                device_id: &identity.device_id,
                device_name: &identity.device_name,
                version: identity.version,
            },
            (EventKind::StateChanged, Some(state)) => WireMessage::State {
                sequence: self.sequence,
                timestamp: self.timestamp,
                state: WireState::from(state),
            },
            (EventKind::StateChanged, None) => {
                return Err(SessionError::Protocol("state event without payload".to_string()))
            }
            (EventKind::Heartbeat, _) => WireMessage::Heartbeat {
                sequence: self.sequence,
                timestamp: self.timestamp,
            },
        };

        serde_json::to_string(&message).map_err(|e| SessionError::Protocol(e.to_string()))
    }
}

/// Who we are, sent once per connection in `hello`.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub token: String,
    pub device_id: String,
    pub device_name: String,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireMessage<'a> {
    #[serde(rename_all = "camelCase")]
    Hello {
        sequence: u64,
        timestamp: DateTime<Utc>,
        token: &'a str,
        device_id: &'a str,
        device_name: &'a str,
        version: &'a str,
    },
    State {
        sequence: u64,
        timestamp: DateTime<Utc>,
        state: WireState<'a>,
    },
    Heartbeat {
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireState<'a> {
    active: bool,
    idle_duration_ms: u64,
    locked: bool,
    session_id: &'a str,
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    app: Option<&'a str>,
}

impl<'a> From<&'a PresenceState> for WireState<'a> {
    fn from(state: &'a PresenceState) -> Self {
        Self {
            active: state.active,
            idle_duration_ms: state.idle_duration_ms,
            locked: state.locked,
            session_id: &state.session_id,
            available: state.available,
            app: state.foreground_app.as_deref(),
        }
    }
}

/// Messages the service sends us.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    /// Handshake acknowledgement.
    Welcome,
    /// Credentials refused.
    Rejected {
        #[serde(default)]
        reason: String,
    },
    Heartbeat,
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        serde_json::from_str(text)
            .map_err(|e| SessionError::Protocol(format!("malformed message {text:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn identity() -> ClientIdentity {
        ClientIdentity {
            token: "t0ken".into(),
            device_id: "work-pc".into(),
            device_name: "Work PC".into(),
            version: "0.1.0",
        }
    }

    fn state() -> PresenceState {
        PresenceState {
            active: false,
            idle_duration_ms: 90_000,
            locked: true,
            session_id: "2".into(),
            available: true,
            foreground_app: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn hello_carries_identity() {
        let json: Value = serde_json::from_str(&OutboundEvent::hello().encode(&identity()).unwrap()).unwrap();
        assert_eq!(json["type"], "hello");
        assert_eq!(json["sequence"], 0);
        assert_eq!(json["token"], "t0ken");
        assert_eq!(json["deviceId"], "work-pc");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn state_event_shape() {
        let event = OutboundEvent::state_changed(state(), 4);
        let json: Value = serde_json::from_str(&event.encode(&identity()).unwrap()).unwrap();
        assert_eq!(json["type"], "state");
        assert_eq!(json["sequence"], 4);
        assert_eq!(json["state"]["idleDurationMs"], 90_000);
        assert_eq!(json["state"]["locked"], true);
        assert_eq!(json["state"]["sessionId"], "2");
        assert!(json["state"].get("app").is_none());
        assert!(json.get("token").is_none());
    }

    #[test]
    fn heartbeat_has_no_state() {
        let json: Value =
            serde_json::from_str(&OutboundEvent::heartbeat(9).encode(&identity()).unwrap()).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert!(json.get("state").is_none());
    }

    #[test]
    fn parses_server_messages() {
        assert_eq!(
            InboundMessage::parse(r#"{"type":"welcome","server":"v6"}"#).unwrap(),
            InboundMessage::Welcome
        );
        assert_eq!(
            InboundMessage::parse(r#"{"type":"rejected","reason":"bad token"}"#).unwrap(),
            InboundMessage::Rejected {
                reason: "bad token".into()
            }
        );
        assert_eq!(
            InboundMessage::parse(r#"{"type":"something-new"}"#).unwrap(),
            InboundMessage::Other
        );
        let err = InboundMessage::parse("not json").unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }
}
