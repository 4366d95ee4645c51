//! Engine events and the sinks that record them.

mod jsonl;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::presence::PresenceState;
use crate::session::ConnectionStatus;

pub use jsonl::JournalSink;

/// Something the engine wants recorded.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    SessionStart {
        timestamp: DateTime<Utc>,
        version: String,
    },
    SessionEnd {
        timestamp: DateTime<Utc>,
        states_reported: u64,
    },
    PresenceChanged {
        timestamp: DateTime<Utc>,
        state: PresenceState,
    },
    ConnectionChanged {
        timestamp: DateTime<Utc>,
        status: ConnectionStatus,
    },
    ProbeFailure {
        timestamp: DateTime<Utc>,
        query: String,
        reason: String,
    },
}

/// Destination for engine events. Must not block the caller.
pub trait EventSink: Send + Sync {
    fn record(&self, event: EngineEvent);
}

/// Sink that only emits tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: EngineEvent) {
        match event {
            EngineEvent::SessionStart { version, .. } => info!(%version, "Engine session started"),
            EngineEvent::SessionEnd { states_reported, .. } => {
                info!(states_reported, "Engine session ended")
            }
            EngineEvent::PresenceChanged { state, .. } => info!(
                active = state.active,
                locked = state.locked,
                available = state.available,
                idle_ms = state.idle_duration_ms,
                session = %state.session_id,
                "Presence changed"
            ),
            EngineEvent::ConnectionChanged { status, .. } => info!(?status, "Connection changed"),
            EngineEvent::ProbeFailure { query, reason, .. } => {
                warn!(%query, %reason, "Probe query failed")
            }
        }
    }
}
