//! Canonical presence model and the normalizer that produces it.

mod normalizer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use normalizer::StateNormalizer;

/// Whether the monitored machine is in use, as reported to the service.
///
/// Immutable: each poll cycle produces a new value that replaces the
/// previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    /// Debounced "in use" flag.
    pub active: bool,
    /// Time since the last detected activity edge.
    pub idle_duration_ms: u64,
    /// Debounced session lock flag.
    pub locked: bool,
    pub session_id: String,
    /// False once native readings have been missing past the grace period.
    pub available: bool,
    #[serde(rename = "app", default, skip_serializing_if = "Option::is_none")]
    pub foreground_app: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl PresenceState {
    /// State reported when nothing could be read yet.
    pub fn unavailable(timestamp: DateTime<Utc>) -> Self {
        Self {
            active: false,
            idle_duration_ms: 0,
            locked: false,
            session_id: String::new(),
            available: false,
            foreground_app: None,
            timestamp,
        }
    }

    /// The last known state marked as no longer observable.
    pub fn into_unavailable(self, timestamp: DateTime<Utc>) -> Self {
        Self {
            active: false,
            available: false,
            timestamp,
            ..self
        }
    }

    /// Idle duration quantized to `bucket_ms`.
    pub fn idle_bucket(&self, bucket_ms: u64) -> u64 {
        self.idle_duration_ms / bucket_ms.max(1)
    }

    /// Whether `self` is worth reporting given `sent` was the last state sent.
    ///
    /// Idle duration only counts once it crosses into another bucket; every
    /// other field counts on any change.
    pub fn differs_from(&self, sent: &PresenceState, idle_bucket_ms: u64) -> bool {
        self.active != sent.active
            || self.locked != sent.locked
            || self.available != sent.available
            || self.session_id != sent.session_id
            || self.foreground_app != sent.foreground_app
            || self.idle_bucket(idle_bucket_ms) != sent.idle_bucket(idle_bucket_ms)
    }
}
