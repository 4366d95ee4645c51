//! Turns raw probe samples into debounced presence states.

use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::PresenceState;
use crate::config::PollConfig;
use crate::probe::RawSample;

/// A raw value that differs from the reported one, waiting out the
/// debounce window.
#[derive(Debug, Clone, Copy)]
struct Pending {
    value: bool,
    since: Instant,
}

/// Debounce and idle bookkeeping between consecutive samples.
#[derive(Debug)]
pub struct StateNormalizer {
    idle_threshold: Duration,
    debounce_window: Duration,
    unknown_grace: Duration,
    /// Instant of the most recent activity edge.
    last_activity: Option<Instant>,
    /// Native idle reading from the previous sample.
    last_native_idle: Option<Duration>,
    pending_active: Option<Pending>,
    pending_locked: Option<Pending>,
    /// First unknown sample of the current unknown streak.
    unknown_since: Option<Instant>,
    force_next: bool,
}

impl StateNormalizer {
    pub fn new(config: &PollConfig) -> Self {
        Self {
            idle_threshold: Duration::from_millis(config.idle_threshold_ms),
            debounce_window: config.debounce_window(),
            unknown_grace: config.unknown_grace(),
            last_activity: None,
            last_native_idle: None,
            pending_active: None,
            pending_locked: None,
            unknown_since: None,
            force_next: false,
        }
    }

    /// Accept the raw values of the next known sample without debouncing.
    pub fn force_next(&mut self) {
        self.force_next = true;
    }

    /// Produce the state for `sample`, given the previously produced state.
    pub fn observe(&mut self, sample: &RawSample, previous: Option<&PresenceState>) -> PresenceState {
        let now = Utc::now();
        let at = sample.taken_at;

        if sample.is_unknown() {
            let since = *self.unknown_since.get_or_insert(at);
            return match previous {
                Some(prev) if prev.available && at.saturating_duration_since(since) < self.unknown_grace => {
                    // Carry forward, still counting idle time from the last edge.
                    let mut carried = prev.clone();
                    carried.idle_duration_ms = self
                        .last_activity
                        .map(|edge| at.saturating_duration_since(edge).as_millis() as u64)
                        .unwrap_or(prev.idle_duration_ms)
                        .max(prev.idle_duration_ms);
                    carried.timestamp = now;
                    carried
                }
                Some(prev) => {
                    if prev.available {
                        debug!(unknown_for = ?at.saturating_duration_since(since), "Activity signals unavailable past grace period");
                    }
                    prev.clone().into_unavailable(now)
                }
                None => PresenceState::unavailable(now),
            };
        }

        self.unknown_since = None;
        let force = std::mem::take(&mut self.force_next);

        // Coming back from "unavailable" there is nothing to debounce against.
        let reported = previous.filter(|p| p.available);

        let idle = self.idle_since_activity(sample);
        let locked_raw = sample
            .locked
            .unwrap_or_else(|| previous.map(|p| p.locked).unwrap_or(false));
        let active_raw = idle < self.idle_threshold && !locked_raw;

        let locked = settle(
            &mut self.pending_locked,
            reported.map(|p| p.locked),
            locked_raw,
            at,
            self.debounce_window,
            force,
        );
        let active = settle(
            &mut self.pending_active,
            reported.map(|p| p.active),
            active_raw,
            at,
            self.debounce_window,
            force,
        );

        let session_id = sample
            .session_id
            .clone()
            .or_else(|| previous.map(|p| p.session_id.clone()))
            .unwrap_or_default();

        PresenceState {
            active,
            idle_duration_ms: idle.as_millis() as u64,
            locked,
            session_id,
            available: true,
            foreground_app: sample.foreground_app.clone(),
            timestamp: now,
        }
    }

    /// Idle time from the native reading when present, else accumulated
    /// since the last known activity edge.
    fn idle_since_activity(&mut self, sample: &RawSample) -> Duration {
        let at = sample.taken_at;
        match sample.idle {
            Some(native) => {
                // A drop in native idle time means input happened in between.
                if self.last_native_idle.map_or(true, |prev| native < prev) {
                    self.last_activity = Some(at.checked_sub(native).unwrap_or(at));
                }
                self.last_native_idle = Some(native);
                native
            }
            None => {
                self.last_native_idle = None;
                let edge = *self.last_activity.get_or_insert(at);
                at.saturating_duration_since(edge)
            }
        }
    }
}

/// Debounce one boolean field. Returns the value to report.
fn settle(
    pending: &mut Option<Pending>,
    reported: Option<bool>,
    raw: bool,
    at: Instant,
    window: Duration,
    force: bool,
) -> bool {
    let reported = match reported {
        Some(r) if !force && r != raw => r,
        _ => {
            *pending = None;
            return raw;
        }
    };

    match *pending {
        Some(p) if p.value == raw => {
            if at.saturating_duration_since(p.since) >= window {
                *pending = None;
                raw
            } else {
                reported
            }
        }
        _ if window.is_zero() => {
            *pending = None;
            raw
        }
        _ => {
            *pending = Some(Pending { value: raw, since: at });
            reported
        }
    }
}
