//! Native activity probes with platform-specific implementations.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod windows;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
mod unsupported;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ProbeUnavailable;

#[cfg(target_os = "linux")]
pub use linux::NativeProbe;
#[cfg(target_os = "macos")]
pub use macos::NativeProbe;
#[cfg(target_os = "windows")]
pub use windows::NativeProbe;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub use unsupported::NativeProbe;

/// One reading of the native activity signals.
///
/// Each signal may be missing independently. A sample with neither idle
/// time nor lock state is "unknown".
#[derive(Debug, Clone)]
pub struct RawSample {
    /// When the sample was taken.
    pub taken_at: Instant,
    /// Time since the last user input.
    pub idle: Option<Duration>,
    pub locked: Option<bool>,
    pub session_id: Option<String>,
    /// Title or name of the foreground application, where exposed.
    pub foreground_app: Option<String>,
    /// Queries that failed while taking this sample.
    pub failures: Vec<ProbeUnavailable>,
}

impl RawSample {
    /// Sentinel sample used when the probe could not answer at all.
    pub fn unknown(failure: ProbeUnavailable) -> Self {
        Self {
            taken_at: Instant::now(),
            idle: None,
            locked: None,
            session_id: None,
            foreground_app: None,
            failures: vec![failure],
        }
    }

    /// Assemble a sample from the individual native query results.
    pub fn collect(
        idle_ms: Result<u64, ProbeUnavailable>,
        locked: Result<bool, ProbeUnavailable>,
        session_id: Result<String, ProbeUnavailable>,
        foreground_app: Option<String>,
    ) -> Self {
        let mut failures = Vec::new();
        let mut keep = |failure: ProbeUnavailable| {
            debug!(query = failure.query, reason = %failure.reason, "Native query failed");
            failures.push(failure);
        };

        let idle = idle_ms.map(Duration::from_millis).map_err(&mut keep).ok();
        let locked = locked.map_err(&mut keep).ok();
        let session_id = session_id.map_err(&mut keep).ok();

        Self {
            taken_at: Instant::now(),
            idle,
            locked,
            session_id,
            foreground_app: foreground_app.filter(|app| !app.is_empty()),
            failures,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.idle.is_none() && self.locked.is_none()
    }
}

/// Uniform polling interface over the platform's activity signals.
///
/// `sample` never fails: unavailable signals are left empty in the sample.
pub trait ActivityProbe: Send + Sync + 'static {
    fn sample(&self) -> RawSample;
}

/// Runs probe samples on the blocking pool with a timeout, at most one
/// native call at a time.
///
/// A hung call yields an unknown sample instead of stalling the poll loop.
/// It is kept as the in-flight call, and until it returns every sample is
/// unknown without touching the probe, so a wedged display server or
/// session API costs one blocking thread.
pub struct GuardedProbe<P: ActivityProbe> {
    probe: Arc<P>,
    timeout: Duration,
    in_flight: Option<JoinHandle<RawSample>>,
}

impl<P: ActivityProbe> GuardedProbe<P> {
    pub fn new(probe: Arc<P>, timeout: Duration) -> Self {
        Self {
            probe,
            timeout,
            in_flight: None,
        }
    }

    pub async fn sample(&mut self) -> RawSample {
        if let Some(task) = self.in_flight.take() {
            if !task.is_finished() {
                self.in_flight = Some(task);
                return RawSample::unknown(ProbeUnavailable::new(
                    "sample",
                    "previous native call still running",
                ));
            }
            // Late result of a timed-out call; too stale to report.
            let _ = task.await;
            debug!("Hung native call returned");
        }

        let probe = Arc::clone(&self.probe);
        let mut task = tokio::task::spawn_blocking(move || probe.sample());

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => RawSample::unknown(ProbeUnavailable::new("sample", e)),
            Err(_) => {
                warn!(timeout = ?self.timeout, "Native call timed out, holding further samples until it returns");
                self.in_flight = Some(task);
                RawSample::unknown(ProbeUnavailable::new(
                    "sample",
                    format!("timed out after {:?}", self.timeout),
                ))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed list of readings, then repeats the last one.
    pub struct ScriptedProbe {
        script: Mutex<VecDeque<Reading>>,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[derive(Debug, Clone)]
    pub enum Reading {
        Idle { idle_ms: u64, locked: bool },
        Unknown,
        Hang(Duration),
    }

    impl ScriptedProbe {
        pub fn new(readings: impl IntoIterator<Item = Reading>) -> Self {
            Self {
                script: Mutex::new(readings.into_iter().collect()),
                calls: Default::default(),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl ActivityProbe for ScriptedProbe {
        fn sample(&self) -> RawSample {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let reading = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().cloned()
                }
            };

            match reading {
                Some(Reading::Idle { idle_ms, locked }) => RawSample::collect(
                    Ok(idle_ms),
                    Ok(locked),
                    Ok("console".to_string()),
                    Some("Terminal".to_string()),
                ),
                Some(Reading::Hang(d)) => {
                    std::thread::sleep(d);
                    RawSample::unknown(ProbeUnavailable::new("sample", "hung"))
                }
                Some(Reading::Unknown) | None => {
                    RawSample::unknown(ProbeUnavailable::new("sample", "scripted"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::{Reading, ScriptedProbe};
    use super::*;

    #[test]
    fn partial_failures_are_kept_on_the_sample() {
        let sample = RawSample::collect(
            Err(ProbeUnavailable::new("idle", "no display")),
            Ok(true),
            Err(ProbeUnavailable::new("session", "no session")),
            Some(String::new()),
        );
        assert!(!sample.is_unknown());
        assert_eq!(sample.locked, Some(true));
        assert_eq!(sample.idle, None);
        assert_eq!(sample.foreground_app, None);
        let queries: Vec<_> = sample.failures.iter().map(|f| f.query).collect();
        assert_eq!(queries, ["idle", "session"]);
    }

    #[tokio::test]
    async fn hung_probe_yields_unknown_sample() {
        let probe = Arc::new(ScriptedProbe::new([Reading::Hang(Duration::from_millis(300))]));
        let sample = GuardedProbe::new(probe, Duration::from_millis(20)).sample().await;
        assert!(sample.is_unknown());
        assert!(sample.failures[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn hung_call_is_not_stacked() {
        let probe = Arc::new(ScriptedProbe::new([Reading::Hang(Duration::from_millis(300))]));
        let mut guarded = GuardedProbe::new(probe.clone(), Duration::from_millis(10));

        let started = std::time::Instant::now();
        while started.elapsed() < Duration::from_millis(200) {
            assert!(guarded.sample().await.is_unknown());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(probe.calls(), 1);

        // once the stuck call returns, sampling resumes
        tokio::time::sleep(Duration::from_millis(200)).await;
        guarded.sample().await;
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn guarded_sample_passes_readings_through() {
        let probe = Arc::new(ScriptedProbe::new([Reading::Idle {
            idle_ms: 1_500,
            locked: false,
        }]));
        let mut guarded = GuardedProbe::new(probe.clone(), Duration::from_secs(1));
        let sample = guarded.sample().await;
        assert_eq!(sample.idle, Some(Duration::from_millis(1_500)));
        assert_eq!(sample.session_id.as_deref(), Some("console"));
        guarded.sample().await;
        assert_eq!(probe.calls(), 2);
    }
}
