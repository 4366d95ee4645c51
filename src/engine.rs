//! Reporting engine: poll loop, change detection and the shell surface.
//!
//! The engine owns two tasks. The poll task samples the probe on a fixed
//! interval, normalizes the sample and hands changed states to the session.
//! The session task owns the connection. Neither waits on the other: they
//! only share the single-slot state handoff and the status channel.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, PollConfig};
use crate::error::{ConfigError, EngineError};
use crate::logging::{EngineEvent, EventSink};
use crate::presence::{PresenceState, StateNormalizer};
use crate::probe::{ActivityProbe, GuardedProbe, RawSample};
use crate::session::{ConnectionSession, ConnectionStatus, SessionHandle};

/// Capacity of the command queue; commands beyond it are dropped.
const COMMAND_QUEUE: usize = 16;

/// Control commands from the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Pause,
    Resume,
    ForceRefresh,
}

/// What the shell renders: last reported presence plus connection status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub presence: Option<PresenceState>,
    pub connection: ConnectionStatus,
    pub paused: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            presence: None,
            connection: ConnectionStatus::Disconnected,
            paused: false,
        }
    }
}

pub struct ReportingEngine<P: ActivityProbe> {
    config: Config,
    probe: Option<Arc<P>>,
    sink: Arc<dyn EventSink>,
    commands: mpsc::Sender<EngineCommand>,
    command_rx: Option<mpsc::Receiver<EngineCommand>>,
    snapshot: watch::Sender<Snapshot>,
    status: Option<watch::Receiver<ConnectionStatus>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<P: ActivityProbe> ReportingEngine<P> {
    /// Build an engine. Refuses configurations with undefined timing.
    pub fn new(config: Config, probe: P, sink: Arc<dyn EventSink>) -> Result<Self, ConfigError> {
        config.validate()?;

        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (snapshot, _) = watch::channel(Snapshot::default());

        Ok(Self {
            config,
            probe: Some(Arc::new(probe)),
            sink,
            commands,
            command_rx: Some(command_rx),
            snapshot,
            status: None,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Spawn the session and poll tasks on the current runtime.
    pub fn start(&mut self) -> Result<(), EngineError> {
        let (Some(commands), Some(probe)) = (self.command_rx.take(), self.probe.clone()) else {
            return Err(EngineError::AlreadyStarted);
        };

        let (session, handle) = ConnectionSession::new(&self.config, self.cancel.child_token())?;
        let status = handle.status();
        self.status = Some(status.clone());

        self.sink.record(EngineEvent::SessionStart {
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        info!(
            interval_ms = self.config.poll.interval_ms,
            debounce_ms = self.config.poll.debounce_window_ms,
            "Reporting engine starting"
        );

        let poll = PollLoop {
            probe: GuardedProbe::new(probe, self.config.poll.probe_timeout()),
            normalizer: StateNormalizer::new(&self.config.poll),
            poll: self.config.poll.clone(),
            session: handle,
            status,
            commands,
            snapshot: self.snapshot.clone(),
            sink: Arc::clone(&self.sink),
            cancel: self.cancel.clone(),
            latest: None,
            last_sent: None,
            last_failures: Vec::new(),
            paused: false,
            states_reported: 0,
        };

        self.tasks.push(tokio::spawn(session.run()));
        self.tasks.push(tokio::spawn(poll.run()));
        Ok(())
    }

    /// Stop sampling. The connection and its heartbeats stay up.
    pub fn pause(&self) {
        self.send(EngineCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(EngineCommand::Resume);
    }

    /// Sample now and report the result without debouncing.
    pub fn force_refresh(&self) {
        self.send(EngineCommand::ForceRefresh);
    }

    fn send(&self, command: EngineCommand) {
        if let Err(e) = self.commands.try_send(command) {
            warn!(?command, error = %e, "Dropping engine command");
        }
    }

    /// Receive a snapshot on every presence or connection change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    /// Call `callback` with every new snapshot until the engine shuts down.
    pub fn on_update<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(&Snapshot) + Send + 'static,
    {
        let mut rx = self.snapshot.subscribe();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = rx.borrow_and_update().clone();
                        callback(&snapshot);
                    }
                }
            }
        })
    }

    /// Cancel both tasks and wait up to `timeout` for them to exit, then
    /// release the probe. Tasks still running after the timeout are aborted.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<(), EngineError> {
        info!("Reporting engine shutting down");
        self.cancel.cancel();

        let mut tasks = std::mem::take(&mut self.tasks);
        let joined = tokio::time::timeout(timeout, async {
            for task in tasks.iter_mut() {
                if let Err(e) = task.await {
                    warn!(error = %e, "Engine task ended abnormally");
                }
            }
        })
        .await;

        if let Some(status) = &self.status {
            let connection = status.borrow().clone();
            self.snapshot.send_if_modified(|s| {
                let changed = s.connection != connection;
                s.connection = connection;
                changed
            });
        }
        self.probe.take();

        match joined {
            Ok(()) => {
                info!("Reporting engine stopped");
                Ok(())
            }
            Err(_) => {
                for task in &tasks {
                    task.abort();
                }
                warn!(?timeout, "Engine tasks did not stop in time, aborted");
                Err(EngineError::ShutdownTimeout(timeout))
            }
        }
    }
}

impl<P: ActivityProbe> Drop for ReportingEngine<P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State owned by the poll task.
struct PollLoop<P: ActivityProbe> {
    probe: GuardedProbe<P>,
    normalizer: StateNormalizer,
    poll: PollConfig,
    session: SessionHandle,
    status: watch::Receiver<ConnectionStatus>,
    commands: mpsc::Receiver<EngineCommand>,
    snapshot: watch::Sender<Snapshot>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    /// Most recently produced state, fed back into the normalizer.
    latest: Option<PresenceState>,
    /// Most recently handed to the session, for change detection.
    last_sent: Option<PresenceState>,
    /// Queries that failed on the previous sample.
    last_failures: Vec<&'static str>,
    paused: bool,
    states_reported: u64,
}

impl<P: ActivityProbe> PollLoop<P> {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.poll.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(command) = self.commands.recv() => match command {
                    EngineCommand::Pause if !self.paused => {
                        info!("Sampling paused");
                        self.set_paused(true);
                    }
                    EngineCommand::Resume if self.paused => {
                        info!("Sampling resumed");
                        self.set_paused(false);
                        ticker.reset_immediately();
                    }
                    EngineCommand::ForceRefresh if !self.paused => {
                        debug!("Forced refresh");
                        self.normalizer.force_next();
                        self.cycle(true).await;
                        ticker.reset();
                    }
                    EngineCommand::ForceRefresh => debug!("Ignoring forced refresh while paused"),
                    _ => {}
                },
                Ok(()) = self.status.changed() => {
                    let connection = self.status.borrow_and_update().clone();
                    self.sink.record(EngineEvent::ConnectionChanged {
                        timestamp: Utc::now(),
                        status: connection.clone(),
                    });
                    self.snapshot.send_if_modified(|s| {
                        let changed = s.connection != connection;
                        s.connection = connection;
                        changed
                    });
                }
                _ = ticker.tick(), if !self.paused => self.cycle(false).await,
            }
        }

        self.sink.record(EngineEvent::SessionEnd {
            timestamp: Utc::now(),
            states_reported: self.states_reported,
        });
        debug!(states_reported = self.states_reported, "Poll loop stopped");
    }

    /// One sample, normalize, diff, report round.
    async fn cycle(&mut self, forced: bool) {
        let sample = self.probe.sample().await;
        self.note_failures(&sample);

        let state = self.normalizer.observe(&sample, self.latest.as_ref());
        self.latest = Some(state.clone());

        let changed = match &self.last_sent {
            Some(sent) => forced || state.differs_from(sent, self.poll.idle_bucket_ms),
            None => true,
        };
        if !changed {
            return;
        }

        debug!(
            active = state.active,
            locked = state.locked,
            available = state.available,
            idle_ms = state.idle_duration_ms,
            forced,
            "Reporting presence"
        );
        self.session.submit(state.clone());
        self.states_reported += 1;
        self.sink.record(EngineEvent::PresenceChanged {
            timestamp: Utc::now(),
            state: state.clone(),
        });
        self.snapshot.send_modify(|s| s.presence = Some(state.clone()));
        self.last_sent = Some(state);
    }

    /// Record probe failures when the set of failing queries changes.
    fn note_failures(&mut self, sample: &RawSample) {
        let queries: Vec<&'static str> = sample.failures.iter().map(|f| f.query).collect();
        if queries == self.last_failures {
            return;
        }
        for failure in &sample.failures {
            self.sink.record(EngineEvent::ProbeFailure {
                timestamp: Utc::now(),
                query: failure.query.to_string(),
                reason: failure.reason.clone(),
            });
        }
        if queries.is_empty() {
            info!("Activity probe recovered");
        }
        self.last_failures = queries;
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        self.snapshot.send_modify(|s| s.paused = paused);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::scripted::{Reading, ScriptedProbe};
    use crate::session::testing::{config_for, Behavior, MockServer};
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio_test::assert_ok;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<EngineEvent>>);

    impl EventSink for RecordingSink {
        fn record(&self, event: EngineEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl RecordingSink {
        fn count(&self, pred: impl Fn(&EngineEvent) -> bool) -> usize {
            self.0.lock().unwrap().iter().filter(|e| pred(e)).count()
        }
    }

    const ACTIVE: Reading = Reading::Idle {
        idle_ms: 100,
        locked: false,
    };
    const IDLE: Reading = Reading::Idle {
        idle_ms: 120_000,
        locked: false,
    };

    fn engine_config(url: &str, debounce_ms: u64) -> Config {
        let mut config = config_for(url);
        config.poll.interval_ms = 20;
        config.poll.debounce_window_ms = debounce_ms;
        config.poll.probe_timeout_ms = 100;
        config
    }

    fn engine(
        config: Config,
        readings: Vec<Reading>,
    ) -> (ReportingEngine<ScriptedProbe>, Arc<ScriptedProbe>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let mut engine = ReportingEngine::new(config, ScriptedProbe::new(readings), sink.clone()).unwrap();
        let probe = engine.probe.clone().unwrap();
        engine.start().unwrap();
        (engine, probe, sink)
    }

    async fn wait_snapshot(rx: &mut watch::Receiver<Snapshot>, pred: impl Fn(&Snapshot) -> bool) -> Snapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let snapshot = rx.borrow_and_update();
                    if pred(&snapshot) {
                        return snapshot.clone();
                    }
                }
                rx.changed().await.expect("engine gone");
            }
        })
        .await
        .expect("snapshot not reached in time")
    }

    #[tokio::test]
    async fn short_idle_blip_never_reaches_the_server() {
        let mut server = MockServer::start(|_| Behavior::Welcome).await;
        let readings = vec![ACTIVE, ACTIVE, ACTIVE, IDLE, IDLE, IDLE, ACTIVE];
        let (mut engine, probe, _sink) = engine(engine_config(&server.url(), 300), readings);

        let received = server.drain_for(Duration::from_millis(500)).await;
        assert!(probe.calls() >= 7);

        let states: Vec<_> = received.iter().filter(|(_, m)| m["type"] == "state").collect();
        assert!(!states.is_empty());
        assert!(states.iter().all(|(_, m)| m["state"]["active"] == true), "{states:?}");

        assert_ok!(engine.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn sustained_idle_is_reported() {
        let mut server = MockServer::start(|_| Behavior::Welcome).await;
        let (mut engine, _probe, sink) = engine(engine_config(&server.url(), 60), vec![ACTIVE, IDLE]);

        loop {
            let (_, state) = server.next_of("state").await;
            if state["state"]["active"] == false {
                assert_eq!(state["state"]["idleDurationMs"], 120_000);
                break;
            }
        }

        assert_ok!(engine.shutdown(Duration::from_secs(1)).await);
        assert!(sink.count(|e| matches!(e, EngineEvent::PresenceChanged { .. })) >= 2);
        assert_eq!(sink.count(|e| matches!(e, EngineEvent::SessionStart { .. })), 1);
        assert_eq!(sink.count(|e| matches!(e, EngineEvent::SessionEnd { .. })), 1);
    }

    #[tokio::test]
    async fn pause_stops_sampling_but_not_heartbeats() {
        let mut server = MockServer::start(|_| Behavior::Welcome).await;
        let (mut engine, probe, _sink) = engine(engine_config(&server.url(), 300), vec![ACTIVE]);
        let mut snapshots = engine.subscribe();
        wait_snapshot(&mut snapshots, |s| s.connection.is_connected() && s.presence.is_some()).await;

        engine.pause();
        wait_snapshot(&mut snapshots, |s| s.paused).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let calls = probe.calls();
        server.drain_for(Duration::from_millis(10)).await;
        let (_, heartbeat) = server.next_of("heartbeat").await;
        assert!(heartbeat["sequence"].as_u64().unwrap() > 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(probe.calls(), calls);

        engine.resume();
        wait_snapshot(&mut snapshots, |s| !s.paused).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(probe.calls() > calls);

        assert_ok!(engine.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_debounce() {
        let mut server = MockServer::start(|_| Behavior::Welcome).await;
        let (mut engine, _probe, _sink) = engine(engine_config(&server.url(), 60_000), vec![ACTIVE, IDLE]);

        let received = server.drain_for(Duration::from_millis(300)).await;
        let states: Vec<_> = received.iter().filter(|(_, m)| m["type"] == "state").collect();
        assert!(!states.is_empty());
        assert!(states.iter().all(|(_, m)| m["state"]["active"] == true));

        engine.force_refresh();
        let (_, forced) = server.next_of("state").await;
        assert_eq!(forced["state"]["active"], false);

        assert_ok!(engine.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn shutdown_is_bounded_with_hung_probe() {
        let server = MockServer::start(|_| Behavior::Welcome).await;
        let mut config = engine_config(&server.url(), 300);
        config.poll.interval_ms = 50;
        let readings = vec![ACTIVE, Reading::Hang(Duration::from_millis(300))];
        let (mut engine, probe, _sink) = engine(config, readings);
        tokio::time::sleep(Duration::from_millis(150)).await;
        // the hung call is not retried while it is still running
        assert_eq!(probe.calls(), 2);

        let started = Instant::now();
        assert_ok!(engine.shutdown(Duration::from_secs(2)).await);
        // one probe timeout plus one heartbeat interval, with slack
        assert!(started.elapsed() < Duration::from_millis(400), "{:?}", started.elapsed());
        assert_eq!(engine.subscribe().borrow().connection, ConnectionStatus::ShuttingDown);
        assert!(engine.probe.is_none());
    }

    #[tokio::test]
    async fn probe_failures_become_unavailable_state() {
        let mut server = MockServer::start(|_| Behavior::Welcome).await;
        let mut config = engine_config(&server.url(), 300);
        config.poll.unknown_grace_ms = 60;
        let (mut engine, _probe, sink) = engine(config, vec![ACTIVE, Reading::Unknown]);

        loop {
            let (_, state) = server.next_of("state").await;
            if state["state"]["available"] == false {
                assert_eq!(state["state"]["active"], false);
                break;
            }
        }
        assert_ok!(engine.shutdown(Duration::from_secs(1)).await);

        // reported once per failure streak, not once per sample
        assert_eq!(sink.count(|e| matches!(e, EngineEvent::ProbeFailure { .. })), 1);
    }

    #[tokio::test]
    async fn on_update_delivers_snapshots() {
        let server = MockServer::start(|_| Behavior::Welcome).await;
        let (mut engine, _probe, _sink) = engine(engine_config(&server.url(), 300), vec![ACTIVE]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let forwarder = engine.on_update(move |snapshot| {
            let _ = tx.send(snapshot.clone());
        });

        let connected = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(snapshot) = rx.recv().await {
                if snapshot.connection.is_connected() && snapshot.presence.is_some() {
                    return snapshot;
                }
            }
            panic!("forwarder ended early");
        })
        .await
        .unwrap();
        assert!(connected.presence.unwrap().active);

        assert_ok!(engine.shutdown(Duration::from_secs(1)).await);
        tokio::time::timeout(Duration::from_secs(1), forwarder).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let mut config = config_for("ws://127.0.0.1:9");
        config.poll.interval_ms = 0;
        let result = ReportingEngine::new(config, ScriptedProbe::new([ACTIVE]), Arc::new(RecordingSink::default()));
        assert!(matches!(result, Err(ConfigError::ZeroDuration("poll.interval_ms"))));

        let mut config = config_for("ftp://example.com");
        config.poll.interval_ms = 1_000;
        let result = ReportingEngine::new(config, ScriptedProbe::new([ACTIVE]), Arc::new(RecordingSink::default()));
        assert!(matches!(result, Err(ConfigError::UnsupportedScheme(_))));
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let server = MockServer::start(|_| Behavior::Welcome).await;
        let (mut engine, _probe, _sink) = engine(engine_config(&server.url(), 300), vec![ACTIVE]);
        assert!(matches!(engine.start(), Err(EngineError::AlreadyStarted)));
        assert_ok!(engine.shutdown(Duration::from_secs(1)).await);
    }
}
