//! Persistent connection to the status service.
//!
//! One task owns the connection and drives it through
//! `Connecting -> Handshaking -> Connected`, dropping to a backoff wait on
//! any failure and back to `Connecting` when the timer fires. It never holds
//! more than one transport at a time: a connection is fully dropped before
//! the next attempt starts.
//!
//! The engine hands states over through a single-slot watch channel. While
//! disconnected, newer states simply overwrite older ones, so a reconnect
//! sends exactly one catch-up state.

mod backoff;
mod protocol;

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConnectionConfig};
use crate::error::{ConfigError, SessionError};
use crate::presence::PresenceState;

use backoff::Backoff;
use protocol::{ClientIdentity, InboundMessage, OutboundEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Close codes the service uses to refuse credentials.
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Connection state as seen by the engine and the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    /// Waiting to retry after a transport, protocol or heartbeat failure.
    Backoff {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        reason: String,
    },
    /// Waiting to retry after the server refused our token.
    AuthRejected {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        reason: String,
    },
    ShuttingDown,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Engine side of the session: state handoff in, status out.
#[derive(Debug)]
pub struct SessionHandle {
    latest: watch::Sender<Option<PresenceState>>,
    status: watch::Receiver<ConnectionStatus>,
}

impl SessionHandle {
    /// Hand over the newest state. Never blocks; replaces anything not yet sent.
    pub fn submit(&self, state: PresenceState) {
        self.latest.send_replace(Some(state));
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

/// Owner of the single logical connection to the service.
pub struct ConnectionSession {
    url: String,
    identity: ClientIdentity,
    config: ConnectionConfig,
    latest: watch::Receiver<Option<PresenceState>>,
    status: watch::Sender<ConnectionStatus>,
    backoff: Backoff,
    cancel: CancellationToken,
}

impl ConnectionSession {
    pub fn new(config: &Config, cancel: CancellationToken) -> Result<(Self, SessionHandle), ConfigError> {
        let url = config.server.websocket_url()?;
        let (latest_tx, latest_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let session = Self {
            url,
            identity: identity(config),
            config: config.connection.clone(),
            latest: latest_rx,
            status: status_tx,
            backoff: Backoff::new(&config.connection),
            cancel,
        };
        let handle = SessionHandle {
            latest: latest_tx,
            status: status_rx,
        };
        Ok((session, handle))
    }

    /// Run until cancelled. Every failure ends in a backoff wait, never in
    /// an early return.
    pub async fn run(mut self) {
        info!(url = %self.url, device = %self.identity.device_id, "Connection session starting");

        while !self.cancel.is_cancelled() {
            let err = match self.connect_once().await {
                Ok(()) => break,
                Err(e) => e,
            };
            if self.cancel.is_cancelled() {
                break;
            }

            let (delay, status) = self.schedule_retry(&err);
            self.set_status(status);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_status(ConnectionStatus::ShuttingDown);
        info!("Connection session stopped");
    }

    fn schedule_retry(&mut self, err: &SessionError) -> (Duration, ConnectionStatus) {
        let delay = if err.is_auth() {
            self.backoff.escalate()
        } else {
            self.backoff.next_delay()
        };
        let attempt = self.backoff.attempt();
        let next_retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let reason = err.to_string();

        if err.is_auth() {
            error!(kind = err.kind(), error = %err, attempt, delay_ms = delay.as_millis() as u64, "Server rejected credentials");
            (delay, ConnectionStatus::AuthRejected { attempt, next_retry_at, reason })
        } else {
            warn!(kind = err.kind(), error = %err, attempt, delay_ms = delay.as_millis() as u64, "Connection failed, backing off");
            (delay, ConnectionStatus::Backoff { attempt, next_retry_at, reason })
        }
    }

    /// One connection lifetime. `Ok` means we stopped because of cancellation.
    async fn connect_once(&mut self) -> Result<(), SessionError> {
        self.set_status(ConnectionStatus::Connecting);

        let ws = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            ws = open(&self.url, self.config.connect_timeout()) => ws?,
        };
        let (mut write, mut read) = ws.split();

        let result = self.drive(&mut write, &mut read).await;
        self.backoff.disconnected(Instant::now());

        let sequence = result?;
        self.set_status(ConnectionStatus::ShuttingDown);
        let deadline = tokio::time::Instant::now() + self.config.close_timeout();
        if let Some(sequence) = sequence {
            self.flush_pending(&mut write, sequence, deadline).await;
        }
        close_gracefully(&mut write, deadline).await;
        Ok(())
    }

    /// Send a state handed over but not yet transmitted. Shares the close
    /// deadline with the close handshake.
    async fn flush_pending(&mut self, write: &mut WsWrite, sequence: u64, deadline: tokio::time::Instant) {
        if !self.latest.has_changed().unwrap_or(false) {
            return;
        }
        let Some(state) = self.latest.borrow_and_update().clone() else {
            return;
        };

        let text = match OutboundEvent::state_changed(state, sequence + 1).encode(&self.identity) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode pending state");
                return;
            }
        };
        match tokio::time::timeout_at(deadline, write.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => debug!(sequence = sequence + 1, "Sent pending state before close"),
            Ok(Err(e)) => debug!(error = %e, "Failed to send pending state"),
            Err(_) => warn!("Pending state not sent before close deadline"),
        }
    }

    /// Handshake, catch-up, then pump events until failure or cancellation.
    ///
    /// On cancellation returns the last sequence used, or `None` if the
    /// handshake never completed.
    async fn drive(&mut self, write: &mut WsWrite, read: &mut WsRead) -> Result<Option<u64>, SessionError> {
        self.set_status(ConnectionStatus::Handshaking);
        let cancel = self.cancel.clone();

        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            r = handshake(write, read, &self.identity, self.config.heartbeat_timeout()) => r?,
        }

        // Sequence 0 went out with hello; data events count up from here.
        let mut sequence: u64 = 0;
        self.backoff.connected(Instant::now());
        self.set_status(ConnectionStatus::Connected);

        let catch_up = self.latest.borrow_and_update().clone();
        if let Some(state) = catch_up {
            sequence += 1;
            debug!(sequence, "Sending catch-up state");
            self.transmit(write, OutboundEvent::state_changed(state, sequence)).await?;
        }

        let interval = self.config.heartbeat_interval();
        let timeout = self.config.heartbeat_timeout();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_seen = tokio::time::Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Ok(Some(sequence));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(Some(sequence)),
                changed = self.latest.changed() => {
                    if changed.is_err() {
                        // Engine dropped its handle.
                        return Ok(Some(sequence));
                    }
                    let state = self.latest.borrow_and_update().clone();
                    if let Some(state) = state {
                        sequence += 1;
                        self.transmit(write, OutboundEvent::state_changed(state, sequence)).await?;
                    }
                }
                _ = heartbeat.tick() => {
                    sequence += 1;
                    self.transmit(write, OutboundEvent::heartbeat(sequence)).await?;
                }
                msg = read.next() => {
                    last_seen = tokio::time::Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => match InboundMessage::parse(&text)? {
                            InboundMessage::Rejected { reason } => return Err(SessionError::Auth(reason)),
                            InboundMessage::Error { message } => return Err(SessionError::Protocol(message)),
                            other => debug!(message = ?other, "Server message"),
                        },
                        Some(Ok(Message::Close(frame))) => return Err(closed_by_server(frame)),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(SessionError::Transport("connection closed by server".to_string())),
                    }
                }
                _ = tokio::time::sleep_until(last_seen + timeout) => {
                    return Err(SessionError::HeartbeatTimeout(timeout));
                }
            }
        }
    }

    /// Send one event, bounded by the heartbeat interval so a stalled peer
    /// cannot hold the loop.
    async fn transmit(&self, write: &mut WsWrite, event: OutboundEvent) -> Result<(), SessionError> {
        let text = event.encode(&self.identity)?;
        let limit = self.config.heartbeat_interval();

        match tokio::time::timeout(limit, write.send(Message::Text(text.into()))).await {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => Err(SessionError::Transport(format!("send stalled for {limit:?}"))),
        }
    }

    fn set_status(&self, next: ConnectionStatus) {
        let previous = self.status.send_replace(next.clone());
        if previous != next {
            info!(from = ?previous, to = ?next, "Connection status changed");
        }
    }
}

/// Connect once and complete the hello exchange, returning the round trip.
pub async fn check_endpoint(config: &Config) -> Result<Duration, SessionError> {
    let url = config
        .server
        .websocket_url()
        .map_err(|e| SessionError::Protocol(e.to_string()))?;
    let started = Instant::now();

    let ws = open(&url, config.connection.connect_timeout()).await?;
    let (mut write, mut read) = ws.split();
    handshake(&mut write, &mut read, &identity(config), config.connection.heartbeat_timeout()).await?;
    let elapsed = started.elapsed();

    close_gracefully(&mut write, tokio::time::Instant::now() + config.connection.close_timeout()).await;
    Ok(elapsed)
}

fn identity(config: &Config) -> ClientIdentity {
    ClientIdentity {
        token: config.server.auth_token.clone(),
        device_id: config.server.device_id(),
        device_name: config.server.device_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
    }
}

async fn open(url: &str, timeout: Duration) -> Result<WsStream, SessionError> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(SessionError::Transport(format!("connect timed out after {timeout:?}"))),
    }
}

/// Send `hello` and wait for the acknowledgement.
async fn handshake(
    write: &mut WsWrite,
    read: &mut WsRead,
    identity: &ClientIdentity,
    timeout: Duration,
) -> Result<(), SessionError> {
    let hello = OutboundEvent::hello().encode(identity)?;
    write.send(Message::Text(hello.into())).await?;

    let reply = async {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match InboundMessage::parse(&text)? {
                    InboundMessage::Heartbeat | InboundMessage::Other => continue,
                    reply => return Ok::<_, SessionError>(reply),
                },
                Some(Ok(Message::Close(frame))) => return Err(closed_by_server(frame)),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(SessionError::from(e)),
                None => {
                    return Err(SessionError::Transport(
                        "connection closed during handshake".to_string(),
                    ))
                }
            }
        }
    };

    let reply = tokio::time::timeout(timeout, reply)
        .await
        .map_err(|_| SessionError::Protocol(format!("no handshake acknowledgement within {timeout:?}")))??;

    match reply {
        InboundMessage::Welcome => Ok(()),
        InboundMessage::Rejected { reason } => Err(SessionError::Auth(reason)),
        InboundMessage::Error { message } => Err(SessionError::Protocol(message)),
        other => Err(SessionError::Protocol(format!("unexpected {other:?} during handshake"))),
    }
}

fn closed_by_server(frame: Option<CloseFrame<'_>>) -> SessionError {
    match frame {
        Some(frame) => {
            let code = u16::from(frame.code);
            let reason = frame.reason.to_string();
            if code == CLOSE_POLICY_VIOLATION || code == CLOSE_UNAUTHORIZED {
                SessionError::Auth(format!("closed with code {code}: {reason}"))
            } else {
                SessionError::Transport(format!("closed by server with code {code}: {reason}"))
            }
        }
        None => SessionError::Transport("closed by server".to_string()),
    }
}

/// Attempt a close handshake before `deadline`; dropping the stream after
/// that force-closes it.
async fn close_gracefully(write: &mut WsWrite, deadline: tokio::time::Instant) {
    match tokio::time::timeout_at(deadline, write.close()).await {
        Ok(Ok(())) => debug!("Connection closed"),
        Ok(Err(e)) => debug!(error = %e, "Close handshake failed"),
        Err(_) => warn!("Close handshake timed out, dropping connection"),
    }
}
