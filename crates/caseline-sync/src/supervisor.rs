//! # Connection Supervisor
//!
//! The single task that owns the live transport connection and every timer
//! tied to it.
//!
//! ## Supervisor Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Connection Supervisor                               │
//! │                                                                         │
//! │  IDLE (disconnected / error)                                           │
//! │    Connect ──► open (bounded by connect timeout)                       │
//! │                  ├─ failure ──► Error, reply Err                        │
//! │                  └─ success ──► CONNECTED, reply Ok                     │
//! │                                                                         │
//! │  CONNECTED                                                             │
//! │    snapshot subscriptions + presence, then publish Connected           │
//! │    on entry: auth (if token) → flush queue → resubscribe + presence    │
//! │    select! {                                                           │
//! │      command        Send / Disconnect                                  │
//! │      flush signal   next batch (queued op, batch acknowledged)         │
//! │      inbound frame  ping → pong, pong → clear deadline, else → router  │
//! │      ping tick      send ping, arm pong deadline                       │
//! │      pong deadline  connection dead ──► LOST                           │
//! │      flush tick     ack-timeout requeue, flush                         │
//! │    }                                                                    │
//! │    every write is bounded by the pong timeout ──► LOST                 │
//! │                                                                         │
//! │  LOST                                                                  │
//! │    requeue in-flight (failed attempt) → Reconnecting                   │
//! │    sleep backoff delay ──► Connecting ──► open                         │
//! │      ├─ success ──► backoff reset, CONNECTED                           │
//! │      └─ failure ──► delay × multiplier (capped), Reconnecting          │
//! │    Connect(url) while waiting or opening retargets the attempt         │
//! │                                                                         │
//! │  Disconnect in any state cancels every timer before replying.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The presence ticker is a separate task (`presence_ticker`) so the
//! heartbeat and the stale sweep keep running while the link is down.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use caseline_core::PresenceRecord;
use caseline_store::KeyValueStore;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{AbandonReason, EventBus, PresenceUpdate, SyncEvent};
use crate::presence::{PresenceClock, PresenceTracker};
use crate::protocol::WireMessage;
use crate::queue::{OfflineQueue, QueuedOperation};
use crate::session::SessionRegistry;
use crate::transport::{ConnectionState, TransportConnection, TransportError, TransportFactory};

// =============================================================================
// Reconnect Policy
// =============================================================================

/// Exponential reconnect delay without jitter.
///
/// The n-th delay after a loss is `min(min * multiplier^n, max)`.
pub struct ReconnectPolicy {
    backoff: ExponentialBackoff,
}

impl std::fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("current", &self.backoff.current_interval)
            .field("max", &self.backoff.max_interval)
            .field("multiplier", &self.backoff.multiplier)
            .finish()
    }
}

impl ReconnectPolicy {
    pub fn new(min: Duration, max: Duration, multiplier: f64) -> Self {
        let mut backoff = ExponentialBackoff {
            current_interval: min,
            initial_interval: min,
            randomization_factor: 0.0,
            multiplier,
            max_interval: max,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        ReconnectPolicy { backoff }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.reconnect_delay_min(),
            config.reconnect_delay_max(),
            config.connection.reconnect_backoff,
        )
    }

    /// Returns the delay before the next attempt and grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        self.backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval)
    }

    /// Back to the minimum delay.
    pub fn reset(&mut self) {
        self.backoff.reset();
    }
}

// =============================================================================
// Shared Engine State
// =============================================================================

/// Connection facts for status queries.
#[derive(Debug, Clone, Default)]
pub(crate) struct LinkStatus {
    pub url: Option<String>,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
}

/// State shared by the client façade, the supervisor and the router.
///
/// Each component is behind its own lock and is only touched through its
/// methods.
#[derive(Clone)]
pub(crate) struct EngineContext {
    pub config: Arc<SyncConfig>,
    pub store: Arc<dyn KeyValueStore>,
    pub queue: Arc<Mutex<OfflineQueue>>,
    pub sessions: Arc<RwLock<SessionRegistry>>,
    pub presence: Arc<Mutex<PresenceTracker>>,
    pub events: EventBus,
    pub link: Arc<RwLock<LinkStatus>>,
    pub state_tx: Arc<watch::Sender<ConnectionState>>,
    /// Wakes the supervisor to send the next batch.
    pub flush_signal: Arc<Notify>,
    /// Wakes the presence ticker when local records come or go.
    pub presence_signal: Arc<Notify>,
    /// Time base for presence records and subscribe frames.
    pub clock: PresenceClock,
}

impl EngineContext {
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Publishes a state transition. Repeating the current state is a no-op.
    pub fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            info!(%state, "Connection state changed");
            self.events.emit(SyncEvent::ConnectionChanged(state));
        }
    }

    pub async fn record_error(&self, error: &SyncError) {
        self.link.write().await.last_error = Some(error.to_string());
    }

    /// Reports abandoned operations, once each.
    pub fn report_abandoned<F>(&self, entries: Vec<QueuedOperation>, reason_for: F)
    where
        F: Fn(&QueuedOperation) -> AbandonReason,
    {
        for entry in entries {
            let reason = reason_for(&entry);
            warn!(operation_id = %entry.operation.id, %reason, "Operation abandoned");
            self.events.emit(SyncEvent::OperationAbandoned {
                operation: entry.operation,
                reason,
            });
        }
    }
}

/// Abandon reason for entries dropped by the retry bound.
pub(crate) fn retries_exhausted(entry: &QueuedOperation) -> AbandonReason {
    AbandonReason::RetriesExhausted {
        attempts: entry.retry_count,
    }
}

/// Abandon reason for entries evicted by the queue cap.
pub(crate) fn queue_overflow(_entry: &QueuedOperation) -> AbandonReason {
    AbandonReason::QueueOverflow
}

// =============================================================================
// Commands
// =============================================================================

/// Requests from the client façade.
#[derive(Debug)]
pub(crate) enum SupervisorCommand {
    /// Open a connection. Answered once the state is `Connected` or the
    /// attempt failed.
    Connect {
        url: String,
        reply: oneshot::Sender<SyncResult<()>>,
    },

    /// Close the connection and cancel all timers.
    Disconnect { reply: oneshot::Sender<()> },

    /// Send one frame if connected, drop it otherwise.
    Send(WireMessage),
}

/// How a connected period ended.
enum DriveEnd {
    Lost(SyncError),
    Disconnected,
    Shutdown,
}

/// How the supervisor left the connected/reconnecting cycle.
enum CycleEnd {
    Idle,
    Shutdown,
}

/// Outcome of a backoff wait or a reconnect attempt.
enum Interrupt {
    Disconnect(oneshot::Sender<()>),
    Shutdown,
}

/// What a new connection replays, captured before `Connected` is published
/// so a subscribe racing the handshake is sent once.
struct Resume {
    subscriptions: Vec<(String, String)>,
    presence: Vec<PresenceRecord>,
    at_ms: i64,
}

// =============================================================================
// Connection Supervisor
// =============================================================================

pub(crate) struct ConnectionSupervisor {
    ctx: EngineContext,
    factory: Arc<dyn TransportFactory>,
    commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    inbound: mpsc::UnboundedSender<WireMessage>,
    /// Callers waiting on a `Connect` that arrived while reconnecting.
    waiting: Vec<oneshot::Sender<SyncResult<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        ctx: EngineContext,
        factory: Arc<dyn TransportFactory>,
        commands: mpsc::UnboundedReceiver<SupervisorCommand>,
        inbound: mpsc::UnboundedSender<WireMessage>,
    ) -> Self {
        ConnectionSupervisor {
            ctx,
            factory,
            commands,
            inbound,
            waiting: Vec::new(),
        }
    }

    /// Main supervisor loop. Ends when the client is dropped.
    pub async fn run(mut self) {
        debug!("Connection supervisor started");

        while let Some(command) = self.commands.recv().await {
            match command {
                SupervisorCommand::Connect { url, reply } => {
                    self.ctx.set_state(ConnectionState::Connecting);
                    self.ctx.link.write().await.url = Some(url.clone());

                    match self.open(&url).await {
                        Ok(connection) => {
                            self.waiting.push(reply);
                            if let CycleEnd::Shutdown = self.connected_cycle(url, connection).await {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(url = %url, error = %e, "Connect failed");
                            self.ctx.record_error(&e).await;
                            self.ctx.set_state(ConnectionState::Error);
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                SupervisorCommand::Disconnect { reply } => {
                    self.ctx.set_state(ConnectionState::Disconnected);
                    let _ = reply.send(());
                }
                SupervisorCommand::Send(message) => {
                    debug!(frame = message.type_name(), "Not connected, dropping frame");
                }
            }
        }

        debug!("Connection supervisor stopped");
    }

    async fn open(&self, url: &str) -> SyncResult<TransportConnection> {
        open_with_timeout(self.factory.clone(), url.to_string(), self.ctx.config.connect_timeout()).await
    }

    /// Runs connected periods and the reconnect cycles between them.
    async fn connected_cycle(&mut self, mut url: String, mut connection: TransportConnection) -> CycleEnd {
        let mut policy = ReconnectPolicy::from_config(&self.ctx.config);

        loop {
            policy.reset();
            let resume = self.resume_snapshot().await;
            self.mark_connected(&url).await;

            let end = match self.on_connected(&mut connection, resume).await {
                Ok(()) => self.drive(&mut connection).await,
                Err(e) => DriveEnd::Lost(e),
            };

            match end {
                DriveEnd::Disconnected => return CycleEnd::Idle,
                DriveEnd::Shutdown => return CycleEnd::Shutdown,
                DriveEnd::Lost(reason) => {
                    warn!(error = %reason, "Connection lost");
                    self.ctx.record_error(&reason).await;
                    self.ctx.link.write().await.connected_since = None;
                    self.requeue_after_loss().await;
                }
            }

            connection = loop {
                self.ctx.set_state(ConnectionState::Reconnecting);

                let delay = policy.next_delay();
                info!(?delay, "Waiting before reconnect");
                if let Err(interrupt) = self.wait_backoff(delay, &mut url).await {
                    return self.interrupted(interrupt);
                }

                self.ctx.set_state(ConnectionState::Connecting);
                match self.attempt(&mut url).await {
                    Ok(Ok(connection)) => break connection,
                    Ok(Err(e)) => {
                        warn!(url = %url, error = %e, "Reconnect attempt failed");
                        self.ctx.record_error(&e).await;
                        let message = e.to_string();
                        for reply in self.waiting.drain(..) {
                            let _ = reply.send(Err(SyncError::ConnectionFailed(message.clone())));
                        }
                    }
                    Err(interrupt) => return self.interrupted(interrupt),
                }
            };
        }
    }

    async fn mark_connected(&mut self, url: &str) {
        {
            let mut link = self.ctx.link.write().await;
            link.connected_since = Some(Utc::now());
            link.last_error = None;
        }
        self.ctx.set_state(ConnectionState::Connected);
        info!(url = %url, "Connected to sync service");

        for reply in self.waiting.drain(..) {
            let _ = reply.send(Ok(()));
        }
    }

    fn interrupted(&mut self, interrupt: Interrupt) -> CycleEnd {
        for reply in self.waiting.drain(..) {
            let _ = reply.send(Err(SyncError::Disconnected));
        }

        match interrupt {
            Interrupt::Disconnect(reply) => {
                info!("Reconnect abandoned by disconnect");
                self.ctx.set_state(ConnectionState::Disconnected);
                let _ = reply.send(());
                CycleEnd::Idle
            }
            Interrupt::Shutdown => CycleEnd::Shutdown,
        }
    }

    /// Sleeps out the backoff delay. A `Connect` cuts the wait short and
    /// its URL becomes the reconnect target.
    async fn wait_backoff(&mut self, delay: Duration, url: &mut String) -> Result<(), Interrupt> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                command = self.commands.recv() => match command {
                    None => return Err(Interrupt::Shutdown),
                    Some(SupervisorCommand::Disconnect { reply }) => {
                        return Err(Interrupt::Disconnect(reply));
                    }
                    Some(SupervisorCommand::Connect { url: requested, reply }) => {
                        debug!(url = %requested, "Connect requested during backoff, retrying now");
                        self.waiting.push(reply);
                        self.retarget(url, requested).await;
                        return Ok(());
                    }
                    Some(SupervisorCommand::Send(message)) => {
                        debug!(frame = message.type_name(), "Reconnecting, dropping frame");
                    }
                },
            }
        }
    }

    /// One reconnect attempt that a `Disconnect` can abandon.
    ///
    /// A `Connect` for another URL restarts the attempt against that URL.
    async fn attempt(&mut self, url: &mut String) -> Result<SyncResult<TransportConnection>, Interrupt> {
        let limit = self.ctx.config.connect_timeout();
        let open = open_with_timeout(self.factory.clone(), url.clone(), limit);
        tokio::pin!(open);

        loop {
            tokio::select! {
                result = &mut open => return Ok(result),
                command = self.commands.recv() => match command {
                    None => return Err(Interrupt::Shutdown),
                    Some(SupervisorCommand::Disconnect { reply }) => {
                        return Err(Interrupt::Disconnect(reply));
                    }
                    Some(SupervisorCommand::Connect { url: requested, reply }) => {
                        self.waiting.push(reply);
                        if self.retarget(url, requested).await {
                            open.set(open_with_timeout(self.factory.clone(), url.clone(), limit));
                        }
                    }
                    Some(SupervisorCommand::Send(message)) => {
                        debug!(frame = message.type_name(), "Connecting, dropping frame");
                    }
                },
            }
        }
    }

    /// Switches the reconnect target. Returns whether the URL changed.
    async fn retarget(&mut self, url: &mut String, requested: String) -> bool {
        if *url == requested {
            return false;
        }
        info!(from = %url, to = %requested, "Reconnect target changed");
        self.ctx.link.write().await.url = Some(requested.clone());
        *url = requested;
        true
    }

    async fn resume_snapshot(&self) -> Resume {
        let at_ms = self.ctx.clock.now_ms();
        Resume {
            subscriptions: self.ctx.sessions.read().await.subscriptions(),
            presence: self.ctx.presence.lock().await.heartbeat(at_ms),
            at_ms,
        }
    }

    /// Authenticates, flushes the queue and replays subscriptions.
    async fn on_connected(&mut self, connection: &mut TransportConnection, resume: Resume) -> SyncResult<()> {
        let limit = self.ctx.config.pong_timeout();

        if let Some(token) = self.ctx.config.connection.auth_token.clone() {
            debug!("Sending auth frame");
            send_frame(connection, &WireMessage::auth(&token), limit).await?;
        }

        self.flush(connection).await?;

        for (session_id, user_id) in &resume.subscriptions {
            let frame = WireMessage::subscribe(session_id, user_id, resume.at_ms);
            send_frame(connection, &frame, limit).await?;
        }

        for record in resume.presence {
            send_frame(connection, &WireMessage::presence(record), limit).await?;
        }

        if !resume.subscriptions.is_empty() {
            info!(sessions = resume.subscriptions.len(), "Resubscribed to sessions");
        }
        Ok(())
    }

    /// Serves one connected period until it ends.
    async fn drive(&mut self, connection: &mut TransportConnection) -> DriveEnd {
        let config = self.ctx.config.clone();
        let limit = config.pong_timeout();
        let start = Instant::now();

        let mut ping = interval_at(start + config.ping_interval(), config.ping_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush = interval_at(start + config.flush_interval(), config.flush_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let flush_signal = self.ctx.flush_signal.clone();
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => {
                        close_sink(connection, limit).await;
                        return DriveEnd::Shutdown;
                    }
                    Some(SupervisorCommand::Disconnect { reply }) => {
                        info!("Disconnecting");
                        close_sink(connection, limit).await;
                        self.ctx.queue.lock().await.release_in_flight();
                        self.ctx.link.write().await.connected_since = None;
                        self.ctx.set_state(ConnectionState::Disconnected);
                        let _ = reply.send(());
                        return DriveEnd::Disconnected;
                    }
                    Some(SupervisorCommand::Connect { reply, .. }) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(SupervisorCommand::Send(message)) => {
                        if let Err(e) = send_frame(connection, &message, limit).await {
                            return DriveEnd::Lost(e);
                        }
                    }
                },

                _ = flush_signal.notified() => {
                    if let Err(e) = self.flush(connection).await {
                        return DriveEnd::Lost(e);
                    }
                }

                frame = connection.stream.next() => match frame {
                    Some(Ok(text)) => match WireMessage::from_json(&text) {
                        Ok(WireMessage::Ping) => {
                            if let Err(e) = send_frame(connection, &WireMessage::Pong, limit).await {
                                return DriveEnd::Lost(e);
                            }
                        }
                        Ok(WireMessage::Pong) => {
                            debug!("Received pong");
                            pong_deadline = None;
                        }
                        Ok(message) => {
                            if self.inbound.send(message).is_err() {
                                return DriveEnd::Shutdown;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed frame");
                        }
                    },
                    Some(Err(e)) => return DriveEnd::Lost(e.into()),
                    None => return DriveEnd::Lost(SyncError::Disconnected),
                },

                _ = ping.tick() => {
                    if let Err(e) = send_frame(connection, &WireMessage::Ping, limit).await {
                        return DriveEnd::Lost(e);
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + config.pong_timeout());
                    }
                }

                _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    warn!(timeout = ?config.pong_timeout(), "No pong received");
                    return DriveEnd::Lost(SyncError::Timeout(config.pong_timeout()));
                }

                _ = flush.tick() => {
                    let abandoned = self
                        .ctx
                        .queue
                        .lock()
                        .await
                        .requeue_if_stale(Instant::now(), config.ack_timeout())
                        .await;
                    self.ctx.report_abandoned(abandoned, retries_exhausted);

                    if let Err(e) = self.flush(connection).await {
                        return DriveEnd::Lost(e);
                    }
                }
            }
        }
    }

    /// Sends the next batch if nothing is in flight.
    ///
    /// Batches are stop-and-wait: the router raises the flush signal once the
    /// echoes for the current batch have arrived. The queue lock is released
    /// before any frame is written. A failed write leaves the batch in flight
    /// for [`requeue_after_loss`](Self::requeue_after_loss).
    async fn flush(&mut self, connection: &mut TransportConnection) -> SyncResult<()> {
        let (evicted, batch, remaining) = {
            let mut queue = self.ctx.queue.lock().await;

            let evicted = match queue.load().await {
                Ok(evicted) => evicted,
                Err(e) => {
                    warn!(error = %e, "Offline queue not loaded, flushing memory only");
                    Vec::new()
                }
            };
            queue.persist_if_dirty().await;

            let batch = if queue.in_flight_len() == 0 {
                queue.drain_batch(self.ctx.config.queue.batch_size, Instant::now())
            } else {
                Vec::new()
            };
            (evicted, batch, queue.pending_len())
        };

        self.ctx.report_abandoned(evicted, queue_overflow);

        if batch.is_empty() {
            return Ok(());
        }

        debug!(count = batch.len(), remaining, "Flushing offline queue");
        let limit = self.ctx.config.pong_timeout();
        for operation in batch {
            send_frame(connection, &WireMessage::sync(operation), limit).await?;
        }
        Ok(())
    }

    /// Loss of the connection fails every in-flight operation once.
    async fn requeue_after_loss(&mut self) {
        let abandoned = self.ctx.queue.lock().await.requeue_in_flight().await;
        self.ctx.report_abandoned(abandoned, retries_exhausted);
    }
}

// =============================================================================
// Presence Ticker
// =============================================================================

/// Heartbeats local presence and sweeps stale remote records every presence
/// interval, connected or not.
///
/// Parks while no session has a local record; subscribe wakes it and
/// disconnect (which clears presence) parks it again. Broadcasts go through
/// the supervisor and are only sent while connected. Ends when `shutdown`
/// resolves.
pub(crate) async fn presence_ticker(
    ctx: EngineContext,
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let period = ctx.config.presence_interval();

    'parked: loop {
        while !ctx.presence.lock().await.has_local_records() {
            tokio::select! {
                _ = ctx.presence_signal.notified() => {}
                _ = &mut shutdown => break 'parked,
            }
        }

        debug!(?period, "Presence ticker running");
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !presence_tick(&ctx, &commands).await {
                        break;
                    }
                }
                _ = ctx.presence_signal.notified() => {
                    if !ctx.presence.lock().await.has_local_records() {
                        break;
                    }
                }
                _ = &mut shutdown => break 'parked,
            }
        }

        debug!("Presence ticker parked");
    }

    debug!("Presence ticker stopped");
}

/// One heartbeat and sweep. Returns whether local records remain.
async fn presence_tick(ctx: &EngineContext, commands: &mpsc::UnboundedSender<SupervisorCommand>) -> bool {
    let now = ctx.clock.now_ms();

    let (records, updates, active) = {
        let mut tracker = ctx.presence.lock().await;
        let records = tracker.heartbeat(now);
        let updates: Vec<PresenceUpdate> = tracker
            .sweep(now)
            .into_iter()
            .map(|session_id| PresenceUpdate {
                active_users: tracker.active_users(&session_id, now),
                session_id,
            })
            .collect();
        (records, updates, tracker.has_local_records())
    };

    for update in updates {
        ctx.events.emit(SyncEvent::Presence(update));
    }

    if ctx.state().is_connected() {
        for record in records {
            if commands.send(SupervisorCommand::Send(WireMessage::presence(record))).is_err() {
                break;
            }
        }
    }
    active
}

// =============================================================================
// Helpers
// =============================================================================

async fn open_with_timeout(
    factory: Arc<dyn TransportFactory>,
    url: String,
    limit: Duration,
) -> SyncResult<TransportConnection> {
    match tokio::time::timeout(limit, factory.connect(&url)).await {
        Ok(Ok(connection)) => Ok(connection),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(SyncError::Timeout(limit)),
    }
}

/// Writes one frame. A write still pending after `limit` means the link is
/// dead.
async fn send_frame(
    connection: &mut TransportConnection,
    message: &WireMessage,
    limit: Duration,
) -> SyncResult<()> {
    let text = message.to_json()?;
    debug!(frame = message.type_name(), "Sending frame");
    match tokio::time::timeout(limit, connection.sink.send(text)).await {
        Ok(result) => result.map_err(SyncError::from),
        Err(_) => {
            warn!(frame = message.type_name(), ?limit, "Write stalled");
            Err(SyncError::Timeout(limit))
        }
    }
}

async fn close_sink(connection: &mut TransportConnection, limit: Duration) {
    match tokio::time::timeout(limit, connection.sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(TransportError::ConnectionClosed)) => {}
        Ok(Err(e)) => debug!(error = %e, "Close failed"),
        Err(_) => debug!("Close stalled, dropping connection"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: Duration, expected_secs: f64) {
        let diff = (actual.as_secs_f64() - expected_secs).abs();
        assert!(diff < 0.001, "expected ~{}s, got {:?}", expected_secs, actual);
    }

    #[test]
    fn test_reconnect_delays_grow_and_cap() {
        let mut policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(4), 1.5);

        for expected in [1.0, 1.5, 2.25, 3.375, 4.0, 4.0] {
            assert_close(policy.next_delay(), expected);
        }

        policy.reset();
        assert_close(policy.next_delay(), 1.0);
    }

    #[test]
    fn test_default_policy_matches_engine_constants() {
        let config = SyncConfig::new("alice");
        let mut policy = ReconnectPolicy::from_config(&config);

        assert_close(policy.next_delay(), 1.0);
        for _ in 0..20 {
            policy.next_delay();
        }
        assert_close(policy.next_delay(), 30.0);
    }
}
