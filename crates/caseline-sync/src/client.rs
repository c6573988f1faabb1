//! # Sync Client
//!
//! Public façade of the engine.
//!
//! ## Client Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncClient Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                         SyncClient                               │  │
//! │  │  connect / disconnect / subscribe / queue_operation / presence   │  │
//! │  │  • validates input, fails fast on misuse                         │  │
//! │  │  • never waits on network delivery (except connect)              │  │
//! │  └──────────┬──────────────────────────────────────┬────────────────┘  │
//! │             │ SupervisorCommand                    │ OfflineQueue,     │
//! │             ▼                                      ▼ PresenceTracker   │
//! │  ┌────────────────────────┐   inbound frames  ┌────────────────────┐   │
//! │  │  ConnectionSupervisor  │ ────────────────► │   message router   │   │
//! │  │  (owns the transport)  │ ◄──── flush ───── │  sync / presence / │   │
//! │  └────────────────────────┘      signal       │  error / auth-ack  │   │
//! │                                                └─────────┬──────────┘   │
//! │                                                          ▼              │
//! │                                              EventBus → SyncHooks,      │
//! │                                                         events()        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Inbound `sync` Handling
//! 1. Already seen (same operation id) → dropped
//! 2. Own operation (echo) → acknowledgment: removed from the offline queue,
//!    never delivered
//! 3. Session not subscribed → dropped
//! 4. Version skipped ahead → `VersionGap` event, then delivered
//! 5. Delivered as `SyncEvent::Sync`

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use caseline_core::validation::{validate_session_id, validate_user_id};
use caseline_core::{EventType, OperationClock, PresenceRecord, SyncOperation};
use caseline_store::{session_state_key, KeyValueStore, MemoryStore};

use crate::config::{validate_ws_url, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, NoOpHooks, PresenceUpdate, SyncEvent, SyncHooks};
use crate::presence::{PresenceClock, PresenceTracker};
use crate::protocol::WireMessage;
use crate::queue::OfflineQueue;
use crate::session::{SessionRegistry, SessionState, VersionCheck};
use crate::supervisor::{
    presence_ticker, queue_overflow, ConnectionSupervisor, EngineContext, LinkStatus,
    SupervisorCommand,
};
use crate::transport::{ConnectionState, TransportFactory, WebSocketTransport};

/// Activity label of a freshly registered local presence record.
pub const DEFAULT_PRESENCE_STATUS: &str = "viewing";

// =============================================================================
// Sync Status
// =============================================================================

/// Snapshot of the engine for status queries.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub connection_state: ConnectionState,

    pub is_connected: bool,

    /// URL of the last connect attempt.
    pub url: Option<String>,

    pub user_id: String,

    /// Subscribed sessions, ordered by id.
    pub sessions: Vec<String>,

    /// Operations not yet acknowledged.
    pub pending_count: usize,

    /// Last connection or server error.
    pub last_error: Option<String>,

    pub connected_since: Option<DateTime<Utc>>,
}

// =============================================================================
// Sync Client
// =============================================================================

/// Real-time sync engine handle.
///
/// ## Usage
/// ```rust,ignore
/// let config = SyncConfig::new("analyst-7").with_url("wss://collab.example.org/sync");
/// let client = SyncClient::builder(config).with_hooks(Arc::new(MyHooks)).build()?;
///
/// client.connect(None).await?;
/// client.subscribe_to_session("case-42", "analyst-7").await?;
/// client
///     .queue_operation("case-42", EventType::CommentAdded, json!({ "body": "see ev-3" }))
///     .await?;
/// ```
pub struct SyncClient {
    ctx: EngineContext,
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    clock: Mutex<OperationClock>,
    /// Stops the presence ticker when the client is dropped.
    _presence_ticker: oneshot::Sender<()>,
}

impl SyncClient {
    /// Creates a client with the WebSocket transport, an in-memory store
    /// and no hooks.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        SyncClientBuilder::new(config).build()
    }

    pub fn builder(config: SyncConfig) -> SyncClientBuilder {
        SyncClientBuilder::new(config)
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connects to the coordination service.
    ///
    /// Uses `url` when given, otherwise the configured URL. Returns
    /// immediately if already connected. On success the persisted offline
    /// queue is loaded and flushed.
    ///
    /// ## Errors
    /// - [`SyncError::InvalidConfig`] if no URL is available
    /// - [`SyncError::InvalidUrl`] if the URL is not `ws://` or `wss://`
    /// - [`SyncError::ConnectionFailed`] / [`SyncError::Timeout`] if the
    ///   handshake fails or exceeds the connect timeout
    pub async fn connect(&self, url: Option<&str>) -> SyncResult<()> {
        if self.ctx.state().is_connected() {
            debug!("Already connected");
            return Ok(());
        }

        let url = url
            .or_else(|| self.ctx.config.url())
            .ok_or_else(|| SyncError::InvalidConfig("No sync URL configured".into()))?
            .to_string();
        validate_ws_url(&url)?;

        info!(url = %url, user_id = %self.ctx.config.user_id(), "Connecting to sync service");

        let (reply, response) = oneshot::channel();
        self.send_command(SupervisorCommand::Connect { url, reply })?;
        response.await.map_err(|_| SyncError::ShuttingDown)??;

        let evicted = self.ctx.queue.lock().await.load().await;
        match evicted {
            Ok(evicted) => self.ctx.report_abandoned(evicted, queue_overflow),
            Err(e) => warn!(error = %e, "Failed to load offline queue"),
        }
        self.ctx.flush_signal.notify_one();

        Ok(())
    }

    /// Closes the connection, cancels every timer and forgets all session
    /// subscriptions. Queued operations are kept.
    pub async fn disconnect(&self) -> SyncResult<()> {
        let (reply, done) = oneshot::channel();
        self.send_command(SupervisorCommand::Disconnect { reply })?;
        done.await.map_err(|_| SyncError::ShuttingDown)?;

        self.ctx.sessions.write().await.clear_subscriptions();
        self.ctx.presence.lock().await.clear();
        self.ctx.presence_signal.notify_one();

        info!("Disconnected from sync service");
        Ok(())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Subscribes to a session and announces the local user's presence.
    ///
    /// ## Errors
    /// - [`SyncError::Validation`] for an invalid session or user id
    /// - [`SyncError::NotConnected`] without a live connection
    pub async fn subscribe_to_session(&self, session_id: &str, user_id: &str) -> SyncResult<()> {
        validate_session_id(session_id)?;
        validate_user_id(user_id)?;

        if !self.ctx.state().is_connected() {
            return Err(SyncError::NotConnected);
        }

        let state = self.load_session_state(session_id).await;
        {
            let mut sessions = self.ctx.sessions.write().await;
            sessions.subscribe(session_id, user_id);
            if let Some(state) = state {
                sessions.restore_cursor(session_id, state);
            }
        }

        let now = self.ctx.clock.now_ms();
        let (record, update) = {
            let mut tracker = self.ctx.presence.lock().await;
            let record = tracker.register_local(session_id, user_id, DEFAULT_PRESENCE_STATUS, now);
            let update = PresenceUpdate {
                session_id: session_id.to_string(),
                active_users: tracker.active_users(session_id, now),
            };
            (record, update)
        };

        self.ctx.presence_signal.notify_one();

        self.send_command(SupervisorCommand::Send(WireMessage::subscribe(session_id, user_id, now)))?;
        self.send_command(SupervisorCommand::Send(WireMessage::presence(record)))?;

        info!(session_id = %session_id, user_id = %user_id, "Subscribed to session");
        self.ctx.events.emit(SyncEvent::Presence(update));
        Ok(())
    }

    /// Leaves a session and drops its presence records.
    ///
    /// ## Errors
    /// [`SyncError::NotSubscribed`] if the session was not subscribed.
    pub async fn unsubscribe_from_session(&self, session_id: &str) -> SyncResult<()> {
        let user_id = self
            .ctx
            .sessions
            .write()
            .await
            .unsubscribe(session_id)
            .ok_or_else(|| SyncError::NotSubscribed(session_id.to_string()))?;

        self.ctx.presence.lock().await.remove_local(session_id);
        self.ctx.presence_signal.notify_one();

        if self.ctx.state().is_connected() {
            self.send_command(SupervisorCommand::Send(WireMessage::unsubscribe(
                session_id,
                &user_id,
                self.ctx.clock.now_ms(),
            )))?;
        }

        info!(session_id = %session_id, "Unsubscribed from session");
        Ok(())
    }

    async fn load_session_state(&self, session_id: &str) -> Option<SessionState> {
        match self.ctx.store.get(&session_state_key(session_id)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Ignoring unreadable session state");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to read session state");
                None
            }
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Queues a local change for delivery.
    ///
    /// Always succeeds locally, connected or not. The operation is persisted
    /// before this returns; transmission happens on the supervisor's
    /// schedule.
    pub async fn queue_operation(
        &self,
        session_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> SyncResult<SyncOperation> {
        validate_session_id(session_id)?;

        // The clock stays locked through enqueue so queue order matches
        // timestamp order.
        let (operation, evicted) = {
            let mut clock = self.clock.lock().await;
            let operation = SyncOperation::new(
                session_id,
                event_type,
                payload,
                self.ctx.config.user_id(),
                clock.next_timestamp(),
            );
            let evicted = self.ctx.queue.lock().await.enqueue(operation.clone()).await;
            (operation, evicted)
        };

        self.ctx.report_abandoned(evicted, queue_overflow);

        if self.ctx.state().is_connected() {
            self.ctx.flush_signal.notify_one();
        }

        Ok(operation)
    }

    /// Number of operations not yet acknowledged.
    pub async fn pending_operations(&self) -> usize {
        self.ctx.queue.lock().await.len()
    }

    // =========================================================================
    // Presence
    // =========================================================================

    /// Updates the local user's activity in a session.
    ///
    /// Broadcast at most once per presence update interval.
    pub async fn update_presence(
        &self,
        session_id: &str,
        status: &str,
        current_page: Option<String>,
        current_item: Option<String>,
    ) -> SyncResult<()> {
        let broadcast = self.ctx.presence.lock().await.update_local(
            session_id,
            status,
            current_page,
            current_item,
            self.ctx.clock.now_ms(),
        )?;

        self.broadcast_presence(broadcast)
    }

    /// Marks the local user as still active in a session without changing
    /// the activity.
    ///
    /// Same debounce as [`update_presence`](Self::update_presence).
    ///
    /// ## Errors
    /// [`SyncError::NotSubscribed`] if the session was not subscribed.
    pub async fn touch_presence(&self, session_id: &str) -> SyncResult<()> {
        let broadcast = self
            .ctx
            .presence
            .lock()
            .await
            .touch(session_id, self.ctx.clock.now_ms())?;

        self.broadcast_presence(broadcast)
    }

    fn broadcast_presence(&self, record: Option<PresenceRecord>) -> SyncResult<()> {
        match record {
            Some(record) if self.ctx.state().is_connected() => {
                self.send_command(SupervisorCommand::Send(WireMessage::presence(record)))
            }
            _ => Ok(()),
        }
    }

    /// Active users of a session, local user first.
    pub async fn active_users(&self, session_id: &str) -> Vec<PresenceRecord> {
        self.ctx
            .presence
            .lock()
            .await
            .active_users(session_id, self.ctx.clock.now_ms())
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn connection_state(&self) -> ConnectionState {
        self.ctx.state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.ctx.state_tx.subscribe()
    }

    /// Subscribes to every event the engine emits from now on.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    pub fn user_id(&self) -> &str {
        self.ctx.config.user_id()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.ctx.config
    }

    pub async fn status(&self) -> SyncStatus {
        let link = self.ctx.link.read().await.clone();
        let connection_state = self.ctx.state();

        SyncStatus {
            connection_state,
            is_connected: connection_state.is_connected(),
            url: link.url,
            user_id: self.ctx.config.user_id().to_string(),
            sessions: self.ctx.sessions.read().await.sessions(),
            pending_count: self.ctx.queue.lock().await.len(),
            last_error: link.last_error,
            connected_since: link.connected_since,
        }
    }

    fn send_command(&self, command: SupervisorCommand) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::ChannelClosed("Supervisor stopped".into()))
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("user_id", &self.ctx.config.user_id())
            .field("state", &self.ctx.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Message Router
// =============================================================================

/// Dispatches inbound frames until the supervisor stops.
async fn message_router(ctx: EngineContext, mut inbound: mpsc::UnboundedReceiver<WireMessage>) {
    while let Some(message) = inbound.recv().await {
        match message {
            WireMessage::Sync { operation } => route_operation(&ctx, operation).await,

            WireMessage::Presence { presence } => {
                let now = ctx.clock.now_ms();
                let update = {
                    let mut tracker = ctx.presence.lock().await;
                    tracker.apply_remote(presence).map(|session_id| PresenceUpdate {
                        active_users: tracker.active_users(&session_id, now),
                        session_id,
                    })
                };
                if let Some(update) = update {
                    ctx.events.emit(SyncEvent::Presence(update));
                }
            }

            WireMessage::Error { error } => {
                warn!(error = %error, "Received error from sync service");
                ctx.link.write().await.last_error = Some(error.clone());
                ctx.events.emit(SyncEvent::ServerError(error));
            }

            WireMessage::AuthAck => info!("Authenticated with sync service"),

            other => debug!(frame = other.type_name(), "Ignoring frame"),
        }
    }

    debug!("Message router stopped");
}

async fn route_operation(ctx: &EngineContext, operation: SyncOperation) {
    let own = operation.is_from(ctx.config.user_id());

    let (version_check, subscribed) = {
        let mut sessions = ctx.sessions.write().await;
        if !sessions.observe(&operation.id) {
            debug!(operation_id = %operation.id, "Dropping duplicate operation");
            return;
        }
        let subscribed = sessions.is_subscribed(&operation.session_id);
        let check = if subscribed {
            sessions.check_version(&operation.session_id, operation.version)
        } else {
            VersionCheck::Unversioned
        };
        (check, subscribed)
    };

    if matches!(version_check, VersionCheck::InOrder | VersionCheck::Gap { .. }) {
        persist_cursor(ctx, &operation.session_id, operation.version).await;
    }

    if own {
        let batch_done = {
            let mut queue = ctx.queue.lock().await;
            let confirmed = queue.confirm(&[operation.id.as_str()]).await;
            confirmed > 0 && queue.in_flight_len() == 0 && queue.pending_len() > 0
        };
        debug!(operation_id = %operation.id, "Operation acknowledged");
        if batch_done {
            ctx.flush_signal.notify_one();
        }
        return;
    }

    if !subscribed {
        debug!(session_id = %operation.session_id, "Dropping operation for unsubscribed session");
        return;
    }

    if let VersionCheck::Gap { expected, received } = version_check {
        warn!(session_id = %operation.session_id, expected, received, "Version gap detected");
        ctx.events.emit(SyncEvent::VersionGap {
            session_id: operation.session_id.clone(),
            expected,
            received,
        });
    }

    debug!(operation_id = %operation.id, event_type = %operation.event_type, "Delivering remote operation");
    ctx.events.emit(SyncEvent::Sync(operation));
}

async fn persist_cursor(ctx: &EngineContext, session_id: &str, version: u64) {
    let state = SessionState {
        last_version: version,
    };
    let raw = match serde_json::to_string(&state) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "Failed to serialize session state");
            return;
        }
    };
    if let Err(e) = ctx.store.set(&session_state_key(session_id), raw).await {
        warn!(session_id = %session_id, error = %e, "Failed to persist session state");
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating a SyncClient with custom collaborators.
pub struct SyncClientBuilder {
    config: SyncConfig,
    transport: Option<Arc<dyn TransportFactory>>,
    store: Option<Arc<dyn KeyValueStore>>,
    hooks: Option<Arc<dyn SyncHooks>>,
}

impl SyncClientBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncClientBuilder {
            config,
            transport: None,
            store: None,
            hooks: None,
        }
    }

    /// Sets the transport factory. Default: [`WebSocketTransport`].
    pub fn with_transport(mut self, transport: Arc<dyn TransportFactory>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the durable store. Default: [`MemoryStore`] (nothing survives
    /// the process).
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the event hooks. Default: [`NoOpHooks`].
    pub fn with_hooks(mut self, hooks: Arc<dyn SyncHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Validates the configuration and spawns the engine tasks.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> SyncResult<SyncClient> {
        self.config.validate()?;

        let config = Arc::new(self.config);
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WebSocketTransport::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let hooks = self.hooks.unwrap_or_else(|| Arc::new(NoOpHooks));

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let ctx = EngineContext {
            queue: Arc::new(Mutex::new(OfflineQueue::new(
                store.clone(),
                config.queue.max_entries,
                config.queue.retry_attempts,
            ))),
            sessions: Arc::new(RwLock::new(SessionRegistry::new(caseline_core::DEDUP_WINDOW))),
            presence: Arc::new(Mutex::new(PresenceTracker::new(
                config.user_id(),
                config.presence_interval(),
                config.presence_timeout(),
            ))),
            events: EventBus::new(hooks),
            link: Arc::new(RwLock::new(LinkStatus::default())),
            state_tx: Arc::new(state_tx),
            flush_signal: Arc::new(Notify::new()),
            presence_signal: Arc::new(Notify::new()),
            clock: PresenceClock::new(),
            store,
            config,
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ticker_guard, ticker_shutdown) = oneshot::channel();

        let supervisor = ConnectionSupervisor::new(ctx.clone(), transport, command_rx, inbound_tx);
        tokio::spawn(supervisor.run());
        tokio::spawn(message_router(ctx.clone(), inbound_rx));
        tokio::spawn(presence_ticker(ctx.clone(), command_tx.clone(), ticker_shutdown));

        info!(user_id = %ctx.config.user_id(), "Sync client started");

        Ok(SyncClient {
            ctx,
            commands: command_tx,
            clock: Mutex::new(OperationClock::new()),
            _presence_ticker: ticker_guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let err = SyncClient::builder(SyncConfig::new("")).build().unwrap_err();
        assert!(err.is_misuse());

        let err = SyncClient::new(SyncConfig::new("alice").with_url("http://collab.example.org"))
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let client = SyncClient::new(SyncConfig::new("alice")).unwrap();
        let status = client.status().await;

        assert_eq!(status.connection_state, ConnectionState::Disconnected);
        assert!(!status.is_connected);
        assert_eq!(status.user_id, "alice");
        assert!(status.sessions.is_empty());
        assert_eq!(status.pending_count, 0);
    }

    #[tokio::test]
    async fn test_queue_operation_validates_session() {
        let client = SyncClient::new(SyncConfig::new("alice")).unwrap();

        let err = client
            .queue_operation(" ", EventType::CommentAdded, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(client.pending_operations().await, 0);
    }

    #[tokio::test]
    async fn test_operations_get_non_decreasing_timestamps() {
        let client = SyncClient::new(SyncConfig::new("alice")).unwrap();

        let mut last = i64::MIN;
        for _ in 0..5 {
            let op = client
                .queue_operation("S", EventType::EvidenceAdded, serde_json::json!({}))
                .await
                .unwrap();
            assert!(op.timestamp >= last);
            assert_eq!(op.origin_user_id, "alice");
            last = op.timestamp;
        }
        assert_eq!(client.pending_operations().await, 5);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_session() {
        let client = SyncClient::new(SyncConfig::new("alice")).unwrap();
        let err = client.unsubscribe_from_session("S").await.unwrap_err();
        assert!(matches!(err, SyncError::NotSubscribed(_)));
    }

    #[tokio::test]
    async fn test_touch_presence_requires_subscription() {
        let client = SyncClient::new(SyncConfig::new("alice")).unwrap();
        let err = client.touch_presence("S").await.unwrap_err();
        assert!(matches!(err, SyncError::NotSubscribed(ref s) if s == "S"));
    }
}
