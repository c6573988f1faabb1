//! In-process doubles for engine tests.
//!
//! [`MockRelay`] plays the coordination service: it assigns versions, fans
//! `sync` frames out to subscribers, echoes them to the sender and answers
//! `auth` and `ping`. Frames are handled synchronously inside the sink, so
//! with paused Tokio time a single [`settle`] is enough for a round trip.
//! [`MockRelay::set_hold_writes`] stalls every sink until released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use caseline_core::SyncOperation;
use caseline_store::{KeyValueStore, StoreError, StoreResult};

use crate::events::{AbandonReason, PresenceUpdate, SyncEvent, SyncHooks};
use crate::protocol::WireMessage;
use crate::transport::{
    ConnectionState, TransportConnection, TransportError, TransportFactory, TransportResult,
};

pub const RELAY_URL: &str = "ws://relay.test/sync";

/// Lets spawned tasks run. Paused time auto-advances past the sleep.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("caseline_sync=debug")),
        )
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Mock Relay
// =============================================================================

struct Peer {
    tx: mpsc::UnboundedSender<TransportResult<String>>,
    sessions: HashSet<String>,
}

#[derive(Default)]
struct RelayState {
    next_id: u64,
    peers: HashMap<u64, Peer>,
    versions: HashMap<String, u64>,
    received: Vec<WireMessage>,
    connect_attempts: Vec<Instant>,
    connect_urls: Vec<String>,
    refuse_connects: bool,
    mute_sync_echo: bool,
    ignore_pings: bool,
}

impl RelayState {
    fn send_to(&self, peer_id: u64, message: &WireMessage) {
        if let Some(peer) = self.peers.get(&peer_id) {
            if let Ok(text) = message.to_json() {
                let _ = peer.tx.send(Ok(text));
            }
        }
    }

    fn fan_out(&self, session_id: &str, except: u64, message: &WireMessage) {
        let targets: Vec<u64> = self
            .peers
            .iter()
            .filter(|(id, peer)| **id != except && peer.sessions.contains(session_id))
            .map(|(id, _)| *id)
            .collect();
        for id in targets {
            self.send_to(id, message);
        }
    }

    fn handle(&mut self, from: u64, text: &str) -> TransportResult<()> {
        if !self.peers.contains_key(&from) {
            return Err(TransportError::SendFailed("peer dropped".into()));
        }

        let Ok(message) = WireMessage::from_json(text) else {
            return Ok(());
        };
        self.received.push(message.clone());

        match message {
            WireMessage::Subscribe { session_id, .. } => {
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.sessions.insert(session_id);
                }
            }
            WireMessage::Unsubscribe { session_id, .. } => {
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.sessions.remove(&session_id);
                }
            }
            WireMessage::Sync { mut operation } => {
                let version = self.versions.entry(operation.session_id.clone()).or_insert(0);
                *version += 1;
                operation.version = *version;

                let session_id = operation.session_id.clone();
                let relayed = WireMessage::sync(operation);
                self.fan_out(&session_id, from, &relayed);
                if !self.mute_sync_echo {
                    self.send_to(from, &relayed);
                }
            }
            WireMessage::Presence { presence } => {
                let session_id = presence.session_id.clone();
                self.fan_out(&session_id, from, &WireMessage::presence(presence));
            }
            WireMessage::Auth { .. } => self.send_to(from, &WireMessage::AuthAck),
            WireMessage::Ping if !self.ignore_pings => self.send_to(from, &WireMessage::Pong),
            _ => {}
        }
        Ok(())
    }
}

/// In-process coordination service.
#[derive(Clone)]
pub struct MockRelay {
    state: Arc<Mutex<RelayState>>,
    /// `true` while writes are held.
    writes: Arc<watch::Sender<bool>>,
}

impl MockRelay {
    pub fn new() -> Self {
        let (writes, _) = watch::channel(false);
        MockRelay {
            state: Arc::new(Mutex::new(RelayState::default())),
            writes: Arc::new(writes),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().unwrap()
    }

    /// While held, every write on every connection stays pending, like a
    /// socket whose send buffer never drains.
    pub fn set_hold_writes(&self, hold: bool) {
        self.writes.send_replace(hold);
    }

    async fn writes_released(&self) {
        let mut held = self.writes.subscribe();
        let _released = held.wait_for(|held| !*held).await.is_ok();
    }

    fn accept(&self, id: u64, text: &str) -> TransportResult<()> {
        match self.state.lock() {
            Ok(mut state) => state.handle(id, text),
            Err(_) => Err(TransportError::SendFailed("relay poisoned".into())),
        }
    }

    /// Makes every connect attempt fail until turned off.
    pub fn set_refuse_connects(&self, refuse: bool) {
        self.lock().refuse_connects = refuse;
    }

    /// Stops echoing `sync` frames to their sender, so nothing is acknowledged.
    pub fn set_mute_sync_echo(&self, mute: bool) {
        self.lock().mute_sync_echo = mute;
    }

    /// Stops answering pings.
    pub fn set_ignore_pings(&self, ignore: bool) {
        self.lock().ignore_pings = ignore;
    }

    /// Ends every open connection as if the network went away.
    pub fn drop_all(&self) {
        self.lock().peers.clear();
    }

    /// Sends a frame to every open connection.
    pub fn inject(&self, message: &WireMessage) {
        let text = message.to_json().unwrap();
        self.inject_raw(&text);
    }

    pub fn inject_raw(&self, text: &str) {
        for peer in self.lock().peers.values() {
            let _ = peer.tx.send(Ok(text.to_string()));
        }
    }

    pub fn received(&self) -> Vec<WireMessage> {
        self.lock().received.clone()
    }

    /// Frames of one type, in arrival order.
    pub fn received_of(&self, type_name: &str) -> Vec<WireMessage> {
        self.received()
            .into_iter()
            .filter(|m| m.type_name() == type_name)
            .collect()
    }

    /// Operations received in `sync` frames, in arrival order.
    pub fn synced(&self) -> Vec<SyncOperation> {
        self.received()
            .into_iter()
            .filter_map(|m| match m {
                WireMessage::Sync { operation } => Some(operation),
                _ => None,
            })
            .collect()
    }

    pub fn clear_received(&self) {
        self.lock().received.clear();
    }

    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.lock().connect_attempts.clone()
    }

    /// Target URL of every connect attempt, in order.
    pub fn connect_urls(&self) -> Vec<String> {
        self.lock().connect_urls.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().peers.len()
    }
}

#[async_trait]
impl TransportFactory for MockRelay {
    async fn connect(&self, url: &str) -> TransportResult<TransportConnection> {
        let (id, rx) = {
            let mut state = self.lock();
            state.connect_attempts.push(Instant::now());
            state.connect_urls.push(url.to_string());

            if state.refuse_connects {
                return Err(TransportError::ConnectionFailed("connection refused".into()));
            }

            let id = state.next_id;
            state.next_id += 1;

            let (tx, rx) = mpsc::unbounded_channel();
            state.peers.insert(
                id,
                Peer {
                    tx,
                    sessions: HashSet::new(),
                },
            );
            (id, rx)
        };

        let sink = futures_util::sink::unfold(self.clone(), move |relay: MockRelay, text: String| async move {
            relay.writes_released().await;
            relay.accept(id, &text).map(|()| relay)
        });

        Ok(TransportConnection {
            sink: Box::pin(sink),
            stream: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }
}

// =============================================================================
// Recording Hooks
// =============================================================================

/// Hooks that keep every event they see.
#[derive(Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: SyncEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn synced(&self) -> Vec<SyncOperation> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::Sync(operation) => Some(operation),
                _ => None,
            })
            .collect()
    }

    pub fn abandoned(&self) -> Vec<(SyncOperation, AbandonReason)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::OperationAbandoned { operation, reason } => Some((operation, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::ConnectionChanged(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn presence_updates(&self) -> Vec<PresenceUpdate> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::Presence(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::ServerError(message) => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl SyncHooks for RecordingHooks {
    fn on_sync(&self, operation: &SyncOperation) {
        self.push(SyncEvent::Sync(operation.clone()));
    }

    fn on_presence_update(&self, update: &PresenceUpdate) {
        self.push(SyncEvent::Presence(update.clone()));
    }

    fn on_connection_change(&self, state: ConnectionState) {
        self.push(SyncEvent::ConnectionChanged(state));
    }

    fn on_operation_abandoned(&self, operation: &SyncOperation, reason: AbandonReason) {
        self.push(SyncEvent::OperationAbandoned {
            operation: operation.clone(),
            reason,
        });
    }

    fn on_version_gap(&self, session_id: &str, expected: u64, received: u64) {
        self.push(SyncEvent::VersionGap {
            session_id: session_id.to_string(),
            expected,
            received,
        });
    }

    fn on_error(&self, message: &str) {
        self.push(SyncEvent::ServerError(message.to_string()));
    }
}

// =============================================================================
// Failing Store
// =============================================================================

/// A store whose every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingStore;

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        Err(StoreError::ConnectionFailed("disk unavailable".into()))
    }

    async fn set(&self, _key: &str, _value: String) -> StoreResult<()> {
        Err(StoreError::ConnectionFailed("disk unavailable".into()))
    }
}
