//! Hub - the client registry and broadcast engine
//!
//! All registry mutation and all fan-out run on one control loop
//! ([`HubRunner`]). Everything else talks to it through a cloneable
//! [`HubHandle`] that sends commands over a channel, so the client set and
//! topic index are never written from two tasks at once.
//!
//! # Backpressure
//!
//! Delivery is a non-blocking push into each recipient's bounded queue. A
//! client whose queue is full is evicted on the spot: slow consumers get
//! disconnected, they never stall the broadcaster or anyone else.
//!
//! # Example
//!
//! ```ignore
//! use hearth_gateway::hub::Hub;
//!
//! let (hub, runner) = Hub::new().max_clients(500).build();
//! tokio::spawn(runner.run());
//!
//! hub.broadcast_to_topic("room:kitchen", &envelope).await?;
//! hub.shutdown().await;
//! ```

mod registry;
mod runner;

pub use runner::HubRunner;

use crate::client::{Client, ClientId, ClientInfo};
use crate::error::HubError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hearth_core::Envelope;
use parking_lot::RwLock;
use registry::Registry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Hub settings
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Registrations beyond this are refused
    pub max_clients: usize,
    /// Interval between heartbeat broadcasts
    pub heartbeat_interval: Duration,
    /// Interval between idle-client sweeps
    pub maintenance_interval: Duration,
    /// Clients silent for longer than this are evicted
    pub client_timeout: Duration,
    /// Command channel depth
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_clients: 1000,
            heartbeat_interval: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(300),
            command_capacity: 1024,
        }
    }
}

/// Hub builder
#[derive(Debug, Clone, Default)]
pub struct Hub {
    config: HubConfig,
}

impl Hub {
    /// Builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder from an existing config
    pub fn with_config(config: HubConfig) -> Self {
        Self { config }
    }

    /// Maximum registered clients
    pub fn max_clients(mut self, max: usize) -> Self {
        self.config.max_clients = max;
        self
    }

    /// Heartbeat broadcast interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Idle sweep interval
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.config.maintenance_interval = interval;
        self
    }

    /// Inactivity timeout
    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.config.client_timeout = timeout;
        self
    }

    /// Command channel depth
    pub fn command_capacity(mut self, capacity: usize) -> Self {
        self.config.command_capacity = capacity.max(1);
        self
    }

    /// Split into a handle and the control loop that must be spawned
    pub fn build(self) -> (HubHandle, HubRunner) {
        let (tx, rx) = mpsc::channel(self.config.command_capacity.max(1));
        let shared = Arc::new(Shared {
            registry: RwLock::new(Registry::default()),
            stats: HubStats::default(),
            started_at: Instant::now(),
            started_wall: Utc::now(),
        });
        let handle = HubHandle {
            tx,
            shared: Arc::clone(&shared),
        };
        let runner = HubRunner::new(rx, shared, self.config);
        (handle, runner)
    }

    /// Build and spawn the control loop
    pub fn start(self) -> (HubHandle, JoinHandle<()>) {
        let (handle, runner) = self.build();
        (handle, tokio::spawn(runner.run()))
    }
}

/// Why a client left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Outbound queue was full
    QueueFull,
    /// No inbound activity within the timeout
    Idle,
    /// Connection ended on its own
    Disconnected,
    /// Hub is stopping
    Shutdown,
}

impl EvictReason {
    /// Metrics label
    pub fn as_str(self) -> &'static str {
        match self {
            EvictReason::QueueFull => "queue_full",
            EvictReason::Idle => "idle",
            EvictReason::Disconnected => "disconnected",
            EvictReason::Shutdown => "shutdown",
        }
    }
}

/// Topic joined by `subscribe_room`
pub fn room_topic(room_id: &str) -> String {
    format!("room:{room_id}")
}

/// Topic carrying updates for one entity
pub fn entity_topic(entity_id: &str) -> String {
    format!("entity:{entity_id}")
}

/// Per-recipient predicate used by [`Target::Matching`]
pub type ClientFilter = Arc<dyn Fn(&Client) -> bool + Send + Sync>;

/// Who a frame goes to
#[derive(Clone)]
pub enum Target {
    /// Every registered client
    All,
    /// Members of a topic
    Topic(String),
    /// One client by id
    Client(ClientId),
    /// Every client the predicate accepts
    Matching(ClientFilter),
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::All => f.write_str("All"),
            Target::Topic(t) => f.debug_tuple("Topic").field(t).finish(),
            Target::Client(id) => f.debug_tuple("Client").field(id).finish(),
            Target::Matching(_) => f.write_str("Matching(..)"),
        }
    }
}

/// What one delivery did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Recipients whose queue accepted the frame
    pub delivered: usize,
    /// Recipients evicted because their queue was full
    pub evicted: usize,
}

/// Hub-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct HubMetrics {
    /// Currently registered clients
    pub connected_clients: usize,
    /// Registrations accepted since start
    pub total_connections: u64,
    /// Registrations refused since start
    pub rejected_connections: u64,
    /// Frames enqueued to clients
    pub messages_sent: u64,
    /// Bytes enqueued to clients
    pub bytes_sent: u64,
    /// Frames read from clients
    pub messages_received: u64,
    /// Clients removed by eviction or disconnect
    pub evictions: u64,
    /// Topics with members
    pub topic_count: usize,
    /// Members per topic
    pub clients_per_topic: BTreeMap<String, usize>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Seconds since start
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
pub(crate) struct HubStats {
    pub(crate) total_connections: AtomicU64,
    pub(crate) rejected_connections: AtomicU64,
    pub(crate) messages_sent: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) messages_received: AtomicU64,
    pub(crate) evictions: AtomicU64,
}

/// State readable from outside the control loop
#[derive(Debug)]
pub(crate) struct Shared {
    /// Written only by the control loop; readers copy and release
    pub(crate) registry: RwLock<Registry>,
    pub(crate) stats: HubStats,
    pub(crate) started_at: Instant,
    pub(crate) started_wall: DateTime<Utc>,
}

pub(crate) enum HubCommand {
    Register {
        client: Arc<Client>,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Unregister {
        id: ClientId,
        reason: EvictReason,
    },
    Subscribe {
        id: ClientId,
        topics: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    Unsubscribe {
        id: ClientId,
        topics: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    Deliver {
        target: Target,
        frame: Bytes,
        reply: Option<oneshot::Sender<DeliveryReport>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to a running hub
///
/// Every operation fails only with [`HubError::Shutdown`] once the control
/// loop has stopped (or [`HubError::Capacity`] for a full registry).
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("running", &self.is_running())
            .field("clients", &self.client_count())
            .finish()
    }
}

impl HubHandle {
    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.tx.send(command).await.map_err(|_| HubError::Shutdown)
    }

    /// Add a client; refused with [`HubError::Capacity`] when full
    ///
    /// On success the welcome frame is already in the client's queue.
    pub async fn register(&self, client: Arc<Client>) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Register { client, reply }).await?;
        rx.await.map_err(|_| HubError::Shutdown)?
    }

    /// Remove a client; unknown ids are ignored
    pub async fn unregister(&self, id: &str) -> Result<(), HubError> {
        self.send(HubCommand::Unregister {
            id: id.to_string(),
            reason: EvictReason::Disconnected,
        })
        .await
    }

    /// Evict a client for a specific reason
    pub async fn evict(&self, id: &str, reason: EvictReason) -> Result<(), HubError> {
        self.send(HubCommand::Unregister {
            id: id.to_string(),
            reason,
        })
        .await
    }

    /// Join topics; resolves once the index is updated
    pub async fn subscribe(&self, id: &str, topics: Vec<String>) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Subscribe {
            id: id.to_string(),
            topics,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Shutdown)
    }

    /// Leave topics; resolves once the index is updated
    pub async fn unsubscribe(&self, id: &str, topics: Vec<String>) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Unsubscribe {
            id: id.to_string(),
            topics,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Shutdown)
    }

    /// Deliver a pre-serialized frame and wait for the outcome
    pub async fn deliver(&self, target: Target, frame: Bytes) -> Result<DeliveryReport, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Deliver {
            target,
            frame,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| HubError::Shutdown)
    }

    /// Queue a frame for delivery without waiting for the outcome
    pub async fn dispatch(&self, target: Target, frame: Bytes) -> Result<(), HubError> {
        self.send(HubCommand::Deliver {
            target,
            frame,
            reply: None,
        })
        .await
    }

    /// Send to every client
    pub async fn broadcast_to_all(&self, envelope: &Envelope) -> Result<DeliveryReport, HubError> {
        self.deliver(Target::All, encode(envelope)?).await
    }

    /// Send to members of `topic`
    pub async fn broadcast_to_topic(
        &self,
        topic: &str,
        envelope: &Envelope,
    ) -> Result<DeliveryReport, HubError> {
        self.deliver(Target::Topic(topic.to_string()), encode(envelope)?)
            .await
    }

    /// Send to one client
    pub async fn send_to_client(
        &self,
        id: &str,
        envelope: &Envelope,
    ) -> Result<DeliveryReport, HubError> {
        self.deliver(Target::Client(id.to_string()), encode(envelope)?)
            .await
    }

    /// Send to every client `filter` accepts
    pub async fn broadcast_matching(
        &self,
        frame: Bytes,
        filter: ClientFilter,
    ) -> Result<DeliveryReport, HubError> {
        self.deliver(Target::Matching(filter), frame).await
    }

    /// Stop the control loop, closing every client
    ///
    /// Idempotent; resolves once the loop has dropped all clients.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(HubCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether the control loop is still accepting commands
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Read-only snapshots
    // ─────────────────────────────────────────────────────────────────────────

    /// Number of registered clients
    pub fn client_count(&self) -> usize {
        self.shared.registry.read().len()
    }

    /// Look up a registered client
    pub fn client(&self, id: &str) -> Option<Arc<Client>> {
        self.shared.registry.read().get(id).cloned()
    }

    /// Whether `id` is registered
    pub fn contains(&self, id: &str) -> bool {
        self.shared.registry.read().contains(id)
    }

    /// Snapshot of every registered client
    pub fn clients(&self) -> Vec<ClientInfo> {
        let copied: Vec<(Arc<Client>, Vec<String>)> = {
            let registry = self.shared.registry.read();
            registry
                .clients()
                .map(|c| (Arc::clone(c), registry.topics_of(c.id())))
                .collect()
        };
        let mut infos: Vec<ClientInfo> = copied
            .into_iter()
            .map(|(client, topics)| client.info(topics))
            .collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Registered clients with at least one event type enabled
    pub fn subscribed_client_count(&self) -> usize {
        let clients: Vec<Arc<Client>> = self.shared.registry.read().clients().cloned().collect();
        clients
            .iter()
            .filter(|c| c.subscriptions().has_event_types())
            .count()
    }

    /// Hub-wide counters
    pub fn metrics(&self) -> HubMetrics {
        let (connected_clients, topic_count, clients_per_topic) = {
            let registry = self.shared.registry.read();
            (
                registry.len(),
                registry.topic_count(),
                registry.topic_sizes(),
            )
        };
        let stats = &self.shared.stats;
        HubMetrics {
            connected_clients,
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            rejected_connections: stats.rejected_connections.load(Ordering::Relaxed),
            messages_sent: stats.messages_sent.load(Ordering::Relaxed),
            bytes_sent: stats.bytes_sent.load(Ordering::Relaxed),
            messages_received: stats.messages_received.load(Ordering::Relaxed),
            evictions: stats.evictions.load(Ordering::Relaxed),
            topic_count,
            clients_per_topic,
            started_at: self.shared.started_wall,
            uptime_secs: self.shared.started_at.elapsed().as_secs(),
        }
    }

    pub(crate) fn record_received(&self) {
        self.shared
            .stats
            .messages_received
            .fetch_add(1, Ordering::Relaxed);
    }
}

fn encode(envelope: &Envelope) -> Result<Bytes, HubError> {
    envelope
        .to_bytes()
        .map_err(|e| HubError::Serialization(e.to_string()))
}
