//! Client - one connection's actor
//!
//! A [`Client`] owns its outbound queue and subscription state. The actual
//! socket I/O runs in two pumps started by [`serve`]:
//!
//! ```text
//!              ┌────────── reader pump ◄────────── socket
//!  control ◄───┤   (subscriptions, ping, activity)
//!              │
//!  hub ──► OutboundQueue ──► writer pump ──────────► socket
//!                  (sole writer: coalesce, ping, close)
//! ```
//!
//! Lifecycle: `Connecting → Connected → Closing → Closed`, never backwards.
//! A reconnect is a brand-new `Client` with a new id.

mod pump;
mod queue;
mod subscriptions;
mod transport;

pub use pump::serve;
pub use queue::{OutboundQueue, PushError};
pub use subscriptions::{Scope, Subscriptions};
pub use transport::{Frame, FrameSink, FrameSource};

use crate::rate_limit::TokenBucket;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use hearth_core::{Event, EventType};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Opaque client identifier
pub type ClientId = String;

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Outbound queue capacity in frames
    pub queue_capacity: usize,
    /// Writer sends a ping after this long without writing
    pub ping_interval: Duration,
    /// Reader gives up after this long without any inbound frame
    pub pong_timeout: Duration,
    /// Deadline for a single socket write
    pub write_timeout: Duration,
    /// Largest inbound frame accepted, in bytes
    pub max_message_size: usize,
    /// Most queued frames written per flush
    pub max_coalesce: usize,
    /// Inbound control messages per second
    pub inbound_rate: u64,
    /// Inbound control message burst
    pub inbound_burst: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            ping_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_message_size: 4096,
            max_coalesce: 32,
            inbound_rate: 20,
            inbound_burst: 40,
        }
    }
}

/// Where a connection came from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientMetadata {
    /// Peer address as reported by the upgrade request
    pub remote_addr: Option<String>,
    /// `User-Agent` header
    pub user_agent: Option<String>,
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Created, not yet registered
    Connecting,
    /// Registered and pumping
    Connected,
    /// Shutting down; pumps are exiting
    Closing,
    /// Both pumps have exited
    Closed,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Snapshot of one client for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    /// Client id
    pub id: ClientId,
    /// Peer address
    pub remote_addr: Option<String>,
    /// User agent
    pub user_agent: Option<String>,
    /// Registration time
    pub connected_at: DateTime<Utc>,
    /// Last inbound frame
    pub last_activity: DateTime<Utc>,
    /// Auth flag fixed at construction
    pub authenticated: bool,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Subscribed event types
    pub event_types: Vec<EventType>,
    /// Entity allow-list, `None` = all
    pub entities: Option<Vec<String>>,
    /// Room allow-list, `None` = all
    pub rooms: Option<Vec<String>>,
    /// Hub topics
    pub topics: Vec<String>,
    /// Frames waiting in the outbound queue
    pub queued: usize,
}

/// One connected client
pub struct Client {
    id: ClientId,
    metadata: ClientMetadata,
    authenticated: bool,
    connected_at: DateTime<Utc>,
    /// Anchor for the activity clocks below
    epoch: Instant,
    /// Nanos since `epoch` of the last inbound frame
    last_activity: AtomicU64,
    /// Nanos since `epoch` of the last socket write
    last_write: AtomicU64,
    state: AtomicU8,
    queue: OutboundQueue,
    subscriptions: RwLock<Subscriptions>,
    inbound_limiter: TokenBucket,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl Client {
    /// Create a client for a freshly upgraded connection
    ///
    /// `authenticated` comes from the external auth decision and never
    /// changes afterwards.
    pub fn new(config: &ClientConfig, metadata: ClientMetadata, authenticated: bool) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id: ulid::Ulid::new().to_string(),
            metadata,
            authenticated,
            connected_at: Utc::now(),
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            queue: OutboundQueue::new(config.queue_capacity),
            subscriptions: RwLock::new(Subscriptions::default()),
            inbound_limiter: TokenBucket::new(config.inbound_rate, config.inbound_burst),
            shutdown,
        })
    }

    /// Client id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Connection metadata
    pub fn metadata(&self) -> &ClientMetadata {
        &self.metadata
    }

    /// Auth flag
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Registration time
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Outbound queue
    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Enqueue a frame without blocking
    pub fn enqueue(&self, frame: Bytes) -> Result<(), PushError> {
        self.queue.try_push(frame)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Activity
    // ─────────────────────────────────────────────────────────────────────────

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Record inbound activity
    pub fn touch(&self) {
        self.last_activity
            .store(self.now_nanos(), Ordering::Relaxed);
    }

    /// Record a socket write
    pub fn mark_written(&self) {
        self.last_write.store(self.now_nanos(), Ordering::Relaxed);
    }

    /// Time since the last inbound frame (or since creation)
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_nanos(self.now_nanos().saturating_sub(last))
    }

    /// Time since the last socket write (or since creation)
    pub fn write_idle_for(&self) -> Duration {
        let last = self.last_write.load(Ordering::Relaxed);
        Duration::from_nanos(self.now_nanos().saturating_sub(last))
    }

    /// Wall-clock time of the last inbound frame
    pub fn last_activity(&self) -> DateTime<Utc> {
        let offset = Duration::from_nanos(self.last_activity.load(Ordering::Relaxed));
        self.connected_at + TimeDelta::from_std(offset).unwrap_or(TimeDelta::zero())
    }

    /// Consume one inbound control-message token
    pub(crate) fn admit_inbound(&self) -> bool {
        self.inbound_limiter.try_acquire()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    /// Read the subscription state
    ///
    /// Hold the guard only for the duration of a check or copy.
    pub fn subscriptions(&self) -> RwLockReadGuard<'_, Subscriptions> {
        self.subscriptions.read()
    }

    /// Mutate the subscription state under the client's private lock
    pub fn update_subscriptions<R>(&self, f: impl FnOnce(&mut Subscriptions) -> R) -> R {
        f(&mut self.subscriptions.write())
    }

    /// Whether the client opted into `event_type`
    pub fn is_subscribed_to_event(&self, event_type: EventType) -> bool {
        self.subscriptions.read().is_subscribed_to_event(event_type)
    }

    /// Whether the entity filter admits `entity_id`
    pub fn is_subscribed_to_entity(&self, entity_id: &str) -> bool {
        self.subscriptions.read().is_subscribed_to_entity(entity_id)
    }

    /// Whether the room filter admits `room_id`
    pub fn is_subscribed_to_room(&self, room_id: &str) -> bool {
        self.subscriptions.read().is_subscribed_to_room(room_id)
    }

    /// Full per-recipient filter for an event with its room already resolved
    pub fn wants(&self, event: &Event) -> bool {
        self.subscriptions.read().matches(event)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                from.contains(&ConnectionState::from_u8(raw))
                    .then_some(to as u8)
            })
            .is_ok()
    }

    /// `Connecting → Connected`
    pub(crate) fn mark_connected(&self) -> bool {
        self.transition(&[ConnectionState::Connecting], ConnectionState::Connected)
    }

    /// `Closing → Closed`, once both pumps are done
    pub(crate) fn mark_closed(&self) {
        self.close();
        self.transition(&[ConnectionState::Closing], ConnectionState::Closed);
    }

    /// Begin shutting the connection down
    ///
    /// Closes the outbound queue (the writer drains nothing further and
    /// exits) and signals the reader to stop. Idempotent.
    pub fn close(&self) {
        self.transition(
            &[ConnectionState::Connecting, ConnectionState::Connected],
            ConnectionState::Closing,
        );
        self.queue.close();
        self.shutdown.send_replace(true);
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closing(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the client is asked to close
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Snapshot for the admin surface
    pub fn info(&self, topics: Vec<String>) -> ClientInfo {
        let subs = self.subscriptions.read();
        ClientInfo {
            id: self.id.clone(),
            remote_addr: self.metadata.remote_addr.clone(),
            user_agent: self.metadata.user_agent.clone(),
            connected_at: self.connected_at,
            last_activity: self.last_activity(),
            authenticated: self.authenticated,
            state: self.state(),
            event_types: subs.event_types(),
            entities: subs.entities().ids(),
            rooms: subs.rooms().ids(),
            topics,
            queued: self.queue.len(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn client() -> Arc<Client> {
        Client::new(
            &ClientConfig {
                queue_capacity: 2,
                ..ClientConfig::default()
            },
            ClientMetadata::default(),
            true,
        )
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(client().id(), client().id());
    }

    #[test]
    fn lifecycle_never_goes_backwards() {
        let c = client();
        assert_eq!(c.state(), ConnectionState::Connecting);
        assert!(c.mark_connected());
        assert_eq!(c.state(), ConnectionState::Connected);

        c.close();
        assert_eq!(c.state(), ConnectionState::Closing);
        assert!(!c.mark_connected());

        c.mark_closed();
        assert_eq!(c.state(), ConnectionState::Closed);
        c.close();
        assert_eq!(c.state(), ConnectionState::Closed);
    }

    #[test]
    fn close_shuts_the_queue() {
        let c = client();
        c.close();
        assert!(c.is_closing());
        assert_eq!(
            c.enqueue(Bytes::from_static(b"x")),
            Err(PushError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn activity_clock() {
        let c = client();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(c.idle_for(), Duration::from_secs(5));
        c.touch();
        assert_eq!(c.idle_for(), Duration::ZERO);
        assert!(c.last_activity() >= c.connected_at());
    }

    #[test]
    fn info_reflects_subscriptions() {
        let c = client();
        c.update_subscriptions(|s| {
            s.subscribe_event_types([EventType::StateChanged]);
            s.subscribe_entities(["light.kitchen".to_string()]);
        });
        let info = c.info(vec!["room:1".into()]);
        assert_eq!(info.event_types, vec![EventType::StateChanged]);
        assert_eq!(info.entities, Some(vec!["light.kitchen".to_string()]));
        assert_eq!(info.rooms, None);
        assert_eq!(info.topics, vec!["room:1".to_string()]);
        assert!(info.authenticated);
    }
}
