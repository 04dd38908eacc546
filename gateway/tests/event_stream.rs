//! End-to-end tests: forwarder → hub → client pumps → in-memory transport
//!
//! Each connection runs the real reader and writer pumps over a pair of
//! unbounded channels, so frames are observed exactly as a socket would
//! carry them.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use hearth_core::{Data, Envelope, Event, EventType};
use hearth_gateway::client::serve;
use hearth_gateway::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, Client, ClientConfig,
    ClientMetadata, ConnectionState, EventForwarder, ForwardError, ForwardOutcome,
    ForwarderConfig, Frame, FrameSink, FrameSource, Hub, HubError, HubHandle, TokenBucket,
    TransportError,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

// ============================================================================
// In-memory transport
// ============================================================================

struct ChannelSink(mpsc::UnboundedSender<Frame>);

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.0.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.0.send(Frame::Close);
        Ok(())
    }
}

/// A peer that never reads: every write hangs
struct StalledSink;

#[async_trait]
impl FrameSink for StalledSink {
    async fn send(&mut self, _frame: Frame) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct ChannelSource(mpsc::UnboundedReceiver<Frame>);

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.0.recv().await.map(Ok)
    }
}

struct Peer {
    client: Arc<Client>,
    to_server: mpsc::UnboundedSender<Frame>,
    from_server: mpsc::UnboundedReceiver<Frame>,
    task: JoinHandle<Result<(), HubError>>,
}

impl Peer {
    fn connect(hub: &HubHandle, config: ClientConfig) -> Self {
        let (to_server, server_rx) = mpsc::unbounded_channel();
        let (server_tx, from_server) = mpsc::unbounded_channel();
        let client = Client::new(&config, ClientMetadata::default(), false);
        let task = tokio::spawn(serve(
            Arc::clone(&client),
            hub.clone(),
            config,
            ChannelSink(server_tx),
            ChannelSource(server_rx),
        ));
        Self {
            client,
            to_server,
            from_server,
            task,
        }
    }

    /// Connect and consume the welcome frame
    async fn ready(hub: &HubHandle, config: ClientConfig) -> Self {
        let mut peer = Self::connect(hub, config);
        assert_eq!(peer.recv().await.message_type, "welcome");
        peer
    }

    fn send(&self, raw: serde_json::Value) {
        self.to_server
            .send(Frame::Text(Bytes::from(raw.to_string())))
            .unwrap();
    }

    /// Send a ping and wait for its pong, so every earlier message is applied
    async fn sync(&mut self) {
        self.send(json!({"type": "ping"}));
        loop {
            if self.recv().await.message_type == "pong" {
                return;
            }
        }
    }

    async fn recv(&mut self) -> Envelope {
        loop {
            let frame = timeout(Duration::from_secs(5), self.from_server.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection closed");
            match frame {
                Frame::Text(raw) => return Envelope::from_slice(&raw).unwrap(),
                Frame::Ping(_) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    /// Everything received so far without waiting
    fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(frame) = self.from_server.try_recv() {
            if let Frame::Text(raw) = frame {
                out.push(Envelope::from_slice(&raw).unwrap());
            }
        }
        out
    }
}

fn immediate() -> ForwarderConfig {
    ForwarderConfig::default()
        .rate_limit(0, 0)
        .without_batching()
        .event_types(EventType::ALL)
}

// ============================================================================
// Hub backpressure
// ============================================================================

#[tokio::test]
async fn stalled_client_never_blocks_the_broadcast() {
    let (hub, _hub_task) = Hub::new().start();
    let mut peers = Vec::new();
    for _ in 0..4 {
        peers.push(Peer::ready(&hub, ClientConfig::default()).await);
    }

    let config = ClientConfig {
        queue_capacity: 4,
        write_timeout: Duration::from_millis(100),
        ..ClientConfig::default()
    };
    let stalled = Client::new(&config, ClientMetadata::default(), false);
    let (_keep_open, source_rx) = mpsc::unbounded_channel();
    let stalled_task = tokio::spawn(serve(
        Arc::clone(&stalled),
        hub.clone(),
        config,
        StalledSink,
        ChannelSource(source_rx),
    ));
    while !hub.contains(stalled.id()) {
        tokio::task::yield_now().await;
    }

    for n in 0..10 {
        let envelope = Envelope::new("announcement", Data::from_iter([("n".into(), json!(n))]));
        timeout(Duration::from_secs(1), hub.broadcast_to_all(&envelope))
            .await
            .expect("broadcast stalled")
            .unwrap();
    }

    for peer in &mut peers {
        for n in 0..10 {
            let envelope = peer.recv().await;
            assert_eq!(envelope.message_type, "announcement");
            assert_eq!(envelope.data["n"], n);
        }
    }

    // The stalled connection is evicted and fully closed
    stalled_task.await.unwrap().unwrap();
    assert!(!hub.contains(stalled.id()));
    assert_eq!(stalled.state(), ConnectionState::Closed);
    assert_eq!(hub.client_count(), 4);
    assert_eq!(hub.metrics().evictions, 1);
}

// ============================================================================
// Forwarding through real connections
// ============================================================================

#[tokio::test]
async fn subscribed_entity_receives_its_state_change() {
    let (hub, _hub_task) = Hub::new().start();
    let forwarder = EventForwarder::new(hub.clone(), immediate());
    let mut peer = Peer::ready(&hub, ClientConfig::default()).await;

    peer.send(json!({"type": "subscribe_ha_events", "data": {"event_types": ["state_changed"]}}));
    peer.send(json!({"type": "subscribe_ha_entities", "data": {"entity_ids": ["light.kitchen"]}}));
    peer.sync().await;

    forwarder
        .forward_state_changed("light.kitchen", json!("off"), json!("on"), Data::new())
        .await
        .unwrap();

    let envelope = peer.recv().await;
    assert_eq!(envelope.message_type, "state_changed");
    assert_eq!(envelope.data["entity_id"], "light.kitchen");
    assert_eq!(envelope.data["new_state"], "on");

    peer.sync().await;
    assert!(peer.drain().is_empty());
}

#[tokio::test]
async fn other_entities_are_filtered_out() {
    let (hub, _hub_task) = Hub::new().start();
    let forwarder = EventForwarder::new(hub.clone(), immediate());
    let mut peer = Peer::ready(&hub, ClientConfig::default()).await;

    peer.send(json!({"type": "subscribe_event_types", "data": {"event_types": ["state_changed"]}}));
    peer.send(json!({"type": "subscribe_entities", "data": {"entity_ids": ["light.kitchen"]}}));
    peer.sync().await;

    let outcome = forwarder
        .forward_state_changed("switch.fan", json!("off"), json!("on"), Data::new())
        .await
        .unwrap();
    assert!(matches!(outcome, ForwardOutcome::Delivered(r) if r.delivered == 0));

    peer.sync().await;
    assert!(peer.drain().is_empty());
    assert_eq!(peer.client.queue().len(), 0);
}

#[tokio::test]
async fn room_filter_uses_entity_mapping() {
    let (hub, _hub_task) = Hub::new().start();
    let forwarder = EventForwarder::new(hub.clone(), immediate());
    forwarder.update_room_filters(
        [("light.kitchen", "kitchen"), ("light.bedroom", "bedroom")]
            .into_iter()
            .map(|(e, r)| (e.to_string(), r.to_string()))
            .collect(),
    );
    let mut peer = Peer::ready(&hub, ClientConfig::default()).await;
    peer.send(json!({"type": "subscribe_ha_events", "data": {"event_types": ["state_changed"]}}));
    peer.send(json!({"type": "subscribe_ha_rooms", "data": {"room_ids": ["kitchen"]}}));
    peer.sync().await;

    for entity in ["light.bedroom", "light.kitchen", "light.unmapped"] {
        forwarder
            .forward_state_changed(entity, json!("off"), json!("on"), Data::new())
            .await
            .unwrap();
    }
    peer.sync().await;

    let entities: Vec<String> = peer
        .drain()
        .into_iter()
        .filter(|e| e.message_type == "state_changed")
        .map(|e| e.data["entity_id"].as_str().unwrap().to_string())
        .collect();
    // Unmapped entities are not room-filtered
    assert_eq!(entities, vec!["light.kitchen", "light.unmapped"]);
}

#[tokio::test(start_paused = true)]
async fn batch_window_delivers_everything_once_in_order() {
    let (hub, _hub_task) = Hub::new()
        .heartbeat_interval(Duration::from_secs(3600))
        .start();
    let forwarder = EventForwarder::new(
        hub.clone(),
        immediate().batching(Duration::from_millis(50), 100),
    );
    forwarder.start();
    let mut peer = Peer::ready(&hub, ClientConfig::default()).await;
    peer.send(json!({"type": "subscribe_ha_events", "data": {"event_types": ["state_changed"]}}));
    peer.sync().await;

    for n in 0..5 {
        let event = Event::new(
            EventType::StateChanged,
            Data::from_iter([("n".into(), json!(n))]),
        )
        .with_entity("light.kitchen");
        assert_eq!(
            forwarder.forward(event).await.unwrap(),
            ForwardOutcome::Batched
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(peer.drain().is_empty());

    let order: Vec<u64> = {
        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(peer.recv().await.data["n"].as_u64().unwrap());
        }
        order
    };
    assert_eq!(order, vec![0, 1, 2, 3, 4]);

    let stats = forwarder.stats();
    assert_eq!(stats.batches_processed, 1);
    assert_eq!(stats.batched_events, 5);
    assert_eq!(stats.events_forwarded, 5);
    assert_eq!(stats.connected_clients, 1);
    assert_eq!(stats.subscribed_clients, 1);
}

#[tokio::test]
async fn rapid_updates_to_one_entity_stay_ordered_across_flushes() {
    let (hub, _hub_task) = Hub::new().start();
    let forwarder = EventForwarder::new(
        hub.clone(),
        immediate().batching(Duration::from_millis(5), 3),
    );
    forwarder.start();
    let mut peer = Peer::ready(&hub, ClientConfig::default()).await;
    peer.send(json!({"type": "subscribe_ha_events", "data": {"event_types": ["state_changed"]}}));
    peer.sync().await;

    for n in 0..20 {
        forwarder
            .forward_state_changed("light.kitchen", json!(n), json!(n + 1), Data::new())
            .await
            .unwrap();
        if n % 4 == 0 {
            tokio::time::sleep(Duration::from_millis(6)).await;
        }
    }
    forwarder.stop().await;

    let mut seen = Vec::new();
    for _ in 0..20 {
        seen.push(peer.recv().await.data["new_state"].as_u64().unwrap());
    }
    assert_eq!(seen, (1..=20).collect::<Vec<u64>>());
}

// ============================================================================
// Resilience
// ============================================================================

#[tokio::test]
async fn forwarding_fails_fast_once_delivery_keeps_failing() {
    let (hub, hub_task) = Hub::new().start();
    let mut config = immediate();
    config.circuit_breaker.max_failures = 3;
    let forwarder = EventForwarder::new(hub.clone(), config);
    hub.shutdown().await;
    hub_task.await.unwrap();

    for _ in 0..3 {
        assert_eq!(
            forwarder.forward_sync_status("syncing", "", 1).await,
            Err(ForwardError::Hub(HubError::Shutdown))
        );
    }
    assert!(matches!(
        forwarder.forward_sync_status("syncing", "", 1).await,
        Err(ForwardError::Unavailable { .. })
    ));
    assert_eq!(forwarder.circuit_breaker().current_state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn breaker_admits_one_trial_after_reset_timeout() {
    let breaker = Arc::new(CircuitBreaker::new(
        "upstream",
        CircuitBreakerConfig {
            max_failures: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        },
    ));
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        let result: Result<(), _> = breaker
            .call(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("refused")
            })
            .await;
        assert_eq!(result, Err(CircuitError::Inner("refused")));
    }

    let rejected = breaker.call(|| async { Ok::<_, &str>(()) }).await;
    assert!(matches!(rejected, Err(CircuitError::Open { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::advance(Duration::from_secs(31)).await;

    // Trial held open while a second caller arrives
    let (release, hold) = tokio::sync::oneshot::channel::<()>();
    let trial = {
        let breaker = Arc::clone(&breaker);
        tokio::spawn(async move {
            breaker
                .call(|| async move {
                    let _ = hold.await;
                    Ok::<_, &str>(())
                })
                .await
        })
    };
    tokio::task::yield_now().await;
    assert_eq!(breaker.current_state(), CircuitState::HalfOpen);
    let concurrent = breaker.call(|| async { Ok::<_, &str>(()) }).await;
    assert!(matches!(concurrent, Err(CircuitError::Open { .. })));

    release.send(()).unwrap();
    trial.await.unwrap().unwrap();
    assert_eq!(breaker.current_state(), CircuitState::Closed);
}

#[test]
fn token_bucket_stays_within_bounds() {
    let bucket = TokenBucket::new(1_000, 5);
    for round in 0..50 {
        for _ in 0..(round % 7) {
            bucket.try_acquire();
        }
        let available = bucket.available();
        assert!((0.0..=bucket.capacity()).contains(&available));
        std::thread::sleep(Duration::from_micros(300));
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn disconnect_removes_client_and_its_topics() {
    let (hub, _hub_task) = Hub::new().start();
    let mut peer = Peer::ready(&hub, ClientConfig::default()).await;
    peer.send(json!({"type": "subscribe", "data": {"topics": ["room:1", "entity:light.a"]}}));
    assert_eq!(peer.recv().await.message_type, "subscription_confirmed");
    assert_eq!(hub.metrics().topic_count, 2);

    let Peer {
        client,
        to_server,
        task,
        ..
    } = peer;
    drop(to_server);
    task.await.unwrap().unwrap();

    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(hub.client_count(), 0);
    assert_eq!(hub.metrics().topic_count, 0);
}

#[tokio::test]
async fn hub_shutdown_closes_every_connection() {
    let (hub, hub_task) = Hub::new().start();
    let peers = vec![
        Peer::ready(&hub, ClientConfig::default()).await,
        Peer::ready(&hub, ClientConfig::default()).await,
    ];

    hub.shutdown().await;
    hub_task.await.unwrap();

    for peer in peers {
        peer.task.await.unwrap().unwrap();
        assert_eq!(peer.client.state(), ConnectionState::Closed);
    }
    assert!(!hub.is_running());
}
