//! Hub runner - the single control loop
//!
//! Owns every write to the registry. Blocks on exactly four things:
//! commands, the heartbeat tick, the maintenance tick and shutdown.

use super::{DeliveryReport, EvictReason, HubCommand, HubConfig, Shared, Target};
use crate::client::{Client, PushError};
use crate::error::HubError;
use crate::metrics::Metrics;
use bytes::Bytes;
use hearth_core::Envelope;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Hub control loop; spawn [`run`](Self::run) exactly once
pub struct HubRunner {
    rx: mpsc::Receiver<HubCommand>,
    shared: Arc<Shared>,
    config: HubConfig,
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl HubRunner {
    pub(crate) fn new(rx: mpsc::Receiver<HubCommand>, shared: Arc<Shared>, config: HubConfig) -> Self {
        Self { rx, shared, config }
    }

    /// Process commands until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!(
            max_clients = self.config.max_clients,
            heartbeat_secs = self.config.heartbeat_interval.as_secs(),
            client_timeout_secs = self.config.client_timeout.as_secs(),
            "Hub started"
        );

        let mut heartbeat = ticker(self.config.heartbeat_interval);
        let mut maintenance = ticker(self.config.maintenance_interval);

        loop {
            tokio::select! {
                biased;

                // Due ticks win over a busy mailbox
                _ = heartbeat.tick() => self.heartbeat(),
                _ = maintenance.tick() => self.sweep_idle(),
                command = self.rx.recv() => match command {
                    Some(HubCommand::Shutdown { reply }) => {
                        self.close_all();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.close_all();
                        break;
                    }
                },
            }
        }

        // Refuse further commands; pending replies resolve to Shutdown
        self.rx.close();
        info!("Hub stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { client, reply } => {
                let _ = reply.send(self.register(client));
            }
            HubCommand::Unregister { id, reason } => self.evict(&id, reason),
            HubCommand::Subscribe { id, topics, reply } => {
                {
                    let mut registry = self.shared.registry.write();
                    for topic in &topics {
                        registry.subscribe(&id, topic);
                    }
                }
                debug!(client_id = %id, topics = ?topics, "Client subscribed to topics");
                self.update_gauges();
                let _ = reply.send(());
            }
            HubCommand::Unsubscribe { id, topics, reply } => {
                {
                    let mut registry = self.shared.registry.write();
                    for topic in &topics {
                        registry.unsubscribe(&id, topic);
                    }
                }
                debug!(client_id = %id, topics = ?topics, "Client unsubscribed from topics");
                self.update_gauges();
                let _ = reply.send(());
            }
            HubCommand::Deliver {
                target,
                frame,
                reply,
            } => {
                let report = self.deliver(target, frame);
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            // Handled in the select loop
            HubCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn register(&mut self, client: Arc<Client>) -> Result<(), HubError> {
        let current = self.shared.registry.read().len();
        if current >= self.config.max_clients {
            self.shared
                .stats
                .rejected_connections
                .fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = Metrics::get() {
                metrics.record_rejected("capacity");
            }
            warn!(
                client_id = %client.id(),
                max_clients = self.config.max_clients,
                "Hub at capacity, connection rejected"
            );
            client.close();
            return Err(HubError::Capacity {
                max: self.config.max_clients,
            });
        }

        client.mark_connected();
        let total = {
            let mut registry = self.shared.registry.write();
            registry.insert(Arc::clone(&client));
            registry.len()
        };
        self.shared
            .stats
            .total_connections
            .fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = Metrics::get() {
            metrics.record_connected(total);
        }

        info!(
            client_id = %client.id(),
            remote_addr = client.metadata().remote_addr.as_deref().unwrap_or("unknown"),
            authenticated = client.is_authenticated(),
            total_clients = total,
            "Client registered"
        );

        match Envelope::welcome(client.id()).to_bytes() {
            Ok(frame) => {
                self.deliver(Target::Client(client.id().to_string()), frame);
            }
            Err(e) => warn!(client_id = %client.id(), error = %e, "Failed to encode welcome frame"),
        }
        Ok(())
    }

    /// Non-blocking fan-out; full queues get their owner evicted
    fn deliver(&mut self, target: Target, frame: Bytes) -> DeliveryReport {
        let recipients: Vec<Arc<Client>> = {
            let registry = self.shared.registry.read();
            match &target {
                Target::All => registry.clients().cloned().collect(),
                Target::Topic(topic) => registry.topic_members(topic),
                Target::Client(id) => registry.get(id).cloned().into_iter().collect(),
                Target::Matching(filter) => registry
                    .clients()
                    .filter(|c| {
                        let client: &Client = c;
                        filter(client)
                    })
                    .cloned()
                    .collect(),
            }
        };

        let mut report = DeliveryReport::default();
        let mut unresponsive = Vec::new();
        for client in &recipients {
            match client.enqueue(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(PushError::Full) => unresponsive.push(client.id().to_string()),
                // Already closing; its unregister is on the way
                Err(PushError::Closed) => {}
            }
        }

        for id in &unresponsive {
            self.evict(id, EvictReason::QueueFull);
        }
        report.evicted = unresponsive.len();

        let stats = &self.shared.stats;
        stats
            .messages_sent
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        stats
            .bytes_sent
            .fetch_add((report.delivered * frame.len()) as u64, Ordering::Relaxed);
        if let Some(metrics) = Metrics::get() {
            metrics.record_sent(report.delivered as u64, frame.len());
        }
        report
    }

    fn evict(&mut self, id: &str, reason: EvictReason) {
        let (removed, remaining) = {
            let mut registry = self.shared.registry.write();
            let removed = registry.remove(id);
            (removed, registry.len())
        };
        let Some(client) = removed else {
            return;
        };

        client.close();
        self.shared.stats.evictions.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = Metrics::get() {
            metrics.record_evicted(reason.as_str(), remaining);
        }
        self.update_gauges();

        match reason {
            EvictReason::QueueFull | EvictReason::Idle => warn!(
                client_id = %id,
                reason = reason.as_str(),
                idle_secs = client.idle_for().as_secs(),
                remaining_clients = remaining,
                "Client evicted"
            ),
            EvictReason::Disconnected | EvictReason::Shutdown => info!(
                client_id = %id,
                reason = reason.as_str(),
                remaining_clients = remaining,
                "Client unregistered"
            ),
        }
    }

    fn heartbeat(&mut self) {
        let connected = self.shared.registry.read().len();
        if connected == 0 {
            return;
        }
        let uptime = self.shared.started_at.elapsed().as_secs();
        match Envelope::heartbeat(connected, uptime).to_bytes() {
            Ok(frame) => {
                let report = self.deliver(Target::All, frame);
                debug!(
                    delivered = report.delivered,
                    evicted = report.evicted,
                    "Heartbeat sent"
                );
            }
            Err(e) => warn!(error = %e, "Failed to encode heartbeat"),
        }
    }

    fn sweep_idle(&mut self) {
        let timeout = self.config.client_timeout;
        let idle: Vec<String> = self
            .shared
            .registry
            .read()
            .clients()
            .filter(|c| c.idle_for() > timeout)
            .map(|c| c.id().to_string())
            .collect();

        for id in &idle {
            self.evict(id, EvictReason::Idle);
        }
        if !idle.is_empty() {
            info!(evicted = idle.len(), "Idle clients evicted");
        }
        self.update_gauges();
    }

    fn update_gauges(&self) {
        if let Some(metrics) = Metrics::get() {
            let registry = self.shared.registry.read();
            metrics.set_registry_size(registry.len(), registry.topic_count());
        }
    }

    fn close_all(&mut self) {
        let clients = self.shared.registry.write().drain();
        for client in &clients {
            client.close();
        }
        if let Some(metrics) = Metrics::get() {
            for _ in &clients {
                metrics.record_evicted(EvictReason::Shutdown.as_str(), 0);
            }
        }
        info!(closed = clients.len(), "Hub closed all clients");
    }
}
