//! Read and write pumps
//!
//! [`serve`] registers the client, runs the writer as its own task and the
//! reader inline, and tears everything down when either side stops.

use super::{Client, ClientConfig, Frame, FrameSink, FrameSource, PushError};
use crate::error::HubError;
use crate::hub::{EvictReason, HubHandle, room_topic};
use crate::metrics::Metrics;
use bytes::Bytes;
use hearth_core::{ControlMessage, Data, Envelope, EventType, ProtocolError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// Drive one connection from registration to close
///
/// Returns an error only if the hub refused the registration (capacity or
/// shutdown); the sink is closed in that case too.
pub async fn serve<S, R>(
    client: Arc<Client>,
    hub: HubHandle,
    config: ClientConfig,
    mut sink: S,
    source: R,
) -> Result<(), HubError>
where
    S: FrameSink,
    R: FrameSource,
{
    if let Err(e) = hub.register(Arc::clone(&client)).await {
        let _ = timeout(config.write_timeout, sink.close()).await;
        client.mark_closed();
        return Err(e);
    }

    let writer = tokio::spawn(write_pump(Arc::clone(&client), sink, config.clone()));

    read_pump(&client, &hub, source, &config).await;

    client.close();
    // Hub already gone means the client is already out of the registry
    let _ = hub.unregister(client.id()).await;
    if let Err(e) = writer.await {
        warn!(client_id = %client.id(), error = %e, "Writer task failed");
    }
    client.mark_closed();

    info!(
        client_id = %client.id(),
        connected_secs = (chrono::Utc::now() - client.connected_at()).num_seconds(),
        "Connection closed"
    );
    Ok(())
}

/// Sole writer to the socket
///
/// Waits for queued frames and writes everything currently queued with one
/// flush. Pings go out every ping interval regardless of application
/// traffic, so a peer that only answers pings keeps the reader's pong
/// deadline satisfied.
async fn write_pump<S: FrameSink>(client: Arc<Client>, mut sink: S, config: ClientConfig) {
    let max_coalesce = config.max_coalesce.max(1);
    let ping_interval = config.ping_interval.max(Duration::from_millis(1));
    let mut pending: Vec<Bytes> = Vec::with_capacity(max_coalesce);
    let mut next_ping = Instant::now() + ping_interval;

    loop {
        if client.queue().is_closed() {
            break;
        }

        // Checked before draining so a steady stream of frames can't delay it
        if Instant::now() >= next_ping {
            next_ping = Instant::now() + ping_interval;
            match timeout(config.write_timeout, sink.send(Frame::Ping(Bytes::new()))).await {
                Ok(Ok(())) => client.mark_written(),
                Ok(Err(e)) => {
                    debug!(client_id = %client.id(), error = %e, "Ping failed");
                    break;
                }
                Err(_) => {
                    warn!(client_id = %client.id(), "Ping write deadline elapsed");
                    break;
                }
            }
            continue;
        }

        if client.queue().drain_into(&mut pending, max_coalesce) > 0 {
            let frames: Vec<Frame> = pending.drain(..).map(Frame::Text).collect();
            match timeout(config.write_timeout, sink.send_all(frames)).await {
                Ok(Ok(())) => client.mark_written(),
                Ok(Err(e)) => {
                    debug!(client_id = %client.id(), error = %e, "Write failed");
                    break;
                }
                Err(_) => {
                    warn!(client_id = %client.id(), "Write deadline elapsed");
                    break;
                }
            }
            continue;
        }

        tokio::select! {
            _ = client.queue().ready() => {}
            _ = tokio::time::sleep_until(next_ping) => {}
        }
    }

    // Make sure the reader stops too
    client.close();
    let _ = timeout(config.write_timeout, sink.close()).await;
}

/// Reads frames until error, close, deadline or eviction
async fn read_pump<R: FrameSource>(
    client: &Client,
    hub: &HubHandle,
    mut source: R,
    config: &ClientConfig,
) {
    let mut closed = client.closed_signal();

    loop {
        let next = tokio::select! {
            _ = closed.wait_for(|closing| *closing) => break,
            next = timeout(config.pong_timeout, source.recv()) => next,
        };

        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!(client_id = %client.id(), error = %e, "Read failed");
                break;
            }
            Ok(None) => {
                debug!(client_id = %client.id(), "Connection closed by peer");
                break;
            }
            Err(_) => {
                warn!(
                    client_id = %client.id(),
                    timeout_secs = config.pong_timeout.as_secs(),
                    "No traffic from client, closing connection"
                );
                break;
            }
        };

        client.touch();
        hub.record_received();
        if let Some(metrics) = Metrics::get() {
            metrics.record_received();
        }

        match frame {
            Frame::Text(raw) | Frame::Binary(raw) => {
                handle_message(client, hub, &raw, config).await;
            }
            Frame::Ping(_) | Frame::Pong(_) => {}
            Frame::Close => break,
        }
    }
}

async fn handle_message(client: &Client, hub: &HubHandle, raw: &[u8], config: &ClientConfig) {
    if raw.len() > config.max_message_size {
        let err = ProtocolError::TooLarge {
            size: raw.len(),
            limit: config.max_message_size,
        };
        warn!(client_id = %client.id(), error = %err, "Ignoring oversized frame");
        return;
    }

    let envelope = match Envelope::from_slice(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(client_id = %client.id(), error = %e, "Ignoring malformed frame");
            return;
        }
    };

    if !client.admit_inbound() {
        warn!(
            client_id = %client.id(),
            message_type = %envelope.message_type,
            "Inbound rate limit exceeded, dropping message"
        );
        return;
    }

    let control = match ControlMessage::parse(&envelope) {
        Ok(control) => control,
        Err(e) => {
            warn!(client_id = %client.id(), error = %e, "Ignoring unsupported message");
            return;
        }
    };

    if let Some(metrics) = Metrics::get() {
        metrics.record_control(control.name());
    }
    debug!(client_id = %client.id(), message_type = control.name(), "Control message");

    if let Err(e) = apply(client, hub, control).await {
        debug!(client_id = %client.id(), error = %e, "Control message not applied");
    }
}

async fn apply(client: &Client, hub: &HubHandle, control: ControlMessage) -> Result<(), HubError> {
    match control {
        ControlMessage::Ping => reply(client, hub, Envelope::pong()).await,

        ControlMessage::Subscribe { topics } if topics.is_empty() => {
            client.update_subscriptions(|s| s.subscribe_event_types([EventType::StateChanged]));
            let mut data = Data::new();
            data.insert(
                "event_types".into(),
                Value::from(vec![EventType::StateChanged.as_str()]),
            );
            reply(client, hub, Envelope::subscription_confirmed(data)).await
        }

        ControlMessage::Subscribe { topics } => {
            hub.subscribe(client.id(), topics.clone()).await?;
            let mut data = Data::new();
            data.insert("topics".into(), Value::from(topics));
            reply(client, hub, Envelope::subscription_confirmed(data)).await
        }

        ControlMessage::SubscribeRoom(room) => {
            hub.subscribe(client.id(), vec![room_topic(&room)]).await?;
            let mut data = Data::new();
            data.insert("room_id".into(), Value::from(room));
            data.insert("subscribed".into(), Value::from(true));
            reply(client, hub, Envelope::subscription_confirmed(data)).await
        }

        ControlMessage::UnsubscribeRoom(room) => {
            hub.unsubscribe(client.id(), vec![room_topic(&room)]).await?;
            let mut data = Data::new();
            data.insert("room_id".into(), Value::from(room));
            data.insert("subscribed".into(), Value::from(false));
            reply(client, hub, Envelope::subscription_confirmed(data)).await
        }

        ControlMessage::SubscribeEventTypes(names) => {
            let types = known_event_types(client, names);
            client.update_subscriptions(|s| s.subscribe_event_types(types));
            Ok(())
        }

        ControlMessage::UnsubscribeEventTypes(names) => {
            let types = known_event_types(client, names);
            client.update_subscriptions(|s| s.unsubscribe_event_types(types));
            Ok(())
        }

        ControlMessage::SubscribeEntities(ids) => {
            client.update_subscriptions(|s| s.subscribe_entities(ids));
            Ok(())
        }

        ControlMessage::UnsubscribeEntities(ids) => {
            client.update_subscriptions(|s| s.unsubscribe_entities(ids.iter().map(String::as_str)));
            Ok(())
        }

        ControlMessage::SubscribeRooms(ids) => {
            client.update_subscriptions(|s| s.subscribe_rooms(ids));
            Ok(())
        }

        ControlMessage::UnsubscribeRooms(ids) => {
            client.update_subscriptions(|s| s.unsubscribe_rooms(ids.iter().map(String::as_str)));
            Ok(())
        }
    }
}

fn known_event_types(client: &Client, names: Vec<String>) -> Vec<EventType> {
    names
        .into_iter()
        .filter_map(|name| match name.parse::<EventType>() {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(client_id = %client.id(), error = %e, "Ignoring unknown event type");
                None
            }
        })
        .collect()
}

/// Queue a reply frame; a full queue gets the client evicted
async fn reply(client: &Client, hub: &HubHandle, envelope: Envelope) -> Result<(), HubError> {
    let frame = envelope
        .to_bytes()
        .map_err(|e| HubError::Serialization(e.to_string()))?;
    match client.enqueue(frame) {
        Ok(()) => Ok(()),
        Err(PushError::Full) => hub.evict(client.id(), EvictReason::QueueFull).await,
        Err(PushError::Closed) => Ok(()),
    }
}
