//! Demo hub with a simulated upstream that toggles a few lights every second.
//!
//! ```bash
//! cargo run -p hearth-runtime --example demo_gateway
//! # then, e.g. with websocat:
//! websocat ws://127.0.0.1:3001/ws
//! {"type":"subscribe_ha_events","data":{"event_types":["state_changed"]}}
//! ```

use hearth_runtime::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

const LIGHTS: [(&str, &str); 3] = [
    ("light.kitchen", "kitchen"),
    ("light.living_room", "living_room"),
    ("light.bedroom", "bedroom"),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hearth_runtime::run(|gateway| async move {
        let rooms: HashMap<String, String> = LIGHTS
            .iter()
            .map(|(entity, room)| (entity.to_string(), room.to_string()))
            .collect();
        gateway.forwarder.update_room_filters(rooms);
        gateway
            .forwarder
            .set_event_type_enabled(EventType::AreaUpdated, true);

        tokio::spawn(simulate_upstream(gateway));
        Ok(())
    })
    .await
}

async fn simulate_upstream(gateway: Gateway) {
    let forwarder = &gateway.forwarder;
    let _ = forwarder
        .forward_sync_status("synced", "demo upstream ready", LIGHTS.len())
        .await;

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut on = false;
    loop {
        tick.tick().await;
        on = !on;
        let (old, new) = if on { ("off", "on") } else { ("on", "off") };

        for (entity, room) in LIGHTS {
            let mut attributes = Data::new();
            attributes.insert("brightness".into(), json!(if on { 255 } else { 0 }));
            if let Err(e) = forwarder
                .forward_state_changed(entity, json!(old), json!(new), attributes)
                .await
            {
                tracing::warn!(error = %e, entity, "Demo event not delivered");
            }

            // Topic subscribers get a compact room summary as well
            let summary = Envelope::new(
                "room_activity",
                Data::from_iter([("entity_id".into(), json!(entity)), ("state".into(), json!(new))]),
            );
            let _ = gateway.hub.broadcast_to_topic(&room_topic(room), &summary).await;
        }

        if !on {
            let stats = forwarder.stats();
            tracing::info!(
                forwarded = stats.events_forwarded,
                dropped = stats.events_dropped,
                clients = stats.connected_clients,
                "Demo upstream tick"
            );
        }
    }
}
