//! MQTT side of the hub: topic conventions, payload helpers and the bridge
//! that turns the broker into entity state, switch and notification
//! capabilities.
//!
//! | topic                    | direction | payload                     |
//! |--------------------------|-----------|-----------------------------|
//! | `entity/<id>/state`      | in        | raw state (`ON`, `41.5`, …) |
//! | `entity/<id>/set`        | out       | `ON` / `OFF`, QoS 1         |
//! | `notify/<name>`          | out       | `{"title","message"}` JSON  |

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::host::{Actuator, EntityState, Notifier, StateReader};
use crate::notify::NOTIFY_CATEGORY;

pub(crate) const STATE_WILDCARD: &str = "entity/+/state";

/// Upper bound on waiting for the broker to take our DISCONNECT.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct NotifyMsg {
    pub(crate) title: String,
    pub(crate) message: String,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

pub(crate) fn command_topic(entity_id: &str) -> String {
    format!("entity/{entity_id}/set")
}

pub(crate) fn notify_topic(name: &str) -> String {
    format!("{NOTIFY_CATEGORY}/{name}")
}

/// Extract entity_id from "entity/<entity_id>/state".
pub(crate) fn extract_entity_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "entity" && parts[2] == "state" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Parse an "ON"/"OFF" payload into a bool (case-insensitive, trims whitespace).
pub(crate) fn parse_switch_state(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        _ => Err(format!("unknown switch state '{s}'")),
    }
}

/// Trimmed text of a state payload, with ON/OFF folded to "on"/"off".
pub(crate) fn normalize_state(payload: &[u8]) -> String {
    match parse_switch_state(payload) {
        Ok(true) => "on".to_string(),
        Ok(false) => "off".to_string(),
        Err(_) => String::from_utf8_lossy(payload).trim().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Caches inbound entity states and publishes commands and notifications.
pub struct MqttBridge {
    client: AsyncClient,
    states: RwLock<HashMap<String, EntityState>>,
    clock: Arc<dyn Clock>,
}

impl MqttBridge {
    pub fn new(client: AsyncClient, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            states: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    /// Cache a state payload for `entity_id`; returns the normalised state.
    pub fn record_state(&self, entity_id: &str, payload: &[u8]) -> String {
        let state = normalize_state(payload);
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                entity_id.to_string(),
                EntityState {
                    state: state.clone(),
                    last_updated: self.clock.now(),
                },
            );
        state
    }

    /// Keep the event loop turning until `work` completes, so commands it
    /// queues (pump off calls above all) actually reach the broker. Inbound
    /// states are still cached so pump confirmations keep working.
    pub async fn drive_until<F: Future>(&self, eventloop: &mut EventLoop, work: F) -> F::Output {
        tokio::pin!(work);
        loop {
            tokio::select! {
                biased;
                out = &mut work => return out,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        if let Some(entity_id) = extract_entity_id(&p.topic) {
                            self.record_state(entity_id, &p.payload);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt: error while draining: {e}");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }
    }

    /// Flush everything queued so far, then disconnect cleanly.
    pub async fn disconnect(&self, eventloop: &mut EventLoop) {
        if let Err(e) = self.client.disconnect().await {
            warn!("mqtt: disconnect request failed: {e}");
            return;
        }
        let drained = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt: connection lost before disconnect: {e}");
                        return false;
                    }
                }
            }
        })
        .await;
        match drained {
            Ok(true) => info!("mqtt: disconnected"),
            Ok(false) => {}
            Err(_) => warn!("mqtt: timed out waiting for disconnect"),
        }
    }
}

impl StateReader for MqttBridge {
    fn state(&self, entity_id: &str) -> Option<EntityState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned()
    }
}

#[async_trait]
impl Actuator for MqttBridge {
    async fn switch(&self, entity_id: &str, on: bool) -> Result<()> {
        let payload: &[u8] = if on { b"ON" } else { b"OFF" };
        self.client
            .publish(command_topic(entity_id), QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .with_context(|| format!("mqtt publish to {} failed", command_topic(entity_id)))?;
        debug!(switch = %entity_id, on, "mqtt: switch command published");
        Ok(())
    }
}

impl Notifier for MqttBridge {
    fn send(&self, category: &str, name: &str, title: &str, body: &str) {
        if category != NOTIFY_CATEGORY {
            warn!(category, "mqtt: unsupported notification category");
            return;
        }
        let msg = NotifyMsg {
            title: title.to_string(),
            message: body.to_string(),
        };
        let payload = match serde_json::to_vec(&msg) {
            Ok(p) => p,
            Err(e) => {
                warn!("mqtt: could not encode notification: {e}");
                return;
            }
        };
        if let Err(e) = self
            .client
            .try_publish(notify_topic(name), QoS::AtLeastOnce, false, payload)
        {
            warn!(channel = %name, "mqtt: notification dropped: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
