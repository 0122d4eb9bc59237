//! Inbound MQTT publishes: entity state caching and last-seen stamping.
//!
//! A plant is "seen" when a numeric state arrives for its moisture entity or
//! any message arrives on its heartbeat topic. Both are read from the live
//! settings; a heartbeat topic set at runtime is subscribed through
//! `subscribe_topic`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use rumqttc::QoS;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::mqtt::{extract_entity_id, MqttBridge, STATE_WILDCARD};
use crate::scheduler::Plants;
use crate::settings::{PlantSettings, KEY_LAST_SEEN};
use crate::state::SharedState;

pub struct Ingest {
    bridge: Arc<MqttBridge>,
    plants: Plants,
    shared: SharedState,
    clock: Arc<dyn Clock>,
    /// Topics subscribed on the current connection.
    subscribed: Mutex<HashSet<String>>,
}

impl Ingest {
    pub fn new(bridge: Arc<MqttBridge>, plants: Plants, shared: SharedState, clock: Arc<dyn Clock>) -> Self {
        Self {
            bridge,
            plants,
            shared,
            clock,
            subscribed: Mutex::new(HashSet::new()),
        }
    }

    /// Topics to subscribe to on every (re)connection.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics = vec![STATE_WILDCARD.to_string()];
        for sched in self.plants.values() {
            if let Some(t) = sched.engine().settings().resolved().heartbeat_topic {
                if !topics.contains(&t) {
                    topics.push(t);
                }
            }
        }
        topics
    }

    /// Subscribe everything in `subscriptions()`. Run on each (re)connection.
    pub fn subscribe_all(&self) {
        self.subscribed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        for topic in self.subscriptions() {
            self.subscribe_topic(&topic);
        }
    }

    /// Subscribe `topic` unless already subscribed. Returns `true` when a
    /// new subscription was queued. Never blocks on the event loop.
    pub fn subscribe_topic(&self, topic: &str) -> bool {
        let fresh = self
            .subscribed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string());
        if !fresh {
            return false;
        }

        if let Err(e) = self.bridge.client().try_subscribe(topic, QoS::AtLeastOnce) {
            warn!(topic = %topic, "ingest: subscribe failed: {e}");
            self.subscribed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(topic);
            return false;
        }
        info!(topic = %topic, "ingest: subscribed");
        true
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscribed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(topic)
    }

    pub async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let mut handled = false;

        if let Some(entity_id) = extract_entity_id(topic) {
            handled = true;
            let state = self.bridge.record_state(entity_id, payload);
            debug!(entity = %entity_id, state = %state, "ingest: state");

            if let Ok(on) = crate::mqtt::parse_switch_state(payload) {
                let mut st = self.shared.write().await;
                if st.pumps.contains_key(entity_id) {
                    st.record_pump(entity_id, on);
                }
            }

            let numeric = state.parse::<f64>().is_ok_and(|v| v.is_finite());
            if numeric {
                let watching = self.settings_where(|s| {
                    s.resolved().moisture_entity.as_deref() == Some(entity_id)
                });
                for settings in watching {
                    self.stamp_seen(&settings).await;
                }
            }
        }

        let heartbeats =
            self.settings_where(|s| s.resolved().heartbeat_topic.as_deref() == Some(topic));
        for settings in heartbeats {
            handled = true;
            self.stamp_seen(&settings).await;
        }

        if !handled {
            warn!(topic = %topic, "ingest: unhandled topic");
        }
    }

    fn settings_where(&self, pred: impl Fn(&PlantSettings) -> bool) -> Vec<Arc<PlantSettings>> {
        self.plants
            .values()
            .map(|sched| sched.engine().settings())
            .filter(|s| pred(s))
            .cloned()
            .collect()
    }

    async fn stamp_seen(&self, settings: &PlantSettings) {
        if let Err(e) = settings.set_ts(KEY_LAST_SEEN, self.clock.now()).await {
            error!(plant = %settings.plant_id(), "ingest: failed to stamp last_seen: {e:#}");
            self.shared
                .write()
                .await
                .record_error(format!("{}: failed to stamp last_seen: {e:#}", settings.plant_id()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{fake_engine, ManualClock};
    use crate::host::StateReader;
    use crate::scheduler::PlantScheduler;
    use crate::state::SystemState;
    use rumqttc::{AsyncClient, MqttOptions};
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Harness {
        ingest: Ingest,
        bridge: Arc<MqttBridge>,
        settings: Arc<PlantSettings>,
        clock: Arc<ManualClock>,
        shared: SharedState,
        _el: rumqttc::EventLoop,
    }

    fn harness(overlay: serde_json::Value) -> Harness {
        let (client, el) = AsyncClient::new(MqttOptions::new("test-ingest", "127.0.0.1", 1883), 10);
        let (engine, _host, clock) = fake_engine(overlay);
        let settings = engine.settings().clone();
        let shared = SystemState::shared(&["switch.fern_pump".to_string()]);
        let sched = PlantScheduler::new(engine, shared.clone());
        let plants: Plants = Arc::new(BTreeMap::from([("fern".to_string(), sched)]));
        let bridge = Arc::new(MqttBridge::new(client, clock.clone()));
        Harness {
            ingest: Ingest::new(bridge.clone(), plants, shared.clone(), clock.clone()),
            bridge,
            settings,
            clock,
            shared,
            _el: el,
        }
    }

    #[tokio::test]
    async fn numeric_moisture_state_stamps_last_seen() {
        let h = harness(json!({}));
        h.ingest
            .handle_publish("entity/sensor.fern_moisture/state", b"31.2")
            .await;

        assert_eq!(h.settings.get_ts(KEY_LAST_SEEN), Some(h.clock.now()));
        assert_eq!(h.bridge.state("sensor.fern_moisture").unwrap().state, "31.2");
    }

    #[tokio::test]
    async fn non_numeric_moisture_state_is_cached_but_not_seen() {
        let h = harness(json!({}));
        h.ingest
            .handle_publish("entity/sensor.fern_moisture/state", b"unavailable")
            .await;

        assert_eq!(h.settings.get_ts(KEY_LAST_SEEN), None);
        assert_eq!(
            h.bridge.state("sensor.fern_moisture").unwrap().state,
            "unavailable"
        );
    }

    #[tokio::test]
    async fn other_entities_do_not_stamp() {
        let h = harness(json!({}));
        h.ingest
            .handle_publish("entity/sensor.cactus_moisture/state", b"12")
            .await;
        assert_eq!(h.settings.get_ts(KEY_LAST_SEEN), None);
    }

    #[tokio::test]
    async fn heartbeat_topic_stamps_last_seen() {
        let h = harness(json!({ "heartbeat_topic": "ecowitt/fern/alive" }));
        h.ingest.handle_publish("ecowitt/fern/alive", b"anything").await;
        assert_eq!(h.settings.get_ts(KEY_LAST_SEEN), Some(h.clock.now()));
    }

    #[tokio::test]
    async fn overlay_moisture_entity_is_followed() {
        let h = harness(json!({ "moisture_entity": "sensor.new_sensor" }));
        h.ingest
            .handle_publish("entity/sensor.fern_moisture/state", b"20")
            .await;
        assert_eq!(h.settings.get_ts(KEY_LAST_SEEN), None);

        h.ingest
            .handle_publish("entity/sensor.new_sensor/state", b"20")
            .await;
        assert!(h.settings.get_ts(KEY_LAST_SEEN).is_some());
    }

    #[tokio::test]
    async fn known_pump_state_is_recorded() {
        let h = harness(json!({}));
        h.ingest
            .handle_publish("entity/switch.fern_pump/state", b"ON")
            .await;
        assert!(h.shared.read().await.pumps["switch.fern_pump"].on);
        assert_eq!(h.bridge.state("switch.fern_pump").unwrap().state, "on");
    }

    #[tokio::test]
    async fn subscribe_all_covers_wildcard_and_heartbeats() {
        let h = harness(json!({ "heartbeat_topic": "ecowitt/fern/alive" }));
        h.ingest.subscribe_all();
        assert!(h.ingest.is_subscribed("entity/+/state"));
        assert!(h.ingest.is_subscribed("ecowitt/fern/alive"));
    }

    #[tokio::test]
    async fn subscribe_topic_skips_known_topics() {
        let h = harness(json!({}));
        h.ingest.subscribe_all();
        assert!(!h.ingest.subscribe_topic("entity/+/state"));
        assert!(h.ingest.subscribe_topic("ecowitt/fern/alive"));
        assert!(!h.ingest.subscribe_topic("ecowitt/fern/alive"));
    }

    #[tokio::test]
    async fn subscriptions_include_heartbeat_topics() {
        let h = harness(json!({ "heartbeat_topic": "ecowitt/fern/alive" }));
        assert_eq!(
            h.ingest.subscriptions(),
            vec!["entity/+/state".to_string(), "ecowitt/fern/alive".to_string()]
        );
    }
}
