//! Capabilities the hub consumes from its surroundings: entity state reads,
//! switch actuation and outbound notifications. The MQTT bridge and the GPIO
//! pump board implement these; tests substitute recording doubles.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;

use crate::clock::Clock;

/// Last observed state of an entity (a moisture sensor or a pump switch).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    pub state: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

pub trait StateReader: Send + Sync {
    fn state(&self, entity_id: &str) -> Option<EntityState>;
}

#[async_trait]
pub trait Actuator: Send + Sync {
    /// Command a switch on or off. Resolves once the command has been issued;
    /// it says nothing about whether the device followed it.
    async fn switch(&self, entity_id: &str, on: bool) -> Result<()>;
}

pub trait Notifier: Send + Sync {
    /// Fire-and-forget: delivery failures are the implementation's to log.
    fn send(&self, category: &str, name: &str, title: &str, body: &str);
}

/// Numeric reading of a source, or `None` when absent or non-numeric.
pub fn read_value(states: &dyn StateReader, entity_id: &str) -> Option<f64> {
    let st = states.state(entity_id)?;
    st.state
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Everything one plant's engine needs from the outside world.
#[derive(Clone)]
pub struct Host {
    pub states: Arc<dyn StateReader>,
    pub actuator: Arc<dyn Actuator>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeHost;

    #[test]
    fn read_value_parses_numbers() {
        let host = FakeHost::new();
        host.set_state("sensor.fern", "41.5");
        assert_eq!(read_value(&host, "sensor.fern"), Some(41.5));
    }

    #[test]
    fn read_value_trims_whitespace() {
        let host = FakeHost::new();
        host.set_state("sensor.fern", " 20 \n");
        assert_eq!(read_value(&host, "sensor.fern"), Some(20.0));
    }

    #[test]
    fn read_value_absent_entity_is_none() {
        let host = FakeHost::new();
        assert_eq!(read_value(&host, "sensor.nope"), None);
    }

    #[test]
    fn read_value_unavailable_is_none() {
        let host = FakeHost::new();
        host.set_state("sensor.fern", "unavailable");
        assert_eq!(read_value(&host, "sensor.fern"), None);
    }

    #[test]
    fn read_value_rejects_nan() {
        let host = FakeHost::new();
        host.set_state("sensor.fern", "NaN");
        assert_eq!(read_value(&host, "sensor.fern"), None);
    }
}
