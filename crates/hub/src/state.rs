use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::engine::{Decision, Evaluation};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub pumps: BTreeMap<String, PumpState>,
    pub plants: BTreeMap<String, PlantStatus>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct PumpState {
    pub on: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
}

#[derive(Clone, Serialize)]
pub struct PlantStatus {
    pub decision: Decision,
    pub moisture: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Decision,
    Pump,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub pumps: BTreeMap<String, PumpState>,
    pub plants: BTreeMap<String, PlantStatus>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(pump_switches: &[String]) -> Self {
        let pumps = pump_switches
            .iter()
            .map(|s| {
                (
                    s.clone(),
                    PumpState {
                        on: false,
                        last_changed: None,
                    },
                )
            })
            .collect();

        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            pumps,
            plants: BTreeMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(pump_switches: &[String]) -> SharedState {
        Arc::new(RwLock::new(Self::new(pump_switches)))
    }

    /// Record the outcome of one evaluation.
    pub fn record_decision(&mut self, plant_id: &str, eval: &Evaluation) {
        let now = OffsetDateTime::now_utc();
        self.plants.insert(
            plant_id.to_string(),
            PlantStatus {
                decision: eval.decision,
                moisture: eval.moisture,
                at: now,
            },
        );

        let detail = match eval.moisture {
            Some(m) => format!("{plant_id}: {} (moisture {m:.1})", eval.decision),
            None => format!("{plant_id}: {}", eval.decision),
        };
        self.push_event(EventKind::Decision, detail);
    }

    /// Record a pump state change. Unknown switches are tracked from the
    /// first time they are seen.
    pub fn record_pump(&mut self, switch: &str, on: bool) {
        let pump = self.pumps.entry(switch.to_string()).or_insert(PumpState {
            on: false,
            last_changed: None,
        });
        if pump.on == on && pump.last_changed.is_some() {
            return;
        }
        pump.on = on;
        pump.last_changed = Some(OffsetDateTime::now_utc());

        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Pump, format!("{switch} set {state_str}"));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            pumps: self.pumps.clone(),
            plants: self.plants.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}
