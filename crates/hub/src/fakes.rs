//! Recording test doubles for the host capabilities and the settings store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use time::macros::datetime;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::db::PlantConfig;
use crate::engine::PlantEngine;
use crate::host::{Actuator, EntityState, Host, Notifier, StateReader};
use crate::pump::PumpTiming;
use crate::settings::{PlantSettings, SettingsStore};

pub const T0: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);

pub fn test_plant_config() -> PlantConfig {
    PlantConfig {
        plant_id: "fern".into(),
        name: "Fern".into(),
        moisture_entity: "sensor.fern_moisture".into(),
        pump_switch: "switch.fern_pump".into(),
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, by: time::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(T0)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        ManualClock::now(self)
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchCall {
    On,
    Off,
}

#[derive(Debug, Clone)]
pub struct SwitchRecord {
    pub entity_id: String,
    pub call: SwitchCall,
    pub at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub category: String,
    pub name: String,
    pub title: String,
    pub body: String,
}

#[derive(Default)]
struct Inner {
    states: HashMap<String, String>,
    /// Switches whose "on" state only appears after a delay.
    confirm_delay: HashMap<String, Duration>,
    pending_on: HashMap<String, Instant>,
    stuck: HashSet<String>,
    reject_on: HashSet<String>,
    reject_off: HashSet<String>,
    calls: Vec<SwitchRecord>,
    sent: Vec<SentNotification>,
}

/// In-memory host. Switches follow their commands immediately unless told
/// otherwise.
#[derive(Default)]
pub struct FakeHost {
    inner: Mutex<Inner>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, entity_id: &str, state: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_on.remove(entity_id);
        inner.states.insert(entity_id.into(), state.into());
    }

    pub fn state_of(&self, entity_id: &str) -> Option<String> {
        self.state(entity_id).map(|s| s.state)
    }

    /// The switch accepts commands but never reports "on".
    pub fn set_stuck(&self, entity_id: &str) {
        self.inner.lock().unwrap().stuck.insert(entity_id.into());
    }

    pub fn set_confirm_delay(&self, entity_id: &str, delay: Duration) {
        self.inner
            .lock()
            .unwrap()
            .confirm_delay
            .insert(entity_id.into(), delay);
    }

    pub fn reject_on(&self, entity_id: &str) {
        self.inner.lock().unwrap().reject_on.insert(entity_id.into());
    }

    pub fn reject_off(&self, entity_id: &str) {
        self.inner.lock().unwrap().reject_off.insert(entity_id.into());
    }

    pub fn switch_calls(&self) -> Vec<SwitchRecord> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn on_calls(&self, entity_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.entity_id == entity_id && c.call == SwitchCall::On)
            .count()
    }

    pub fn notifications(&self) -> Vec<SentNotification> {
        self.inner.lock().unwrap().sent.clone()
    }
}

impl StateReader for FakeHost {
    fn state(&self, entity_id: &str) -> Option<EntityState> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ready_at) = inner.pending_on.get(entity_id).copied() {
            if Instant::now() >= ready_at {
                inner.pending_on.remove(entity_id);
                inner.states.insert(entity_id.into(), "on".into());
            }
        }
        inner.states.get(entity_id).map(|s| EntityState {
            state: s.clone(),
            last_updated: T0,
        })
    }
}

#[async_trait]
impl Actuator for FakeHost {
    async fn switch(&self, entity_id: &str, on: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(SwitchRecord {
            entity_id: entity_id.into(),
            call: if on { SwitchCall::On } else { SwitchCall::Off },
            at: Instant::now(),
        });

        if on {
            if inner.reject_on.contains(entity_id) {
                bail!("switch {entity_id} rejected on");
            }
            if inner.stuck.contains(entity_id) {
                return Ok(());
            }
            if let Some(delay) = inner.confirm_delay.get(entity_id).copied() {
                inner
                    .pending_on
                    .insert(entity_id.into(), Instant::now() + delay);
                return Ok(());
            }
            inner.states.insert(entity_id.into(), "on".into());
        } else {
            if inner.reject_off.contains(entity_id) {
                bail!("switch {entity_id} rejected off");
            }
            inner.pending_on.remove(entity_id);
            inner.states.insert(entity_id.into(), "off".into());
        }
        Ok(())
    }
}

impl Notifier for FakeHost {
    fn send(&self, category: &str, name: &str, title: &str, body: &str) {
        self.inner.lock().unwrap().sent.push(SentNotification {
            category: category.into(),
            name: name.into(),
            title: title.into(),
            body: body.into(),
        });
    }
}

pub fn host_for(fake: &Arc<FakeHost>, clock: &Arc<ManualClock>) -> Host {
    Host {
        states: fake.clone(),
        actuator: fake.clone(),
        notifier: fake.clone(),
        clock: clock.clone(),
    }
}

// ---------------------------------------------------------------------------
// Settings store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    plants: Mutex<HashMap<String, Map<String, Value>>>,
    failing: AtomicBool,
}

impl MemoryStore {
    /// Make every write fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("store unavailable");
        }
        Ok(())
    }

    pub fn snapshot(&self, plant_id: &str) -> Map<String, Value> {
        self.plants
            .lock()
            .unwrap()
            .get(plant_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn load(&self, plant_id: &str) -> Result<Map<String, Value>> {
        Ok(self.snapshot(plant_id))
    }

    async fn merge(&self, plant_id: &str, patch: &Map<String, Value>) -> Result<()> {
        self.check_writable()?;
        let mut plants = self.plants.lock().unwrap();
        let entry = plants.entry(plant_id.to_string()).or_default();
        for (k, v) in patch {
            entry.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn remove(&self, plant_id: &str, key: &str) -> Result<()> {
        self.check_writable()?;
        if let Some(entry) = self.plants.lock().unwrap().get_mut(plant_id) {
            entry.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, plant_id: &str) -> Result<()> {
        self.check_writable()?;
        self.plants.lock().unwrap().remove(plant_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Assembled engine
// ---------------------------------------------------------------------------

/// The "fern" plant on fakes, with `overlay` as its starting settings.
pub fn fake_engine(overlay: Value) -> (Arc<PlantEngine>, Arc<FakeHost>, Arc<ManualClock>) {
    let fake = Arc::new(FakeHost::new());
    let clock = Arc::new(ManualClock::default());
    let overlay = match overlay {
        Value::Object(m) => m,
        _ => Map::new(),
    };
    let settings = Arc::new(PlantSettings::with_overlay(
        test_plant_config(),
        overlay,
        Arc::new(MemoryStore::default()),
    ));
    let engine = PlantEngine::new(settings, host_for(&fake, &clock), PumpTiming::default());
    (Arc::new(engine), fake, clock)
}
