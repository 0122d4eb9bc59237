//! Per-plant settings: a mutable overlay layered over the immutable setup
//! record.
//!
//! Lookups prefer the overlay, then fall back to the [`PlantConfig`] fields,
//! then to the caller's default. The overlay is merged in place on every
//! update and persisted through a [`SettingsStore`]; it is only wiped by an
//! explicit [`PlantSettings::reset`].

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::clock::{format_ts, parse_ts};
use crate::db::PlantConfig;
use crate::notify::NotifyChannel;

// ---------------------------------------------------------------------------
// Keys and defaults
// ---------------------------------------------------------------------------

pub const KEY_PLANT_NAME: &str = "plant_name";
pub const KEY_MOISTURE_ENTITY: &str = "moisture_entity";
pub const KEY_PUMP_SWITCH: &str = "pump_switch";

pub const KEY_THRESHOLD: &str = "threshold";
pub const KEY_PUMP_DURATION_S: &str = "pump_duration_s";
pub const KEY_COOLDOWN_MIN: &str = "cooldown_min";
pub const KEY_STALE_AFTER_MIN: &str = "stale_after_min";
pub const KEY_AUTO_WATER: &str = "auto_water";

pub const KEY_LAST_WATERED: &str = "last_watered";
pub const KEY_LAST_SEEN: &str = "last_seen";
pub const KEY_LAST_EVALUATED: &str = "last_evaluated";
pub const KEY_LAST_DECISION: &str = "last_decision";

pub const KEY_NOTIFY_SERVICE: &str = "notify_service";
pub const KEY_NOTIFY_ON_WATER: &str = "notify_on_water";
pub const KEY_NOTIFY_ON_STALE: &str = "notify_on_stale";
pub const KEY_NOTIFY_ON_FAILURE: &str = "notify_on_failure";
pub const KEY_NOTIFY_THROTTLE_MIN: &str = "notify_throttle_min";
pub const KEY_LAST_STALE_NOTIFY: &str = "last_stale_notify";
pub const KEY_LAST_FAILURE_NOTIFY: &str = "last_failure_notify";

pub const KEY_HEARTBEAT_TOPIC: &str = "heartbeat_topic";

pub const DEFAULT_THRESHOLD: f64 = 35.0;
pub const DEFAULT_PUMP_DURATION_S: i64 = 8;
pub const DEFAULT_COOLDOWN_MIN: i64 = 240;
pub const DEFAULT_STALE_AFTER_MIN: i64 = 120;
pub const DEFAULT_NOTIFY_THROTTLE_MIN: i64 = 60;

// ---------------------------------------------------------------------------
// Persistence capability
// ---------------------------------------------------------------------------

/// Key-value persistence for the overlay, merge-on-write.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self, plant_id: &str) -> Result<Map<String, Value>>;
    async fn merge(&self, plant_id: &str, patch: &Map<String, Value>) -> Result<()>;
    async fn remove(&self, plant_id: &str, key: &str) -> Result<()>;
    async fn clear(&self, plant_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Resolved view
// ---------------------------------------------------------------------------

/// Every setting resolved with its typed default. Used for diagnostics and
/// as the engine's per-evaluation snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedSettings {
    pub plant_name: String,
    pub moisture_entity: Option<String>,
    pub pump_switch: Option<String>,
    pub threshold: f64,
    pub pump_duration_s: i64,
    pub cooldown_min: i64,
    pub stale_after_min: i64,
    pub auto_water: bool,
    pub last_watered: Option<String>,
    pub last_seen: Option<String>,
    pub last_evaluated: Option<String>,
    pub last_decision: Option<String>,
    pub notify_service: Option<String>,
    pub notify_on_water: bool,
    pub notify_on_stale: bool,
    pub notify_on_failure: bool,
    pub notify_throttle_min: i64,
    pub last_stale_notify: Option<String>,
    pub last_failure_notify: Option<String>,
    pub heartbeat_topic: Option<String>,
}

// ---------------------------------------------------------------------------
// Accessor
// ---------------------------------------------------------------------------

pub struct PlantSettings {
    config: PlantConfig,
    base: Map<String, Value>,
    overlay: RwLock<Map<String, Value>>,
    store: Arc<dyn SettingsStore>,
}

impl PlantSettings {
    /// Build the accessor for one plant, loading its persisted overlay.
    pub async fn load(config: PlantConfig, store: Arc<dyn SettingsStore>) -> Result<Self> {
        let overlay = store.load(&config.plant_id).await?;
        Ok(Self::with_overlay(config, overlay, store))
    }

    pub fn with_overlay(
        config: PlantConfig,
        overlay: Map<String, Value>,
        store: Arc<dyn SettingsStore>,
    ) -> Self {
        let mut base = Map::new();
        base.insert(KEY_PLANT_NAME.into(), Value::String(config.name.clone()));
        base.insert(
            KEY_MOISTURE_ENTITY.into(),
            Value::String(config.moisture_entity.clone()),
        );
        base.insert(
            KEY_PUMP_SWITCH.into(),
            Value::String(config.pump_switch.clone()),
        );

        Self {
            config,
            base,
            overlay: RwLock::new(overlay),
            store,
        }
    }

    pub fn plant_id(&self) -> &str {
        &self.config.plant_id
    }

    pub fn config(&self) -> &PlantConfig {
        &self.config
    }

    /// Overlay value if present, else the setup record's value.
    pub fn get(&self, key: &str) -> Option<Value> {
        let overlay = self.overlay.read().unwrap_or_else(PoisonError::into_inner);
        overlay
            .get(key)
            .or_else(|| self.base.get(key))
            .cloned()
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Integers are also accepted in float form (`8.0`), truncated.
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
                .unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "1" | "yes" => true,
                "false" | "off" | "0" | "no" => false,
                _ => default,
            },
            _ => default,
        }
    }

    /// Non-blank string value, trimmed.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }

    /// Stored timestamp; absent or malformed values are `None`.
    pub fn get_ts(&self, key: &str) -> Option<OffsetDateTime> {
        self.get_str(key).as_deref().and_then(parse_ts)
    }

    /// Snapshot of the overlay alone.
    pub fn overlay(&self) -> Map<String, Value> {
        self.overlay
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn resolved(&self) -> ResolvedSettings {
        ResolvedSettings {
            plant_name: self
                .get_str(KEY_PLANT_NAME)
                .unwrap_or_else(|| self.config.plant_id.clone()),
            moisture_entity: self.get_str(KEY_MOISTURE_ENTITY),
            pump_switch: self.get_str(KEY_PUMP_SWITCH),
            threshold: self.get_f64(KEY_THRESHOLD, DEFAULT_THRESHOLD),
            pump_duration_s: self.get_i64(KEY_PUMP_DURATION_S, DEFAULT_PUMP_DURATION_S),
            cooldown_min: self.get_i64(KEY_COOLDOWN_MIN, DEFAULT_COOLDOWN_MIN),
            stale_after_min: self.get_i64(KEY_STALE_AFTER_MIN, DEFAULT_STALE_AFTER_MIN),
            auto_water: self.get_bool(KEY_AUTO_WATER, false),
            last_watered: self.get_str(KEY_LAST_WATERED),
            last_seen: self.get_str(KEY_LAST_SEEN),
            last_evaluated: self.get_str(KEY_LAST_EVALUATED),
            last_decision: self.get_str(KEY_LAST_DECISION),
            notify_service: self.get_str(KEY_NOTIFY_SERVICE),
            notify_on_water: self.get_bool(KEY_NOTIFY_ON_WATER, false),
            notify_on_stale: self.get_bool(KEY_NOTIFY_ON_STALE, false),
            notify_on_failure: self.get_bool(KEY_NOTIFY_ON_FAILURE, false),
            notify_throttle_min: self
                .get_i64(KEY_NOTIFY_THROTTLE_MIN, DEFAULT_NOTIFY_THROTTLE_MIN),
            last_stale_notify: self.get_str(KEY_LAST_STALE_NOTIFY),
            last_failure_notify: self.get_str(KEY_LAST_FAILURE_NOTIFY),
            heartbeat_topic: self.get_str(KEY_HEARTBEAT_TOPIC),
        }
    }

    /// Merge `patch` into the overlay and persist it.
    pub async fn update(&self, patch: Map<String, Value>) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        self.store.merge(&self.config.plant_id, &patch).await?;

        let mut overlay = self.overlay.write().unwrap_or_else(PoisonError::into_inner);
        for (k, v) in patch {
            overlay.insert(k, v);
        }
        Ok(())
    }

    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let mut patch = Map::new();
        patch.insert(key.to_string(), value.into());
        self.update(patch).await
    }

    pub async fn set_ts(&self, key: &str, ts: OffsetDateTime) -> Result<()> {
        self.set(key, format_ts(ts)).await
    }

    /// Merge only keys not already in the overlay. Used to seed options from
    /// the config file without clobbering live edits.
    pub async fn seed(&self, defaults: &Map<String, Value>) -> Result<()> {
        let missing: Map<String, Value> = {
            let overlay = self.overlay.read().unwrap_or_else(PoisonError::into_inner);
            defaults
                .iter()
                .filter(|(k, _)| !overlay.contains_key(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        self.update(missing).await
    }

    /// Drop one key from the overlay, revealing the setup value again.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.store.remove(&self.config.plant_id, key).await?;
        self.overlay
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    /// Wipe the whole overlay, history included.
    pub async fn reset(&self) -> Result<()> {
        self.store.clear(&self.config.plant_id).await?;
        self.overlay
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation of user-supplied patches
// ---------------------------------------------------------------------------

const NUMERIC_RANGES: &[(&str, f64, f64)] = &[
    (KEY_THRESHOLD, 0.0, 100.0),
    (KEY_PUMP_DURATION_S, 1.0, 120.0),
    (KEY_COOLDOWN_MIN, 0.0, 1440.0),
    (KEY_STALE_AFTER_MIN, 1.0, 1440.0),
    (KEY_NOTIFY_THROTTLE_MIN, 0.0, 10080.0),
];

const BOOL_KEYS: &[&str] = &[
    KEY_AUTO_WATER,
    KEY_NOTIFY_ON_WATER,
    KEY_NOTIFY_ON_STALE,
    KEY_NOTIFY_ON_FAILURE,
];

const IDENTITY_KEYS: &[&str] = &[KEY_PLANT_NAME, KEY_MOISTURE_ENTITY, KEY_PUMP_SWITCH];

const TIMESTAMP_KEYS: &[&str] = &[
    KEY_LAST_WATERED,
    KEY_LAST_SEEN,
    KEY_LAST_EVALUATED,
    KEY_LAST_STALE_NOTIFY,
    KEY_LAST_FAILURE_NOTIFY,
];

/// Validate a settings patch. Reports every violation, not just the first.
pub fn validate_patch(patch: &Map<String, Value>) -> Result<()> {
    let mut errors: Vec<String> = Vec::new();

    for (key, value) in patch {
        let key = key.as_str();

        if let Some((_, min, max)) = NUMERIC_RANGES.iter().find(|(k, _, _)| *k == key) {
            match value.as_f64() {
                Some(v) if (*min..=*max).contains(&v) => {}
                Some(v) => errors.push(format!("{key}: {v} out of range [{min}, {max}]")),
                None => errors.push(format!("{key}: expected a number")),
            }
        } else if BOOL_KEYS.contains(&key) {
            if !value.is_boolean() {
                errors.push(format!("{key}: expected true or false"));
            }
        } else if IDENTITY_KEYS.contains(&key) {
            match value.as_str() {
                Some(s) if !s.trim().is_empty() => {}
                _ => errors.push(format!("{key}: expected a non-empty string")),
            }
        } else if TIMESTAMP_KEYS.contains(&key) {
            match value {
                Value::Null => {}
                Value::String(s) if parse_ts(s).is_some() => {}
                _ => errors.push(format!("{key}: expected null or an RFC 3339 timestamp")),
            }
        } else if key == KEY_NOTIFY_SERVICE {
            match value {
                Value::Null => {}
                Value::String(s) if s.trim().is_empty() || NotifyChannel::parse(s).is_some() => {}
                _ => errors.push(format!(
                    "{key}: expected empty or a notify channel like \"notify.phone\""
                )),
            }
        } else if key == KEY_HEARTBEAT_TOPIC {
            match value {
                Value::Null => {}
                Value::String(s) if !s.contains(&['+', '#'][..]) => {}
                _ => errors.push(format!("{key}: expected a concrete MQTT topic")),
            }
        } else if key == KEY_LAST_DECISION {
            if !(value.is_null() || value.is_string()) {
                errors.push(format!("{key}: expected null or a string"));
            }
        } else {
            errors.push(format!("{key}: unknown setting"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!(
            "settings validation failed ({} error{}):\n  - {}",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" },
            errors.join("\n  - ")
        );
    }
}

// ===========================================================================
// Tests
// ===========================================================================
