//! TOML config file loading, validation, and database seeding for plants
//! and locally wired pumps.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::db::{Db, PlantConfig};
use crate::settings::validate_patch;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_evaluate_interval_min")]
    pub evaluate_interval_min: u64,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
    #[serde(default)]
    pub pumps: Vec<PumpEntry>,
}

fn default_evaluate_interval_min() -> u64 {
    10
}

/// One day, matching the other minute-valued limits.
const MAX_EVALUATE_INTERVAL_MIN: u64 = 1440;

#[derive(Debug, Clone, Deserialize)]
pub struct PlantEntry {
    pub plant_id: String,
    pub name: String,
    pub moisture_entity: String,
    pub pump_switch: String,
    /// Initial settings, merged only for keys the overlay does not have yet.
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PumpEntry {
    pub switch: String,
    pub gpio_pin: i64,
}

impl PlantEntry {
    pub fn to_plant_config(&self) -> PlantConfig {
        PlantConfig {
            plant_id: self.plant_id.clone(),
            name: self.name.clone(),
            moisture_entity: self.moisture_entity.clone(),
            pump_switch: self.pump_switch.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if !(1..=MAX_EVALUATE_INTERVAL_MIN).contains(&self.evaluate_interval_min) {
            errors.push(format!(
                "evaluate_interval_min {} out of range [1, {MAX_EVALUATE_INTERVAL_MIN}]",
                self.evaluate_interval_min
            ));
        }
        self.validate_plants(&mut errors);
        self.validate_pumps(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = || {
                if p.plant_id.is_empty() {
                    format!("plants[{i}]")
                } else {
                    format!("plant '{}'", p.plant_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if p.plant_id.trim().is_empty() {
                errors.push(format!("{}: plant_id is empty", ctx()));
            } else if p.plant_id.contains(&['/', '+', '#'][..]) {
                errors.push(format!("{}: plant_id must not contain '/', '+' or '#'", ctx()));
            } else if !seen_ids.insert(&p.plant_id) {
                errors.push(format!("{}: duplicate plant_id", ctx()));
            }

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if p.moisture_entity.trim().is_empty() {
                errors.push(format!("{}: moisture_entity is empty", ctx()));
            }
            if p.pump_switch.trim().is_empty() {
                errors.push(format!("{}: pump_switch is empty", ctx()));
            }

            // ── Seed options (same rules as live edits) ─────────
            if let Err(e) = validate_patch(&p.options) {
                errors.push(format!("{}: options: {e}", ctx()));
            }
        }
    }

    fn validate_pumps(&self, errors: &mut Vec<String>) {
        let mut seen_switches: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, p) in self.pumps.iter().enumerate() {
            let ctx = || {
                if p.switch.is_empty() {
                    format!("pumps[{i}]")
                } else {
                    format!("pump '{}'", p.switch)
                }
            };

            if p.switch.trim().is_empty() {
                errors.push(format!("{}: switch is empty", ctx()));
            } else if !seen_switches.insert(&p.switch) {
                errors.push(format!("{}: duplicate switch", ctx()));
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&p.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    p.gpio_pin
                ));
            } else if !seen_pins.insert(p.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is already used by another pump",
                    ctx(),
                    p.gpio_pin
                ));
            }
        }
    }

    /// Local pumps as `(switch, pin)` pairs. Only meaningful after `validate`.
    pub fn local_pumps(&self) -> Vec<(String, u8)> {
        self.pumps
            .iter()
            .filter_map(|p| u8::try_from(p.gpio_pin).ok().map(|pin| (p.switch.clone(), pin)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

/// Parse and validate TOML config text.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Upsert every plant's setup record and drop plants no longer configured.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for p in &config.plants {
        db.upsert_plant(&p.to_plant_config())
            .await
            .with_context(|| format!("failed to upsert plant '{}'", p.plant_id))?;
    }

    let keep: Vec<String> = config.plants.iter().map(|p| p.plant_id.clone()).collect();
    let removed = db.prune_plants(&keep).await?;

    tracing::info!(
        plants = config.plants.len(),
        pumps = config.pumps.len(),
        removed,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
