//! Per-plant decision engine: turns the latest reading, the thresholds and
//! the watering history into one decision, and acts on it.
//!
//! ## Evaluation order
//!
//! ```text
//! stamp last_evaluated
//!   │
//!   ├─ stale / unknown last_seen ──────────▶ skipped_stale_or_unavailable (+ stale notify)
//!   │  (fresh again: clear stale throttle)
//!   ├─ auto_water off ─────────────────────▶ skipped_auto_off
//!   ├─ no moisture entity / pump switch ───▶ skipped_no_moisture_entity / skipped_no_pump_switch
//!   ├─ reading absent or non-numeric ──────▶ skipped_no_moisture_value
//!   ├─ moisture >= threshold ──────────────▶ skipped_above_threshold
//!   ├─ cooldown not elapsed ───────────────▶ skipped_cooldown
//!   └─ pump cycle
//!        ├─ on rejected ──────────────────▶ failed_pump_call (+ failure notify, error)
//!        ├─ not confirmed ────────────────▶ failed_pump_confirm_on (+ failure notify)
//!        └─ confirmed ────────────────────▶ watered (+ stamp last_watered, water notify)
//! ```
//!
//! Freshness is checked before the auto-water flag so staleness is surfaced
//! even while automation is off.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::clock::{format_ts, parse_ts};
use crate::guards::{cooldown_ok, is_fresh};
use crate::host::{read_value, Host};
use crate::notify::{notify, should_throttle};
use crate::pump::{Pump, PumpTiming, WaterResult};
use crate::settings::{
    PlantSettings, ResolvedSettings, KEY_LAST_DECISION, KEY_LAST_EVALUATED, KEY_LAST_FAILURE_NOTIFY,
    KEY_LAST_STALE_NOTIFY, KEY_LAST_WATERED,
};

// ---------------------------------------------------------------------------
// Decision codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    SkippedStaleOrUnavailable,
    SkippedAutoOff,
    SkippedNoMoistureEntity,
    SkippedNoPumpSwitch,
    SkippedNoMoistureValue,
    SkippedAboveThreshold,
    SkippedCooldown,
    FailedPumpCall,
    FailedPumpConfirmOn,
    Watered,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SkippedStaleOrUnavailable => "skipped_stale_or_unavailable",
            Self::SkippedAutoOff => "skipped_auto_off",
            Self::SkippedNoMoistureEntity => "skipped_no_moisture_entity",
            Self::SkippedNoPumpSwitch => "skipped_no_pump_switch",
            Self::SkippedNoMoistureValue => "skipped_no_moisture_value",
            Self::SkippedAboveThreshold => "skipped_above_threshold",
            Self::SkippedCooldown => "skipped_cooldown",
            Self::FailedPumpCall => "failed_pump_call",
            Self::FailedPumpConfirmOn => "failed_pump_confirm_on",
            Self::Watered => "watered",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one evaluation decided and did.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Evaluation {
    pub decision: Decision,
    pub result: WaterResult,
    pub moisture: Option<f64>,
}

impl Evaluation {
    fn skipped(decision: Decision, moisture: Option<f64>) -> Self {
        Self {
            decision,
            result: WaterResult::default(),
            moisture,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct PlantEngine {
    settings: Arc<PlantSettings>,
    host: Host,
    pump: Pump,
}

impl PlantEngine {
    pub fn new(settings: Arc<PlantSettings>, host: Host, timing: PumpTiming) -> Self {
        let pump = Pump::new(host.actuator.clone(), host.states.clone(), timing);
        Self {
            settings,
            host,
            pump,
        }
    }

    pub fn settings(&self) -> &Arc<PlantSettings> {
        &self.settings
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Evaluate the plant and water it if every guard passes.
    ///
    /// Always stamps `last_evaluated` on entry and `last_decision` on exit.
    /// Callers must serialise calls per plant (see the scheduler).
    pub async fn evaluate_and_water(&self) -> Result<Evaluation> {
        let now = self.host.clock.now();
        self.settings.set_ts(KEY_LAST_EVALUATED, now).await?;

        let s = self.settings.resolved();
        let plant = self.settings.plant_id();

        // ── Freshness (independent of auto mode) ────────────────────
        let last_seen = s.last_seen.as_deref().and_then(parse_ts);
        if !is_fresh(last_seen, s.stale_after_min, now) {
            warn!(
                plant = %plant,
                last_seen = s.last_seen.as_deref().unwrap_or("never"),
                stale_after_min = s.stale_after_min,
                "engine: moisture data stale or unavailable"
            );
            self.notify_stale(&s, now).await?;
            return self
                .finish(Evaluation::skipped(Decision::SkippedStaleOrUnavailable, None))
                .await;
        }
        if s.last_stale_notify.is_some() {
            debug!(plant = %plant, "engine: data fresh again, clearing stale throttle");
            self.settings
                .set(KEY_LAST_STALE_NOTIFY, serde_json::Value::Null)
                .await?;
        }

        // ── Configuration ───────────────────────────────────────────
        if !s.auto_water {
            return self.finish(Evaluation::skipped(Decision::SkippedAutoOff, None)).await;
        }
        let Some(moisture_entity) = s.moisture_entity.as_deref() else {
            return self
                .finish(Evaluation::skipped(Decision::SkippedNoMoistureEntity, None))
                .await;
        };
        let Some(pump_switch) = s.pump_switch.as_deref() else {
            return self
                .finish(Evaluation::skipped(Decision::SkippedNoPumpSwitch, None))
                .await;
        };

        // ── Reading vs threshold ────────────────────────────────────
        let Some(moisture) = read_value(self.host.states.as_ref(), moisture_entity) else {
            return self
                .finish(Evaluation::skipped(Decision::SkippedNoMoistureValue, None))
                .await;
        };
        if moisture >= s.threshold {
            return self
                .finish(Evaluation::skipped(Decision::SkippedAboveThreshold, Some(moisture)))
                .await;
        }

        // ── Cooldown ────────────────────────────────────────────────
        let last_watered = s.last_watered.as_deref().and_then(parse_ts);
        if !cooldown_ok(last_watered, s.cooldown_min, now) {
            return self
                .finish(Evaluation::skipped(Decision::SkippedCooldown, Some(moisture)))
                .await;
        }

        // ── Water ───────────────────────────────────────────────────
        info!(
            plant = %plant,
            moisture,
            threshold = s.threshold,
            duration_s = s.pump_duration_s.max(1),
            "engine: moisture below threshold, starting pump"
        );

        let result = match self.pump.run(pump_switch, s.pump_duration_s).await {
            Ok(r) => r,
            Err(e) => {
                self.notify_failure(
                    &s,
                    now,
                    &format!("Pump {pump_switch} could not be started: {e:#}"),
                )
                .await?;
                self.finish(Evaluation::skipped(Decision::FailedPumpCall, Some(moisture)))
                    .await?;
                return Err(e);
            }
        };

        let decision = if result.confirmed_on {
            self.settings.set_ts(KEY_LAST_WATERED, now).await?;
            notify(
                self.host.notifier.as_ref(),
                s.notify_service.as_deref(),
                s.notify_on_water,
                &format!("{} watered", s.plant_name),
                &format!(
                    "Moisture {moisture:.1}% was below the {:.1}% threshold; pump ran for {}s.",
                    s.threshold,
                    s.pump_duration_s.max(1)
                ),
            );
            Decision::Watered
        } else {
            self.notify_failure(
                &s,
                now,
                &format!(
                    "Pump {pump_switch} did not report on within {}s; it was switched off after {}s.",
                    self.pump_confirm_secs(),
                    s.pump_duration_s.max(1)
                ),
            )
            .await?;
            Decision::FailedPumpConfirmOn
        };

        self.finish(Evaluation {
            decision,
            result,
            moisture: Some(moisture),
        })
        .await
    }

    /// Manual watering: skips every guard but keeps the confirmation and the
    /// guaranteed shutoff. Does not touch the decision code.
    pub async fn water_now(&self) -> Result<WaterResult> {
        let now = self.host.clock.now();
        let s = self.settings.resolved();
        let Some(pump_switch) = s.pump_switch.as_deref() else {
            anyhow::bail!("plant '{}' has no pump switch configured", self.settings.plant_id());
        };

        info!(plant = %self.settings.plant_id(), switch = %pump_switch, "engine: manual watering");
        let result = self.pump.run(pump_switch, s.pump_duration_s).await?;

        if result.confirmed_on {
            self.settings.set_ts(KEY_LAST_WATERED, now).await?;
            notify(
                self.host.notifier.as_ref(),
                s.notify_service.as_deref(),
                s.notify_on_water,
                &format!("{} watered", s.plant_name),
                &format!("Manual watering: pump ran for {}s.", s.pump_duration_s.max(1)),
            );
        } else {
            warn!(plant = %self.settings.plant_id(), "engine: manual watering not confirmed");
        }
        Ok(result)
    }

    // -- helpers ----------------------------------------------------------

    async fn finish(&self, eval: Evaluation) -> Result<Evaluation> {
        self.settings
            .set(KEY_LAST_DECISION, eval.decision.as_str())
            .await?;
        info!(
            plant = %self.settings.plant_id(),
            decision = %eval.decision,
            moisture = ?eval.moisture,
            "engine: evaluated"
        );
        Ok(eval)
    }

    async fn notify_stale(&self, s: &ResolvedSettings, now: OffsetDateTime) -> Result<()> {
        let last = s.last_stale_notify.as_deref().and_then(parse_ts);
        if should_throttle(last, s.notify_throttle_min, now) {
            debug!(plant = %self.settings.plant_id(), "engine: stale notification throttled");
            return Ok(());
        }
        let message = match s.last_seen.as_deref().and_then(parse_ts) {
            Some(seen) => format!(
                "No fresh moisture reading since {} (limit {} min). Auto-watering is paused.",
                format_ts(seen),
                s.stale_after_min.max(1)
            ),
            None => "No moisture reading has been received yet. Auto-watering is paused.".to_string(),
        };
        let sent = notify(
            self.host.notifier.as_ref(),
            s.notify_service.as_deref(),
            s.notify_on_stale,
            &format!("{}: sensor stale", s.plant_name),
            &message,
        );
        if sent {
            self.settings.set_ts(KEY_LAST_STALE_NOTIFY, now).await?;
        }
        Ok(())
    }

    async fn notify_failure(&self, s: &ResolvedSettings, now: OffsetDateTime, message: &str) -> Result<()> {
        let last = s.last_failure_notify.as_deref().and_then(parse_ts);
        if should_throttle(last, s.notify_throttle_min, now) {
            debug!(plant = %self.settings.plant_id(), "engine: failure notification throttled");
            return Ok(());
        }
        let sent = notify(
            self.host.notifier.as_ref(),
            s.notify_service.as_deref(),
            s.notify_on_failure,
            &format!("{}: watering failed", s.plant_name),
            message,
        );
        if sent {
            self.settings.set_ts(KEY_LAST_FAILURE_NOTIFY, now).await?;
        }
        Ok(())
    }

    fn pump_confirm_secs(&self) -> u64 {
        self.pump.timing().confirm_timeout.as_secs()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
