//! One pump cycle: on, confirm, hold, off.
//!
//! The off command is issued whatever happens before it. The cycle runs in
//! its own task, so even a caller that drops the future mid-cycle cannot skip
//! the shutoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::host::{Actuator, StateReader};

/// Outcome of a pump cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct WaterResult {
    pub ran: bool,
    pub confirmed_on: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PumpTiming {
    /// Upper bound on waiting for the switch to report "on".
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for PumpTiming {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Clone)]
pub struct Pump {
    actuator: Arc<dyn Actuator>,
    states: Arc<dyn StateReader>,
    timing: PumpTiming,
}

impl Pump {
    pub fn new(actuator: Arc<dyn Actuator>, states: Arc<dyn StateReader>, timing: PumpTiming) -> Self {
        Self {
            actuator,
            states,
            timing,
        }
    }

    pub fn timing(&self) -> PumpTiming {
        self.timing
    }

    /// Run the pump on `switch_id` for `duration_s` seconds (at least one).
    ///
    /// An unconfirmed start is not an error: the full duration still elapses
    /// and the result reports `confirmed_on: false`. A rejected on command is
    /// returned as an error, after the off command has been attempted.
    pub async fn run(&self, switch_id: &str, duration_s: i64) -> Result<WaterResult> {
        let this = self.clone();
        let switch_id = switch_id.to_string();
        let duration = Duration::from_secs(duration_s.max(1) as u64);

        tokio::spawn(async move { this.cycle(&switch_id, duration).await })
            .await
            .context("pump cycle task failed")?
    }

    async fn cycle(&self, switch_id: &str, duration: Duration) -> Result<WaterResult> {
        let outcome = self.on_and_hold(switch_id, duration).await;

        if let Err(e) = self.actuator.switch(switch_id, false).await {
            error!(switch = %switch_id, "pump: turn off failed: {e:#}");
        } else {
            info!(switch = %switch_id, "pump: off");
        }

        outcome.map(|confirmed_on| WaterResult {
            ran: true,
            confirmed_on,
        })
    }

    async fn on_and_hold(&self, switch_id: &str, duration: Duration) -> Result<bool> {
        self.actuator
            .switch(switch_id, true)
            .await
            .with_context(|| format!("turn on {switch_id}"))?;

        let confirmed = self.wait_for_state(switch_id, "on").await;
        if confirmed {
            info!(switch = %switch_id, secs = duration.as_secs(), "pump: on, confirmed");
        } else {
            warn!(
                switch = %switch_id,
                timeout_ms = self.timing.confirm_timeout.as_millis() as u64,
                "pump: on not confirmed, holding for the full duration anyway"
            );
        }

        sleep(duration).await;
        Ok(confirmed)
    }

    async fn wait_for_state(&self, entity_id: &str, desired: &str) -> bool {
        let matches = || {
            self.states
                .state(entity_id)
                .is_some_and(|s| s.state.trim().eq_ignore_ascii_case(desired))
        };

        if matches() {
            return true;
        }

        let deadline = Instant::now() + self.timing.confirm_timeout;
        while Instant::now() < deadline {
            sleep(self.timing.poll_interval).await;
            if matches() {
                return true;
            }
        }
        false
    }
}
