//! Per-plant scheduler: a recurring timer plus the lock that keeps at most
//! one evaluation (and so at most one pump cycle) in flight per plant.
//!
//! ```text
//!            start(interval)                       stop()
//! Stopped ───────────────────▶ Running ────────────────────────▶ Stopped
//!                                │  ▲
//!                          tick  │  │ evaluation done
//!                                ▼  │
//!                          lock ─▶ engine.evaluate_and_water()
//! ```
//!
//! Manual triggers (`evaluate_now`, `water_now`) take the same lock, so a
//! trigger racing a tick waits for the running cycle instead of starting a
//! second one. Once acquired, the lock and the work move onto their own task:
//! dropping the caller (a disconnected HTTP client, say) never releases the
//! lock mid-cycle. Stopping never interrupts a running evaluation.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::engine::{Evaluation, PlantEngine};
use crate::pump::WaterResult;
use crate::state::SharedState;

/// Default evaluation interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// All schedulers, keyed by plant id.
pub type Plants = Arc<BTreeMap<String, Arc<PlantScheduler>>>;

struct Timer {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct PlantScheduler {
    engine: Arc<PlantEngine>,
    lock: Arc<Mutex<()>>,
    shared: SharedState,
    timer: std::sync::Mutex<Option<Timer>>,
}

impl PlantScheduler {
    pub fn new(engine: Arc<PlantEngine>, shared: SharedState) -> Arc<Self> {
        Arc::new(Self {
            engine,
            lock: Arc::new(Mutex::new(())),
            shared,
            timer: std::sync::Mutex::new(None),
        })
    }

    pub fn plant_id(&self) -> &str {
        self.engine.settings().plant_id()
    }

    pub fn engine(&self) -> &Arc<PlantEngine> {
        &self.engine
    }

    /// Start the recurring timer. The first tick fires one interval from now.
    /// Returns `false` if the timer was already running.
    pub fn start(self: &Arc<Self>, interval: Duration) -> bool {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.as_ref().is_some_and(|t| !t.task.is_finished()) {
            return false;
        }

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(tick_loop(Arc::downgrade(self), interval, rx));
        *timer = Some(Timer { shutdown: tx, task });

        info!(
            plant = %self.plant_id(),
            interval_sec = interval.as_secs(),
            "scheduler started"
        );
        true
    }

    /// Stop the timer. A running evaluation completes first. Returns `false`
    /// if nothing was running.
    pub fn stop(&self) -> bool {
        let Some(timer) = self.take_timer() else {
            return false;
        };
        let _ = timer.shutdown.send(true);
        info!(plant = %self.plant_id(), "scheduler stopped");
        true
    }

    /// Stop and wait for the timer task to wind down.
    pub async fn shutdown(&self) {
        let Some(timer) = self.take_timer() else {
            return;
        };
        let _ = timer.shutdown.send(true);
        if let Err(e) = timer.task.await {
            error!(plant = %self.plant_id(), "scheduler task failed: {e}");
        }
        info!(plant = %self.plant_id(), "scheduler shut down");
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.task.is_finished())
    }

    /// Evaluate immediately, waiting for any cycle already in flight.
    pub async fn evaluate_now(&self) -> Result<Evaluation> {
        let guard = self.lock.clone().lock_owned().await;
        let engine = self.engine.clone();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let result = engine.evaluate_and_water().await;
            let plant_id = engine.settings().plant_id();
            let mut st = shared.write().await;
            match &result {
                Ok(eval) => st.record_decision(plant_id, eval),
                Err(e) => st.record_error(format!("{plant_id}: evaluation failed: {e:#}")),
            }
            drop(guard);
            result
        })
        .await
        .context("evaluation task failed")?
    }

    /// Run the pump now, bypassing the guards but not the lock.
    pub async fn water_now(&self) -> Result<WaterResult> {
        let guard = self.lock.clone().lock_owned().await;
        let engine = self.engine.clone();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let result = engine.water_now().await;
            let plant_id = engine.settings().plant_id();
            let mut st = shared.write().await;
            match &result {
                Ok(r) => st.record_system(format!(
                    "{plant_id}: manual watering ({})",
                    if r.confirmed_on { "confirmed" } else { "not confirmed" }
                )),
                Err(e) => st.record_error(format!("{plant_id}: manual watering failed: {e:#}")),
            }
            drop(guard);
            result
        })
        .await
        .context("manual watering task failed")?
    }

    fn take_timer(&self) -> Option<Timer> {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

async fn tick_loop(scheduler: Weak<PlantScheduler>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        if let Err(e) = scheduler.evaluate_now().await {
            error!(plant = %scheduler.plant_id(), "scheduled evaluation failed: {e:#}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
