//! Pump relays wired to the hub's own GPIO header, and the switch router
//! that sends every other pump over MQTT.
//!
//! The `gpio` feature gates the real rppal driver; without it, a mock board
//! keeps relay state in memory and logs changes.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::clock::Clock;
use crate::host::{Actuator, EntityState, StateReader};
use crate::mqtt::MqttBridge;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Real GPIO pump board (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct PumpBoard {
    pins: HashMap<String, OutputPin>, // switch -> GPIO pin
    states: HashMap<String, bool>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl PumpBoard {
    pub(crate) fn new(switch_to_gpio: &[(String, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();
        let mut states = HashMap::new();

        for (switch, pin_num) in switch_to_gpio {
            let mut pin = gpio.get(*pin_num)?.into_output();

            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high(); // active-low relay OFF
            } else {
                pin.set_low(); // active-high relay OFF
            }

            pins.insert(switch.clone(), pin);
            states.insert(switch.clone(), false);
        }

        Ok(Self {
            pins,
            states,
            active_low,
        })
    }

    pub(crate) fn contains(&self, switch: &str) -> bool {
        self.pins.contains_key(switch)
    }

    pub(crate) fn is_on(&self, switch: &str) -> Option<bool> {
        self.states.get(switch).copied()
    }

    pub(crate) fn set(&mut self, switch: &str, on: bool) {
        let Some(pin) = self.pins.get_mut(switch) else {
            warn!(switch, "gpio: unknown pump switch");
            return;
        };
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high()
        } else {
            pin.set_low()
        }
        self.states.insert(switch.to_string(), on);
        info!(switch, "gpio: pump set {}", if on { "ON" } else { "OFF" });
    }

    pub(crate) fn switches(&self) -> Vec<String> {
        self.pins.keys().cloned().collect()
    }

    pub(crate) fn all_off(&mut self) {
        for k in self.switches() {
            self.set(&k, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Mock pump board (development — no hardware, state kept in memory)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct PumpBoard {
    pub(super) pumps: HashMap<String, bool>, // switch -> on/off state
}

#[cfg(not(feature = "gpio"))]
impl PumpBoard {
    pub(crate) fn new(switch_to_gpio: &[(String, u8)], _active_low: bool) -> Result<Self> {
        let mut pumps = HashMap::new();
        for (switch, pin_num) in switch_to_gpio {
            info!(switch = %switch, pin = pin_num, "mock-gpio: registered pump (not wired)");
            pumps.insert(switch.clone(), false);
        }
        info!("mock-gpio: pump board initialised (no hardware)");
        Ok(Self { pumps })
    }

    pub(crate) fn contains(&self, switch: &str) -> bool {
        self.pumps.contains_key(switch)
    }

    pub(crate) fn is_on(&self, switch: &str) -> Option<bool> {
        self.pumps.get(switch).copied()
    }

    pub(crate) fn set(&mut self, switch: &str, on: bool) {
        if let Some(state) = self.pumps.get_mut(switch) {
            *state = on;
            info!(switch, "mock-gpio: pump set {}", if on { "ON" } else { "OFF" });
        } else {
            warn!(switch, "mock-gpio: unknown pump switch");
        }
    }

    pub(crate) fn switches(&self) -> Vec<String> {
        self.pumps.keys().cloned().collect()
    }

    pub(crate) fn all_off(&mut self) {
        for k in self.switches() {
            self.set(&k, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Switch router
// ---------------------------------------------------------------------------

/// Drives locally wired pumps on the board and everything else over MQTT.
/// Reads of local switches reflect the relay state.
pub struct HubSwitches {
    board: Mutex<PumpBoard>,
    bridge: Arc<MqttBridge>,
    shared: SharedState,
    clock: Arc<dyn Clock>,
}

impl HubSwitches {
    pub(crate) fn new(
        board: PumpBoard,
        bridge: Arc<MqttBridge>,
        shared: SharedState,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            board: Mutex::new(board),
            bridge,
            shared,
            clock,
        }
    }

    /// Force every local pump off.
    pub fn all_off(&self) {
        self.board
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .all_off();
    }

    fn is_local(&self, switch: &str) -> bool {
        self.board
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(switch)
    }
}

impl StateReader for HubSwitches {
    fn state(&self, entity_id: &str) -> Option<EntityState> {
        let local = self
            .board
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_on(entity_id);
        match local {
            Some(on) => Some(EntityState {
                state: if on { "on" } else { "off" }.to_string(),
                last_updated: self.clock.now(),
            }),
            None => self.bridge.state(entity_id),
        }
    }
}

#[async_trait]
impl Actuator for HubSwitches {
    async fn switch(&self, entity_id: &str, on: bool) -> Result<()> {
        if self.is_local(entity_id) {
            self.board
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .set(entity_id, on);
            self.shared.write().await.record_pump(entity_id, on);
            Ok(())
        } else {
            self.bridge.switch(entity_id, on).await
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
