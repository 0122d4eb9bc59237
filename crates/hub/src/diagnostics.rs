//! Read-only diagnostics snapshot of one plant.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::engine::PlantEngine;
use crate::host::EntityState;
use crate::settings::ResolvedSettings;

#[derive(Debug, Serialize)]
pub struct Diagnostics {
    pub plant_id: String,
    pub plant_name: String,
    pub resolved: ResolvedIds,
    /// Every setting with defaults applied.
    pub settings: ResolvedSettings,
    /// The raw overlay as persisted.
    pub overlay: Map<String, Value>,
    pub current_state: CurrentState,
}

#[derive(Debug, Serialize)]
pub struct ResolvedIds {
    pub moisture_entity: Option<String>,
    pub pump_switch: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CurrentState {
    pub moisture: Option<EntityReading>,
    pub pump: Option<EntityReading>,
}

#[derive(Debug, Serialize)]
pub struct EntityReading {
    pub entity_id: String,
    /// `None` when the entity has never reported.
    pub state: Option<EntityState>,
}

/// Build the snapshot. Reads only; never actuates or writes.
pub fn snapshot(engine: &PlantEngine) -> Diagnostics {
    let settings = engine.settings();
    let resolved = settings.resolved();
    let states = engine.host().states.as_ref();

    let read = |id: &Option<String>| {
        id.as_ref().map(|entity_id| EntityReading {
            entity_id: entity_id.clone(),
            state: states.state(entity_id),
        })
    };

    Diagnostics {
        plant_id: settings.plant_id().to_string(),
        plant_name: resolved.plant_name.clone(),
        resolved: ResolvedIds {
            moisture_entity: resolved.moisture_entity.clone(),
            pump_switch: resolved.pump_switch.clone(),
        },
        current_state: CurrentState {
            moisture: read(&resolved.moisture_entity),
            pump: read(&resolved.pump_switch),
        },
        overlay: settings.overlay(),
        settings: resolved,
    }
}
