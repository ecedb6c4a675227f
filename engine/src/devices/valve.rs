use std::collections::HashMap;

use serde::Serialize;

use crate::{
    config::ValveSettings,
    error::DeviceError,
    state::{DeviceCommand, EntityState},
    types::EntityId,
};

use super::{available_state, AreaCommand, DeviceIo};

const POSITION_ATTRIBUTES: [&str; 2] = ["position", "current_position"];
const TEMPERATURE_ATTRIBUTES: [&str; 3] = ["temperature", "min_temp", "max_temp"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeviceCapability {
    pub supports_position: bool,
    pub supports_temperature: bool,
    pub position_min: f32,
    pub position_max: f32,
}

impl DeviceCapability {
    /// Derived only from what the valve reports about itself.
    pub fn detect(entity_id: &str, state: &EntityState) -> Self {
        let min = state.attribute_f32("min");
        let max = state.attribute_f32("max");

        let supports_position = (min.is_some() && max.is_some())
            || POSITION_ATTRIBUTES.iter().any(|key| state.has_attribute(key))
            || entity_id.starts_with("number.");
        let supports_temperature = TEMPERATURE_ATTRIBUTES
            .iter()
            .any(|key| state.has_attribute(key));

        Self {
            supports_position,
            supports_temperature,
            position_min: min.unwrap_or(0.0),
            position_max: max.unwrap_or(100.0),
        }
    }
}

/// Capabilities learned at first contact, kept until invalidated.
#[derive(Debug, Clone, Default)]
pub struct CapabilityCache {
    entries: HashMap<EntityId, DeviceCapability>,
}

impl CapabilityCache {
    pub fn get(&self, entity_id: &str) -> Option<&DeviceCapability> {
        self.entries.get(entity_id)
    }

    pub fn resolve(&mut self, entity_id: &str, state: &EntityState) -> DeviceCapability {
        *self
            .entries
            .entry(entity_id.to_string())
            .or_insert_with(|| DeviceCapability::detect(entity_id, state))
    }

    pub fn invalidate(&mut self, entity_id: &str) -> bool {
        self.entries.remove(entity_id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ValveCoordinator {
    pub capabilities: CapabilityCache,
    settings: ValveSettings,
}

impl ValveCoordinator {
    pub fn new(settings: &ValveSettings) -> Self {
        Self {
            capabilities: CapabilityCache::default(),
            settings: settings.clone(),
        }
    }

    pub fn reconfigure(&mut self, settings: &ValveSettings) {
        self.settings = settings.clone();
    }

    /// The command a valve should receive, independent of what it reports now.
    pub fn desired(
        &self,
        entity_id: &str,
        capability: &DeviceCapability,
        command: &AreaCommand,
    ) -> Result<DeviceCommand, DeviceError> {
        let heating = command.decision.is_heating() && !command.force_off;

        if capability.supports_position {
            let position = if heating {
                capability.position_max
            } else {
                capability.position_min
            };
            Ok(DeviceCommand::SetPosition { position })
        } else if capability.supports_temperature {
            let temperature = if heating {
                command.target + self.settings.heating_offset
            } else {
                self.settings.idle_temperature
            };
            Ok(DeviceCommand::SetTemperature { temperature })
        } else {
            Err(DeviceError::Unsupported {
                device: entity_id.to_string(),
            })
        }
    }

    pub fn apply(
        &mut self,
        entity_id: &str,
        command: &AreaCommand,
        io: &mut DeviceIo,
    ) -> Result<(), DeviceError> {
        let state = available_state(entity_id, io.states)?;
        let capability = self.capabilities.resolve(entity_id, &state);
        let desired = self.desired(entity_id, &capability, command)?;

        if already_applied(&state, &desired) {
            return Ok(());
        }
        io.sink.send_command(entity_id, desired)
    }
}

fn already_applied(state: &EntityState, desired: &DeviceCommand) -> bool {
    let close = |reported: Option<f32>, wanted: f32| {
        reported
            .map(|reported| (reported - wanted).abs() < 0.05)
            .unwrap_or(false)
    };

    match desired {
        DeviceCommand::SetPosition { position } => {
            let reported = POSITION_ATTRIBUTES
                .iter()
                .find_map(|key| state.attribute_f32(key))
                .or_else(|| state.numeric());
            close(reported, *position)
        }
        DeviceCommand::SetTemperature { temperature } => {
            close(state.attribute_f32("temperature"), *temperature)
        }
        _ => false,
    }
}
