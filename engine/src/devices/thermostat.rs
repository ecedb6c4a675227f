use std::collections::{HashMap, HashSet};

use crate::{
    config::ThermostatSettings,
    error::DeviceError,
    state::{DeviceCommand, StateProvider},
    types::EntityId,
};

use super::{available_state, AreaCommand, DeviceIo};

/// Attribute holding a thermostat's own setpoint.
pub const ATTR_SETPOINT: &str = "temperature";
pub const ATTR_HVAC_ACTION: &str = "hvac_action";

const CHANGE_TOLERANCE: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Written {
    temperature: f32,
    at_ms: u64,
}

/// Keeps thermostat setpoints in step with the resolved target whether or
/// not the area is calling for heat.
#[derive(Debug, Clone)]
pub struct ThermostatCoordinator {
    settings: ThermostatSettings,
    written: HashMap<EntityId, Written>,
    switched_off: HashSet<EntityId>,
}

impl ThermostatCoordinator {
    pub fn new(settings: &ThermostatSettings) -> Self {
        Self {
            settings: settings.clone(),
            written: HashMap::new(),
            switched_off: HashSet::new(),
        }
    }

    pub fn reconfigure(&mut self, settings: &ThermostatSettings) {
        self.settings = settings.clone();
    }

    pub fn last_written(&self, entity_id: &str) -> Option<f32> {
        self.written.get(entity_id).map(|written| written.temperature)
    }

    pub fn forget(&mut self, entity_id: &str) {
        self.written.remove(entity_id);
        self.switched_off.remove(entity_id);
    }

    pub fn apply(
        &mut self,
        entity_id: &str,
        command: &AreaCommand,
        io: &mut DeviceIo,
    ) -> Result<(), DeviceError> {
        let state = available_state(entity_id, io.states)?;

        if command.force_off {
            self.written.remove(entity_id);
            if !state.value.eq_ignore_ascii_case("off") {
                io.sink.send_command(entity_id, DeviceCommand::TurnOff)?;
            }
            self.switched_off.insert(entity_id.to_string());
            return Ok(());
        }

        if self.switched_off.contains(entity_id) {
            io.sink.send_command(entity_id, DeviceCommand::TurnOn)?;
            self.switched_off.remove(entity_id);
        }

        if let Some(written) = self.written.get(entity_id) {
            let change = (written.temperature - command.target).abs();
            if change < self.settings.min_change - CHANGE_TOLERANCE {
                return Ok(());
            }
        }

        let result = io.sink.send_command(
            entity_id,
            DeviceCommand::SetTemperature {
                temperature: command.target,
            },
        );
        match result {
            Ok(()) => {
                self.written.insert(
                    entity_id.to_string(),
                    Written {
                        temperature: command.target,
                        at_ms: io.now_ms,
                    },
                );
                Ok(())
            }
            Err(err) => {
                self.written.remove(entity_id);
                Err(err)
            }
        }
    }

    /// Setpoint the thermostat reports when someone changed it by hand,
    /// i.e. it disagrees with our last write once the grace period is over.
    pub fn detect_override(
        &self,
        entity_id: &str,
        states: &dyn StateProvider,
        now_ms: u64,
    ) -> Option<f32> {
        if !self.settings.detect_manual_override {
            return None;
        }
        let written = self.written.get(entity_id)?;
        if now_ms.saturating_sub(written.at_ms) < self.settings.override_grace_ms {
            return None;
        }
        let state = available_state(entity_id, states).ok()?;
        let reported = state.attribute_f32(ATTR_SETPOINT)?;
        ((reported - written.temperature).abs() >= self.settings.override_threshold)
            .then_some(reported)
    }

    pub fn is_heating(entity_id: &str, states: &dyn StateProvider) -> bool {
        states
            .get_current_state(entity_id)
            .filter(|state| state.is_available())
            .and_then(|state| state.attribute_str(ATTR_HVAC_ACTION).map(str::to_string))
            .map(|action| action.eq_ignore_ascii_case("heating"))
            .unwrap_or(false)
    }
}
