//! Per-device-class translation of an area's heat decision into commands.
//!
//! The set of device classes is closed; [`Coordinators::apply`] routes each
//! device by its [`DeviceKind`].

pub mod switch;
pub mod thermostat;
pub mod valve;

use serde::{Deserialize, Serialize};

use crate::{
    config::EngineConfig,
    error::DeviceError,
    state::{CommandSink, EntityState, StateProvider},
    types::{DeviceKind, EntityId, HeatDecision},
};

pub use switch::SwitchCoordinator;
pub use thermostat::ThermostatCoordinator;
pub use valve::{CapabilityCache, DeviceCapability, ValveCoordinator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRef {
    pub entity_id: EntityId,
    pub kind: DeviceKind,
}

impl DeviceRef {
    pub fn new(entity_id: &str, kind: DeviceKind) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            kind,
        }
    }
}

/// What an area asks of each of its devices this tick.
#[derive(Debug, Clone, Copy)]
pub struct AreaCommand {
    pub decision: HeatDecision,
    pub target: f32,
    pub shutdown_when_idle: bool,
    /// A thermostat of the same area still reports it is heating.
    pub thermostat_heating: bool,
    /// Safety alarm: every device goes to its off state.
    pub force_off: bool,
}

pub struct DeviceIo<'a> {
    pub states: &'a dyn StateProvider,
    pub sink: &'a mut dyn CommandSink,
    pub now_ms: u64,
}

pub struct Coordinators {
    pub thermostat: ThermostatCoordinator,
    pub switch: SwitchCoordinator,
    pub valve: ValveCoordinator,
}

impl Coordinators {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            thermostat: ThermostatCoordinator::new(&config.thermostat),
            switch: SwitchCoordinator,
            valve: ValveCoordinator::new(&config.valve),
        }
    }

    pub fn reconfigure(&mut self, config: &EngineConfig) {
        self.thermostat.reconfigure(&config.thermostat);
        self.valve.reconfigure(&config.valve);
    }

    pub fn apply(
        &mut self,
        device: &DeviceRef,
        command: &AreaCommand,
        io: &mut DeviceIo,
    ) -> Result<(), DeviceError> {
        match device.kind {
            DeviceKind::Thermostat => self.thermostat.apply(&device.entity_id, command, io),
            DeviceKind::Switch => self.switch.apply(&device.entity_id, command, io),
            DeviceKind::Valve => self.valve.apply(&device.entity_id, command, io),
        }
    }

    /// Drops everything cached about a device.
    pub fn forget(&mut self, entity_id: &str) {
        self.thermostat.forget(entity_id);
        self.valve.capabilities.invalidate(entity_id);
    }
}

pub(crate) fn available_state(
    entity_id: &str,
    states: &dyn StateProvider,
) -> Result<EntityState, DeviceError> {
    states
        .get_current_state(entity_id)
        .filter(EntityState::is_available)
        .ok_or_else(|| DeviceError::Unavailable {
            device: entity_id.to_string(),
        })
}
