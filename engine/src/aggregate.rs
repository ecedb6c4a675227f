//! Reduces an area's raw readings to one current temperature.

use tracing::debug;

use crate::{
    area::Area,
    config::EngineConfig,
    error::EngineError,
    state::StateProvider,
    types::DeviceKind,
};

/// Attribute thermostats report their own measured temperature under.
pub const ATTR_CURRENT_TEMPERATURE: &str = "current_temperature";

fn sensor_reading(
    entity_id: &str,
    states: &dyn StateProvider,
    config: &EngineConfig,
) -> Result<f32, EngineError> {
    let unavailable = || EngineError::SensorUnavailable {
        entity: entity_id.to_string(),
    };
    let state = states.get_current_state(entity_id).ok_or_else(unavailable)?;
    let value = state.celsius().ok_or_else(unavailable)?;
    in_range(value, config).ok_or_else(unavailable)
}

fn thermostat_reading(
    entity_id: &str,
    states: &dyn StateProvider,
    config: &EngineConfig,
) -> Result<f32, EngineError> {
    let unavailable = || EngineError::SensorUnavailable {
        entity: entity_id.to_string(),
    };
    let state = states
        .get_current_state(entity_id)
        .filter(|state| state.is_available())
        .ok_or_else(unavailable)?;
    let value = state
        .attribute_f32(ATTR_CURRENT_TEMPERATURE)
        .map(|value| crate::state::to_celsius(value, state.unit.as_deref()))
        .ok_or_else(unavailable)?;
    in_range(value, config).ok_or_else(unavailable)
}

fn in_range(value: f32, config: &EngineConfig) -> Option<f32> {
    (config.min_valid_temp..=config.max_valid_temp)
        .contains(&value)
        .then_some(value)
}

fn reading(
    entity_id: &str,
    is_thermostat: bool,
    states: &dyn StateProvider,
    config: &EngineConfig,
) -> Result<f32, EngineError> {
    if is_thermostat {
        thermostat_reading(entity_id, states, config)
    } else {
        sensor_reading(entity_id, states, config)
    }
}

/// Primary sensor when it has a valid reading, else the mean of every valid
/// sensor and thermostat reading. `None` when nothing is readable.
pub fn aggregate(area: &Area, states: &dyn StateProvider, config: &EngineConfig) -> Option<f32> {
    if let Some(primary) = &area.primary_temperature_sensor {
        let is_thermostat = area
            .devices_of(DeviceKind::Thermostat)
            .any(|device| &device.entity_id == primary);
        match reading(primary, is_thermostat, states, config) {
            Ok(value) => return Some(value),
            Err(err) => debug!(area = %area.id, "primary sensor skipped: {err}"),
        }
    }

    let sensors = area.temperature_sensors.iter().map(|id| (id, false));
    let thermostats = area
        .devices_of(DeviceKind::Thermostat)
        .map(|device| (&device.entity_id, true));

    let mut sum = 0.0;
    let mut count = 0usize;
    for (entity_id, is_thermostat) in sensors.chain(thermostats) {
        match reading(entity_id, is_thermostat, states, config) {
            Ok(value) => {
                sum += value;
                count += 1;
            }
            Err(err) => debug!(area = %area.id, "reading skipped: {err}"),
        }
    }

    (count > 0).then(|| sum / count as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EntityState, StateCache};

    fn area() -> Area {
        Area::new("living", "Living", 21.0)
            .with_sensor("sensor.a")
            .with_sensor("sensor.b")
            .with_device("climate.living", DeviceKind::Thermostat)
    }

    #[test]
    fn averages_available_readings() {
        let mut states = StateCache::new();
        states.update("sensor.a", EntityState::new("20.0"));
        states.update("sensor.b", EntityState::new("unavailable"));
        states.update(
            "climate.living",
            EntityState::new("heat").with_attribute(ATTR_CURRENT_TEMPERATURE, 21.0),
        );

        let value = aggregate(&area(), &states, &EngineConfig::default()).unwrap();
        assert!((value - 20.5).abs() < 1e-4);
    }

    #[test]
    fn primary_sensor_wins_when_available() {
        let mut states = StateCache::new();
        states.update("sensor.a", EntityState::new("20.0"));
        states.update("sensor.b", EntityState::new("23.0"));
        let mut area = area();
        area.primary_temperature_sensor = Some("sensor.b".to_string());

        assert_eq!(aggregate(&area, &states, &EngineConfig::default()), Some(23.0));

        states.update("sensor.b", EntityState::unavailable());
        assert_eq!(aggregate(&area, &states, &EngineConfig::default()), Some(20.0));
    }

    #[test]
    fn out_of_range_readings_are_skipped() {
        let mut states = StateCache::new();
        states.update("sensor.a", EntityState::new("-127.0"));
        states.update("sensor.b", EntityState::new("19.0"));

        assert_eq!(aggregate(&area(), &states, &EngineConfig::default()), Some(19.0));
    }

    #[test]
    fn nothing_readable_yields_none() {
        let states = StateCache::new();
        assert_eq!(aggregate(&area(), &states, &EngineConfig::default()), None);
    }
}
