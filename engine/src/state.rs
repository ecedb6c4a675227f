//! Read/write seams to the host platform: current entity states in, device
//! commands out.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::DeviceError, types::EntityId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub value: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

fn default_available() -> bool {
    true
}

impl EntityState {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            unit: None,
            available: true,
            attributes: Map::new(),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            value: "unavailable".to_string(),
            unit: None,
            available: false,
            attributes: Map::new(),
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn is_available(&self) -> bool {
        self.available && !matches!(self.value.as_str(), "unavailable" | "unknown" | "")
    }

    pub fn numeric(&self) -> Option<f32> {
        if !self.is_available() {
            return None;
        }
        self.value.trim().parse::<f32>().ok().filter(|v| v.is_finite())
    }

    /// Numeric value in °C, converting Fahrenheit readings.
    pub fn celsius(&self) -> Option<f32> {
        let value = self.numeric()?;
        Some(to_celsius(value, self.unit.as_deref()))
    }

    pub fn attribute_f32(&self, key: &str) -> Option<f32> {
        match self.attributes.get(key)? {
            Value::Number(n) => n.as_f64().map(|v| v as f32),
            Value::String(s) => s.trim().parse::<f32>().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite())
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn is_on(&self) -> bool {
        matches!(
            self.value.to_ascii_lowercase().as_str(),
            "on" | "true" | "open" | "home" | "heat" | "detected"
        )
    }
}

pub fn to_celsius(value: f32, unit: Option<&str>) -> f32 {
    match unit {
        Some("°F") | Some("F") | Some("degF") => (value - 32.0) * 5.0 / 9.0,
        _ => value,
    }
}

pub trait StateProvider {
    /// `None` when the entity has never reported.
    fn get_current_state(&self, entity_id: &str) -> Option<EntityState>;
}

#[derive(Debug, Clone, Default)]
pub struct StateCache {
    states: HashMap<EntityId, EntityState>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, entity_id: &str, state: EntityState) {
        self.states.insert(entity_id.to_string(), state);
    }

    pub fn remove(&mut self, entity_id: &str) -> Option<EntityState> {
        self.states.remove(entity_id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl StateProvider for StateCache {
    fn get_current_state(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DeviceCommand {
    SetTemperature { temperature: f32 },
    SetPosition { position: f32 },
    TurnOn,
    TurnOff,
    SetBoiler {
        on: bool,
        setpoint: Option<f32>,
    },
}

pub trait CommandSink {
    /// Must not block; delivery happens asynchronously and failures to
    /// enqueue are reported here.
    fn send_command(&mut self, entity_id: &str, command: DeviceCommand) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_states_have_no_reading() {
        assert_eq!(EntityState::new("unknown").numeric(), None);
        assert_eq!(EntityState::unavailable().numeric(), None);
        assert_eq!(EntityState::new("21.5").numeric(), Some(21.5));
    }

    #[test]
    fn converts_fahrenheit_readings() {
        let state = EntityState::new("68").with_unit("°F");
        let celsius = state.celsius().unwrap();
        assert!((celsius - 20.0).abs() < 0.01);
    }

    #[test]
    fn reads_numeric_attributes_from_strings_and_numbers() {
        let state = EntityState::new("heat")
            .with_attribute("temperature", 21.0)
            .with_attribute("min", "0");
        assert_eq!(state.attribute_f32("temperature"), Some(21.0));
        assert_eq!(state.attribute_f32("min"), Some(0.0));
        assert_eq!(state.attribute_f32("missing"), None);
    }
}
