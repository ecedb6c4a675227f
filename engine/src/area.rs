use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::{
    config::{validate_hysteresis, validate_target, EngineConfig},
    devices::DeviceRef,
    error::EngineError,
    schedule::{ScheduleSet, TimeWindow},
    types::{AreaId, DeviceKind, EntityId, HeatDecision, HeatingType, PresetMode},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Area {
    pub id: AreaId,
    pub name: String,
    pub target_temperature: f32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub hidden: bool,
    /// Frozen target observed on a device changed outside the engine.
    #[serde(default)]
    pub manual_override: Option<f32>,
    #[serde(default)]
    pub hysteresis: Option<f32>,
    #[serde(default)]
    pub heating_type: HeatingType,
    #[serde(default)]
    pub heating_curve_coefficient: Option<f32>,
    #[serde(default)]
    pub devices: Vec<DeviceRef>,
    #[serde(default)]
    pub temperature_sensors: Vec<EntityId>,
    #[serde(default)]
    pub primary_temperature_sensor: Option<EntityId>,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub schedule: ScheduleSet,
    #[serde(default)]
    pub smart_preheat: bool,
    #[serde(default)]
    pub night_boost: NightBoost,
    #[serde(default)]
    pub presets: BTreeMap<PresetMode, PresetSetting>,
    #[serde(default)]
    pub preset_mode: Option<PresetMode>,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default = "default_true")]
    pub shutdown_switches_when_idle: bool,
    #[serde(default)]
    pub boost: Option<Boost>,

    #[serde(default)]
    pub current_temperature: Option<f32>,
    #[serde(default)]
    pub heating_state: HeatDecision,
    #[serde(skip)]
    pub temperature_history: VecDeque<(DateTime<FixedOffset>, f32)>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "temperature", rename_all = "snake_case")]
pub enum PresetSetting {
    Global,
    Custom(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAction {
    #[default]
    None,
    ReduceTemperature,
    TurnOff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub sensors: Vec<EntityId>,
    pub action: WindowAction,
    pub temperature_drop: f32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            sensors: Vec::new(),
            action: WindowAction::None,
            temperature_drop: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NightBoost {
    pub enabled: bool,
    pub offset: f32,
    pub window: TimeWindow,
    pub smart: Option<SmartNightBoost>,
}

impl Default for NightBoost {
    fn default() -> Self {
        Self {
            enabled: false,
            offset: 0.5,
            window: TimeWindow::new(22 * 60, 6 * 60),
            smart: None,
        }
    }
}

/// Predictive night boost: the window ends at the wake time and starts as late
/// as the learned heating time allows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartNightBoost {
    #[serde(rename = "wakeMinutes")]
    pub wake_minutes: u16,
    #[serde(default)]
    pub weather_sensor: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub use_global: bool,
    pub sensors: Vec<EntityId>,
    pub away_preset: Option<PresetMode>,
    pub home_preset: Option<PresetMode>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            use_global: true,
            sensors: Vec::new(),
            away_preset: Some(PresetMode::Away),
            home_preset: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Boost {
    pub temperature: f32,
    pub until: DateTime<FixedOffset>,
}

impl Area {
    pub fn new(id: &str, name: &str, target_temperature: f32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            target_temperature,
            enabled: true,
            hidden: false,
            manual_override: None,
            hysteresis: None,
            heating_type: HeatingType::default(),
            heating_curve_coefficient: None,
            devices: Vec::new(),
            temperature_sensors: Vec::new(),
            primary_temperature_sensor: None,
            window: WindowConfig::default(),
            schedule: ScheduleSet::default(),
            smart_preheat: false,
            night_boost: NightBoost::default(),
            presets: BTreeMap::new(),
            preset_mode: None,
            presence: PresenceConfig::default(),
            shutdown_switches_when_idle: true,
            boost: None,
            current_temperature: None,
            heating_state: HeatDecision::Idle,
            temperature_history: VecDeque::new(),
        }
    }

    pub fn with_device(mut self, entity_id: &str, kind: DeviceKind) -> Self {
        self.devices.push(DeviceRef::new(entity_id, kind));
        self
    }

    pub fn with_sensor(mut self, entity_id: &str) -> Self {
        self.temperature_sensors.push(entity_id.to_string());
        self
    }

    pub fn hysteresis_or(&self, global: f32) -> f32 {
        self.hysteresis.unwrap_or(global)
    }

    pub fn devices_of(&self, kind: DeviceKind) -> impl Iterator<Item = &DeviceRef> {
        self.devices.iter().filter(move |device| device.kind == kind)
    }

    /// Area-specific value when set to custom, otherwise the global table.
    pub fn preset_temperature(&self, preset: PresetMode, config: &EngineConfig) -> Option<f32> {
        match self.presets.get(&preset) {
            Some(PresetSetting::Custom(temperature)) => Some(*temperature),
            Some(PresetSetting::Global) | None => config.preset_temperature(preset),
        }
    }

    pub fn is_boost_active(&self, now: DateTime<FixedOffset>) -> bool {
        self.boost.map(|boost| now < boost.until).unwrap_or(false)
    }

    pub fn record_temperature(&mut self, at: DateTime<FixedOffset>, temperature: f32, max_len: usize) {
        if max_len == 0 {
            return;
        }
        while self.temperature_history.len() >= max_len {
            self.temperature_history.pop_front();
        }
        self.temperature_history.push_back((at, temperature));
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let mut errors: Vec<String> = Vec::new();
        let mut check = |result: Result<(), EngineError>| {
            if let Err(EngineError::ConfigInvalid(message)) = result {
                errors.push(message);
            }
        };

        check(validate_target("target temperature", self.target_temperature));
        if let Some(hysteresis) = self.hysteresis {
            check(validate_hysteresis(hysteresis));
        }
        for (preset, setting) in &self.presets {
            if let PresetSetting::Custom(temperature) = setting {
                check(validate_target(&format!("preset {}", preset.as_str()), *temperature));
            }
        }
        for entry in &self.schedule.entries {
            if let Some(temperature) = entry.temperature {
                check(validate_target("schedule temperature", temperature));
            }
        }

        if self.id.trim().is_empty() {
            errors.push("area id is empty".to_string());
        }
        if let Some(coefficient) = self.heating_curve_coefficient {
            if !(coefficient > 0.0 && coefficient <= 10.0) {
                errors.push(format!(
                    "heating curve coefficient {coefficient} out of range (0, 10]"
                ));
            }
        }
        if !(0.0..=10.0).contains(&self.night_boost.offset) {
            errors.push(format!(
                "night boost offset {} out of range [0, 10]",
                self.night_boost.offset
            ));
        }
        if self.night_boost.enabled && !self.night_boost.window.is_valid() {
            errors.push("night boost window is invalid".to_string());
        }
        if let Some(smart) = &self.night_boost.smart {
            if smart.wake_minutes >= crate::schedule::MINUTES_PER_DAY {
                errors.push(format!("wake time {} out of range", smart.wake_minutes));
            }
        }
        if !(self.window.temperature_drop >= 0.0) {
            errors.push("window temperature_drop must not be negative".to_string());
        }
        if let Some(primary) = &self.primary_temperature_sensor {
            let known = self.temperature_sensors.contains(primary)
                || self
                    .devices_of(DeviceKind::Thermostat)
                    .any(|device| &device.entity_id == primary);
            if !known {
                errors.push(format!(
                    "primary temperature sensor '{primary}' is not assigned to the area"
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::ConfigInvalid(format!(
                "area '{}': {}",
                self.id,
                errors.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_preset_overrides_global_table() {
        let config = EngineConfig::default();
        let mut area = Area::new("living", "Living", 21.0);
        assert_eq!(area.preset_temperature(PresetMode::Eco, &config), Some(18.0));

        area.presets
            .insert(PresetMode::Eco, PresetSetting::Custom(17.0));
        assert_eq!(area.preset_temperature(PresetMode::Eco, &config), Some(17.0));

        area.presets.insert(PresetMode::Eco, PresetSetting::Global);
        assert_eq!(area.preset_temperature(PresetMode::Eco, &config), Some(18.0));
    }

    #[test]
    fn history_is_bounded() {
        let now = DateTime::parse_from_rfc3339("2026-01-05T10:00:00+01:00").unwrap();
        let mut area = Area::new("living", "Living", 21.0);
        for i in 0..5 {
            area.record_temperature(now, 20.0 + i as f32, 3);
        }
        assert_eq!(area.temperature_history.len(), 3);
        assert_eq!(area.temperature_history.front().map(|(_, t)| *t), Some(22.0));
    }

    #[test]
    fn rejects_unassigned_primary_sensor() {
        let mut area = Area::new("living", "Living", 21.0).with_sensor("sensor.living");
        area.primary_temperature_sensor = Some("sensor.kitchen".to_string());
        assert!(area.validate().is_err());

        area.primary_temperature_sensor = Some("sensor.living".to_string());
        assert!(area.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_hysteresis() {
        let mut area = Area::new("living", "Living", 21.0);
        area.hysteresis = Some(5.0);
        assert!(matches!(area.validate(), Err(EngineError::ConfigInvalid(_))));
    }
}
