use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::{
    error::EngineError,
    types::{EntityId, PresetMode},
};

pub const MIN_HYSTERESIS: f32 = 0.1;
pub const MAX_HYSTERESIS: f32 = 2.0;
pub const MIN_TARGET: f32 = 5.0;
pub const MAX_TARGET: f32 = 35.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub control_interval_secs: u64,
    pub schedule_interval_secs: u64,
    pub device_timeout_ms: u64,
    pub hysteresis: f32,
    pub presets: BTreeMap<PresetMode, f32>,
    pub frost_protection: FrostProtection,
    pub safety: SafetyConfig,
    pub vacation: VacationConfig,
    pub presence_sensors: Vec<EntityId>,
    pub outdoor_sensor: Option<EntityId>,
    pub min_valid_temp: f32,
    pub max_valid_temp: f32,
    pub history_len: usize,
    pub thermostat: ThermostatSettings,
    pub valve: ValveSettings,
    pub boiler: BoilerConfig,
    pub advanced: AdvancedControlConfig,
    pub learning: LearningConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_interval_secs: 30,
            schedule_interval_secs: 60,
            device_timeout_ms: 5_000,
            hysteresis: 0.5,
            presets: default_presets(),
            frost_protection: FrostProtection::default(),
            safety: SafetyConfig::default(),
            vacation: VacationConfig::default(),
            presence_sensors: Vec::new(),
            outdoor_sensor: None,
            min_valid_temp: -30.0,
            max_valid_temp: 60.0,
            history_len: 2_880,
            thermostat: ThermostatSettings::default(),
            valve: ValveSettings::default(),
            boiler: BoilerConfig::default(),
            advanced: AdvancedControlConfig::default(),
            learning: LearningConfig::default(),
        }
    }
}

fn default_presets() -> BTreeMap<PresetMode, f32> {
    BTreeMap::from([
        (PresetMode::Away, 16.0),
        (PresetMode::Eco, 18.0),
        (PresetMode::Comfort, 22.0),
        (PresetMode::Home, 21.0),
        (PresetMode::Sleep, 18.5),
        (PresetMode::Activity, 20.0),
    ])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrostProtection {
    pub enabled: bool,
    pub temperature: f32,
}

impl Default for FrostProtection {
    fn default() -> Self {
        Self {
            enabled: false,
            temperature: 7.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Smoke / CO detectors; any of them alarming latches the safety state.
    pub sensors: Vec<EntityId>,
    pub floor_temperature: f32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            sensors: Vec::new(),
            floor_temperature: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VacationConfig {
    pub enabled: bool,
    pub temperature: f32,
    pub frost_protection: f32,
    pub until: Option<DateTime<FixedOffset>>,
}

impl Default for VacationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            temperature: 15.0,
            frost_protection: 7.0,
            until: None,
        }
    }
}

impl VacationConfig {
    pub fn is_active(&self, now: DateTime<FixedOffset>) -> bool {
        self.enabled && self.until.map(|until| now < until).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermostatSettings {
    /// Smallest setpoint change worth a write.
    pub min_change: f32,
    /// After our own write, ignore reported setpoints for this long before
    /// treating a difference as a manual change.
    pub override_grace_ms: u64,
    /// Reported setpoints further than this from ours count as manual.
    pub override_threshold: f32,
    pub detect_manual_override: bool,
}

impl Default for ThermostatSettings {
    fn default() -> Self {
        Self {
            min_change: 0.1,
            override_grace_ms: 120_000,
            override_threshold: 0.5,
            detect_manual_override: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValveSettings {
    pub heating_offset: f32,
    pub idle_temperature: f32,
}

impl Default for ValveSettings {
    fn default() -> Self {
        Self {
            heating_offset: 10.0,
            idle_temperature: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoilerConfig {
    pub entity: Option<EntityId>,
    /// Measured flow temperature, used by the overshoot calibration.
    pub flow_sensor: Option<EntityId>,
    pub margin: f32,
    /// Boilers without native modulation get the PWM stage.
    pub modulating: bool,
}

impl Default for BoilerConfig {
    fn default() -> Self {
        Self {
            entity: None,
            flow_sensor: None,
            margin: 20.0,
            modulating: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedControlConfig {
    pub enabled: bool,
    pub heating_curve: bool,
    pub pid: bool,
    pub pwm: bool,
    pub overshoot_protection: bool,
    pub curve: CurveSettings,
    pub pid_gains: PidGainsConfig,
    pub pid_output_limit: f32,
    pub pid_integral_limit: f32,
    pub pwm_period_ms: u64,
    pub pwm_min_flow: f32,
    pub opv: Option<f32>,
    pub calibration: CalibrationSettings,
    pub autotune: AutotuneSettings,
}

impl Default for AdvancedControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            heating_curve: true,
            pid: false,
            pwm: false,
            overshoot_protection: true,
            curve: CurveSettings::default(),
            pid_gains: PidGainsConfig::default(),
            pid_output_limit: 10.0,
            pid_integral_limit: 50.0,
            pwm_period_ms: 900_000,
            pwm_min_flow: 25.0,
            opv: None,
            calibration: CalibrationSettings::default(),
            autotune: AutotuneSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurveSettings {
    pub coefficient: f32,
    pub radiator_baseline: f32,
    pub floor_baseline: f32,
    pub floor_slope_factor: f32,
    pub min_flow: f32,
    pub radiator_max_flow: f32,
    pub floor_max_flow: f32,
}

impl Default for CurveSettings {
    fn default() -> Self {
        Self {
            coefficient: 1.0,
            radiator_baseline: 55.0,
            floor_baseline: 40.0,
            floor_slope_factor: 0.5,
            min_flow: 20.0,
            radiator_max_flow: 80.0,
            floor_max_flow: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidGainsConfig {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Default for PidGainsConfig {
    fn default() -> Self {
        Self {
            kp: 3.0,
            ki: 0.01,
            kd: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub start_flow: f32,
    pub step: f32,
    pub step_interval_ms: u64,
    pub overshoot_threshold: f32,
    pub max_flow: f32,
    pub timeout_ms: u64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            start_flow: 40.0,
            step: 2.0,
            step_interval_ms: 300_000,
            overshoot_threshold: 2.0,
            max_flow: 75.0,
            timeout_ms: 7_200_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutotuneSettings {
    /// Flow temperature swing applied either side of the curve output.
    pub relay_amplitude: f32,
    pub cycles: usize,
    pub timeout_ms: u64,
}

impl Default for AutotuneSettings {
    fn default() -> Self {
        Self {
            relay_amplitude: 10.0,
            cycles: 3,
            timeout_ms: 21_600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub min_samples: usize,
    pub max_samples_per_area: usize,
    /// Heating rate assumed before enough samples exist, °C per hour.
    pub fallback_rate_per_hour: f32,
    pub safety_margin_minutes: i64,
    pub max_prediction_minutes: i64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_samples: 3,
            max_samples_per_area: 100,
            fallback_rate_per_hour: 1.0,
            safety_margin_minutes: 10,
            max_prediction_minutes: 360,
        }
    }
}

pub fn validate_hysteresis(value: f32) -> Result<(), EngineError> {
    if value.is_finite() && (MIN_HYSTERESIS..=MAX_HYSTERESIS).contains(&value) {
        Ok(())
    } else {
        Err(EngineError::ConfigInvalid(format!(
            "hysteresis {value} out of range [{MIN_HYSTERESIS}, {MAX_HYSTERESIS}]"
        )))
    }
}

pub fn validate_target(what: &str, value: f32) -> Result<(), EngineError> {
    if value.is_finite() && (MIN_TARGET..=MAX_TARGET).contains(&value) {
        Ok(())
    } else {
        Err(EngineError::ConfigInvalid(format!(
            "{what} {value} out of range [{MIN_TARGET}, {MAX_TARGET}]"
        )))
    }
}

impl EngineConfig {
    /// Checks every field and reports all violations at once.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut errors: Vec<String> = Vec::new();
        let mut check = |result: Result<(), EngineError>| {
            if let Err(EngineError::ConfigInvalid(message)) = result {
                errors.push(message);
            }
        };

        check(validate_hysteresis(self.hysteresis));
        for (preset, temperature) in &self.presets {
            check(validate_target(&format!("preset {}", preset.as_str()), *temperature));
        }
        check(validate_target(
            "frost protection temperature",
            self.frost_protection.temperature,
        ));
        check(validate_target("vacation temperature", self.vacation.temperature));
        check(validate_target(
            "vacation frost protection",
            self.vacation.frost_protection,
        ));

        if self.control_interval_secs == 0 {
            errors.push("control_interval_secs must be positive".to_string());
        }
        if self.schedule_interval_secs == 0 {
            errors.push("schedule_interval_secs must be positive".to_string());
        }
        if self.device_timeout_ms == 0 {
            errors.push("device_timeout_ms must be positive".to_string());
        }
        if !self.safety.floor_temperature.is_finite() {
            errors.push("safety floor temperature must be finite".to_string());
        }
        if self.min_valid_temp >= self.max_valid_temp {
            errors.push(format!(
                "min_valid_temp ({}) must be below max_valid_temp ({})",
                self.min_valid_temp, self.max_valid_temp
            ));
        }
        if !(self.thermostat.min_change >= 0.0) {
            errors.push("thermostat min_change must be >= 0".to_string());
        }
        if !(self.valve.heating_offset > 0.0) {
            errors.push(format!(
                "valve heating_offset must be positive, got {}",
                self.valve.heating_offset
            ));
        }
        if !(0.0..=100.0).contains(&self.boiler.margin) {
            errors.push(format!(
                "boiler margin {} out of range [0, 100]",
                self.boiler.margin
            ));
        }

        self.validate_advanced(&mut errors);
        self.validate_learning(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::ConfigInvalid(errors.join("; ")))
        }
    }

    fn validate_advanced(&self, errors: &mut Vec<String>) {
        let advanced = &self.advanced;
        let curve = &advanced.curve;

        if !(curve.coefficient > 0.0 && curve.coefficient <= 10.0) {
            errors.push(format!(
                "heating curve coefficient {} out of range (0, 10]",
                curve.coefficient
            ));
        }
        if curve.min_flow >= curve.floor_max_flow || curve.min_flow >= curve.radiator_max_flow {
            errors.push("heating curve min_flow must be below both max flows".to_string());
        }
        if advanced.pwm_period_ms < 60_000 {
            errors.push(format!(
                "pwm_period_ms {} must be at least one minute",
                advanced.pwm_period_ms
            ));
        }
        if advanced.pid_output_limit <= 0.0 || advanced.pid_integral_limit <= 0.0 {
            errors.push("pid limits must be positive".to_string());
        }
        let gains = advanced.pid_gains;
        if gains.kp < 0.0 || gains.ki < 0.0 || gains.kd < 0.0 {
            errors.push("pid gains must not be negative".to_string());
        }
        if let Some(opv) = advanced.opv {
            if !(curve.min_flow..=100.0).contains(&opv) {
                errors.push(format!("opv {opv} out of range [{}, 100]", curve.min_flow));
            }
        }

        let calibration = &advanced.calibration;
        if calibration.step <= 0.0 || calibration.overshoot_threshold <= 0.0 {
            errors.push("calibration step and threshold must be positive".to_string());
        }
        if calibration.start_flow >= calibration.max_flow {
            errors.push(format!(
                "calibration start_flow ({}) must be below max_flow ({})",
                calibration.start_flow, calibration.max_flow
            ));
        }
        if calibration.step_interval_ms == 0 || calibration.timeout_ms == 0 {
            errors.push("calibration intervals must be positive".to_string());
        }
        if advanced.autotune.cycles < 2 || advanced.autotune.relay_amplitude <= 0.0 {
            errors.push("autotune needs at least 2 cycles and a positive amplitude".to_string());
        }
    }

    fn validate_learning(&self, errors: &mut Vec<String>) {
        let learning = &self.learning;
        if learning.min_samples == 0 {
            errors.push("learning min_samples must be at least 1".to_string());
        }
        if learning.max_samples_per_area < learning.min_samples {
            errors.push(format!(
                "learning max_samples_per_area ({}) must be >= min_samples ({})",
                learning.max_samples_per_area, learning.min_samples
            ));
        }
        if !(learning.fallback_rate_per_hour > 0.0) {
            errors.push("learning fallback_rate_per_hour must be positive".to_string());
        }
        if learning.safety_margin_minutes < 0 {
            errors.push("learning safety_margin_minutes must not be negative".to_string());
        }
    }

    pub fn preset_temperature(&self, preset: PresetMode) -> Option<f32> {
        self.presets.get(&preset).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn hysteresis_bounds_are_enforced() {
        assert!(validate_hysteresis(0.1).is_ok());
        assert!(validate_hysteresis(2.0).is_ok());
        assert!(validate_hysteresis(0.05).is_err());
        assert!(validate_hysteresis(2.5).is_err());
        assert!(validate_hysteresis(f32::NAN).is_err());
    }

    #[test]
    fn reports_every_violation() {
        let mut config = EngineConfig::default();
        config.hysteresis = 3.0;
        config.control_interval_secs = 0;
        config.learning.min_samples = 0;

        let Err(EngineError::ConfigInvalid(message)) = config.validate() else {
            panic!("expected invalid config");
        };
        assert!(message.contains("hysteresis"));
        assert!(message.contains("control_interval_secs"));
        assert!(message.contains("min_samples"));
    }

    #[test]
    fn vacation_expires_at_until() {
        let now = DateTime::parse_from_rfc3339("2026-01-05T10:00:00+01:00").unwrap();
        let mut vacation = VacationConfig {
            enabled: true,
            ..VacationConfig::default()
        };
        assert!(vacation.is_active(now));

        vacation.until = Some(now);
        assert!(!vacation.is_active(now));
    }
}
