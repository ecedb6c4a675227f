use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

pub type AreaId = String;
pub type EntityId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HeatDecision {
    #[default]
    Idle,
    Heating,
}

impl HeatDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Heating => "HEATING",
        }
    }

    pub fn is_heating(self) -> bool {
        self == Self::Heating
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatingType {
    #[default]
    Radiator,
    Floor,
}

impl HeatingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Radiator => "radiator",
            Self::Floor => "floor",
        }
    }
}

/// Which precedence layer produced an area's effective target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSource {
    Safety,
    Vacation,
    ManualOverride,
    Boost,
    Window,
    Schedule,
    Presence,
    Preset,
    Base,
}

impl TargetSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safety => "safety",
            Self::Vacation => "vacation",
            Self::ManualOverride => "manual_override",
            Self::Boost => "boost",
            Self::Window => "window",
            Self::Schedule => "schedule",
            Self::Presence => "presence",
            Self::Preset => "preset",
            Self::Base => "base",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetMode {
    Away,
    Eco,
    Comfort,
    Home,
    Sleep,
    Activity,
}

impl PresetMode {
    pub const ALL: [PresetMode; 6] = [
        Self::Away,
        Self::Eco,
        Self::Comfort,
        Self::Home,
        Self::Sleep,
        Self::Activity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Away => "away",
            Self::Eco => "eco",
            Self::Comfort => "comfort",
            Self::Home => "home",
            Self::Sleep => "sleep",
            Self::Activity => "activity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Thermostat,
    Switch,
    Valve,
}

/// Both clocks a tick needs: wall-clock for schedules, boosts and learning
/// timestamps, monotonic milliseconds for rate limits, PID and PWM timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickTime {
    pub wall: DateTime<FixedOffset>,
    pub mono_ms: u64,
}

impl TickTime {
    pub fn new(wall: DateTime<FixedOffset>, mono_ms: u64) -> Self {
        Self { wall, mono_ms }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaStatus {
    pub id: AreaId,
    pub name: String,
    pub enabled: bool,
    pub hidden: bool,
    pub heating_type: &'static str,
    pub current_temperature: Option<f32>,
    pub base_target: f32,
    pub effective_target: Option<f32>,
    pub target_source: Option<&'static str>,
    pub night_boost_active: bool,
    pub state: &'static str,
    pub decision: &'static str,
    pub manual_override: Option<f32>,
    pub boost_until_epoch: Option<i64>,
    pub learning_samples: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoilerStatus {
    pub on: bool,
    pub setpoint: Option<f32>,
    pub duty: Option<f32>,
    pub calibrating: bool,
    pub opv: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub safety_alarm: bool,
    pub safety_triggered_by: Option<EntityId>,
    pub vacation: bool,
    pub hysteresis: f32,
    pub advanced_control: bool,
    pub boiler: BoilerStatus,
    pub areas: Vec<AreaStatus>,
}
