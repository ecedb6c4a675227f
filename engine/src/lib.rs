pub mod aggregate;
pub mod area;
pub mod boiler;
pub mod config;
pub mod devices;
pub mod engine;
pub mod error;
pub mod events;
pub mod hysteresis;
pub mod learning;
pub mod resolver;
pub mod safety;
pub mod schedule;
pub mod state;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use area::{Area, Boost, NightBoost, PresetSetting, WindowAction};
pub use config::{AdvancedControlConfig, EngineConfig, VacationConfig};
pub use devices::{DeviceCapability, DeviceRef};
pub use engine::{HeatingEngine, PreheatPlan};
pub use error::{DeviceError, EngineError};
pub use events::{EngineEvent, TickReport};
pub use learning::{HeatingSample, LearningStats, Prediction};
pub use schedule::{DayOfWeek, ScheduleEntry, ScheduleSet, TimeWindow};
pub use state::{CommandSink, DeviceCommand, EntityState, StateCache, StateProvider};
pub use topics::*;
pub use types::{
    AreaId, AreaStatus, BoilerStatus, DeviceKind, EngineStatus, EntityId, HeatDecision,
    HeatingType, PresetMode, TargetSource, TickTime,
};
