use serde::Serialize;

use crate::{
    error::EngineError,
    types::{AreaId, EntityId, HeatDecision, TargetSource},
};

/// Everything observers may want to know about a tick. Transport decides the
/// wire format; the controller publishes these as tagged JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    DecisionChanged {
        area: AreaId,
        decision: HeatDecision,
        current: Option<f32>,
        target: f32,
    },
    TargetChanged {
        area: AreaId,
        target: f32,
        source: TargetSource,
        night_boost: bool,
    },
    SafetyAlert {
        sensor: EntityId,
    },
    SafetyCleared,
    ManualOverrideDetected {
        area: AreaId,
        device: EntityId,
        temperature: f32,
    },
    BoostExpired {
        area: AreaId,
    },
    PreheatPlanned {
        area: AreaId,
        start_epoch: i64,
        deadline_epoch: i64,
        target: f32,
    },
    HeatingSampleRecorded {
        area: AreaId,
        minutes: f32,
        rate_per_hour: f32,
    },
    CalibrationStarted {
        setpoint: f32,
    },
    CalibrationFinished {
        opv: f32,
    },
    CalibrationAborted {
        reason: String,
    },
    AutoTuneFinished {
        kp: f32,
        ki: f32,
        kd: f32,
    },
    AutoTuneFailed {
        reason: String,
    },
    DeviceCommandFailed {
        area: Option<AreaId>,
        device: EntityId,
        decision: Option<HeatDecision>,
        error: String,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DecisionChanged { .. } => "decision_changed",
            Self::TargetChanged { .. } => "target_changed",
            Self::SafetyAlert { .. } => "safety_alert",
            Self::SafetyCleared => "safety_cleared",
            Self::ManualOverrideDetected { .. } => "manual_override_detected",
            Self::BoostExpired { .. } => "boost_expired",
            Self::PreheatPlanned { .. } => "preheat_planned",
            Self::HeatingSampleRecorded { .. } => "heating_sample_recorded",
            Self::CalibrationStarted { .. } => "calibration_started",
            Self::CalibrationFinished { .. } => "calibration_finished",
            Self::CalibrationAborted { .. } => "calibration_aborted",
            Self::AutoTuneFinished { .. } => "auto_tune_finished",
            Self::AutoTuneFailed { .. } => "auto_tune_failed",
            Self::DeviceCommandFailed { .. } => "device_command_failed",
        }
    }
}

/// Outcome of one engine tick.
#[derive(Debug, Default)]
pub struct TickReport {
    pub events: Vec<EngineEvent>,
    /// Isolated per-device and per-area failures; none of them stopped the tick.
    pub failures: Vec<EngineError>,
    pub boiler: Option<crate::boiler::BoilerOutcome>,
}

impl TickReport {
    pub fn push(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.events.iter().any(|event| event.name() == name)
    }
}
