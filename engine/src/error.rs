use thiserror::Error;

use crate::types::{AreaId, EntityId, HeatDecision};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("device {device} is unavailable")]
    Unavailable { device: EntityId },
    #[error("device {device} rejected command: {reason}")]
    Rejected { device: EntityId, reason: String },
    #[error("device {device} supports neither position nor temperature control")]
    Unsupported { device: EntityId },
    #[error("device {device} did not answer within {timeout_ms} ms")]
    Timeout { device: EntityId, timeout_ms: u64 },
}

impl DeviceError {
    pub fn device(&self) -> &str {
        match self {
            Self::Unavailable { device }
            | Self::Rejected { device, .. }
            | Self::Unsupported { device }
            | Self::Timeout { device, .. } => device,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("sensor {entity} is unavailable")]
    SensorUnavailable { entity: EntityId },
    #[error("command to {device} for area {area} ({}) failed: {source}", .decision.as_str())]
    DeviceCommandFailed {
        area: AreaId,
        device: EntityId,
        decision: HeatDecision,
        #[source]
        source: DeviceError,
    },
    #[error("area {area} has {samples} learning samples, {required} required")]
    InsufficientLearningData {
        area: AreaId,
        samples: usize,
        required: usize,
    },
    #[error("an overshoot protection calibration is already in progress")]
    CalibrationInProgress,
    #[error("overshoot protection calibration aborted: {reason}")]
    CalibrationAborted { reason: String },
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("unknown area '{0}'")]
    UnknownArea(AreaId),
}
