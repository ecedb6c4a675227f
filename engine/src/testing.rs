//! Test doubles shared by the unit tests.

use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone};

use crate::{
    error::DeviceError,
    state::{CommandSink, DeviceCommand},
    types::{EntityId, TickTime},
};

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub sent: Vec<(EntityId, DeviceCommand)>,
    failing: HashSet<EntityId>,
}

impl RecordingSink {
    pub fn fail(&mut self, entity_id: &str) {
        self.failing.insert(entity_id.to_string());
    }

    pub fn recover(&mut self, entity_id: &str) {
        self.failing.remove(entity_id);
    }

    pub fn commands_for(&self, entity_id: &str) -> Vec<DeviceCommand> {
        self.sent
            .iter()
            .filter(|(entity, _)| entity == entity_id)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.sent.clear();
    }
}

impl CommandSink for RecordingSink {
    fn send_command(&mut self, entity_id: &str, command: DeviceCommand) -> Result<(), DeviceError> {
        if self.failing.contains(entity_id) {
            return Err(DeviceError::Rejected {
                device: entity_id.to_string(),
                reason: "test failure".to_string(),
            });
        }
        self.sent.push((entity_id.to_string(), command));
        Ok(())
    }
}

/// 2026-01-05 is a Monday.
pub fn at(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
    let naive = NaiveDate::from_ymd_opt(2026, 1, day)
        .and_then(|date| date.and_hms_opt(hour, minute, 0))
        .unwrap();
    FixedOffset::east_opt(0)
        .unwrap()
        .from_local_datetime(&naive)
        .unwrap()
}

pub fn tick_at(day: u32, hour: u32, minute: u32, mono_ms: u64) -> TickTime {
    TickTime::new(at(day, hour, minute), mono_ms)
}
