use tracing::warn;

use crate::{
    state::{EntityState, StateProvider},
    types::EntityId,
};

const ALARM_STATES: [&str; 5] = ["on", "detected", "alarm", "true", "triggered"];

pub fn is_alarm_state(state: &EntityState) -> bool {
    if !state.is_available() {
        return false;
    }
    let value = state.value.trim().to_ascii_lowercase();
    if ALARM_STATES.contains(&value.as_str()) {
        return true;
    }
    value.parse::<f32>().is_ok_and(|reading| reading > 0.0)
}

/// Smoke / CO alarm latch. Once tripped it stays tripped until cleared by
/// hand, whatever the sensors report afterwards.
#[derive(Debug, Clone, Default)]
pub struct SafetyMonitor {
    triggered_by: Option<EntityId>,
}

impl SafetyMonitor {
    pub fn is_active(&self) -> bool {
        self.triggered_by.is_some()
    }

    pub fn triggered_by(&self) -> Option<&str> {
        self.triggered_by.as_deref()
    }

    /// Returns the sensor that tripped the alarm on this call, if any.
    pub fn evaluate(&mut self, sensors: &[EntityId], states: &dyn StateProvider) -> Option<EntityId> {
        if self.is_active() {
            return None;
        }
        let tripped = sensors.iter().find(|sensor| {
            states
                .get_current_state(sensor)
                .is_some_and(|state| is_alarm_state(&state))
        })?;

        warn!(sensor = %tripped, "safety alarm latched, all areas disabled");
        self.triggered_by = Some(tripped.clone());
        Some(tripped.clone())
    }

    pub fn clear(&mut self) -> bool {
        self.triggered_by.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateCache;
    use pretty_assertions::assert_eq;

    fn sensors() -> Vec<EntityId> {
        vec!["binary_sensor.smoke".to_string(), "sensor.co_ppm".to_string()]
    }

    #[test]
    fn recognises_alarm_values() {
        assert!(is_alarm_state(&EntityState::new("on")));
        assert!(is_alarm_state(&EntityState::new("Detected")));
        assert!(is_alarm_state(&EntityState::new("35")));
        assert!(!is_alarm_state(&EntityState::new("off")));
        assert!(!is_alarm_state(&EntityState::new("0")));
        assert!(!is_alarm_state(&EntityState::unavailable()));
    }

    #[test]
    fn alarm_latches_until_cleared() {
        let mut states = StateCache::new();
        states.update("binary_sensor.smoke", EntityState::new("off"));
        let mut monitor = SafetyMonitor::default();
        assert_eq!(monitor.evaluate(&sensors(), &states), None);

        states.update("binary_sensor.smoke", EntityState::new("on"));
        assert_eq!(
            monitor.evaluate(&sensors(), &states),
            Some("binary_sensor.smoke".to_string())
        );
        assert!(monitor.is_active());

        // Back to normal, still latched and no second alert.
        states.update("binary_sensor.smoke", EntityState::new("off"));
        assert_eq!(monitor.evaluate(&sensors(), &states), None);
        assert!(monitor.is_active());

        assert!(monitor.clear());
        assert!(!monitor.is_active());
        assert_eq!(monitor.evaluate(&sensors(), &states), None);
    }
}
