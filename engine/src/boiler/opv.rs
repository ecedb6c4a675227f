//! Overshoot-protection value calibration: ramp the flow setpoint until the
//! measured flow runs away from it, and keep that setpoint as the ceiling.

use crate::config::CalibrationSettings;

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationStep {
    /// Keep the boiler on at this flow setpoint.
    Drive(f32),
    Finished(f32),
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpvCalibration {
    settings: CalibrationSettings,
    started_ms: u64,
    last_step_ms: u64,
    setpoint: f32,
}

impl OpvCalibration {
    pub fn start(settings: &CalibrationSettings, now_ms: u64) -> Self {
        Self {
            settings: settings.clone(),
            started_ms: now_ms,
            last_step_ms: now_ms,
            setpoint: settings.start_flow.min(settings.max_flow),
        }
    }

    pub fn setpoint(&self) -> f32 {
        self.setpoint
    }

    pub fn timed_out(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.started_ms) >= self.settings.timeout_ms
    }

    pub fn step(&mut self, measured_flow: Option<f32>, now_ms: u64) -> CalibrationStep {
        if self.timed_out(now_ms) {
            return CalibrationStep::Aborted(format!(
                "timed out after {} min",
                self.settings.timeout_ms / 60_000
            ));
        }

        if let Some(measured) = measured_flow {
            if measured >= self.setpoint + self.settings.overshoot_threshold {
                return CalibrationStep::Finished(self.setpoint);
            }
        }

        if now_ms.saturating_sub(self.last_step_ms) >= self.settings.step_interval_ms {
            if self.setpoint >= self.settings.max_flow {
                return CalibrationStep::Finished(self.settings.max_flow);
            }
            self.setpoint = (self.setpoint + self.settings.step).min(self.settings.max_flow);
            self.last_step_ms = now_ms;
        }

        CalibrationStep::Drive(self.setpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINUTE: u64 = 60_000;

    #[test]
    fn ramps_in_steps() {
        let settings = CalibrationSettings::default();
        let mut run = OpvCalibration::start(&settings, 0);
        assert_eq!(run.step(Some(30.0), MINUTE), CalibrationStep::Drive(40.0));
        assert_eq!(run.step(Some(35.0), 5 * MINUTE), CalibrationStep::Drive(42.0));
        assert_eq!(run.step(Some(38.0), 6 * MINUTE), CalibrationStep::Drive(42.0));
        assert_eq!(run.step(Some(40.0), 10 * MINUTE), CalibrationStep::Drive(44.0));
    }

    #[test]
    fn overshoot_records_setpoint() {
        let settings = CalibrationSettings::default();
        let mut run = OpvCalibration::start(&settings, 0);
        run.step(Some(35.0), 5 * MINUTE);
        assert_eq!(run.step(Some(44.5), 6 * MINUTE), CalibrationStep::Finished(42.0));
    }

    #[test]
    fn no_overshoot_settles_on_max_flow() {
        let settings = CalibrationSettings {
            start_flow: 70.0,
            ..CalibrationSettings::default()
        };
        let mut run = OpvCalibration::start(&settings, 0);
        let mut now = 0;
        let result = loop {
            now += 5 * MINUTE;
            match run.step(Some(60.0), now) {
                CalibrationStep::Drive(_) => continue,
                done => break done,
            }
        };
        assert_eq!(result, CalibrationStep::Finished(settings.max_flow));
    }

    #[test]
    fn times_out() {
        let settings = CalibrationSettings::default();
        let mut run = OpvCalibration::start(&settings, 0);
        assert!(matches!(
            run.step(None, settings.timeout_ms),
            CalibrationStep::Aborted(_)
        ));
    }
}
