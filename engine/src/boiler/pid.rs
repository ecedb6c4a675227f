//! Flow-temperature correction from room error, and the relay test that
//! tunes it.

use std::f32::consts::PI;

use crate::config::{AutotuneSettings, PidGainsConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct PidController {
    gains: PidGainsConfig,
    output_limit: f32,
    integral_limit: f32,
    integral: f32,
    last_error: Option<f32>,
    last_ms: Option<u64>,
}

impl PidController {
    pub fn new(gains: PidGainsConfig, output_limit: f32, integral_limit: f32) -> Self {
        Self {
            gains,
            output_limit,
            integral_limit,
            integral: 0.0,
            last_error: None,
            last_ms: None,
        }
    }

    pub fn configure(&mut self, gains: PidGainsConfig, output_limit: f32, integral_limit: f32) {
        self.gains = gains;
        self.output_limit = output_limit;
        self.integral_limit = integral_limit;
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
        self.last_ms = None;
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    /// `error` is target minus measured, °C. Returns a flow correction in °C.
    pub fn update(&mut self, error: f32, now_ms: u64) -> f32 {
        let dt = self
            .last_ms
            .map(|last| now_ms.saturating_sub(last) as f32 / 1000.0)
            .unwrap_or(0.0);

        let derivative = match self.last_error {
            Some(last_error) if dt > 0.0 => (error - last_error) / dt,
            _ => 0.0,
        };

        let unclamped = self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative;
        // Only integrate when the output is not already pinned in the same direction.
        let saturated = unclamped.abs() >= self.output_limit && unclamped.signum() == error.signum();
        if !saturated {
            self.integral = (self.integral + error * dt).clamp(-self.integral_limit, self.integral_limit);
        }

        self.last_error = Some(error);
        self.last_ms = Some(now_ms);

        let output = self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative;
        output.clamp(-self.output_limit, self.output_limit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutoTuneStep {
    /// Relay output to apply as the flow correction this tick.
    Relay(f32),
    Finished(PidGainsConfig),
    Failed(String),
}

/// Åström–Hägglund relay experiment. The relay flips the correction between
/// `+amplitude` and `-amplitude` as the process value crosses the setpoint;
/// the resulting limit cycle gives the ultimate gain and period.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayAutoTune {
    setpoint: f32,
    amplitude: f32,
    cycles: usize,
    started_ms: u64,
    timeout_ms: u64,
    high: bool,
    peak: f32,
    trough: f32,
    peaks: Vec<f32>,
    troughs: Vec<f32>,
    rising_switches: Vec<u64>,
}

impl RelayAutoTune {
    pub fn new(setpoint: f32, settings: &AutotuneSettings, now_ms: u64) -> Self {
        Self {
            setpoint,
            amplitude: settings.relay_amplitude,
            cycles: settings.cycles.max(1),
            started_ms: now_ms,
            timeout_ms: settings.timeout_ms,
            high: true,
            peak: f32::NEG_INFINITY,
            trough: f32::INFINITY,
            peaks: Vec::new(),
            troughs: Vec::new(),
            rising_switches: Vec::new(),
        }
    }

    pub fn cycles_seen(&self) -> usize {
        self.rising_switches.len().saturating_sub(1)
    }

    pub fn timed_out(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.started_ms) >= self.timeout_ms
    }

    pub fn timeout_failure(&self) -> AutoTuneStep {
        AutoTuneStep::Failed(format!(
            "no stable oscillation after {} cycles",
            self.cycles_seen()
        ))
    }

    pub fn step(&mut self, process_value: f32, now_ms: u64) -> AutoTuneStep {
        if self.timed_out(now_ms) {
            return self.timeout_failure();
        }

        self.peak = self.peak.max(process_value);
        self.trough = self.trough.min(process_value);

        if self.high && process_value > self.setpoint {
            self.high = false;
            self.troughs.push(self.trough);
            self.peak = process_value;
        } else if !self.high && process_value < self.setpoint {
            self.high = true;
            self.peaks.push(self.peak);
            self.trough = process_value;
            self.rising_switches.push(now_ms);

            if self.cycles_seen() >= self.cycles {
                return self.finish();
            }
        }

        AutoTuneStep::Relay(if self.high {
            self.amplitude
        } else {
            -self.amplitude
        })
    }

    fn finish(&self) -> AutoTuneStep {
        let recent = |values: &[f32]| {
            let tail = &values[values.len().saturating_sub(self.cycles)..];
            tail.iter().sum::<f32>() / tail.len().max(1) as f32
        };
        let oscillation = (recent(&self.peaks) - recent(&self.troughs)) / 2.0;
        if oscillation <= f32::EPSILON {
            return AutoTuneStep::Failed("process value did not oscillate".to_string());
        }

        let (first, last) = match (self.rising_switches.first(), self.rising_switches.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return AutoTuneStep::Failed("no oscillation period".to_string()),
        };
        let period_secs = (last - first) as f32 / 1000.0 / self.cycles_seen() as f32;

        AutoTuneStep::Finished(ziegler_nichols(self.amplitude, oscillation, period_secs))
    }
}

/// Classic Ziegler–Nichols PID rules from a relay test.
pub fn ziegler_nichols(relay_amplitude: f32, oscillation: f32, period_secs: f32) -> PidGainsConfig {
    let ku = 4.0 * relay_amplitude / (PI * oscillation);
    PidGainsConfig {
        kp: 0.6 * ku,
        ki: 1.2 * ku / period_secs,
        kd: 0.075 * ku * period_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gains(kp: f32, ki: f32, kd: f32) -> PidGainsConfig {
        PidGainsConfig { kp, ki, kd }
    }

    #[test]
    fn proportional_only_follows_error() {
        let mut pid = PidController::new(gains(2.0, 0.0, 0.0), 10.0, 50.0);
        assert_eq!(pid.update(1.5, 0), 3.0);
        assert_eq!(pid.update(-1.0, 30_000), -2.0);
    }

    #[test]
    fn output_is_clamped() {
        let mut pid = PidController::new(gains(5.0, 0.0, 0.0), 10.0, 50.0);
        assert_eq!(pid.update(4.0, 0), 10.0);
        assert_eq!(pid.update(-4.0, 1_000), -10.0);
    }

    #[test]
    fn integral_accumulates_and_is_bounded() {
        let mut pid = PidController::new(gains(0.0, 0.1, 0.0), 100.0, 50.0);
        pid.update(1.0, 0);
        pid.update(1.0, 30_000);
        assert!((pid.integral() - 30.0).abs() < 1e-3);

        for tick in 2..10 {
            pid.update(1.0, tick * 30_000);
        }
        assert_eq!(pid.integral(), 50.0);
    }

    #[test]
    fn saturated_output_stops_integration() {
        let mut pid = PidController::new(gains(20.0, 0.1, 0.0), 10.0, 1_000.0);
        pid.update(1.0, 0);
        pid.update(1.0, 30_000);
        assert_eq!(pid.integral(), 0.0);
    }

    #[test]
    fn reset_clears_history() {
        let mut pid = PidController::new(gains(1.0, 0.1, 1.0), 100.0, 50.0);
        pid.update(2.0, 0);
        pid.update(1.0, 10_000);
        pid.reset();
        assert_eq!(pid.integral(), 0.0);
        // No derivative kick on the first sample after a reset.
        assert_eq!(pid.update(3.0, 20_000), 3.0);
    }

    #[test]
    fn ziegler_nichols_classic_rules() {
        let gains = ziegler_nichols(10.0, 0.5, 3_600.0);
        let ku = 40.0 / (PI * 0.5);
        assert!((gains.kp - 0.6 * ku).abs() < 1e-3);
        assert!((gains.ki - 1.2 * ku / 3_600.0).abs() < 1e-6);
        assert!((gains.kd - 0.075 * ku * 3_600.0).abs() < 0.5);
    }

    #[test]
    fn relay_test_measures_limit_cycle() {
        let settings = AutotuneSettings::default();
        let mut tune = RelayAutoTune::new(0.0, &settings, 0);

        let mut result = None;
        for minute in 0..400u64 {
            let t = minute * 60;
            let value = (0.5 * (2.0 * std::f64::consts::PI * t as f64 / 3_600.0).sin()) as f32;
            match tune.step(value, t * 1_000) {
                AutoTuneStep::Relay(output) => assert_eq!(output.abs(), settings.relay_amplitude),
                done => {
                    result = Some(done);
                    break;
                }
            }
        }

        let Some(AutoTuneStep::Finished(tuned)) = result else {
            panic!("auto-tune did not finish: {result:?}");
        };
        let expected = ziegler_nichols(settings.relay_amplitude, 0.5, 3_600.0);
        assert!((tuned.kp - expected.kp).abs() / expected.kp < 0.02);
        assert!((tuned.ki - expected.ki).abs() / expected.ki < 0.02);
    }

    #[test]
    fn relay_test_times_out() {
        let settings = AutotuneSettings {
            timeout_ms: 60_000,
            ..AutotuneSettings::default()
        };
        let mut tune = RelayAutoTune::new(21.0, &settings, 0);
        assert_eq!(tune.step(19.0, 0), AutoTuneStep::Relay(10.0));
        assert!(!tune.timed_out(59_999));
        assert!(tune.timed_out(60_000));
        assert!(matches!(tune.step(19.5, 60_000), AutoTuneStep::Failed(_)));
    }
}
