/// Duty fraction for a flow request on a boiler that can only switch on/off.
pub fn duty_for(flow: f32, min_flow: f32, max_flow: f32) -> f32 {
    if max_flow <= min_flow {
        return if flow > min_flow { 1.0 } else { 0.0 };
    }
    ((flow - min_flow) / (max_flow - min_flow)).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PwmOutput {
    pub on: bool,
    pub duty: f32,
}

/// Duty is latched once per period; requests in between only take effect at
/// the next boundary so the relay never cycles faster than the period.
#[derive(Debug, Clone, PartialEq)]
pub struct PwmController {
    period_ms: u64,
    period_start_ms: Option<u64>,
    duty: f32,
}

impl PwmController {
    pub fn new(period_ms: u64) -> Self {
        Self {
            period_ms: period_ms.max(1),
            period_start_ms: None,
            duty: 0.0,
        }
    }

    pub fn set_period(&mut self, period_ms: u64) {
        self.period_ms = period_ms.max(1);
    }

    pub fn reset(&mut self) {
        self.period_start_ms = None;
        self.duty = 0.0;
    }

    pub fn update(&mut self, requested_duty: f32, now_ms: u64) -> PwmOutput {
        let boundary = match self.period_start_ms {
            None => true,
            Some(start) => now_ms.saturating_sub(start) >= self.period_ms,
        };
        if boundary {
            self.period_start_ms = Some(now_ms);
            self.duty = requested_duty.clamp(0.0, 1.0);
        }

        let elapsed = self
            .period_start_ms
            .map(|start| now_ms.saturating_sub(start))
            .unwrap_or(0);
        let on_time = (self.duty as f64 * self.period_ms as f64) as u64;

        PwmOutput {
            on: elapsed < on_time,
            duty: self.duty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINUTE: u64 = 60_000;

    #[test]
    fn duty_is_linear_between_bounds() {
        assert_eq!(duty_for(25.0, 25.0, 75.0), 0.0);
        assert_eq!(duty_for(50.0, 25.0, 75.0), 0.5);
        assert_eq!(duty_for(90.0, 25.0, 75.0), 1.0);
        assert_eq!(duty_for(10.0, 25.0, 75.0), 0.0);
    }

    #[test]
    fn relay_on_for_duty_share_of_period() {
        let mut pwm = PwmController::new(15 * MINUTE);
        assert!(pwm.update(0.4, 0).on);
        assert!(pwm.update(0.4, 5 * MINUTE).on);
        assert!(!pwm.update(0.4, 6 * MINUTE).on);
        assert!(!pwm.update(0.4, 14 * MINUTE).on);
        assert!(pwm.update(0.4, 15 * MINUTE).on);
    }

    #[test]
    fn duty_changes_wait_for_period_boundary() {
        let mut pwm = PwmController::new(15 * MINUTE);
        pwm.update(0.2, 0);
        let mid = pwm.update(1.0, 7 * MINUTE);
        assert_eq!(mid, PwmOutput { on: false, duty: 0.2 });

        let next = pwm.update(1.0, 15 * MINUTE);
        assert_eq!(next, PwmOutput { on: true, duty: 1.0 });
    }

    #[test]
    fn zero_duty_never_switches_on() {
        let mut pwm = PwmController::new(15 * MINUTE);
        assert!(!pwm.update(0.0, 0).on);
    }
}
