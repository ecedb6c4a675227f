use crate::types::HeatDecision;

/// Why an area is held at a neutral, non-heating decision this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    Disabled,
    ManualOverride,
    Safety,
}

/// One step of the dead-band state machine. Inside `[target - h, target)`
/// the previous state is kept; an unknown temperature keeps it as well.
pub fn next_state(
    previous: HeatDecision,
    current: Option<f32>,
    target: f32,
    hysteresis: f32,
) -> HeatDecision {
    let Some(current) = current else {
        return previous;
    };

    match previous {
        HeatDecision::Idle if current < target - hysteresis => HeatDecision::Heating,
        HeatDecision::Heating if current >= target => HeatDecision::Idle,
        unchanged => unchanged,
    }
}

/// Advances the persisted state unless the area is held, and returns the
/// decision devices should act on. A held area reports `Idle` while its
/// persisted state stays untouched, so releasing the hold resumes the cycle.
pub fn decide(
    state: &mut HeatDecision,
    hold: Option<Hold>,
    current: Option<f32>,
    target: f32,
    hysteresis: f32,
) -> HeatDecision {
    if hold.is_some() {
        return HeatDecision::Idle;
    }
    *state = next_state(*state, current, target, hysteresis);
    *state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_heating_below_band() {
        assert_eq!(
            next_state(HeatDecision::Idle, Some(20.4), 21.0, 0.5),
            HeatDecision::Heating
        );
        assert_eq!(
            next_state(HeatDecision::Idle, Some(20.5), 21.0, 0.5),
            HeatDecision::Idle
        );
    }

    #[test]
    fn stops_heating_at_target() {
        assert_eq!(
            next_state(HeatDecision::Heating, Some(21.0), 21.0, 0.5),
            HeatDecision::Idle
        );
        assert_eq!(
            next_state(HeatDecision::Heating, Some(20.99), 21.0, 0.5),
            HeatDecision::Heating
        );
    }

    #[test]
    fn dead_band_is_sticky_for_both_states() {
        let target = 21.0;
        let hysteresis = 0.5;
        for step in 0..50 {
            let current = target - hysteresis + step as f32 * 0.01;
            assert!(current < target);
            for previous in [HeatDecision::Idle, HeatDecision::Heating] {
                assert_eq!(
                    next_state(previous, Some(current), target, hysteresis),
                    previous,
                    "current {current} previous {previous:?}"
                );
            }
        }
    }

    #[test]
    fn unknown_temperature_keeps_state() {
        assert_eq!(
            next_state(HeatDecision::Heating, None, 21.0, 0.5),
            HeatDecision::Heating
        );
    }

    #[test]
    fn hold_forces_idle_without_touching_state() {
        let mut state = HeatDecision::Heating;
        let decision = decide(&mut state, Some(Hold::Disabled), Some(18.0), 21.0, 0.5);

        assert_eq!(decision, HeatDecision::Idle);
        assert_eq!(state, HeatDecision::Heating);

        let decision = decide(&mut state, None, Some(20.8), 21.0, 0.5);
        assert_eq!(decision, HeatDecision::Heating);
    }
}
