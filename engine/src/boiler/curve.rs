use crate::{config::CurveSettings, types::HeatingType};

pub fn baseline(heating_type: HeatingType, settings: &CurveSettings) -> f32 {
    match heating_type {
        HeatingType::Radiator => settings.radiator_baseline,
        HeatingType::Floor => settings.floor_baseline,
    }
}

pub fn slope(heating_type: HeatingType, settings: &CurveSettings) -> f32 {
    match heating_type {
        HeatingType::Radiator => 1.0,
        HeatingType::Floor => settings.floor_slope_factor,
    }
}

pub fn max_flow(heating_type: HeatingType, settings: &CurveSettings) -> f32 {
    match heating_type {
        HeatingType::Radiator => settings.radiator_max_flow,
        HeatingType::Floor => settings.floor_max_flow,
    }
}

/// Flow temperature needed to hold `target` against `outdoor`. Without an
/// outdoor reading the curve degenerates to its baseline.
pub fn flow_temperature(
    heating_type: HeatingType,
    target: f32,
    outdoor: Option<f32>,
    coefficient: f32,
    settings: &CurveSettings,
) -> f32 {
    let base = baseline(heating_type, settings);
    let flow = match outdoor {
        Some(outdoor) => base + coefficient * slope(heating_type, settings) * (target - outdoor),
        None => base,
    };
    flow.clamp(settings.min_flow, max_flow(heating_type, settings).max(settings.min_flow))
}
