//! Effective target temperature per area.
//!
//! Layers are pure strategies tried in precedence order; the first one that
//! applies wins. Night boost is not a layer of its own: it adds its offset on
//! top of the schedule, presence, preset and base layers. The frost floor is
//! applied last to everything except the safety floor.

use chrono::{DateTime, FixedOffset};
use serde::Serialize;

use crate::{
    area::{Area, WindowAction},
    config::EngineConfig,
    schedule::{minute_of_day, TimeWindow},
    types::TargetSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Home,
    Away,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub now: DateTime<FixedOffset>,
    pub config: &'a EngineConfig,
    pub safety_alarm: bool,
    pub window_open: bool,
    pub presence: Option<Presence>,
    /// Start of the smart night-boost window, as planned by the predictor.
    pub night_boost_start: Option<u16>,
    /// Target of an upcoming schedule entry whose pre-heat has begun.
    pub preheat_target: Option<f32>,
}

impl<'a> ResolveContext<'a> {
    pub fn new(now: DateTime<FixedOffset>, config: &'a EngineConfig) -> Self {
        Self {
            now,
            config,
            safety_alarm: false,
            window_open: false,
            presence: None,
            night_boost_start: None,
            preheat_target: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Resolution {
    pub target: f32,
    pub source: TargetSource,
    pub night_boost: bool,
    #[serde(skip)]
    pub boost_expired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Layer {
    target: f32,
    source: TargetSource,
}

impl Layer {
    fn new(target: f32, source: TargetSource) -> Self {
        Self { target, source }
    }
}

type Strategy = fn(&Area, &ResolveContext) -> Option<Layer>;

const OVERRIDES: [Strategy; 5] = [safety, vacation, manual_override, boost, window];
const PROGRAMS: [Strategy; 3] = [schedule, presence, preset];

fn safety(_area: &Area, ctx: &ResolveContext) -> Option<Layer> {
    ctx.safety_alarm
        .then(|| Layer::new(ctx.config.safety.floor_temperature, TargetSource::Safety))
}

fn vacation(_area: &Area, ctx: &ResolveContext) -> Option<Layer> {
    ctx.config
        .vacation
        .is_active(ctx.now)
        .then(|| Layer::new(ctx.config.vacation.temperature, TargetSource::Vacation))
}

fn manual_override(area: &Area, _ctx: &ResolveContext) -> Option<Layer> {
    area.manual_override
        .map(|frozen| Layer::new(frozen, TargetSource::ManualOverride))
}

fn boost(area: &Area, ctx: &ResolveContext) -> Option<Layer> {
    area.boost
        .filter(|boost| ctx.now < boost.until)
        .map(|boost| Layer::new(boost.temperature, TargetSource::Boost))
}

fn window(area: &Area, ctx: &ResolveContext) -> Option<Layer> {
    if !ctx.window_open {
        return None;
    }
    match area.window.action {
        WindowAction::None => None,
        WindowAction::ReduceTemperature => Some(Layer::new(
            area.target_temperature - area.window.temperature_drop,
            TargetSource::Window,
        )),
        WindowAction::TurnOff => Some(Layer::new(
            ctx.config.frost_protection.temperature,
            TargetSource::Window,
        )),
    }
}

fn schedule(area: &Area, ctx: &ResolveContext) -> Option<Layer> {
    match area.schedule.active_entry(ctx.now) {
        Some(entry) => entry
            .temperature
            .or_else(|| {
                entry
                    .preset
                    .and_then(|preset| area.preset_temperature(preset, ctx.config))
            })
            .map(|target| Layer::new(target, TargetSource::Schedule)),
        None => ctx
            .preheat_target
            .map(|target| Layer::new(target, TargetSource::Schedule)),
    }
}

fn presence(area: &Area, ctx: &ResolveContext) -> Option<Layer> {
    let preset = match ctx.presence? {
        Presence::Away => area.presence.away_preset,
        Presence::Home => area.presence.home_preset,
    }?;
    area.preset_temperature(preset, ctx.config)
        .map(|target| Layer::new(target, TargetSource::Presence))
}

fn preset(area: &Area, ctx: &ResolveContext) -> Option<Layer> {
    let preset = area.preset_mode?;
    area.preset_temperature(preset, ctx.config)
        .map(|target| Layer::new(target, TargetSource::Preset))
}

/// Effective night-boost window, or `None` when night boost is off.
pub fn night_boost_window(area: &Area, ctx: &ResolveContext) -> Option<TimeWindow> {
    let night_boost = &area.night_boost;
    if !night_boost.enabled {
        return None;
    }
    let window = match &night_boost.smart {
        Some(smart) => TimeWindow::new(
            ctx.night_boost_start
                .unwrap_or(night_boost.window.start_minutes),
            smart.wake_minutes,
        ),
        None => night_boost.window,
    };
    window.is_valid().then_some(window)
}

pub fn night_boost_active(area: &Area, ctx: &ResolveContext) -> bool {
    night_boost_window(area, ctx)
        .map(|window| window.contains(minute_of_day(ctx.now)))
        .unwrap_or(false)
}

fn frost_floor(ctx: &ResolveContext) -> Option<f32> {
    let config = ctx.config;
    if config.vacation.is_active(ctx.now) {
        Some(config.vacation.frost_protection)
    } else if config.frost_protection.enabled {
        Some(config.frost_protection.temperature)
    } else {
        None
    }
}

/// Clears an expired boost, then resolves the area's target for this tick.
pub fn resolve(area: &mut Area, ctx: &ResolveContext) -> Resolution {
    let mut boost_expired = false;
    if area.boost.map(|boost| ctx.now >= boost.until).unwrap_or(false) {
        area.boost = None;
        boost_expired = true;
    }

    let mut resolution = resolve_layers(area, ctx);
    resolution.boost_expired = boost_expired;
    resolution
}

fn resolve_layers(area: &Area, ctx: &ResolveContext) -> Resolution {
    if let Some(layer) = OVERRIDES.iter().find_map(|strategy| strategy(area, ctx)) {
        return finish(layer, false, ctx);
    }

    let layer = PROGRAMS
        .iter()
        .find_map(|strategy| strategy(area, ctx))
        .unwrap_or_else(|| Layer::new(area.target_temperature, TargetSource::Base));

    if night_boost_active(area, ctx) {
        let boosted = Layer::new(layer.target + area.night_boost.offset, layer.source);
        finish(boosted, true, ctx)
    } else {
        finish(layer, false, ctx)
    }
}

fn finish(layer: Layer, night_boost: bool, ctx: &ResolveContext) -> Resolution {
    let target = match (layer.source, frost_floor(ctx)) {
        (TargetSource::Safety, _) | (_, None) => layer.target,
        (_, Some(floor)) => layer.target.max(floor),
    };
    Resolution {
        target,
        source: layer.source,
        night_boost,
        boost_expired: false,
    }
}
