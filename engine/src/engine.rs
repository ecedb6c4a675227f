//! The engine owns every area plus the shared controllers and runs the two
//! periodic passes: the control tick (aggregate, resolve, decide, drive
//! devices, then the boiler) and the schedule tick (pre-heat planning).

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, FixedOffset, TimeZone};
use tracing::{debug, info, warn};

use crate::{
    aggregate::aggregate,
    area::{Area, Boost, WindowAction},
    boiler::{AutoTuneStep, BoilerController, BoilerOutcome, CalibrationStep, DemandEntry},
    config::{
        validate_hysteresis, validate_target, AdvancedControlConfig, EngineConfig, VacationConfig,
    },
    devices::{AreaCommand, Coordinators, DeviceIo, ThermostatCoordinator},
    error::EngineError,
    events::{EngineEvent, TickReport},
    hysteresis::{self, Hold},
    learning::{HeatingSample, LearningOutcome, LearningStats, Predictor},
    resolver::{self, Presence, ResolveContext},
    safety::SafetyMonitor,
    schedule::{minute_of_day, TimeWindow},
    state::{CommandSink, DeviceCommand, StateProvider},
    types::{
        AreaId, AreaStatus, BoilerStatus, DeviceKind, EngineStatus, EntityId, HeatDecision,
        PresetMode, TargetSource, TickTime,
    },
};

#[derive(Debug, Clone, Copy, Default)]
struct AreaRuntime {
    target: Option<f32>,
    source: Option<TargetSource>,
    decision: HeatDecision,
    night_boost: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreheatPlan {
    pub start: DateTime<FixedOffset>,
    pub deadline: DateTime<FixedOffset>,
    pub target: f32,
}

impl PreheatPlan {
    fn is_due(&self, now: DateTime<FixedOffset>) -> bool {
        self.start <= now && now < self.deadline
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct AreaPlan {
    night_boost_start: Option<u16>,
    preheat: Option<PreheatPlan>,
}

struct TickInputs<'a> {
    now: TickTime,
    states: &'a dyn StateProvider,
    safety_alarm: bool,
    presence: Option<Presence>,
    outdoor: Option<f32>,
}

pub struct HeatingEngine {
    config: EngineConfig,
    areas: BTreeMap<AreaId, Area>,
    runtime: HashMap<AreaId, AreaRuntime>,
    plans: HashMap<AreaId, AreaPlan>,
    coordinators: Coordinators,
    boiler: BoilerController,
    predictor: Predictor,
    safety: SafetyMonitor,
}

fn read_celsius(entity_id: Option<&str>, states: &dyn StateProvider) -> Option<f32> {
    states.get_current_state(entity_id?)?.celsius()
}

/// Anyone home when any reporting sensor is on; `None` when nothing reports.
fn presence_of(sensors: &[EntityId], states: &dyn StateProvider) -> Option<Presence> {
    let readings: Vec<bool> = sensors
        .iter()
        .filter_map(|sensor| states.get_current_state(sensor))
        .filter(|state| state.is_available())
        .map(|state| state.is_on())
        .collect();
    if readings.is_empty() {
        None
    } else if readings.contains(&true) {
        Some(Presence::Home)
    } else {
        Some(Presence::Away)
    }
}

/// Next wall-clock time at `minute` past midnight, strictly after `now`.
fn next_occurrence(now: DateTime<FixedOffset>, minute: u16) -> Option<DateTime<FixedOffset>> {
    let naive = now
        .date_naive()
        .and_hms_opt(u32::from(minute / 60), u32::from(minute % 60), 0)?;
    let today = now.offset().from_local_datetime(&naive).single()?;
    Some(if today > now { today } else { today + Duration::days(1) })
}

impl HeatingEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            coordinators: Coordinators::new(&config),
            boiler: BoilerController::new(&config),
            predictor: Predictor::new(&config.learning),
            safety: SafetyMonitor::default(),
            areas: BTreeMap::new(),
            runtime: HashMap::new(),
            plans: HashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn area(&self, id: &str) -> Option<&Area> {
        self.areas.get(id)
    }

    pub fn areas(&self) -> impl Iterator<Item = &Area> {
        self.areas.values()
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    pub fn is_safety_alarm(&self) -> bool {
        self.safety.is_active()
    }

    pub fn is_calibrating(&self) -> bool {
        self.boiler.is_calibrating()
    }

    pub fn preheat_plan(&self, id: &str) -> Option<PreheatPlan> {
        self.plans.get(id).and_then(|plan| plan.preheat)
    }

    pub fn night_boost_start(&self, id: &str) -> Option<u16> {
        self.plans.get(id).and_then(|plan| plan.night_boost_start)
    }

    fn area_mut(&mut self, id: &str) -> Result<&mut Area, EngineError> {
        self.areas
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownArea(id.to_string()))
    }

    // ---- control tick ----

    pub fn control_tick(
        &mut self,
        now: TickTime,
        states: &dyn StateProvider,
        sink: &mut dyn CommandSink,
    ) -> TickReport {
        let mut report = TickReport::default();

        if let Some(sensor) = self.safety.evaluate(&self.config.safety.sensors, states) {
            report.push(EngineEvent::SafetyAlert { sensor });
        }

        let inputs = TickInputs {
            now,
            states,
            safety_alarm: self.safety.is_active(),
            presence: presence_of(&self.config.presence_sensors, states),
            outdoor: read_celsius(self.config.outdoor_sensor.as_deref(), states),
        };

        let ids: Vec<AreaId> = self.areas.keys().cloned().collect();
        let mut demand = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(entry) = self.tick_area(id, &inputs, sink, &mut report) {
                demand.push(entry);
            }
        }

        // Every area has been decided before the boiler sees the demand.
        self.boiler_pass(&demand, inputs.outdoor, now, sink, &mut report);
        report
    }

    fn tick_area(
        &mut self,
        id: &str,
        inputs: &TickInputs,
        sink: &mut dyn CommandSink,
        report: &mut TickReport,
    ) -> Option<DemandEntry> {
        let Self {
            config,
            areas,
            runtime,
            plans,
            coordinators,
            predictor,
            ..
        } = self;
        let config: &EngineConfig = config;
        let area = areas.get_mut(id)?;
        let now = inputs.now;

        if let Some(current) = aggregate(area, inputs.states, config) {
            area.current_temperature = Some(current);
            area.record_temperature(now.wall, current, config.history_len);
        }

        if area.enabled && area.manual_override.is_none() && !inputs.safety_alarm {
            let detected = area
                .devices_of(DeviceKind::Thermostat)
                .find_map(|device| {
                    coordinators
                        .thermostat
                        .detect_override(&device.entity_id, inputs.states, now.mono_ms)
                        .map(|temperature| (device.entity_id.clone(), temperature))
                });
            if let Some((device, temperature)) = detected {
                info!(area = %area.id, %device, temperature, "manual override detected");
                area.manual_override = Some(temperature);
                report.push(EngineEvent::ManualOverrideDetected {
                    area: area.id.clone(),
                    device,
                    temperature,
                });
            }
        }

        let window_open = area.window.action != WindowAction::None
            && area.window.sensors.iter().any(|sensor| {
                inputs
                    .states
                    .get_current_state(sensor)
                    .is_some_and(|state| state.is_available() && state.is_on())
            });
        let presence = if area.presence.use_global || area.presence.sensors.is_empty() {
            inputs.presence
        } else {
            presence_of(&area.presence.sensors, inputs.states)
        };
        let plan = plans.get(id).copied().unwrap_or_default();

        let mut ctx = ResolveContext::new(now.wall, config);
        ctx.safety_alarm = inputs.safety_alarm;
        ctx.window_open = window_open;
        ctx.presence = presence;
        ctx.night_boost_start = plan.night_boost_start;
        ctx.preheat_target = plan
            .preheat
            .filter(|preheat| preheat.is_due(now.wall))
            .map(|preheat| preheat.target);

        let resolution = resolver::resolve(area, &ctx);
        if resolution.boost_expired {
            info!(area = %area.id, "boost expired");
            report.push(EngineEvent::BoostExpired {
                area: area.id.clone(),
            });
        }

        let previous = runtime.get(id).copied().unwrap_or_default();
        let target_changed = previous
            .target
            .map_or(true, |target| (target - resolution.target).abs() > 0.01)
            || previous.source != Some(resolution.source)
            || previous.night_boost != resolution.night_boost;
        if target_changed {
            debug!(
                area = %area.id,
                target = resolution.target,
                source = resolution.source.as_str(),
                "effective target"
            );
            report.push(EngineEvent::TargetChanged {
                area: area.id.clone(),
                target: resolution.target,
                source: resolution.source,
                night_boost: resolution.night_boost,
            });
        }

        let hold = if !area.enabled {
            Some(Hold::Disabled)
        } else if inputs.safety_alarm {
            Some(Hold::Safety)
        } else if area.manual_override.is_some() {
            Some(Hold::ManualOverride)
        } else {
            None
        };
        let band = area.hysteresis_or(config.hysteresis);
        let decision = hysteresis::decide(
            &mut area.heating_state,
            hold,
            area.current_temperature,
            resolution.target,
            band,
        );
        if decision != previous.decision {
            info!(
                area = %area.id,
                decision = decision.as_str(),
                current = ?area.current_temperature,
                target = resolution.target,
                "heating decision changed"
            );
            report.push(EngineEvent::DecisionChanged {
                area: area.id.clone(),
                decision,
                current: area.current_temperature,
                target: resolution.target,
            });
        }

        if hold.is_some() {
            if predictor.discard(id) {
                debug!(area = %area.id, ?hold, "heating event discarded");
            }
        } else if let Some(LearningOutcome::Recorded(sample)) = predictor.observe(
            id,
            previous.decision,
            decision,
            area.current_temperature,
            resolution.target,
            inputs.outdoor,
            now.wall,
        ) {
            report.push(EngineEvent::HeatingSampleRecorded {
                area: area.id.clone(),
                minutes: sample.duration_minutes,
                rate_per_hour: sample.rate_per_minute() * 60.0,
            });
        }

        if area.enabled {
            let thermostat_heating = area
                .devices_of(DeviceKind::Thermostat)
                .any(|device| ThermostatCoordinator::is_heating(&device.entity_id, inputs.states));
            let command = AreaCommand {
                decision,
                target: resolution.target,
                shutdown_when_idle: area.shutdown_switches_when_idle,
                thermostat_heating,
                force_off: inputs.safety_alarm,
            };
            let frozen = area.manual_override.is_some() && !inputs.safety_alarm;

            let mut io = DeviceIo {
                states: inputs.states,
                sink,
                now_ms: now.mono_ms,
            };
            for device in &area.devices {
                if frozen && device.kind == DeviceKind::Thermostat {
                    continue;
                }
                if let Err(source) = coordinators.apply(device, &command, &mut io) {
                    warn!(
                        area = %area.id,
                        device = %device.entity_id,
                        decision = decision.as_str(),
                        error = %source,
                        "device command failed"
                    );
                    report.push(EngineEvent::DeviceCommandFailed {
                        area: Some(area.id.clone()),
                        device: device.entity_id.clone(),
                        decision: Some(decision),
                        error: source.to_string(),
                    });
                    report.failures.push(EngineError::DeviceCommandFailed {
                        area: area.id.clone(),
                        device: device.entity_id.clone(),
                        decision,
                        source,
                    });
                }
            }
        }

        runtime.insert(
            id.to_string(),
            AreaRuntime {
                target: Some(resolution.target),
                source: Some(resolution.source),
                decision,
                night_boost: resolution.night_boost,
            },
        );

        Some(DemandEntry {
            area_id: area.id.clone(),
            heating: decision.is_heating(),
            target: resolution.target,
            current: area.current_temperature,
            heating_type: area.heating_type,
            curve_coefficient: area.heating_curve_coefficient,
        })
    }

    fn boiler_pass(
        &mut self,
        demand: &[DemandEntry],
        outdoor: Option<f32>,
        now: TickTime,
        sink: &mut dyn CommandSink,
        report: &mut TickReport,
    ) {
        if let Some(err) = self.boiler.expire_calibration(now.mono_ms) {
            warn!(%err, "opv calibration expired, control restored");
            if let EngineError::CalibrationAborted { reason } = &err {
                report.push(EngineEvent::CalibrationAborted {
                    reason: reason.clone(),
                });
            }
            report.failures.push(err);
        }

        if self.boiler.is_calibrating() {
            debug!("boiler pass skipped during calibration");
            report.boiler = Some(BoilerOutcome::Skipped);
            return;
        }

        let pass = self.boiler.pass(demand, outdoor, &self.config, now.mono_ms);
        match pass.autotune {
            Some(AutoTuneStep::Finished(gains)) => {
                self.config.advanced.pid_gains = gains;
                report.push(EngineEvent::AutoTuneFinished {
                    kp: gains.kp,
                    ki: gains.ki,
                    kd: gains.kd,
                });
            }
            Some(AutoTuneStep::Failed(reason)) => {
                report.push(EngineEvent::AutoTuneFailed { reason });
            }
            _ => {}
        }

        if let Some(entity) = self.config.boiler.entity.clone() {
            if self.boiler.last_command() != Some(pass.command) {
                match sink.send_command(&entity, pass.command.device_command()) {
                    Ok(()) => {
                        info!(on = pass.command.on, setpoint = ?pass.command.setpoint, "boiler command");
                        self.boiler.mark_sent(Some(pass.command));
                    }
                    Err(err) => {
                        warn!(device = %entity, error = %err, "boiler command failed");
                        self.boiler.mark_sent(None);
                        report.push(EngineEvent::DeviceCommandFailed {
                            area: None,
                            device: entity,
                            decision: None,
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        report.boiler = Some(BoilerOutcome::Command(pass.command));
    }

    // ---- schedule tick ----

    pub fn schedule_tick(&mut self, now: TickTime, states: &dyn StateProvider) -> TickReport {
        let mut report = TickReport::default();
        let outdoor = read_celsius(self.config.outdoor_sensor.as_deref(), states);

        let Self {
            config,
            areas,
            plans,
            predictor,
            ..
        } = self;

        for area in areas.values() {
            let previous = plans.get(&area.id).copied().unwrap_or_default();
            let plan = AreaPlan {
                night_boost_start: plan_night_boost(area, now.wall, states, outdoor, predictor, &previous),
                preheat: plan_preheat(area, now.wall, outdoor, config, predictor),
            };

            if let Some(preheat) = plan.preheat {
                let is_new = previous.preheat.map_or(true, |old| {
                    old.deadline != preheat.deadline || (old.target - preheat.target).abs() > 0.01
                });
                if is_new {
                    info!(area = %area.id, start = %preheat.start, deadline = %preheat.deadline, "pre-heat planned");
                    report.push(EngineEvent::PreheatPlanned {
                        area: area.id.clone(),
                        start_epoch: preheat.start.timestamp(),
                        deadline_epoch: preheat.deadline.timestamp(),
                        target: preheat.target,
                    });
                }
            }
            plans.insert(area.id.clone(), plan);
        }
        plans.retain(|id, _| areas.contains_key(id));

        report
    }

    // ---- configuration boundary ----

    /// Adds or replaces an area. Engine-owned runtime fields of an existing
    /// area survive the replacement.
    pub fn upsert_area(&mut self, mut area: Area) -> Result<(), EngineError> {
        area.validate()?;
        area.schedule.normalize();

        if let Some(existing) = self.areas.remove(&area.id) {
            area.current_temperature = existing.current_temperature;
            area.heating_state = existing.heating_state;
            area.temperature_history = existing.temperature_history;
            for device in &existing.devices {
                if !area.devices.contains(device) {
                    self.coordinators.forget(&device.entity_id);
                }
            }
        }

        info!(area = %area.id, devices = area.devices.len(), "area configured");
        self.areas.insert(area.id.clone(), area);
        Ok(())
    }

    pub fn remove_area(&mut self, id: &str) -> Result<Area, EngineError> {
        let area = self
            .areas
            .remove(id)
            .ok_or_else(|| EngineError::UnknownArea(id.to_string()))?;
        for device in &area.devices {
            self.coordinators.forget(&device.entity_id);
        }
        self.predictor.forget_area(id);
        self.runtime.remove(id);
        self.plans.remove(id);
        info!(area = %id, "area removed");
        Ok(area)
    }

    pub fn set_global_hysteresis(&mut self, hysteresis: f32) -> Result<(), EngineError> {
        validate_hysteresis(hysteresis)?;
        self.config.hysteresis = hysteresis;
        Ok(())
    }

    pub fn set_area_hysteresis(&mut self, id: &str, hysteresis: Option<f32>) -> Result<(), EngineError> {
        if let Some(value) = hysteresis {
            validate_hysteresis(value)?;
        }
        self.area_mut(id)?.hysteresis = hysteresis;
        Ok(())
    }

    pub fn set_area_target(&mut self, id: &str, target: f32) -> Result<(), EngineError> {
        validate_target("target temperature", target)?;
        self.area_mut(id)?.target_temperature = target;
        Ok(())
    }

    pub fn set_area_enabled(&mut self, id: &str, enabled: bool) -> Result<(), EngineError> {
        self.area_mut(id)?.enabled = enabled;
        if !enabled {
            self.predictor.discard(id);
        }
        Ok(())
    }

    pub fn set_preset_mode(&mut self, id: &str, preset: Option<PresetMode>) -> Result<(), EngineError> {
        self.area_mut(id)?.preset_mode = preset;
        Ok(())
    }

    pub fn set_boost(
        &mut self,
        id: &str,
        temperature: f32,
        duration_minutes: i64,
        now: DateTime<FixedOffset>,
    ) -> Result<(), EngineError> {
        validate_target("boost temperature", temperature)?;
        if duration_minutes <= 0 {
            return Err(EngineError::ConfigInvalid(format!(
                "boost duration {duration_minutes} min must be positive"
            )));
        }
        self.area_mut(id)?.boost = Some(Boost {
            temperature,
            until: now + Duration::minutes(duration_minutes),
        });
        Ok(())
    }

    pub fn cancel_boost(&mut self, id: &str) -> Result<bool, EngineError> {
        Ok(self.area_mut(id)?.boost.take().is_some())
    }

    /// Releases the frozen target; the next tick writes the resolved target
    /// to the area's thermostats again.
    pub fn clear_manual_override(&mut self, id: &str) -> Result<bool, EngineError> {
        let area = self
            .areas
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownArea(id.to_string()))?;
        let had_override = area.manual_override.take().is_some();
        for device in area.devices_of(DeviceKind::Thermostat) {
            self.coordinators.thermostat.forget(&device.entity_id);
        }
        Ok(had_override)
    }

    pub fn set_vacation(&mut self, vacation: VacationConfig) -> Result<(), EngineError> {
        validate_target("vacation temperature", vacation.temperature)?;
        validate_target("vacation frost protection", vacation.frost_protection)?;
        self.config.vacation = vacation;
        Ok(())
    }

    pub fn clear_safety_alarm(&mut self) -> Option<EngineEvent> {
        if self.safety.clear() {
            info!("safety alarm cleared");
            Some(EngineEvent::SafetyCleared)
        } else {
            None
        }
    }

    pub fn set_advanced_control(&mut self, advanced: AdvancedControlConfig) -> Result<(), EngineError> {
        let mut config = self.config.clone();
        config.advanced = advanced;
        self.update_config(config)
    }

    /// Replaces the whole configuration after validating it.
    pub fn update_config(&mut self, config: EngineConfig) -> Result<(), EngineError> {
        config.validate()?;
        self.coordinators.reconfigure(&config);
        self.boiler.reconfigure(&config);
        self.predictor.reconfigure(&config.learning);
        self.config = config;
        Ok(())
    }

    pub fn import_samples(&mut self, samples: Vec<HeatingSample>) -> usize {
        self.predictor.import(samples)
    }

    pub fn export_samples(&self) -> Vec<HeatingSample> {
        self.predictor.export()
    }

    pub fn learning_stats(&self) -> Vec<LearningStats> {
        self.predictor.stats()
    }

    // ---- boiler calibration and tuning ----

    pub fn start_calibration(
        &mut self,
        now: TickTime,
        sink: &mut dyn CommandSink,
    ) -> Result<f32, EngineError> {
        let entity = self
            .config
            .boiler
            .entity
            .clone()
            .ok_or_else(|| EngineError::ConfigInvalid("no boiler entity configured".to_string()))?;
        if self.config.boiler.flow_sensor.is_none() {
            return Err(EngineError::ConfigInvalid(
                "calibration needs a flow temperature sensor".to_string(),
            ));
        }

        let setpoint = self
            .boiler
            .start_calibration(&self.config.advanced.calibration, now.mono_ms)?;
        info!(setpoint, "opv calibration started");
        drive_boiler(sink, &entity, setpoint);
        Ok(setpoint)
    }

    /// Advances a running calibration; `None` when none is running.
    pub fn calibration_tick(
        &mut self,
        now: TickTime,
        states: &dyn StateProvider,
        sink: &mut dyn CommandSink,
    ) -> Option<TickReport> {
        let measured = read_celsius(self.config.boiler.flow_sensor.as_deref(), states);
        let step = self.boiler.calibration_step(measured, now.mono_ms)?;

        let mut report = TickReport::default();
        match step {
            CalibrationStep::Drive(setpoint) => {
                if let Some(entity) = self.config.boiler.entity.clone() {
                    drive_boiler(sink, &entity, setpoint);
                }
            }
            CalibrationStep::Finished(opv) => {
                info!(opv, "opv calibration finished");
                self.config.advanced.opv = Some(opv);
                report.push(EngineEvent::CalibrationFinished { opv });
            }
            CalibrationStep::Aborted(reason) => {
                warn!(%reason, "opv calibration aborted");
                report.failures.push(EngineError::CalibrationAborted {
                    reason: reason.clone(),
                });
                report.push(EngineEvent::CalibrationAborted { reason });
            }
        }
        Some(report)
    }

    pub fn abort_calibration(&mut self, reason: &str) -> Result<EngineEvent, EngineError> {
        self.boiler.abort_calibration(reason)?;
        Ok(EngineEvent::CalibrationAborted {
            reason: reason.to_string(),
        })
    }

    pub fn start_pid_autotune(&mut self, now: TickTime) -> Result<(), EngineError> {
        let advanced = &self.config.advanced;
        if !advanced.enabled {
            return Err(EngineError::ConfigInvalid(
                "advanced control is disabled".to_string(),
            ));
        }
        self.boiler.start_autotune(&advanced.autotune, now.mono_ms)?;
        info!("pid auto-tune started");
        Ok(())
    }

    pub fn abort_pid_autotune(&mut self, reason: &str) -> Result<EngineEvent, EngineError> {
        if !self.boiler.abort_autotune() {
            return Err(EngineError::ConfigInvalid("no auto-tune running".to_string()));
        }
        info!(%reason, "pid auto-tune aborted");
        Ok(EngineEvent::AutoTuneFailed {
            reason: reason.to_string(),
        })
    }

    pub fn is_autotuning(&self) -> bool {
        self.boiler.is_autotuning()
    }

    // ---- status ----

    pub fn status(&self, now: DateTime<FixedOffset>) -> EngineStatus {
        let areas = self
            .areas
            .values()
            .map(|area| {
                let runtime = self.runtime.get(&area.id).copied().unwrap_or_default();
                AreaStatus {
                    id: area.id.clone(),
                    name: area.name.clone(),
                    enabled: area.enabled,
                    hidden: area.hidden,
                    heating_type: area.heating_type.as_str(),
                    current_temperature: area.current_temperature,
                    base_target: area.target_temperature,
                    effective_target: runtime.target,
                    target_source: runtime.source.map(TargetSource::as_str),
                    night_boost_active: runtime.night_boost,
                    state: area.heating_state.as_str(),
                    decision: runtime.decision.as_str(),
                    manual_override: area.manual_override,
                    boost_until_epoch: area
                        .boost
                        .filter(|boost| now < boost.until)
                        .map(|boost| boost.until.timestamp()),
                    learning_samples: self.predictor.sample_count(&area.id),
                }
            })
            .collect();

        let last = self.boiler.last_command();
        EngineStatus {
            safety_alarm: self.safety.is_active(),
            safety_triggered_by: self.safety.triggered_by().map(str::to_string),
            vacation: self.config.vacation.is_active(now),
            hysteresis: self.config.hysteresis,
            advanced_control: self.config.advanced.enabled,
            boiler: BoilerStatus {
                on: last.is_some_and(|command| command.on),
                setpoint: self
                    .boiler
                    .calibration_setpoint()
                    .or_else(|| last.and_then(|command| command.setpoint)),
                duty: self.boiler.last_demand().pwm_duty,
                calibrating: self.boiler.is_calibrating(),
                opv: self.config.advanced.opv,
            },
            areas,
        }
    }
}

fn drive_boiler(sink: &mut dyn CommandSink, entity: &str, setpoint: f32) {
    let command = DeviceCommand::SetBoiler {
        on: true,
        setpoint: Some(setpoint),
    };
    if let Err(err) = sink.send_command(entity, command) {
        warn!(device = %entity, error = %err, "calibration setpoint not sent");
    }
}

/// Smart night boost starts as late as the predicted warm-up allows. Once
/// the window has opened it is kept until the wake time.
fn plan_night_boost(
    area: &Area,
    now: DateTime<FixedOffset>,
    states: &dyn StateProvider,
    outdoor: Option<f32>,
    predictor: &Predictor,
    previous: &AreaPlan,
) -> Option<u16> {
    let night_boost = &area.night_boost;
    let smart = night_boost.smart.as_ref().filter(|_| night_boost.enabled)?;

    if let Some(start) = previous.night_boost_start {
        let window = TimeWindow::new(start, smart.wake_minutes);
        if window.is_valid() && window.contains(minute_of_day(now)) {
            return Some(start);
        }
    }

    let current = area.current_temperature?;
    let wake = next_occurrence(now, smart.wake_minutes)?;
    let outdoor = read_celsius(smart.weather_sensor.as_deref(), states).or(outdoor);
    let target = area.target_temperature + night_boost.offset;
    let start = predictor.preheat_start(&area.id, wake, current, target, outdoor);
    Some(minute_of_day(start))
}

fn plan_preheat(
    area: &Area,
    now: DateTime<FixedOffset>,
    outdoor: Option<f32>,
    config: &EngineConfig,
    predictor: &Predictor,
) -> Option<PreheatPlan> {
    if !area.smart_preheat || !area.enabled {
        return None;
    }
    let current = area.current_temperature?;
    let (deadline, entry) = area.schedule.next_start(now)?;
    let target = entry.temperature.or_else(|| {
        entry
            .preset
            .and_then(|preset| area.preset_temperature(preset, config))
    })?;
    if target <= current {
        return None;
    }

    let start = predictor.preheat_start(&area.id, deadline, current, target, outdoor);
    Some(PreheatPlan {
        start,
        deadline,
        target,
    })
}
