//! Boiler demand aggregation and the optional advanced control chain
//! (heating curve, PID, OPV ceiling, PWM).

pub mod curve;
pub mod opv;
pub mod pid;
pub mod pwm;

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    config::{AutotuneSettings, CalibrationSettings, EngineConfig},
    error::EngineError,
    state::DeviceCommand,
    types::{AreaId, HeatingType},
};

pub use opv::{CalibrationStep, OpvCalibration};
pub use pid::{AutoTuneStep, PidController, RelayAutoTune};
pub use pwm::{PwmController, PwmOutput};

/// One area's contribution to boiler demand.
#[derive(Debug, Clone, PartialEq)]
pub struct DemandEntry {
    pub area_id: AreaId,
    pub heating: bool,
    pub target: f32,
    pub current: Option<f32>,
    pub heating_type: HeatingType,
    pub curve_coefficient: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoilerDemand {
    pub heating: Vec<(AreaId, f32)>,
    pub max_target: Option<f32>,
    pub any_heating: bool,
    pub curve_flow: Option<f32>,
    pub pid_correction: Option<f32>,
    pub pwm_duty: Option<f32>,
    pub opv_ceiling: Option<f32>,
}

pub fn aggregate(entries: &[DemandEntry]) -> BoilerDemand {
    let heating: Vec<(AreaId, f32)> = entries
        .iter()
        .filter(|entry| entry.heating)
        .map(|entry| (entry.area_id.clone(), entry.target))
        .collect();
    let max_target = heating.iter().map(|(_, target)| *target).reduce(f32::max);

    BoilerDemand {
        any_heating: !heating.is_empty(),
        heating,
        max_target,
        ..BoilerDemand::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoilerCommand {
    pub on: bool,
    pub setpoint: Option<f32>,
}

impl BoilerCommand {
    pub const OFF: Self = Self {
        on: false,
        setpoint: None,
    };

    pub fn device_command(self) -> DeviceCommand {
        DeviceCommand::SetBoiler {
            on: self.on,
            setpoint: self.setpoint,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoilerOutcome {
    Command(BoilerCommand),
    /// OPV calibration owns the boiler.
    Skipped,
}

/// Result of one boiler pass.
#[derive(Debug, Clone, PartialEq)]
pub struct BoilerPass {
    pub demand: BoilerDemand,
    pub command: BoilerCommand,
    pub autotune: Option<AutoTuneStep>,
}

#[derive(Debug, Clone)]
struct SavedControl {
    pid: PidController,
    pid_active: bool,
    pwm: PwmController,
}

#[derive(Debug, Clone)]
struct Calibration {
    run: OpvCalibration,
    saved: SavedControl,
}

pub struct BoilerController {
    pid: PidController,
    pid_active: bool,
    autotune: Option<RelayAutoTune>,
    pwm: PwmController,
    calibration: Option<Calibration>,
    last_command: Option<BoilerCommand>,
    last_demand: BoilerDemand,
}

impl BoilerController {
    pub fn new(config: &EngineConfig) -> Self {
        let advanced = &config.advanced;
        Self {
            pid: PidController::new(
                advanced.pid_gains,
                advanced.pid_output_limit,
                advanced.pid_integral_limit,
            ),
            pid_active: false,
            autotune: None,
            pwm: PwmController::new(advanced.pwm_period_ms),
            calibration: None,
            last_command: None,
            last_demand: BoilerDemand::default(),
        }
    }

    pub fn reconfigure(&mut self, config: &EngineConfig) {
        let advanced = &config.advanced;
        self.pid.configure(
            advanced.pid_gains,
            advanced.pid_output_limit,
            advanced.pid_integral_limit,
        );
        self.pwm.set_period(advanced.pwm_period_ms);
        // The next pass resets the PID when it is switched back on.
        if !advanced.enabled || !advanced.pid {
            self.pid_active = false;
        }
        if !advanced.enabled && self.autotune.take().is_some() {
            info!("pid auto-tune cancelled, advanced control disabled");
        }
    }

    pub fn last_command(&self) -> Option<BoilerCommand> {
        self.last_command
    }

    pub fn last_demand(&self) -> &BoilerDemand {
        &self.last_demand
    }

    /// Records what was actually sent, `None` when the send failed so the
    /// next pass retries.
    pub fn mark_sent(&mut self, command: Option<BoilerCommand>) {
        self.last_command = command;
    }

    pub fn pass(
        &mut self,
        entries: &[DemandEntry],
        outdoor: Option<f32>,
        config: &EngineConfig,
        now_ms: u64,
    ) -> BoilerPass {
        let mut demand = aggregate(entries);
        let mut autotune = self.expire_autotune(now_ms);

        let command = match demand.max_target {
            Some(max_target) if demand.any_heating => {
                let baseline = max_target + config.boiler.margin;
                if config.advanced.enabled {
                    let (command, tuned) =
                        self.advanced(entries, &mut demand, outdoor, config, now_ms);
                    if tuned.is_some() {
                        autotune = tuned;
                    }
                    command
                } else {
                    BoilerCommand {
                        on: true,
                        setpoint: Some(baseline),
                    }
                }
            }
            _ => {
                self.pwm.reset();
                BoilerCommand::OFF
            }
        };

        self.last_demand = demand.clone();
        BoilerPass {
            demand,
            command,
            autotune,
        }
    }

    fn advanced(
        &mut self,
        entries: &[DemandEntry],
        demand: &mut BoilerDemand,
        outdoor: Option<f32>,
        config: &EngineConfig,
        now_ms: u64,
    ) -> (BoilerCommand, Option<AutoTuneStep>) {
        let advanced = &config.advanced;
        let curve = &advanced.curve;
        let heating: Vec<&DemandEntry> = entries.iter().filter(|entry| entry.heating).collect();

        let ceiling = if heating
            .iter()
            .any(|entry| entry.heating_type == HeatingType::Radiator)
        {
            curve.radiator_max_flow
        } else {
            curve.floor_max_flow
        };

        let mut flow = demand
            .max_target
            .map(|target| target + config.boiler.margin)
            .unwrap_or(curve.min_flow);
        if advanced.heating_curve {
            let curve_flow = heating
                .iter()
                .map(|entry| {
                    let coefficient = entry.curve_coefficient.unwrap_or(curve.coefficient);
                    curve::flow_temperature(entry.heating_type, entry.target, outdoor, coefficient, curve)
                })
                .reduce(f32::max);
            if let Some(curve_flow) = curve_flow {
                demand.curve_flow = Some(curve_flow);
                flow = curve_flow;
            }
        }

        let mut tune_result = None;
        // The worst-off room drives the single global loop.
        let worst = heating
            .iter()
            .filter_map(|entry| entry.current.map(|current| (entry.target, current)))
            .max_by(|a, b| (a.0 - a.1).total_cmp(&(b.0 - b.1)));

        if let Some(tune) = self.autotune.as_mut() {
            let step = match worst {
                Some((target, current)) => tune.step(current - target, now_ms),
                None => AutoTuneStep::Relay(0.0),
            };
            match &step {
                AutoTuneStep::Relay(output) => {
                    demand.pid_correction = Some(*output);
                    flow += output;
                }
                AutoTuneStep::Finished(gains) => {
                    info!(kp = gains.kp, ki = gains.ki, kd = gains.kd, "pid auto-tune finished");
                    self.autotune = None;
                    self.pid.configure(*gains, advanced.pid_output_limit, advanced.pid_integral_limit);
                    self.pid.reset();
                }
                AutoTuneStep::Failed(reason) => {
                    info!(%reason, "pid auto-tune failed");
                    self.autotune = None;
                }
            }
            tune_result = Some(step);
        } else if advanced.pid {
            if !self.pid_active {
                self.pid.reset();
                self.pid_active = true;
            }
            if let Some((target, current)) = worst {
                let correction = self.pid.update(target - current, now_ms);
                demand.pid_correction = Some(correction);
                flow += correction;
            }
        } else {
            self.pid_active = false;
        }

        flow = flow.clamp(curve.min_flow, ceiling.max(curve.min_flow));

        if advanced.overshoot_protection {
            if let Some(opv) = advanced.opv {
                demand.opv_ceiling = Some(opv);
                flow = flow.min(opv);
            }
        }

        let on = if advanced.pwm && !config.boiler.modulating {
            let duty = pwm::duty_for(flow, advanced.pwm_min_flow, ceiling);
            let output = self.pwm.update(duty, now_ms);
            demand.pwm_duty = Some(output.duty);
            output.on
        } else {
            true
        };

        debug!(flow, on, "boiler advanced control");
        (
            BoilerCommand {
                on,
                setpoint: Some(flow),
            },
            tune_result,
        )
    }

    pub fn start_autotune(&mut self, settings: &AutotuneSettings, now_ms: u64) -> Result<(), EngineError> {
        if self.autotune.is_some() || self.calibration.is_some() {
            return Err(EngineError::CalibrationInProgress);
        }
        self.autotune = Some(RelayAutoTune::new(0.0, settings, now_ms));
        Ok(())
    }

    /// Ends a running auto-tune whose deadline has passed, whether or not
    /// any area is calling for heat.
    fn expire_autotune(&mut self, now_ms: u64) -> Option<AutoTuneStep> {
        let failure = self
            .autotune
            .as_ref()
            .filter(|tune| tune.timed_out(now_ms))
            .map(RelayAutoTune::timeout_failure)?;
        self.autotune = None;
        info!("pid auto-tune timed out");
        Some(failure)
    }

    /// `false` when no auto-tune was running.
    pub fn abort_autotune(&mut self) -> bool {
        self.autotune.take().is_some()
    }

    pub fn is_autotuning(&self) -> bool {
        self.autotune.is_some()
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibration.is_some()
    }

    pub fn calibration_setpoint(&self) -> Option<f32> {
        self.calibration.as_ref().map(|calibration| calibration.run.setpoint())
    }

    /// Claims the boiler for OPV calibration and returns the first setpoint.
    pub fn start_calibration(
        &mut self,
        settings: &CalibrationSettings,
        now_ms: u64,
    ) -> Result<f32, EngineError> {
        if self.calibration.is_some() {
            return Err(EngineError::CalibrationInProgress);
        }
        let run = OpvCalibration::start(settings, now_ms);
        let setpoint = run.setpoint();
        self.calibration = Some(Calibration {
            run,
            saved: SavedControl {
                pid: self.pid.clone(),
                pid_active: self.pid_active,
                pwm: self.pwm.clone(),
            },
        });
        // Whatever was sent before no longer reflects the boiler.
        self.last_command = None;
        Ok(setpoint)
    }

    /// `None` when no calibration is running.
    pub fn calibration_step(&mut self, measured_flow: Option<f32>, now_ms: u64) -> Option<CalibrationStep> {
        let calibration = self.calibration.as_mut()?;
        let step = calibration.run.step(measured_flow, now_ms);
        if !matches!(step, CalibrationStep::Drive(_)) {
            self.restore();
        }
        Some(step)
    }

    /// Aborts a calibration whose deadline has passed, as the control tick
    /// would if the driving task disappeared.
    pub fn expire_calibration(&mut self, now_ms: u64) -> Option<EngineError> {
        let timed_out = self
            .calibration
            .as_ref()
            .is_some_and(|calibration| calibration.run.timed_out(now_ms));
        if !timed_out {
            return None;
        }
        self.restore();
        Some(EngineError::CalibrationAborted {
            reason: "timed out".to_string(),
        })
    }

    pub fn abort_calibration(&mut self, reason: &str) -> Result<(), EngineError> {
        if self.calibration.is_none() {
            return Err(EngineError::ConfigInvalid("no calibration running".to_string()));
        }
        self.restore();
        info!(%reason, "opv calibration aborted");
        Ok(())
    }

    fn restore(&mut self) {
        if let Some(calibration) = self.calibration.take() {
            self.pid = calibration.saved.pid;
            self.pid_active = calibration.saved.pid_active;
            self.pwm = calibration.saved.pwm;
            self.last_command = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(area: &str, heating: bool, target: f32, current: f32) -> DemandEntry {
        DemandEntry {
            area_id: area.to_string(),
            heating,
            target,
            current: Some(current),
            heating_type: HeatingType::Radiator,
            curve_coefficient: None,
        }
    }

    #[test]
    fn baseline_uses_highest_heating_target() {
        let config = EngineConfig::default();
        let mut boiler = BoilerController::new(&config);
        let pass = boiler.pass(
            &[entry("a", true, 23.0, 20.0), entry("b", false, 19.0, 19.5)],
            None,
            &config,
            0,
        );
        assert_eq!(
            pass.command,
            BoilerCommand {
                on: true,
                setpoint: Some(43.0)
            }
        );
        assert_eq!(pass.demand.heating, vec![("a".to_string(), 23.0)]);
    }

    #[test]
    fn no_heating_area_turns_boiler_off() {
        let config = EngineConfig::default();
        let mut boiler = BoilerController::new(&config);
        let pass = boiler.pass(&[entry("b", false, 19.0, 19.5)], None, &config, 0);
        assert_eq!(pass.command, BoilerCommand::OFF);
        assert!(!pass.demand.any_heating);
    }

    #[test]
    fn curve_takes_hottest_area_and_opv_caps_it() {
        let mut config = EngineConfig::default();
        config.advanced.enabled = true;
        config.advanced.opv = Some(60.0);
        let mut boiler = BoilerController::new(&config);

        let mut floor = entry("floor", true, 21.0, 20.0);
        floor.heating_type = HeatingType::Floor;
        let pass = boiler.pass(&[floor, entry("living", true, 21.0, 20.0)], Some(1.0), &config, 0);

        assert_eq!(pass.demand.curve_flow, Some(75.0));
        assert_eq!(pass.demand.opv_ceiling, Some(60.0));
        assert_eq!(pass.command.setpoint, Some(60.0));
    }

    #[test]
    fn pid_correction_is_added_to_curve() {
        let mut config = EngineConfig::default();
        config.advanced.enabled = true;
        config.advanced.pid = true;
        config.advanced.overshoot_protection = false;
        let mut boiler = BoilerController::new(&config);

        let pass = boiler.pass(&[entry("living", true, 21.0, 20.0)], Some(11.0), &config, 0);
        // curve 65 + kp 3 * error 1
        assert_eq!(pass.demand.pid_correction, Some(3.0));
        assert_eq!(pass.command.setpoint, Some(68.0));
    }

    #[test]
    fn pid_state_survives_a_demand_gap() {
        let mut config = EngineConfig::default();
        config.advanced.enabled = true;
        config.advanced.pid = true;
        config.advanced.pid_integral_limit = 1_000.0;
        let mut boiler = BoilerController::new(&config);
        let heating = [entry("living", true, 21.0, 20.0)];
        let idle = [entry("living", false, 21.0, 21.2)];

        boiler.pass(&heating, Some(11.0), &config, 0);
        boiler.pass(&heating, Some(11.0), &config, 30_000);
        assert_eq!(boiler.pid.integral(), 30.0);

        let gap = boiler.pass(&idle, Some(11.0), &config, 60_000);
        assert_eq!(gap.command, BoilerCommand::OFF);
        assert_eq!(boiler.pid.integral(), 30.0);

        boiler.pass(&heating, Some(11.0), &config, 90_000);
        assert_eq!(boiler.pid.integral(), 90.0);
    }

    #[test]
    fn pid_resets_when_switched_back_on() {
        let mut config = EngineConfig::default();
        config.advanced.enabled = true;
        config.advanced.pid = true;
        let mut boiler = BoilerController::new(&config);
        let heating = [entry("living", true, 21.0, 20.0)];
        boiler.pass(&heating, Some(11.0), &config, 0);
        boiler.pass(&heating, Some(11.0), &config, 30_000);
        assert_eq!(boiler.pid.integral(), 30.0);

        config.advanced.pid = false;
        boiler.reconfigure(&config);
        config.advanced.pid = true;
        boiler.reconfigure(&config);

        boiler.pass(&heating, Some(11.0), &config, 60_000);
        assert_eq!(boiler.pid.integral(), 0.0);
    }

    #[test]
    fn autotune_times_out_without_demand() {
        let mut config = EngineConfig::default();
        config.advanced.enabled = true;
        let mut boiler = BoilerController::new(&config);
        boiler.start_autotune(&config.advanced.autotune, 0).unwrap();

        let pass = boiler.pass(
            &[entry("living", false, 21.0, 21.5)],
            None,
            &config,
            config.advanced.autotune.timeout_ms * 10,
        );
        assert!(matches!(pass.autotune, Some(AutoTuneStep::Failed(_))));
        assert_eq!(pass.command, BoilerCommand::OFF);
        assert!(!boiler.is_autotuning());
    }

    #[test]
    fn disabling_advanced_control_cancels_autotune() {
        let mut config = EngineConfig::default();
        config.advanced.enabled = true;
        let mut boiler = BoilerController::new(&config);
        boiler.start_autotune(&config.advanced.autotune, 0).unwrap();

        config.advanced.enabled = false;
        boiler.reconfigure(&config);
        assert!(!boiler.is_autotuning());
        assert_eq!(boiler.start_autotune(&config.advanced.autotune, 1_000), Ok(()));
    }

    #[test]
    fn abort_autotune_reports_whether_one_was_running() {
        let config = EngineConfig::default();
        let mut boiler = BoilerController::new(&config);
        assert!(!boiler.abort_autotune());
        boiler.start_autotune(&config.advanced.autotune, 0).unwrap();
        assert!(boiler.abort_autotune());
        assert!(!boiler.is_autotuning());
    }

    #[test]
    fn pwm_switches_non_modulating_boiler() {
        let mut config = EngineConfig::default();
        config.advanced.enabled = true;
        config.advanced.pwm = true;
        config.boiler.modulating = false;
        config.advanced.heating_curve = false;
        let mut boiler = BoilerController::new(&config);

        // Baseline 21 + 20 = 41; duty (41 - 25) / (80 - 25).
        let pass = boiler.pass(&[entry("living", true, 21.0, 20.0)], None, &config, 0);
        let duty = pass.demand.pwm_duty.unwrap();
        assert!((duty - 16.0 / 55.0).abs() < 1e-4);
        assert!(pass.command.on);

        let later = boiler.pass(&[entry("living", true, 21.0, 20.0)], None, &config, 600_000);
        assert!(!later.command.on);
    }

    #[test]
    fn second_calibration_is_rejected() {
        let config = EngineConfig::default();
        let mut boiler = BoilerController::new(&config);
        assert_eq!(
            boiler.start_calibration(&config.advanced.calibration, 0),
            Ok(40.0)
        );
        assert_eq!(
            boiler.start_calibration(&config.advanced.calibration, 1_000),
            Err(EngineError::CalibrationInProgress)
        );
    }

    #[test]
    fn calibration_restores_control_state_when_done() {
        let mut config = EngineConfig::default();
        config.advanced.enabled = true;
        config.advanced.pid = true;
        let mut boiler = BoilerController::new(&config);
        boiler.pass(&[entry("living", true, 21.0, 20.0)], Some(11.0), &config, 0);
        boiler.pass(&[entry("living", true, 21.0, 20.0)], Some(11.0), &config, 30_000);
        let integral = boiler.pid.integral();

        boiler.start_calibration(&config.advanced.calibration, 60_000).unwrap();
        assert!(boiler.is_calibrating());
        boiler.pid.reset();

        let step = boiler.calibration_step(Some(50.0), 120_000);
        assert_eq!(step, Some(CalibrationStep::Finished(40.0)));
        assert!(!boiler.is_calibrating());
        assert_eq!(boiler.pid.integral(), integral);
    }

    #[test]
    fn expired_calibration_is_aborted() {
        let config = EngineConfig::default();
        let mut boiler = BoilerController::new(&config);
        boiler.start_calibration(&config.advanced.calibration, 0).unwrap();

        assert_eq!(boiler.expire_calibration(60_000), None);
        assert!(matches!(
            boiler.expire_calibration(config.advanced.calibration.timeout_ms),
            Some(EngineError::CalibrationAborted { .. })
        ));
        assert!(!boiler.is_calibrating());
        assert_eq!(boiler.calibration_step(None, 0), None);
    }

    #[test]
    fn autotune_cannot_start_during_calibration() {
        let config = EngineConfig::default();
        let mut boiler = BoilerController::new(&config);
        boiler.start_calibration(&config.advanced.calibration, 0).unwrap();
        assert_eq!(
            boiler.start_autotune(&config.advanced.autotune, 0),
            Err(EngineError::CalibrationInProgress)
        );
    }
}
