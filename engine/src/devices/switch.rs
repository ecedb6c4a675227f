use crate::{error::DeviceError, state::DeviceCommand};

use super::{available_state, AreaCommand, DeviceIo};

/// Pumps and relays. Stateless: the reported switch state is the cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchCoordinator;

impl SwitchCoordinator {
    pub fn desired_on(command: &AreaCommand) -> bool {
        if command.force_off {
            return false;
        }
        // Decimal-precision thermostats keep heating after our hysteresis
        // flipped to idle; cutting the pump then starves them.
        command.decision.is_heating() || command.thermostat_heating || !command.shutdown_when_idle
    }

    pub fn apply(
        &mut self,
        entity_id: &str,
        command: &AreaCommand,
        io: &mut DeviceIo,
    ) -> Result<(), DeviceError> {
        let state = available_state(entity_id, io.states)?;
        let want_on = Self::desired_on(command);
        if state.is_on() == want_on {
            return Ok(());
        }

        let switch_command = if want_on {
            DeviceCommand::TurnOn
        } else {
            DeviceCommand::TurnOff
        };
        io.sink.send_command(entity_id, switch_command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        state::{EntityState, StateCache},
        testing::RecordingSink,
        types::HeatDecision,
    };

    const ENTITY: &str = "switch.pump";

    fn command(decision: HeatDecision) -> AreaCommand {
        AreaCommand {
            decision,
            target: 21.0,
            shutdown_when_idle: true,
            thermostat_heating: false,
            force_off: false,
        }
    }

    fn run(state: &str, command: &AreaCommand) -> Vec<DeviceCommand> {
        let mut states = StateCache::new();
        states.update(ENTITY, EntityState::new(state));
        let mut sink = RecordingSink::default();
        let mut io = DeviceIo {
            states: &states,
            sink: &mut sink,
            now_ms: 0,
        };
        SwitchCoordinator.apply(ENTITY, command, &mut io).unwrap();
        sink.commands_for(ENTITY)
    }

    #[test]
    fn turns_on_when_heating() {
        assert_eq!(
            run("off", &command(HeatDecision::Heating)),
            vec![DeviceCommand::TurnOn]
        );
        assert!(run("on", &command(HeatDecision::Heating)).is_empty());
    }

    #[test]
    fn turns_off_on_idle_with_shutdown_policy() {
        assert_eq!(
            run("on", &command(HeatDecision::Idle)),
            vec![DeviceCommand::TurnOff]
        );
    }

    #[test]
    fn stays_on_while_thermostat_still_heats() {
        let mut idle = command(HeatDecision::Idle);
        idle.thermostat_heating = true;
        assert!(run("on", &idle).is_empty());
    }

    #[test]
    fn stays_on_without_shutdown_policy() {
        let mut idle = command(HeatDecision::Idle);
        idle.shutdown_when_idle = false;
        assert!(run("on", &idle).is_empty());
        assert_eq!(run("off", &idle), vec![DeviceCommand::TurnOn]);
    }

    #[test]
    fn force_off_overrides_policy() {
        let mut idle = command(HeatDecision::Heating);
        idle.shutdown_when_idle = false;
        idle.thermostat_heating = true;
        idle.force_off = true;
        assert_eq!(run("on", &idle), vec![DeviceCommand::TurnOff]);
    }
}
