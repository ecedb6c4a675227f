use std::time::Duration;

use rumqttc::{AsyncClient, QoS};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use heating_engine::{command_topic, CommandSink, DeviceCommand, DeviceError, EntityId};

pub const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub entity_id: EntityId,
    pub command: DeviceCommand,
}

/// Engine-facing end of the command queue. Never waits: a full or closed
/// queue is reported back as a device failure for that tick.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Dispatch>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Dispatch>) -> Self {
        Self { tx }
    }
}

impl CommandSink for ChannelSink {
    fn send_command(&mut self, entity_id: &str, command: DeviceCommand) -> Result<(), DeviceError> {
        let dispatch = Dispatch {
            entity_id: entity_id.to_string(),
            command,
        };
        self.tx.try_send(dispatch).map_err(|err| {
            let reason = match err {
                TrySendError::Full(_) => "command queue full",
                TrySendError::Closed(_) => "command dispatcher stopped",
            };
            DeviceError::Rejected {
                device: entity_id.to_string(),
                reason: reason.to_string(),
            }
        })
    }
}

/// Publishes queued commands one by one. Each publish gets its own timeout so
/// a stuck device only costs that much before the next command goes out.
pub fn spawn_dispatcher(mqtt: AsyncClient, mut rx: mpsc::Receiver<Dispatch>, timeout_ms: u64) {
    tokio::spawn(async move {
        let timeout = Duration::from_millis(timeout_ms);
        while let Some(Dispatch { entity_id, command }) = rx.recv().await {
            let payload = match serde_json::to_vec(&command) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("command serialization failed for {entity_id}: {err}");
                    continue;
                }
            };

            let publish = mqtt.publish(command_topic(&entity_id), QoS::AtLeastOnce, false, payload);
            match tokio::time::timeout(timeout, publish).await {
                Ok(Ok(())) => debug!(device = %entity_id, ?command, "command published"),
                Ok(Err(err)) => warn!(device = %entity_id, "command publish failed: {err}"),
                Err(_) => {
                    let err = DeviceError::Timeout {
                        device: entity_id,
                        timeout_ms,
                    };
                    warn!("{err}");
                }
            }
        }
        debug!("command dispatcher stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_queue_is_reported_not_awaited() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = ChannelSink::new(tx);

        assert_eq!(sink.send_command("switch.pump", DeviceCommand::TurnOn), Ok(()));
        assert_eq!(
            sink.send_command("switch.pump", DeviceCommand::TurnOff),
            Err(DeviceError::Rejected {
                device: "switch.pump".to_string(),
                reason: "command queue full".to_string(),
            })
        );

        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.entity_id, "switch.pump");
        assert_eq!(queued.command, DeviceCommand::TurnOn);
    }

    #[test]
    fn closed_queue_is_reported() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let mut sink = ChannelSink::new(tx);
        assert!(matches!(
            sink.send_command("climate.living", DeviceCommand::TurnOff),
            Err(DeviceError::Rejected { .. })
        ));
    }
}
