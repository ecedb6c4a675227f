pub const TOPIC_STATE_PREFIX: &str = "heating/state/";
pub const TOPIC_STATE_WILDCARD: &str = "heating/state/#";
pub const TOPIC_CMND_PREFIX: &str = "heating/cmnd/";

pub const TOPIC_EVENTS: &str = "heating/events";
pub const TOPIC_ENGINE_STATUS: &str = "heating/engine/status";

pub fn state_topic(entity_id: &str) -> String {
    format!("{TOPIC_STATE_PREFIX}{entity_id}")
}

pub fn command_topic(entity_id: &str) -> String {
    format!("{TOPIC_CMND_PREFIX}{entity_id}")
}

/// Entity id addressed by a state topic.
pub fn entity_from_state_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_STATE_PREFIX)
        .filter(|entity| !entity.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_topics_carry_entity_id() {
        let topic = state_topic("sensor.living_temp");
        assert_eq!(topic, "heating/state/sensor.living_temp");
        assert_eq!(entity_from_state_topic(&topic), Some("sensor.living_temp"));
        assert_eq!(entity_from_state_topic("heating/state/"), None);
        assert_eq!(entity_from_state_topic(TOPIC_EVENTS), None);
    }
}
