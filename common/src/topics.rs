pub const TOPIC_SCHEDULE_ACTIVE: &str = "schedule/active";
pub const TOPIC_MODE_SET: &str = "mode/set";
pub const TOPIC_CONFIG_GET: &str = "config/get";
pub const TOPIC_CONFIG_UPDATE: &str = "config/update";

pub const TOPIC_CONFIG_FULL: &str = "config/full";
pub const TOPIC_CONFIG_STATUS: &str = "config/status";
pub const TOPIC_MODE: &str = "mode";

pub const INBOUND_TOPICS: [&str; 4] = [
    TOPIC_SCHEDULE_ACTIVE,
    TOPIC_MODE_SET,
    TOPIC_CONFIG_GET,
    TOPIC_CONFIG_UPDATE,
];

/// Payload published on [`TOPIC_MODE`] when no mode is selected.
pub const NO_MODE: &str = "None";

pub fn sensor_topic(sensor: &str, field: &str) -> String {
    format!("sensor/{sensor}/{field}")
}

pub fn actuator_state_topic(actuator: &str) -> String {
    format!("actuator/{actuator}/state")
}
