pub const TOPIC_PREFIX: &str = "humidifier";

pub const TOPIC_CMD_SUBSCRIPTION: &str = "humidifier/+/cmd/+";
pub const TOPIC_SENSOR_SUBSCRIPTION: &str = "humidifier/+/sensor/humidity";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTopic {
    CmdActive,
    CmdTarget,
    SensorHumidity,
}

pub fn state_topic(device_id: &str) -> String {
    format!("{TOPIC_PREFIX}/{device_id}/state")
}

// humidifier/{device}/cmd/{active|target} or humidifier/{device}/sensor/humidity
pub fn parse_device_topic(topic: &str) -> Option<(&str, DeviceTopic)> {
    let mut parts = topic.split('/');
    if parts.next()? != TOPIC_PREFIX {
        return None;
    }
    let device_id = parts.next().filter(|id| !id.is_empty())?;
    let kind = match (parts.next()?, parts.next()?) {
        ("cmd", "active") => DeviceTopic::CmdActive,
        ("cmd", "target") => DeviceTopic::CmdTarget,
        ("sensor", "humidity") => DeviceTopic::SensorHumidity,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((device_id, kind))
}
