/// Event type carried by every device-detected event
pub const DEVICE_DETECTED_EVENT_TYPE: &str = "device.detected";

/// Default MQTT topic irrigation devices publish their registration on
pub const REGISTRATION_TOPIC: &str = "irrigation/devices/register";

/// Path probed on a device to decide whether it is alive
pub const HEALTH_CHECK_PATH: &str = "/health";
