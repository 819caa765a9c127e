use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use mac_address::MacAddress;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use uuid::Uuid;
use crate::protocol::DEVICE_DETECTED_EVENT_TYPE;

/// Reasons an event or device field is rejected before it reaches the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("MAC address is empty")]
    EmptyMacAddress,
    #[error("invalid MAC address: {0}")]
    InvalidMacAddress(String),
    #[error("IP address is empty")]
    EmptyIpAddress,
    #[error("invalid IP address: {0}")]
    InvalidIpAddress(String),
    #[error("unexpected event type: {0}")]
    UnexpectedEventType(String),
    #[error("event id is empty")]
    EmptyEventId,
    #[error("unknown device status: {0}")]
    UnknownStatus(String),
}

/// Normalizes a MAC address to uppercase, colon-separated form.
/// Accepts `:` or `-` as the octet separator.
pub fn normalize_mac(input: &str) -> Result<String, ValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyMacAddress);
    }

    let mac: MacAddress = trimmed
        .replace('-', ":")
        .parse()
        .map_err(|_| ValidationError::InvalidMacAddress(trimmed.to_string()))?;

    Ok(mac.to_string().to_uppercase())
}

/// Checks that an IP address is present and parses as IPv4 or IPv6.
pub fn validate_ip(input: &str) -> Result<IpAddr, ValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyIpAddress);
    }

    trimmed
        .parse::<IpAddr>()
        .map_err(|_| ValidationError::InvalidIpAddress(trimmed.to_string()))
}

/// A single observation that a device at a given address is reachable.
///
/// Produced by the registration flow every time a device registers or
/// re-registers. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDetectedEvent {
    /// Normalized MAC address, e.g. "AA:BB:CC:DD:EE:FF"
    pub mac_address: String,

    /// Address the device was last seen at
    pub ip_address: String,

    /// Observation time; only meaningful relative to other events of the same device
    pub detected_at: DateTime<Utc>,

    /// Opaque id for tracing
    pub event_id: String,

    /// Always "device.detected"
    pub event_type: String,
}

impl DeviceDetectedEvent {
    /// Build a validated event stamped with the current time.
    pub fn new(mac_address: &str, ip_address: &str) -> Result<Self, ValidationError> {
        Self::with_timestamp(mac_address, ip_address, Utc::now())
    }

    /// Build a validated event with an explicit detection time.
    pub fn with_timestamp(
        mac_address: &str,
        ip_address: &str,
        detected_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let event = Self {
            mac_address: normalize_mac(mac_address)?,
            ip_address: ip_address.trim().to_string(),
            detected_at,
            event_id: Uuid::new_v4().to_string(),
            event_type: DEVICE_DETECTED_EVENT_TYPE.to_string(),
        };
        event.validate()?;
        Ok(event)
    }

    /// Re-check the invariants. Events can be built field by field (or
    /// deserialized), so consumers call this before acting on one.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let normalized = normalize_mac(&self.mac_address)?;
        if normalized != self.mac_address {
            return Err(ValidationError::InvalidMacAddress(self.mac_address.clone()));
        }
        validate_ip(&self.ip_address)?;
        if self.event_type != DEVICE_DETECTED_EVENT_TYPE {
            return Err(ValidationError::UnexpectedEventType(self.event_type.clone()));
        }
        if self.event_id.is_empty() {
            return Err(ValidationError::EmptyEventId);
        }
        Ok(())
    }
}

/// Lifecycle status of a device as seen by the health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Registered,
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Registered => "registered",
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(DeviceStatus::Registered),
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

/// An irrigation device known to the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Normalized MAC address, unique per device
    pub mac_address: String,

    /// Last reported IP address
    pub ip_address: String,

    /// Optional human-readable name sent at registration
    pub name: Option<String>,

    pub status: DeviceStatus,

    /// Last time the device status was touched
    pub last_seen: DateTime<Utc>,

    /// First registration time
    pub registered_at: DateTime<Utc>,
}

impl Device {
    /// A freshly registered device. Status starts at `Registered`.
    pub fn register(
        mac_address: &str,
        ip_address: &str,
        name: Option<String>,
    ) -> Result<Self, ValidationError> {
        let mac_address = normalize_mac(mac_address)?;
        validate_ip(ip_address)?;
        let now = Utc::now();

        Ok(Self {
            mac_address,
            ip_address: ip_address.trim().to_string(),
            name,
            status: DeviceStatus::Registered,
            last_seen: now,
            registered_at: now,
        })
    }

    /// Change the status and touch `last_seen`.
    pub fn set_status(&mut self, status: DeviceStatus) {
        self.status = status;
        self.last_seen = Utc::now();
    }
}
