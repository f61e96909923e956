//! Device model and topic layout
//!
//! Topic names and payload spellings here are a wire contract with Home
//! Assistant and any other subscriber; they are not configurable.

pub mod controller;
pub mod discovery;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use controller::{ControllerState, DeviceController, InboundCommand, PollSummary};

use crate::error::GatewayError;

/// Root of every gateway-owned topic
pub const TOPIC_ROOT: &str = "siemens-s7-mqtt";
/// Home Assistant discovery prefix
pub const DISCOVERY_PREFIX: &str = "homeassistant";

pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";

pub fn command_topic(device_id: &str) -> String {
    format!("{}/{}/command", TOPIC_ROOT, device_id)
}

pub fn state_topic(device_id: &str) -> String {
    format!("{}/{}/state", TOPIC_ROOT, device_id)
}

pub fn brightness_command_topic(device_id: &str) -> String {
    format!("{}/{}/brightness/set", TOPIC_ROOT, device_id)
}

pub fn brightness_state_topic(device_id: &str) -> String {
    format!("{}/{}/brightness", TOPIC_ROOT, device_id)
}

pub fn discovery_topic(device_id: &str) -> String {
    format!("{}/device/{}/config", DISCOVERY_PREFIX, device_id)
}

/// Closed set of supported device kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    #[serde(rename = "light")]
    Light,
    #[serde(rename = "dimmableLight")]
    DimmableLight,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::DimmableLight => "dimmableLight",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested or reported on/off state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    pub fn from_bool(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn as_payload(self) -> &'static str {
        match self {
            Self::On => PAYLOAD_ON,
            Self::Off => PAYLOAD_OFF,
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_payload())
    }
}

impl FromStr for SwitchState {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            PAYLOAD_ON => Ok(Self::On),
            PAYLOAD_OFF => Ok(Self::Off),
            other => Err(GatewayError::invalid_command(format!(
                "expected ON or OFF, got '{}'",
                other
            ))),
        }
    }
}

/// Decoded inbound command; at least one field is set for a valid command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCommand {
    pub state: Option<SwitchState>,
    pub brightness: Option<i64>,
}

impl DeviceCommand {
    pub fn switch(state: SwitchState) -> Self {
        Self {
            state: Some(state),
            brightness: None,
        }
    }

    pub fn brightness(level: i64) -> Self {
        Self {
            state: None,
            brightness: Some(level),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.brightness.is_none()
    }
}

/// Parse a brightness command payload (base-10 integer)
pub fn parse_brightness(payload: &str) -> Result<i64, GatewayError> {
    payload.trim().parse::<i64>().map_err(|_| {
        GatewayError::invalid_command(format!("expected integer brightness, got '{}'", payload))
    })
}

/// Values read back from the PLC for one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlcReading {
    pub on: bool,
    pub brightness: Option<i64>,
}

/// Last reconciled state of a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub id: String,
    pub kind: DeviceKind,
    pub on: bool,
    pub brightness: Option<i64>,
    pub last_updated: DateTime<Utc>,
}

impl DeviceState {
    pub fn new(id: impl Into<String>, kind: DeviceKind, reading: PlcReading) -> Self {
        Self {
            id: id.into(),
            kind,
            on: reading.on,
            brightness: reading.brightness,
            last_updated: Utc::now(),
        }
    }

    pub fn reading(&self) -> PlcReading {
        PlcReading {
            on: self.on,
            brightness: self.brightness,
        }
    }

    /// Whether a fresh reading differs in any observable field
    pub fn differs_from(&self, reading: &PlcReading) -> bool {
        self.reading() != *reading
    }

    /// Copy with the reading applied and the timestamp refreshed
    pub fn with_reading(&self, reading: PlcReading) -> Self {
        Self::new(self.id.clone(), self.kind, reading)
    }

    pub fn switch_state(&self) -> SwitchState {
        SwitchState::from_bool(self.on)
    }
}
