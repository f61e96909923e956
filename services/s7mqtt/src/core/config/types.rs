//! Configuration model
//!
//! Device descriptors are a closed tagged union on `type`; each variant
//! carries exactly the addresses its kind needs, so a missing mandatory
//! address is a deserialization error rather than a runtime surprise.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::reconnect::ReconnectPolicy;
use crate::devices::{DeviceKind, SwitchState};
use crate::plc::link::{LinkSettings, DEFAULT_MAX_BUSY_RETRIES, DEFAULT_MAX_QUEUE_SIZE};

// ============================================================================
// Top level
// ============================================================================

/// Whole-service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub discovery: DiscoveryIdentity,
}

// ============================================================================
// MQTT
// ============================================================================

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttConfig {
    /// `mqtt://[user[:password]@]host[:port]` or `mqtts://...`
    pub url: String,

    /// Generated from a random suffix when absent
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_keep_alive_secs() -> u64 {
    30
}

// ============================================================================
// Polling / link
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Operation queue tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_busy_retry_delay_ms")]
    pub busy_retry_delay_ms: u64,

    /// `null` retries busy writes forever
    #[serde(default = "default_max_busy_retries")]
    pub max_busy_retries: Option<u32>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Backoff for reopening a lost PLC session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0 keeps trying forever
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_attempts: policy.max_attempts,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..ReconnectPolicy::default()
        }
    }
}

fn default_max_queue_size() -> usize {
    DEFAULT_MAX_QUEUE_SIZE
}

fn default_busy_retry_delay_ms() -> u64 {
    50
}

fn default_max_busy_retries() -> Option<u32> {
    Some(DEFAULT_MAX_BUSY_RETRIES)
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            busy_retry_delay_ms: default_busy_retry_delay_ms(),
            max_busy_retries: default_max_busy_retries(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn settings(&self) -> LinkSettings {
        LinkSettings {
            max_queue_size: self.max_queue_size,
            busy_retry_delay: Duration::from_millis(self.busy_retry_delay_ms),
            max_busy_retries: self.max_busy_retries,
            reconnect: self.reconnect.policy(),
        }
    }
}

// ============================================================================
// Discovery identity
// ============================================================================

/// Identity strings embedded in every discovery document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryIdentity {
    pub manufacturer: String,
    pub sw_version: String,
    pub hw_version: String,
    pub origin_name: String,
    pub origin_sw_version: String,
    pub support_url: String,
}

impl Default for DiscoveryIdentity {
    fn default() -> Self {
        Self {
            manufacturer: "jonasclaes".to_string(),
            sw_version: "1.0.0".to_string(),
            hw_version: "1.0.0".to_string(),
            origin_name: "Siemens S7 MQTT".to_string(),
            origin_sw_version: "1.0.0".to_string(),
            support_url: "https://github.com/jonasclaes/siemens-s7-mqtt".to_string(),
        }
    }
}

// ============================================================================
// Controllers
// ============================================================================

/// Which driver backs a controller's PLC link
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    S7,
    Simulated,
}

/// One PLC endpoint and the devices it hosts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    pub s7: S7Endpoint,

    #[serde(default)]
    pub driver: DriverKind,

    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

/// S7 connection target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct S7Endpoint {
    pub host: String,

    #[serde(default = "default_s7_port")]
    pub port: u16,

    #[serde(default)]
    pub rack: u16,

    #[serde(default = "default_s7_slot")]
    pub slot: u16,
}

fn default_s7_port() -> u16 {
    102
}

fn default_s7_slot() -> u16 {
    1
}

impl S7Endpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_s7_port(),
            rack: 0,
            slot: default_s7_slot(),
        }
    }
}

impl std::fmt::Display for S7Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} (rack {}, slot {})",
            self.host, self.port, self.rack, self.slot
        )
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Reference to a PLC address in the vendor address syntax
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AddressRef {
    pub address: String,
}

impl AddressRef {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

/// Configured device, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DeviceDescriptor {
    #[serde(rename = "light")]
    Light(LightDevice),

    #[serde(rename = "dimmableLight")]
    DimmableLight(DimmableLightDevice),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LightDevice {
    pub id: String,

    #[serde(rename = "friendlyName")]
    pub friendly_name: String,

    pub status: LightStatus,

    #[serde(default)]
    pub command: SwitchCommands,

    /// Not valid for plain lights; kept only so validation can reject it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BrightnessData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LightStatus {
    pub on: AddressRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SwitchCommands {
    #[serde(default)]
    pub on: Option<AddressRef>,

    #[serde(default)]
    pub off: Option<AddressRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimmableLightDevice {
    pub id: String,

    #[serde(rename = "friendlyName")]
    pub friendly_name: String,

    pub status: DimmableStatus,

    #[serde(default)]
    pub command: DimmableCommands,

    pub data: BrightnessData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DimmableStatus {
    pub on: AddressRef,
    pub brightness: AddressRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DimmableCommands {
    #[serde(default)]
    pub on: Option<AddressRef>,

    #[serde(default)]
    pub off: Option<AddressRef>,

    #[serde(default)]
    pub brightness: Option<AddressRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BrightnessData {
    pub brightness: AddressRef,
}

impl DeviceDescriptor {
    pub fn id(&self) -> &str {
        match self {
            Self::Light(d) => &d.id,
            Self::DimmableLight(d) => &d.id,
        }
    }

    pub fn friendly_name(&self) -> &str {
        match self {
            Self::Light(d) => &d.friendly_name,
            Self::DimmableLight(d) => &d.friendly_name,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Light(_) => DeviceKind::Light,
            Self::DimmableLight(_) => DeviceKind::DimmableLight,
        }
    }

    /// Trigger address for switching the device on or off, if configured
    pub fn switch_trigger(&self, state: SwitchState) -> Option<&str> {
        let (on, off) = match self {
            Self::Light(d) => (&d.command.on, &d.command.off),
            Self::DimmableLight(d) => (&d.command.on, &d.command.off),
        };
        let target = match state {
            SwitchState::On => on,
            SwitchState::Off => off,
        };
        target.as_ref().map(|a| a.address.as_str())
    }

    /// Every address the descriptor references
    pub fn addresses(&self) -> Vec<&str> {
        let mut out = Vec::new();
        match self {
            Self::Light(d) => {
                out.push(d.status.on.address.as_str());
                out.extend(d.command.on.iter().map(|a| a.address.as_str()));
                out.extend(d.command.off.iter().map(|a| a.address.as_str()));
                out.extend(d.data.iter().map(|a| a.brightness.address.as_str()));
            },
            Self::DimmableLight(d) => {
                out.push(d.status.on.address.as_str());
                out.push(d.status.brightness.address.as_str());
                out.extend(d.command.on.iter().map(|a| a.address.as_str()));
                out.extend(d.command.off.iter().map(|a| a.address.as_str()));
                out.extend(d.command.brightness.iter().map(|a| a.address.as_str()));
                out.push(d.data.brightness.address.as_str());
            },
        }
        out
    }
}
