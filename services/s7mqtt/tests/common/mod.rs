//! Shared fixtures for integration tests
//!
//! `MemoryMessaging` records every publish and lets tests inject inbound
//! messages; the builders produce the two devices most tests use.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use s7mqtt::core::config::{
    AddressRef, AppConfig, BrightnessData, ControllerConfig, DeviceDescriptor, DimmableCommands,
    DimmableLightDevice, DimmableStatus, DiscoveryIdentity, DriverKind, LightDevice, LightStatus,
    LinkConfig, MqttConfig, PollingConfig, S7Endpoint, SwitchCommands,
};
use s7mqtt::messaging::{MessageHandler, MessagingClient, PublishOptions};
use s7mqtt::{GatewayError, Result};

pub const LIGHT_ON: &str = "DB1,X0.0";
pub const LIGHT_CMD_ON: &str = "DB1,X0.1";
pub const LIGHT_CMD_OFF: &str = "DB1,X0.2";

pub const DIMMER_ON: &str = "DB2,X0.0";
pub const DIMMER_BRIGHTNESS: &str = "DB2,INT2";
pub const DIMMER_CMD_ON: &str = "DB2,X0.1";
pub const DIMMER_CMD_OFF: &str = "DB2,X0.2";
pub const DIMMER_CMD_BRIGHTNESS: &str = "DB2,X0.3";
pub const DIMMER_DATA_BRIGHTNESS: &str = "DB2,INT4";

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub options: PublishOptions,
}

#[derive(Default)]
struct MemoryState {
    connected: bool,
    published: Vec<Published>,
    handlers: HashMap<String, Vec<MessageHandler>>,
    fail_publish_on: Option<String>,
    connect_calls: usize,
    disconnect_calls: usize,
}

/// In-memory broker stand-in
#[derive(Default)]
pub struct MemoryMessaging {
    state: Mutex<MemoryState>,
}

impl MemoryMessaging {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connected client, for tests that skip the runtime
    pub fn connected() -> Arc<Self> {
        let messaging = Self::new();
        messaging.state.lock().connected = true;
        messaging
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .collect()
    }

    pub fn clear_published(&self) {
        self.state.lock().published.clear();
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.lock().handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Make publishes to `topic` fail until cleared with `None`
    pub fn fail_publish_on(&self, topic: Option<&str>) {
        self.state.lock().fail_publish_on = topic.map(str::to_string);
    }

    /// Deliver an inbound message to the handlers subscribed to `topic`
    pub fn deliver(&self, topic: &str, payload: &str) -> usize {
        let handlers = self
            .state
            .lock()
            .handlers
            .get(topic)
            .cloned()
            .unwrap_or_default();
        for handler in &handlers {
            handler(topic, payload.as_bytes());
        }
        handlers.len()
    }
}

#[async_trait]
impl MessagingClient for MemoryMessaging {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.connect_calls += 1;
        if state.connected {
            return Err(GatewayError::messaging("Client already connected."));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.disconnect_calls += 1;
        if !state.connected {
            return Err(GatewayError::messaging("Client not connected."));
        }
        state.connected = false;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(GatewayError::messaging("Client not connected."));
        }
        if state.fail_publish_on.as_deref() == Some(topic) {
            return Err(GatewayError::messaging(format!("publish to {} failed", topic)));
        }
        state.published.push(Published {
            topic: topic.to_string(),
            payload: String::from_utf8(payload).unwrap(),
            options,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(GatewayError::messaging("Client not connected."));
        }
        state
            .handlers
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn light(id: &str) -> DeviceDescriptor {
    DeviceDescriptor::Light(LightDevice {
        id: id.to_string(),
        friendly_name: format!("{} light", id),
        status: LightStatus {
            on: AddressRef::new(LIGHT_ON),
        },
        command: SwitchCommands {
            on: Some(AddressRef::new(LIGHT_CMD_ON)),
            off: Some(AddressRef::new(LIGHT_CMD_OFF)),
        },
        data: None,
    })
}

pub fn dimmer(id: &str) -> DeviceDescriptor {
    DeviceDescriptor::DimmableLight(DimmableLightDevice {
        id: id.to_string(),
        friendly_name: format!("{} dimmer", id),
        status: DimmableStatus {
            on: AddressRef::new(DIMMER_ON),
            brightness: AddressRef::new(DIMMER_BRIGHTNESS),
        },
        command: DimmableCommands {
            on: Some(AddressRef::new(DIMMER_CMD_ON)),
            off: Some(AddressRef::new(DIMMER_CMD_OFF)),
            brightness: Some(AddressRef::new(DIMMER_CMD_BRIGHTNESS)),
        },
        data: BrightnessData {
            brightness: AddressRef::new(DIMMER_DATA_BRIGHTNESS),
        },
    })
}

pub fn controller_config(devices: Vec<DeviceDescriptor>) -> ControllerConfig {
    ControllerConfig {
        s7: S7Endpoint::new("127.0.0.1"),
        driver: DriverKind::Simulated,
        devices,
    }
}

pub fn app_config(controllers: Vec<ControllerConfig>, interval_ms: u64) -> AppConfig {
    AppConfig {
        mqtt: MqttConfig {
            url: "mqtt://localhost:1883".to_string(),
            client_id: Some("test".to_string()),
            keep_alive_secs: 30,
        },
        controllers,
        polling: PollingConfig { interval_ms },
        link: LinkConfig::default(),
        discovery: DiscoveryIdentity::default(),
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
