//! Broker-side messaging
//!
//! The device engine only depends on [`MessagingClient`]; [`MqttClient`] is
//! the production implementation.

pub mod mqtt;

use std::sync::Arc;

use async_trait::async_trait;

pub use mqtt::MqttClient;

use crate::error::Result;

/// Delivery guarantee requested for a publish or subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl PublishOptions {
    /// Retained, at-least-once: what discovery documents need
    pub const fn retained() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    }
}

/// Callback for inbound messages on a subscribed topic
///
/// Invoked from the client's receive task; it must not block.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Pub/sub client contract
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()>;

    /// Register `handler` for messages arriving on exactly `topic`
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()>;
}
