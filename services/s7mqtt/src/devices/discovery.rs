//! Home Assistant device-discovery documents
//!
//! Field order follows declaration order, so the serialized JSON is stable
//! across runs.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{
    brightness_command_topic, brightness_state_topic, command_topic, state_topic, PAYLOAD_OFF,
    PAYLOAD_ON,
};
use crate::core::config::{DeviceDescriptor, DiscoveryIdentity};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiscoveryDocument {
    pub device: DeviceBlock,
    pub origin: OriginBlock,
    pub components: BTreeMap<String, Component>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceBlock {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
    pub serial_number: String,
    pub hw_version: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OriginBlock {
    pub name: String,
    pub sw_version: String,
    pub support_url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Component {
    pub unique_id: String,
    pub platform: &'static str,
    pub command_topic: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness_command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness_state_topic: Option<String>,
    pub payload_on: &'static str,
    pub payload_off: &'static str,
    pub optimistic: bool,
}

/// Component key, also used as its `unique_id`: `{id}-light` / `{id}-dimmableLight`
pub fn component_key(device: &DeviceDescriptor) -> String {
    format!("{}-{}", device.id(), device.kind())
}

fn light_component(device: &DeviceDescriptor, dimmable: bool) -> Component {
    let id = device.id();
    Component {
        unique_id: component_key(device),
        platform: "light",
        command_topic: command_topic(id),
        state_topic: state_topic(id),
        brightness_command_topic: dimmable.then(|| brightness_command_topic(id)),
        brightness_state_topic: dimmable.then(|| brightness_state_topic(id)),
        payload_on: PAYLOAD_ON,
        payload_off: PAYLOAD_OFF,
        optimistic: false,
    }
}

pub fn build_document(device: &DeviceDescriptor, identity: &DiscoveryIdentity) -> DiscoveryDocument {
    let component = match device {
        DeviceDescriptor::Light(_) => light_component(device, false),
        DeviceDescriptor::DimmableLight(_) => light_component(device, true),
    };

    let mut components = BTreeMap::new();
    components.insert(component_key(device), component);

    DiscoveryDocument {
        device: DeviceBlock {
            identifiers: vec![device.id().to_string()],
            name: device.friendly_name().to_string(),
            manufacturer: identity.manufacturer.clone(),
            model: device.kind().to_string(),
            sw_version: identity.sw_version.clone(),
            serial_number: device.id().to_string(),
            hw_version: identity.hw_version.clone(),
        },
        origin: OriginBlock {
            name: identity.origin_name.clone(),
            sw_version: identity.origin_sw_version.clone(),
            support_url: identity.support_url.clone(),
        },
        components,
    }
}

/// Serialized discovery payload for `device`
pub fn build_payload(device: &DeviceDescriptor, identity: &DiscoveryIdentity) -> Result<String> {
    Ok(serde_json::to_string(&build_document(device, identity))?)
}
