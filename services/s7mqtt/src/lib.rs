//! Siemens S7 to MQTT gateway
//!
//! Mirrors PLC-resident light/dimmer state onto an MQTT broker using the
//! Home Assistant device-discovery convention, and turns broker commands back
//! into PLC trigger writes.
//!
//! - [`plc`]: field-bus driver contract, the S7 and simulated drivers and the
//!   [`plc::PlcLink`] access serializer
//! - [`messaging`]: broker contract and the MQTT client
//! - [`devices`]: device model, discovery payloads and the reconciliation engine
//! - [`runtime`]: process-level lifecycle

pub mod core;
pub mod devices;
pub mod error;
pub mod messaging;
pub mod plc;
pub mod runtime;

pub use error::{GatewayError, Result};
