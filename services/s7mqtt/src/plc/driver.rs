//! Field-bus driver contract
//!
//! The PLC link only ever talks to a [`FieldBusDriver`]; the S7 TCP driver
//! and the simulated driver both implement it.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::config::S7Endpoint;

/// PLC symbolic address, e.g. `DB1,X0.0`
pub type Address = String;

/// Value read from or written to a PLC address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlcValue {
    Bool(bool),
    Int(i64),
    Real(f64),
}

impl PlcValue {
    /// Boolean view; integers 0/1 are accepted since some PLC programs
    /// expose flags as bytes.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(0) => Some(false),
            Self::Int(1) => Some(true),
            _ => None,
        }
    }

    /// Integer view; reals are rounded to the nearest integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Real(v) if v.is_finite() => Some(v.round() as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Real(v) => Some(*v),
            Self::Bool(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Real(_) => "real",
        }
    }
}

impl fmt::Display for PlcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Real(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for PlcValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PlcValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for PlcValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

/// Driver-level failure
///
/// `Busy` is kept apart from hard failures: the link retries busy writes
/// instead of failing them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("PLC busy")]
    Busy,

    #[error("driver not connected")]
    NotConnected,

    /// The transport failed mid-request; the driver has already dropped
    /// its session
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("{0}")]
    Failed(String),
}

impl DriverError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Whether the driver needs a fresh `connect` before it can serve again
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::NotConnected | Self::ConnectionLost(_))
    }
}

/// Vendor driver contract consumed by [`super::PlcLink`]
///
/// Implementations need not be safe for overlapping calls; the link never
/// issues more than one at a time. After a session-lost error the link calls
/// `connect` again on the same driver.
#[async_trait]
pub trait FieldBusDriver: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn connect(&self, endpoint: &S7Endpoint) -> Result<(), DriverError>;

    async fn disconnect(&self) -> Result<(), DriverError>;

    /// Read all `addresses` in one transaction
    ///
    /// The returned map is keyed by the address strings as given.
    async fn read_addresses(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, PlcValue>, DriverError>;

    /// Write a single address; `Err(DriverError::Busy)` asks for a retry
    async fn write_address(&self, address: &str, value: &PlcValue) -> Result<(), DriverError>;
}
