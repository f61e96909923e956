//! PLC access
//!
//! All field-bus traffic for one controller goes through a single
//! [`PlcLink`], which serializes operations onto one [`FieldBusDriver`].

pub mod driver;
pub mod link;
pub mod s7;
pub mod simulated;

use std::sync::Arc;

pub use driver::{Address, DriverError, FieldBusDriver, PlcValue};
pub use link::{LinkSettings, PendingOperation, PlcLink, WorkerState};
pub use s7::S7Driver;
pub use simulated::SimulatedDriver;

use crate::core::config::{ControllerConfig, DriverKind};

/// Build the driver a controller is configured for
pub fn build_driver(config: &ControllerConfig) -> Arc<dyn FieldBusDriver> {
    match config.driver {
        DriverKind::S7 => Arc::new(S7Driver::new()),
        DriverKind::Simulated => Arc::new(SimulatedDriver::for_devices(&config.devices)),
    }
}
