//! Shared service plumbing
//!
//! Provides the pieces every gateway binary needs before it touches a PLC
//! or a broker:
//! - logging initialisation
//! - shutdown signal handling
//! - service identity and startup banner

pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use logging::LogConfig;
pub use service_bootstrap::ServiceInfo;
pub use shutdown::{wait_for_shutdown, ShutdownSignal};
