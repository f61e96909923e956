//! Service identity and startup banner

use tracing::info;

/// Service metadata for startup
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Binary name (e.g., "s7mqtt")
    pub name: String,
    /// Version of the service crate
    pub version: String,
    /// One-line description
    pub description: String,
}

impl ServiceInfo {
    /// Create new service info
    ///
    /// `version` should come from the service crate itself
    /// (`env!("CARGO_PKG_VERSION")` expanded in the binary), not from this library.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }

    /// Lines printed by [`print_startup_banner`]
    pub fn banner_lines(&self) -> Vec<String> {
        vec![
            String::new(),
            format!(" {} v{}", self.name.to_uppercase(), self.version),
            format!(" {}", self.description),
            String::new(),
        ]
    }
}

/// Print unified startup banner for any service
pub fn print_startup_banner(service: &ServiceInfo) {
    for line in service.banner_lines() {
        info!("{}", line);
    }
}
