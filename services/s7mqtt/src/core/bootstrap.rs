//! Service bootstrap
//!
//! Command-line arguments, logging setup and the `--validate` summary.

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn, Level};

use common::logging::LogConfig;
use common::service_bootstrap::ServiceInfo;

use crate::core::config::ConfigManager;
use crate::error::{GatewayError, Result};

/// Command-line arguments for s7mqtt
#[derive(Parser, Debug, Clone)]
#[command(
    name = "s7mqtt",
    version = env!("CARGO_PKG_VERSION"),
    about = "Siemens S7 PLC to MQTT gateway",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML, JSON or TOML)
    #[arg(
        short = 'c',
        long,
        env = "S7MQTT_CONFIG",
        default_value = "config/s7mqtt.yaml"
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,

    /// Directory for daily rolling log files
    #[arg(long, env = "S7MQTT_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Write log files as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

/// Parse a level name; unknown names fall back to INFO
pub fn parse_log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

pub fn log_config(args: &Args, service_info: &ServiceInfo) -> LogConfig {
    LogConfig {
        service_name: service_info.name.clone(),
        log_dir: args.log_dir.clone(),
        console_level: parse_log_level(&args.log_level),
        enable_json: args.json_logs,
        ansi: !args.no_color,
    }
}

/// Initialize logging system with command-line arguments
pub fn initialize_logging(args: &Args, service_info: &ServiceInfo) -> Result<()> {
    common::logging::init_with_config(log_config(args, service_info))
        .map_err(|e| GatewayError::config(format!("Failed to init logging: {}", e)))?;

    if parse_log_level(&args.log_level) == Level::INFO
        && !args.log_level.eq_ignore_ascii_case("info")
    {
        warn!("Unknown log level '{}', using info", args.log_level);
    }
    Ok(())
}

/// Log what a loaded configuration would run
pub fn log_configuration_summary(manager: &ConfigManager) {
    let config = manager.config();
    info!("MQTT broker: {}", config.mqtt.url);
    info!("Polling interval: {:?}", config.polling.interval());
    info!(
        "Found {} controller(s), {} device(s)",
        config.controllers.len(),
        manager.device_count()
    );

    for controller in &config.controllers {
        info!("  PLC {} ({:?} driver)", controller.s7, controller.driver);
        for device in &controller.devices {
            info!(
                "    {} '{}' ({})",
                device.id(),
                device.friendly_name(),
                device.kind()
            );
        }
    }
}
