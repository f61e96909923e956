//! Siemens S7 to MQTT gateway (`s7mqtt`)
//!
//! Loads the configuration, connects to the broker and every configured PLC
//! and mirrors device state until SIGINT/SIGTERM.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use common::service_bootstrap::{print_startup_banner, ServiceInfo};
use s7mqtt::core::bootstrap::{self, Args};
use s7mqtt::core::config::ConfigManager;
use s7mqtt::messaging::{MessagingClient, MqttClient};
use s7mqtt::runtime::run_gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let service_info = ServiceInfo::new(
        "s7mqtt",
        env!("CARGO_PKG_VERSION"),
        "Siemens S7 PLC to MQTT gateway",
    );

    bootstrap::initialize_logging(&args, &service_info)?;
    if !args.no_color {
        print_startup_banner(&service_info);
    }

    let manager = ConfigManager::from_file(&args.config)?;

    // Validation mode: validate and exit
    if args.validate {
        bootstrap::log_configuration_summary(&manager);
        info!("Validation completed successfully");
        return Ok(());
    }

    let config = manager.into_config();
    let messaging: Arc<dyn MessagingClient> = Arc::new(MqttClient::new(config.mqtt.clone()));

    run_gateway(config, messaging, async {
        let signal = common::wait_for_shutdown().await;
        info!("Received {}, stopping", signal);
    })
    .await?;

    Ok(())
}
