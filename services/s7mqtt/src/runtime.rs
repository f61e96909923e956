//! Gateway runtime
//!
//! Brings the broker connection and every configured controller up, runs
//! them until the shutdown future resolves, then tears everything down.
//! Startup is all or nothing.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::AppConfig;
use crate::devices::DeviceController;
use crate::error::Result;
use crate::messaging::MessagingClient;
use crate::plc::build_driver;

/// Initialize every controller, in configuration order
///
/// On failure the controllers already started are shut down again.
pub async fn start_controllers(
    config: &AppConfig,
    messaging: &Arc<dyn MessagingClient>,
) -> Result<Vec<DeviceController>> {
    let mut started: Vec<DeviceController> = Vec::with_capacity(config.controllers.len());

    for controller_config in &config.controllers {
        let driver = build_driver(controller_config);
        let mut controller = DeviceController::with_options(
            controller_config.clone(),
            driver,
            Arc::clone(messaging),
            config.link.settings(),
            config.discovery.clone(),
        );

        let started_ok = match controller.initialize_devices().await {
            Ok(()) => controller.start_polling(config.polling.interval()),
            Err(e) => Err(e),
        };
        if let Err(e) = started_ok {
            error!(
                "Failed to start controller for {}: {}",
                controller_config.s7, e
            );
            controller.shutdown().await;
            for mut other in started {
                other.shutdown().await;
            }
            return Err(e);
        }
        started.push(controller);
    }

    Ok(started)
}

/// Run the gateway until `shutdown` resolves
pub async fn run_gateway<F>(
    config: AppConfig,
    messaging: Arc<dyn MessagingClient>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    messaging.connect().await?;

    let controllers = match start_controllers(&config, &messaging).await {
        Ok(controllers) => controllers,
        Err(e) => {
            if let Err(disconnect_err) = messaging.disconnect().await {
                warn!("Error disconnecting from MQTT broker: {}", disconnect_err);
            }
            return Err(e);
        },
    };
    info!("Gateway running with {} controller(s)", controllers.len());

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for mut controller in controllers {
        let token = cancel.child_token();
        tasks.spawn(async move {
            controller.run(token).await;
        });
    }

    shutdown.await;
    info!("Shutting down gateway");
    cancel.cancel();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Controller task ended abnormally: {}", e);
        }
    }

    if let Err(e) = messaging.disconnect().await {
        error!("Error disconnecting from MQTT broker: {}", e);
    }
    info!("Gateway stopped");
    Ok(())
}
