//! Device controller: reconciles PLC state with the broker
//!
//! One controller owns one [`PlcLink`] and the devices configured behind it.
//! Commands decoded by subscription handlers are funnelled through a bounded
//! channel into [`DeviceController::run`], which also owns the poll timer.
//! Command handling and poll passes therefore never interleave, and a poll
//! pass that outlasts the interval simply swallows the missed ticks.
//!
//! ```text
//! Uninitialized -> Initializing -> Polling -> ShuttingDown -> Shutdown
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    brightness_command_topic, brightness_state_topic, command_topic, discovery,
    discovery_topic, parse_brightness, state_topic, DeviceCommand, DeviceKind, DeviceState,
    PlcReading,
};
use crate::core::config::{ControllerConfig, DeviceDescriptor, DiscoveryIdentity};
use crate::error::{GatewayError, Result};
use crate::messaging::{MessageHandler, MessagingClient, PublishOptions};
use crate::plc::{FieldBusDriver, LinkSettings, PlcLink, PlcValue};

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Controller lifecycle; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Initializing,
    /// Devices are live; the poll timer may or may not be running
    Polling,
    ShuttingDown,
    Shutdown,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Polling => "polling",
            Self::ShuttingDown => "shutting down",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Command decoded from a subscription, addressed to one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub device_id: String,
    pub command: DeviceCommand,
}

/// Outcome of one poll pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub checked: usize,
    pub changed: usize,
    pub failed: usize,
}

enum LoopEvent {
    Cancelled,
    Command(Option<InboundCommand>),
    Tick,
}

pub struct DeviceController {
    config: Arc<ControllerConfig>,
    link: PlcLink,
    messaging: Arc<dyn MessagingClient>,
    identity: DiscoveryIdentity,
    states: HashMap<String, DeviceState>,
    lifecycle: ControllerState,
    poll_timer: Option<Interval>,
    commands_tx: mpsc::Sender<InboundCommand>,
    commands_rx: mpsc::Receiver<InboundCommand>,
}

impl DeviceController {
    pub fn new(
        config: ControllerConfig,
        driver: Arc<dyn FieldBusDriver>,
        messaging: Arc<dyn MessagingClient>,
    ) -> Self {
        Self::with_options(
            config,
            driver,
            messaging,
            LinkSettings::default(),
            DiscoveryIdentity::default(),
        )
    }

    pub fn with_options(
        config: ControllerConfig,
        driver: Arc<dyn FieldBusDriver>,
        messaging: Arc<dyn MessagingClient>,
        link_settings: LinkSettings,
        identity: DiscoveryIdentity,
    ) -> Self {
        let link = PlcLink::with_settings(config.s7.clone(), driver, link_settings);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            link,
            messaging,
            identity,
            states: HashMap::new(),
            lifecycle: ControllerState::Uninitialized,
            poll_timer: None,
            commands_tx,
            commands_rx,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.lifecycle
    }

    pub fn device_state(&self, device_id: &str) -> Option<&DeviceState> {
        self.states.get(device_id)
    }

    /// Cached states in configuration order
    pub fn device_states(&self) -> Vec<&DeviceState> {
        self.config
            .devices
            .iter()
            .filter_map(|d| self.states.get(d.id()))
            .collect()
    }

    pub fn is_polling(&self) -> bool {
        self.poll_timer.is_some()
    }

    pub fn link(&self) -> &PlcLink {
        &self.link
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect the link and bring every configured device online
    ///
    /// All or nothing: on any failure the device map is cleared, the link is
    /// disconnected and the controller ends in [`ControllerState::Shutdown`].
    pub async fn initialize_devices(&mut self) -> Result<()> {
        if self.lifecycle != ControllerState::Uninitialized {
            return Err(GatewayError::state(format!(
                "cannot initialize devices while {}",
                self.lifecycle
            )));
        }
        self.lifecycle = ControllerState::Initializing;

        match self.bring_up().await {
            Ok(()) => {
                self.lifecycle = ControllerState::Polling;
                info!(
                    "Initialized {} device(s) on {}",
                    self.states.len(),
                    self.config.s7
                );
                Ok(())
            },
            Err(e) => {
                error!("Device initialization on {} failed: {}", self.config.s7, e);
                self.states.clear();
                if self.link.is_connected() {
                    if let Err(disconnect_err) = self.link.disconnect().await {
                        warn!("Cleanup disconnect failed: {}", disconnect_err);
                    }
                }
                self.lifecycle = ControllerState::Shutdown;
                Err(e)
            },
        }
    }

    async fn bring_up(&mut self) -> Result<()> {
        self.link.connect().await?;

        let config = Arc::clone(&self.config);
        for device in &config.devices {
            self.bring_up_device(device).await?;
        }
        Ok(())
    }

    async fn bring_up_device(&mut self, device: &DeviceDescriptor) -> Result<()> {
        let id = device.id();
        let reading = self.read_device(device).await?;
        let state = DeviceState::new(id, device.kind(), reading);
        self.states.insert(id.to_string(), state.clone());

        self.send_discovery(device).await?;
        self.subscribe_commands(device).await?;
        self.publish_state(&state).await?;
        debug!("Device {} online: {:?}", id, reading);
        Ok(())
    }

    async fn send_discovery(&self, device: &DeviceDescriptor) -> Result<()> {
        let topic = discovery_topic(device.id());
        let payload = discovery::build_payload(device, &self.identity)?;
        self.messaging
            .publish(&topic, payload.into_bytes(), PublishOptions::retained())
            .await?;
        info!(
            "Sent discovery message for device {} to topic {}",
            device.friendly_name(),
            topic
        );
        Ok(())
    }

    async fn subscribe_commands(&self, device: &DeviceDescriptor) -> Result<()> {
        let id = device.id();
        self.messaging
            .subscribe(&command_topic(id), self.command_handler(id, decode_switch))
            .await?;

        match device {
            DeviceDescriptor::Light(_) => {},
            DeviceDescriptor::DimmableLight(_) => {
                self.messaging
                    .subscribe(
                        &brightness_command_topic(id),
                        self.command_handler(id, decode_brightness),
                    )
                    .await?;
            },
        }
        Ok(())
    }

    fn command_handler(
        &self,
        device_id: &str,
        decode: fn(&str) -> Result<DeviceCommand>,
    ) -> MessageHandler {
        let tx = self.commands_tx.clone();
        let device_id = device_id.to_string();
        Arc::new(move |topic: &str, payload: &[u8]| {
            let decoded = std::str::from_utf8(payload)
                .map_err(|_| GatewayError::invalid_command("payload is not UTF-8"))
                .and_then(decode);
            let command = match decoded {
                Ok(command) => command,
                Err(e) => {
                    warn!("Invalid command message for {} on {}: {}", device_id, topic, e);
                    return;
                },
            };
            let inbound = InboundCommand {
                device_id: device_id.clone(),
                command,
            };
            if let Err(e) = tx.try_send(inbound) {
                error!("Failed to handle command for {}: {}", device_id, e);
            }
        })
    }

    /// Start the poll timer; the first tick fires one interval from now
    pub fn start_polling(&mut self, interval: Duration) -> Result<()> {
        if self.poll_timer.is_some() {
            return Err(GatewayError::AlreadyStarted);
        }
        if self.lifecycle != ControllerState::Polling {
            return Err(GatewayError::state(format!(
                "cannot start polling while {}",
                self.lifecycle
            )));
        }
        if interval.is_zero() {
            return Err(GatewayError::config(
                "polling interval must be greater than zero",
            ));
        }

        let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.poll_timer = Some(timer);
        info!("Started polling {} every {:?}", self.config.s7, interval);
        Ok(())
    }

    pub fn stop_polling(&mut self) -> Result<()> {
        match self.poll_timer.take() {
            Some(_) => {
                info!("Stopped polling {}", self.config.s7);
                Ok(())
            },
            None => Err(GatewayError::NotStarted),
        }
    }

    /// Stop polling and disconnect the link
    ///
    /// Never fails; disconnect errors are logged. Calling it again is a no-op.
    pub async fn shutdown(&mut self) {
        if self.lifecycle == ControllerState::Shutdown {
            return;
        }
        self.lifecycle = ControllerState::ShuttingDown;

        if self.poll_timer.take().is_some() {
            debug!("Poll timer released for {}", self.config.s7);
        }
        if self.link.is_connected() {
            if let Err(e) = self.link.disconnect().await {
                error!("Error disconnecting from PLC at {}: {}", self.config.s7, e);
            }
        }

        self.lifecycle = ControllerState::Shutdown;
        info!("Controller for {} shut down", self.config.s7);
    }

    /// Event loop: inbound commands and poll ticks until `cancel` fires,
    /// then [`shutdown`](Self::shutdown)
    pub async fn run(&mut self, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => LoopEvent::Cancelled,
                command = self.commands_rx.recv() => LoopEvent::Command(command),
                _ = next_tick(&mut self.poll_timer) => LoopEvent::Tick,
            };

            match event {
                LoopEvent::Cancelled => break,
                LoopEvent::Command(Some(inbound)) => {
                    if let Err(e) = self
                        .handle_device_command(&inbound.device_id, inbound.command)
                        .await
                    {
                        error!("Failed to handle command for {}: {}", inbound.device_id, e);
                    }
                },
                // The controller keeps a sender itself, so the channel stays open
                LoopEvent::Command(None) => {},
                LoopEvent::Tick => {
                    let summary = self.poll_devices().await;
                    if summary.failed > 0 {
                        debug!("Poll pass on {}: {:?}", self.config.s7, summary);
                    }
                },
            }
        }

        self.shutdown().await;
    }

    // ========================================================================
    // Commands and reconciliation
    // ========================================================================

    /// Apply a command to one device, then reconcile it from the PLC
    ///
    /// The command is validated in full before anything is written. For
    /// brightness, the value register is written before its trigger.
    pub async fn handle_device_command(
        &mut self,
        device_id: &str,
        command: DeviceCommand,
    ) -> Result<()> {
        if !self.states.contains_key(device_id) {
            return Err(GatewayError::UnknownDevice(device_id.to_string()));
        }
        let config = Arc::clone(&self.config);
        let device = find_device(&config, device_id)?;
        let writes = plan_writes(device, &command)?;

        info!("Handling command for {}: {:?}", device_id, command);
        for (address, value) in writes {
            self.link.write(address, value).await?;
        }

        if let Err(e) = self.reconcile_device(device_id).await {
            warn!("Read-back after command for {} failed: {}", device_id, e);
        }
        Ok(())
    }

    /// Re-read one device; publish and cache only when it changed
    pub async fn reconcile_device(&mut self, device_id: &str) -> Result<bool> {
        let config = Arc::clone(&self.config);
        let device = find_device(&config, device_id)?;
        let reading = self.read_device(device).await?;

        let current = self
            .states
            .get(device_id)
            .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_string()))?;
        if !current.differs_from(&reading) {
            return Ok(false);
        }

        let next = current.with_reading(reading);
        self.publish_state(&next).await?;
        debug!("State of {} changed: {:?}", device_id, reading);
        self.states.insert(device_id.to_string(), next);
        Ok(true)
    }

    /// One reconciliation pass over every device
    ///
    /// A failing device is logged and counted; the rest are still checked.
    pub async fn poll_devices(&mut self) -> PollSummary {
        let config = Arc::clone(&self.config);
        let mut summary = PollSummary::default();

        for device in &config.devices {
            let id = device.id();
            if !self.states.contains_key(id) {
                continue;
            }
            summary.checked += 1;
            match self.reconcile_device(id).await {
                Ok(true) => summary.changed += 1,
                Ok(false) => {},
                Err(e) => {
                    summary.failed += 1;
                    error!("Error polling device {}: {}", id, e);
                },
            }
        }
        summary
    }

    async fn read_device(&self, device: &DeviceDescriptor) -> Result<PlcReading> {
        match device {
            DeviceDescriptor::Light(light) => Ok(PlcReading {
                on: self.read_bool(&light.status.on.address).await?,
                brightness: None,
            }),
            DeviceDescriptor::DimmableLight(dimmer) => Ok(PlcReading {
                on: self.read_bool(&dimmer.status.on.address).await?,
                brightness: Some(self.read_int(&dimmer.status.brightness.address).await?),
            }),
        }
    }

    async fn read_bool(&self, address: &str) -> Result<bool> {
        let value = self.link.read(address).await?;
        value.as_bool().ok_or_else(|| type_mismatch(address, "bool", &value))
    }

    async fn read_int(&self, address: &str) -> Result<i64> {
        let value = self.link.read(address).await?;
        value.as_i64().ok_or_else(|| type_mismatch(address, "number", &value))
    }

    async fn publish_state(&self, state: &DeviceState) -> Result<()> {
        self.messaging
            .publish(
                &state_topic(&state.id),
                state.switch_state().as_payload().as_bytes().to_vec(),
                PublishOptions::default(),
            )
            .await?;

        match state.kind {
            DeviceKind::Light => {},
            DeviceKind::DimmableLight => {
                let level = state.brightness.unwrap_or(0).to_string();
                self.messaging
                    .publish(
                        &brightness_state_topic(&state.id),
                        level.into_bytes(),
                        PublishOptions::default(),
                    )
                    .await?;
            },
        }
        Ok(())
    }
}

fn find_device<'a>(config: &'a ControllerConfig, device_id: &str) -> Result<&'a DeviceDescriptor> {
    config
        .devices
        .iter()
        .find(|d| d.id() == device_id)
        .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_string()))
}

/// Writes needed to apply `command`, in execution order
fn plan_writes<'a>(
    device: &'a DeviceDescriptor,
    command: &DeviceCommand,
) -> Result<Vec<(&'a str, PlcValue)>> {
    if command.is_empty() {
        return Err(GatewayError::invalid_command(format!(
            "empty command for {}",
            device.id()
        )));
    }

    let mut writes = Vec::new();
    if let Some(state) = command.state {
        let trigger = device.switch_trigger(state).ok_or_else(|| {
            GatewayError::invalid_command(format!(
                "device {} has no {} trigger configured",
                device.id(),
                state
            ))
        })?;
        writes.push((trigger, PlcValue::Bool(true)));
    }

    if let Some(level) = command.brightness {
        match device {
            DeviceDescriptor::Light(light) => {
                return Err(GatewayError::invalid_command(format!(
                    "light {} does not support brightness",
                    light.id
                )));
            },
            DeviceDescriptor::DimmableLight(dimmer) => {
                let trigger = dimmer.command.brightness.as_ref().ok_or_else(|| {
                    GatewayError::invalid_command(format!(
                        "device {} has no brightness trigger configured",
                        dimmer.id
                    ))
                })?;
                writes.push((dimmer.data.brightness.address.as_str(), PlcValue::Int(level)));
                writes.push((trigger.address.as_str(), PlcValue::Bool(true)));
            },
        }
    }
    Ok(writes)
}

fn type_mismatch(address: &str, expected: &str, value: &PlcValue) -> GatewayError {
    GatewayError::operation_failed(format!(
        "expected {} at {}, got {} ({})",
        expected,
        address,
        value.type_name(),
        value
    ))
}

fn decode_switch(payload: &str) -> Result<DeviceCommand> {
    Ok(DeviceCommand::switch(payload.parse()?))
}

fn decode_brightness(payload: &str) -> Result<DeviceCommand> {
    Ok(DeviceCommand::brightness(parse_brightness(payload)?))
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        },
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{
        AddressRef, BrightnessData, DimmableCommands, DimmableLightDevice, DimmableStatus,
        LightDevice, LightStatus, SwitchCommands,
    };
    use crate::devices::SwitchState;

    fn light(with_off: bool) -> DeviceDescriptor {
        DeviceDescriptor::Light(LightDevice {
            id: "light1".into(),
            friendly_name: "Kitchen".into(),
            status: LightStatus {
                on: AddressRef::new("DB1,X0.0"),
            },
            command: SwitchCommands {
                on: Some(AddressRef::new("DB1,X0.1")),
                off: with_off.then(|| AddressRef::new("DB1,X0.2")),
            },
            data: None,
        })
    }

    fn dimmer() -> DeviceDescriptor {
        DeviceDescriptor::DimmableLight(DimmableLightDevice {
            id: "dimmer1".into(),
            friendly_name: "Hall".into(),
            status: DimmableStatus {
                on: AddressRef::new("DB2,X0.0"),
                brightness: AddressRef::new("DB2,INT2"),
            },
            command: DimmableCommands {
                on: None,
                off: None,
                brightness: Some(AddressRef::new("DB2,X0.3")),
            },
            data: BrightnessData {
                brightness: AddressRef::new("DB2,INT4"),
            },
        })
    }

    #[test]
    fn test_plan_switch_write() {
        let device = light(true);
        let writes = plan_writes(&device, &DeviceCommand::switch(SwitchState::Off)).unwrap();
        assert_eq!(writes, vec![("DB1,X0.2", PlcValue::Bool(true))]);
    }

    #[test]
    fn test_plan_brightness_value_before_trigger() {
        let device = dimmer();
        let writes = plan_writes(&device, &DeviceCommand::brightness(80)).unwrap();
        assert_eq!(
            writes,
            vec![
                ("DB2,INT4", PlcValue::Int(80)),
                ("DB2,X0.3", PlcValue::Bool(true)),
            ]
        );
    }

    #[test]
    fn test_plan_rejects_invalid_commands() {
        let plain = light(false);
        assert!(matches!(
            plan_writes(&plain, &DeviceCommand::default()),
            Err(GatewayError::InvalidCommand(_))
        ));
        assert!(matches!(
            plan_writes(&plain, &DeviceCommand::brightness(10)),
            Err(GatewayError::InvalidCommand(_))
        ));
        assert!(matches!(
            plan_writes(&plain, &DeviceCommand::switch(SwitchState::Off)),
            Err(GatewayError::InvalidCommand(_))
        ));
        assert!(matches!(
            plan_writes(&dimmer(), &DeviceCommand::switch(SwitchState::On)),
            Err(GatewayError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_decoders() {
        assert_eq!(
            decode_switch("ON").unwrap(),
            DeviceCommand::switch(SwitchState::On)
        );
        assert!(decode_switch("{\"state\":\"ON\"}").is_err());
        assert_eq!(decode_brightness("200").unwrap(), DeviceCommand::brightness(200));
    }

    #[test]
    fn test_lifecycle_display() {
        assert_eq!(ControllerState::ShuttingDown.to_string(), "shutting down");
    }
}
