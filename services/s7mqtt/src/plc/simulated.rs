//! Simulated field-bus driver
//!
//! Keeps PLC memory in a map and reacts to trigger writes the way the light
//! programs on the PLC do, so the gateway can run end to end without
//! hardware. Faults (busy, stalls, failing addresses) can be injected for
//! testing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::driver::{Address, DriverError, FieldBusDriver, PlcValue};
use crate::core::config::{DeviceDescriptor, S7Endpoint};

/// What a trigger write does to PLC memory
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerEffect {
    Set { address: Address, value: PlcValue },
    Copy { from: Address, to: Address },
}

#[derive(Default)]
struct SimState {
    connected: bool,
    registers: HashMap<Address, PlcValue>,
    triggers: HashMap<Address, Vec<TriggerEffect>>,
    write_log: Vec<(Address, PlcValue)>,
    read_count: usize,
    connect_count: usize,
    // Fault injection
    fail_connect: bool,
    fail_disconnect: bool,
    busy_writes: u32,
    busy_signals: u32,
    stall_writes: bool,
    failing: HashSet<Address>,
    latency: Option<Duration>,
}

/// In-memory [`FieldBusDriver`]
#[derive(Default)]
pub struct SimulatedDriver {
    state: Mutex<SimState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory map and trigger wiring for the given devices
    ///
    /// Status addresses start off / zero. `command.on` sets `status.on`,
    /// `command.off` clears it, `command.brightness` copies
    /// `data.brightness` into `status.brightness` and switches the light on.
    pub fn for_devices(devices: &[DeviceDescriptor]) -> Self {
        let driver = Self::new();
        for device in devices {
            match device {
                DeviceDescriptor::Light(light) => {
                    let on = &light.status.on.address;
                    driver.set_value(on, false);
                    driver.wire_switch(on, &light.command.on, &light.command.off);
                },
                DeviceDescriptor::DimmableLight(dimmer) => {
                    let on = &dimmer.status.on.address;
                    let brightness = &dimmer.status.brightness.address;
                    let data = &dimmer.data.brightness.address;
                    driver.set_value(on, false);
                    driver.set_value(brightness, 0);
                    driver.set_value(data, 0);
                    driver.wire_switch(on, &dimmer.command.on, &dimmer.command.off);
                    if let Some(trigger) = &dimmer.command.brightness {
                        driver.add_trigger(
                            &trigger.address,
                            TriggerEffect::Copy {
                                from: data.clone(),
                                to: brightness.clone(),
                            },
                        );
                        driver.add_trigger(
                            &trigger.address,
                            TriggerEffect::Set {
                                address: on.clone(),
                                value: PlcValue::Bool(true),
                            },
                        );
                    }
                },
            }
        }
        driver
    }

    fn wire_switch(
        &self,
        status: &str,
        on: &Option<crate::core::config::AddressRef>,
        off: &Option<crate::core::config::AddressRef>,
    ) {
        for (trigger, value) in [(on, true), (off, false)] {
            if let Some(trigger) = trigger {
                self.add_trigger(
                    &trigger.address,
                    TriggerEffect::Set {
                        address: status.to_string(),
                        value: PlcValue::Bool(value),
                    },
                );
            }
        }
    }

    pub fn set_value(&self, address: &str, value: impl Into<PlcValue>) {
        self.state
            .lock()
            .registers
            .insert(address.to_string(), value.into());
    }

    pub fn value(&self, address: &str) -> Option<PlcValue> {
        self.state.lock().registers.get(address).cloned()
    }

    pub fn add_trigger(&self, trigger: &str, effect: TriggerEffect) {
        self.state
            .lock()
            .triggers
            .entry(trigger.to_string())
            .or_default()
            .push(effect);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.state.lock().fail_disconnect = fail;
    }

    /// Report busy for the next `count` writes
    pub fn set_busy_writes(&self, count: u32) {
        self.state.lock().busy_writes = count;
    }

    /// Writes never complete while set
    pub fn set_stall_writes(&self, stall: bool) {
        self.state.lock().stall_writes = stall;
    }

    /// Reads and writes touching `address` fail
    pub fn fail_address(&self, address: &str) {
        self.state.lock().failing.insert(address.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// Forget the session, as a PLC restart would
    pub fn drop_session(&self) {
        self.state.lock().connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Successful writes in the order they were applied
    pub fn writes(&self) -> Vec<(Address, PlcValue)> {
        self.state.lock().write_log.clone()
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().read_count
    }

    /// Sessions opened so far
    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_count
    }

    pub fn busy_signals(&self) -> u32 {
        self.state.lock().busy_signals
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of driver calls ever observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Option<Duration> {
        self.state.lock().latency
    }
}

#[async_trait]
impl FieldBusDriver for SimulatedDriver {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn connect(&self, endpoint: &S7Endpoint) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.fail_connect {
            return Err(DriverError::failed(format!(
                "connection refused by {}",
                endpoint
            )));
        }
        if state.connected {
            return Err(DriverError::failed("already connected"));
        }
        state.connected = true;
        state.connect_count += 1;
        info!("Simulated PLC session opened for {}", endpoint);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.connected = false;
        if state.fail_disconnect {
            return Err(DriverError::failed("session teardown failed"));
        }
        Ok(())
    }

    async fn read_addresses(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, PlcValue>, DriverError> {
        let _guard = InFlightGuard::enter(&self.in_flight, &self.max_in_flight);
        if let Some(latency) = self.latency() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        state.read_count += 1;

        let mut values = HashMap::with_capacity(addresses.len());
        for address in addresses {
            if state.failing.contains(address) {
                return Err(DriverError::failed(format!("read of {} failed", address)));
            }
            let value = state
                .registers
                .get(address)
                .cloned()
                .ok_or_else(|| DriverError::failed(format!("address {} not mapped", address)))?;
            values.insert(address.clone(), value);
        }
        Ok(values)
    }

    async fn write_address(&self, address: &str, value: &PlcValue) -> Result<(), DriverError> {
        let _guard = InFlightGuard::enter(&self.in_flight, &self.max_in_flight);
        if let Some(latency) = self.latency() {
            tokio::time::sleep(latency).await;
        }

        let stall = self.state.lock().stall_writes;
        if stall {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        if state.busy_writes > 0 {
            state.busy_writes -= 1;
            state.busy_signals += 1;
            return Err(DriverError::Busy);
        }
        if state.failing.contains(address) {
            return Err(DriverError::failed(format!("write of {} failed", address)));
        }

        state.write_log.push((address.to_string(), value.clone()));

        let effects = state.triggers.get(address).cloned();
        match effects {
            // Trigger bits are edge-driven; the PLC program resets them
            Some(effects) if value.as_bool() == Some(true) => {
                for effect in effects {
                    match effect {
                        TriggerEffect::Set { address, value } => {
                            state.registers.insert(address, value);
                        },
                        TriggerEffect::Copy { from, to } => {
                            if let Some(v) = state.registers.get(&from).cloned() {
                                state.registers.insert(to, v);
                            }
                        },
                    }
                }
                state.registers.insert(address.to_string(), PlcValue::Bool(false));
                debug!("Simulated trigger {} fired", address);
            },
            _ => {
                state.registers.insert(address.to_string(), value.clone());
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{
        AddressRef, BrightnessData, DimmableCommands, DimmableLightDevice, DimmableStatus,
    };

    fn dimmer() -> DeviceDescriptor {
        DeviceDescriptor::DimmableLight(DimmableLightDevice {
            id: "dimmer1".into(),
            friendly_name: "Dimmer".into(),
            status: DimmableStatus {
                on: AddressRef::new("DB1,X2.0"),
                brightness: AddressRef::new("DB1,INT4"),
            },
            command: DimmableCommands {
                on: Some(AddressRef::new("DB1,X2.1")),
                off: Some(AddressRef::new("DB1,X2.2")),
                brightness: Some(AddressRef::new("DB1,X2.3")),
            },
            data: BrightnessData {
                brightness: AddressRef::new("DB1,INT6"),
            },
        })
    }

    #[tokio::test]
    async fn test_brightness_trigger_copies_data() {
        let driver = SimulatedDriver::for_devices(&[dimmer()]);
        driver.connect(&S7Endpoint::new("sim")).await.unwrap();

        driver
            .write_address("DB1,INT6", &PlcValue::Int(80))
            .await
            .unwrap();
        driver
            .write_address("DB1,X2.3", &PlcValue::Bool(true))
            .await
            .unwrap();

        assert_eq!(driver.value("DB1,INT4"), Some(PlcValue::Int(80)));
        assert_eq!(driver.value("DB1,X2.0"), Some(PlcValue::Bool(true)));
        assert_eq!(driver.value("DB1,X2.3"), Some(PlcValue::Bool(false)));
    }

    #[tokio::test]
    async fn test_off_trigger_clears_status() {
        let driver = SimulatedDriver::for_devices(&[dimmer()]);
        driver.connect(&S7Endpoint::new("sim")).await.unwrap();
        driver.set_value("DB1,X2.0", true);

        driver
            .write_address("DB1,X2.2", &PlcValue::Bool(true))
            .await
            .unwrap();

        let values = driver
            .read_addresses(&["DB1,X2.0".to_string()])
            .await
            .unwrap();
        assert_eq!(values["DB1,X2.0"], PlcValue::Bool(false));
    }

    #[tokio::test]
    async fn test_busy_then_success() {
        let driver = SimulatedDriver::new();
        driver.connect(&S7Endpoint::new("sim")).await.unwrap();
        driver.set_busy_writes(1);

        let first = driver.write_address("M0.0", &PlcValue::Bool(true)).await;
        assert_eq!(first, Err(DriverError::Busy));
        driver
            .write_address("M0.0", &PlcValue::Bool(true))
            .await
            .unwrap();
        assert_eq!(driver.busy_signals(), 1);
        assert_eq!(driver.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_unmapped_read_fails() {
        let driver = SimulatedDriver::new();
        driver.connect(&S7Endpoint::new("sim")).await.unwrap();
        let result = driver.read_addresses(&["DB9,INT0".to_string()]).await;
        assert!(matches!(result, Err(DriverError::Failed(_))));
    }
}
