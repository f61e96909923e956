//! PLC link: serialized access to one field-bus session
//!
//! Every read and write is queued and executed strictly one at a time, in
//! submission order, by a single worker task. The worker is an explicit
//! two-state machine:
//!
//! ```text
//!   Idle --enqueue--> Busy --queue drained--> Idle
//! ```
//!
//! A write that the driver reports as busy keeps its place at the head of
//! the line and is retried after `busy_retry_delay`.
//!
//! When the driver loses its session, the operation that hit the failure is
//! failed and the worker reopens the session under the link's
//! [`ReconnectPolicy`] before it dispatches anything else. Once the first
//! attempt has failed, operations are refused with `NotConnected` until the
//! session is back. If the policy gives up, the link closes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::driver::{Address, DriverError, FieldBusDriver, PlcValue};
use crate::core::config::S7Endpoint;
use crate::core::reconnect::{Backoff, ReconnectPolicy};
use crate::error::{GatewayError, Result};

/// Default operation queue bound
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;
/// Default delay before retrying a busy write
pub const DEFAULT_BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Default number of busy retries before a write is failed
pub const DEFAULT_MAX_BUSY_RETRIES: u32 = 100;

/// Queue and retry tuning for a [`PlcLink`]
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    pub max_queue_size: usize,
    pub busy_retry_delay: Duration,
    /// `None` retries busy writes until they succeed or the link disconnects
    pub max_busy_retries: Option<u32>,
    /// Backoff for reopening a session the driver lost
    pub reconnect: ReconnectPolicy,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            busy_retry_delay: DEFAULT_BUSY_RETRY_DELAY,
            max_busy_retries: Some(DEFAULT_MAX_BUSY_RETRIES),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Dispatch state of the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
}

// ============================================================================
// Operations
// ============================================================================

enum Operation {
    Read {
        address: Address,
        reply: oneshot::Sender<Result<PlcValue>>,
    },
    Write {
        address: Address,
        value: PlcValue,
        busy_count: u32,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl Operation {
    fn describe(&self) -> String {
        match self {
            Self::Read { address, .. } => format!("read {}", address),
            Self::Write { address, value, .. } => format!("write {}={}", address, value),
        }
    }

    fn reject(self, err: GatewayError) {
        // Receiver may already be gone; nobody is left to tell
        match self {
            Self::Read { reply, .. } => {
                let _ = reply.send(Err(err));
            },
            Self::Write { reply, .. } => {
                let _ = reply.send(Err(err));
            },
        }
    }
}

/// Completion handle for a submitted operation
///
/// Resolves exactly once. If the link drops the operation without answering
/// (disconnect while it was in flight) it resolves to
/// [`GatewayError::Disconnected`].
#[must_use = "operations are queued regardless; await the handle to observe the result"]
pub struct PendingOperation<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> PendingOperation<T> {
    pub async fn wait(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Disconnected),
        }
    }
}

// ============================================================================
// Shared queue
// ============================================================================

struct OperationQueue {
    ops: VecDeque<Operation>,
    state: WorkerState,
    open: bool,
    /// Session lost and the first reconnect attempt failed
    reconnecting: bool,
}

struct LinkShared {
    queue: Mutex<OperationQueue>,
    wake: Notify,
}

impl LinkShared {
    fn new() -> Self {
        Self {
            queue: Mutex::new(OperationQueue {
                ops: VecDeque::new(),
                state: WorkerState::Idle,
                open: false,
                reconnecting: false,
            }),
            wake: Notify::new(),
        }
    }

    /// Mark the link closed and hand back everything still queued
    ///
    /// `None` when it was already closed.
    fn close(&self) -> Option<VecDeque<Operation>> {
        let mut queue = self.queue.lock();
        if !queue.open {
            return None;
        }
        queue.open = false;
        queue.reconnecting = false;
        queue.state = WorkerState::Idle;
        Some(std::mem::take(&mut queue.ops))
    }
}

// ============================================================================
// PlcLink
// ============================================================================

/// Serialized, bounded access to one PLC
pub struct PlcLink {
    endpoint: S7Endpoint,
    driver: Arc<dyn FieldBusDriver>,
    settings: LinkSettings,
    shared: Arc<LinkShared>,
    worker: Option<JoinHandle<()>>,
}

impl PlcLink {
    pub fn new(endpoint: S7Endpoint, driver: Arc<dyn FieldBusDriver>) -> Self {
        Self::with_settings(endpoint, driver, LinkSettings::default())
    }

    pub fn with_settings(
        endpoint: S7Endpoint,
        driver: Arc<dyn FieldBusDriver>,
        settings: LinkSettings,
    ) -> Self {
        Self {
            endpoint,
            driver,
            settings,
            shared: Arc::new(LinkShared::new()),
            worker: None,
        }
    }

    /// The link is open; see [`is_reconnecting`](Self::is_reconnecting) for
    /// whether the session behind it is currently up
    pub fn is_connected(&self) -> bool {
        self.shared.queue.lock().open
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared.queue.lock().reconnecting
    }

    /// Operations waiting behind the one currently dispatched
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().ops.len()
    }

    pub fn worker_state(&self) -> WorkerState {
        self.shared.queue.lock().state
    }

    /// Open the field-bus session and start the worker
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            error!("S7 service already connected to {}", self.endpoint);
            return Err(GatewayError::connection("S7 service already connected"));
        }

        info!("Connecting to PLC at {} via {}", self.endpoint, self.driver.name());
        self.driver.connect(&self.endpoint).await.map_err(|e| {
            error!("Failed to connect to PLC at {}: {}", self.endpoint, e);
            GatewayError::connection(format!(
                "Failed to connect to PLC at {}: {}",
                self.endpoint, e
            ))
        })?;

        {
            let mut queue = self.shared.queue.lock();
            queue.open = true;
            queue.reconnecting = false;
            queue.state = WorkerState::Idle;
        }

        self.worker = Some(tokio::spawn(run_worker(
            Arc::clone(&self.shared),
            Arc::clone(&self.driver),
            self.endpoint.clone(),
            self.settings.clone(),
        )));

        info!("Connected to PLC at {}", self.endpoint);
        Ok(())
    }

    /// Close the session
    ///
    /// Every queued operation is rejected with [`GatewayError::Disconnected`];
    /// an operation already handed to the driver is abandoned and its caller
    /// sees the same error.
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(rejected) = self.shared.close() else {
            return Err(GatewayError::NotConnected);
        };

        if !rejected.is_empty() {
            warn!(
                "Rejecting {} queued PLC operation(s) on disconnect",
                rejected.len()
            );
        }
        for op in rejected {
            op.reject(GatewayError::Disconnected);
        }

        if let Some(worker) = self.worker.take() {
            worker.abort();
        }

        self.driver.disconnect().await.map_err(|e| {
            GatewayError::connection(format!(
                "Failed to disconnect from PLC at {}: {}",
                self.endpoint, e
            ))
        })?;

        info!("Disconnected from PLC at {}", self.endpoint);
        Ok(())
    }

    /// Queue a read without waiting for it
    pub fn submit_read(&self, address: &str) -> Result<PendingOperation<PlcValue>> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Operation::Read {
            address: address.to_string(),
            reply,
        })?;
        Ok(PendingOperation { rx })
    }

    /// Queue a write without waiting for it
    pub fn submit_write(
        &self,
        address: &str,
        value: impl Into<PlcValue>,
    ) -> Result<PendingOperation<()>> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Operation::Write {
            address: address.to_string(),
            value: value.into(),
            busy_count: 0,
            reply,
        })?;
        Ok(PendingOperation { rx })
    }

    pub async fn read(&self, address: &str) -> Result<PlcValue> {
        self.submit_read(address)?.wait().await
    }

    pub async fn write(&self, address: &str, value: impl Into<PlcValue>) -> Result<()> {
        self.submit_write(address, value)?.wait().await
    }

    fn enqueue(&self, op: Operation) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if !queue.open || queue.reconnecting {
            return Err(GatewayError::NotConnected);
        }
        if queue.ops.len() >= self.settings.max_queue_size {
            warn!(
                "Operation queue is full ({}), rejecting {}",
                self.settings.max_queue_size,
                op.describe()
            );
            return Err(GatewayError::QueueFull(self.settings.max_queue_size));
        }

        debug!("Queued {} (queue length {})", op.describe(), queue.ops.len() + 1);
        queue.ops.push_back(op);

        if queue.state == WorkerState::Idle {
            queue.state = WorkerState::Busy;
            drop(queue);
            self.shared.wake.notify_one();
        }
        Ok(())
    }
}

impl Drop for PlcLink {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker(
    shared: Arc<LinkShared>,
    driver: Arc<dyn FieldBusDriver>,
    endpoint: S7Endpoint,
    settings: LinkSettings,
) {
    // Busy write waiting for its retry; it stays ahead of everything queued
    let mut head: Option<Operation> = None;

    loop {
        let op = match head.take() {
            Some(op) => {
                if !shared.queue.lock().open {
                    op.reject(GatewayError::Disconnected);
                    return;
                }
                op
            },
            None => {
                let next = {
                    let mut queue = shared.queue.lock();
                    if !queue.open {
                        return;
                    }
                    match queue.ops.pop_front() {
                        Some(op) => Some(op),
                        None => {
                            queue.state = WorkerState::Idle;
                            None
                        },
                    }
                };
                match next {
                    Some(op) => op,
                    None => {
                        shared.wake.notified().await;
                        continue;
                    },
                }
            },
        };

        debug!("Dispatching {}", op.describe());
        match dispatch(driver.as_ref(), op, &settings).await {
            Dispatched::Done => {},
            Dispatched::Retry(op) => {
                head = Some(op);
                tokio::time::sleep(settings.busy_retry_delay).await;
            },
            Dispatched::SessionLost => {
                if !reopen_session(&shared, driver.as_ref(), &endpoint, &settings.reconnect).await {
                    return;
                }
            },
        }
    }
}

/// What the worker does after handing one operation to the driver
enum Dispatched {
    Done,
    /// Busy write to put back at the head of the line
    Retry(Operation),
    /// The operation was failed and the driver needs a new session
    SessionLost,
}

/// Run one operation and answer its caller unless it has to be retried
async fn dispatch(
    driver: &dyn FieldBusDriver,
    op: Operation,
    settings: &LinkSettings,
) -> Dispatched {
    match op {
        Operation::Read { address, reply } => match read_single(driver, &address).await {
            Ok(value) => {
                let _ = reply.send(Ok(value));
                Dispatched::Done
            },
            Err(e) => {
                error!("Read of {} failed: {}", address, e);
                let _ = reply.send(Err(GatewayError::operation_failed(format!(
                    "Read of {} failed: {}",
                    address, e
                ))));
                after_failure(&e)
            },
        },
        Operation::Write {
            address,
            value,
            busy_count,
            reply,
        } => match driver.write_address(&address, &value).await {
            Ok(()) => {
                debug!("Wrote {}={}", address, value);
                let _ = reply.send(Ok(()));
                Dispatched::Done
            },
            Err(DriverError::Busy) => {
                let busy_count = busy_count + 1;
                if settings
                    .max_busy_retries
                    .is_some_and(|max| busy_count > max)
                {
                    warn!(
                        "PLC still busy after {} attempts, giving up on write to {}",
                        busy_count, address
                    );
                    let _ = reply.send(Err(GatewayError::operation_failed(format!(
                        "Write to {} failed: PLC busy after {} attempts",
                        address, busy_count
                    ))));
                    return Dispatched::Done;
                }
                warn!(
                    "PLC busy, retrying write to {} in {:?}",
                    address, settings.busy_retry_delay
                );
                Dispatched::Retry(Operation::Write {
                    address,
                    value,
                    busy_count,
                    reply,
                })
            },
            Err(e) => {
                error!("Write to {} failed: {}", address, e);
                let _ = reply.send(Err(GatewayError::operation_failed(format!(
                    "Write to {} failed: {}",
                    address, e
                ))));
                after_failure(&e)
            },
        },
    }
}

fn after_failure(err: &DriverError) -> Dispatched {
    if err.is_session_lost() {
        Dispatched::SessionLost
    } else {
        Dispatched::Done
    }
}

/// Register the address for one transaction, read it, and pull its value out
async fn read_single(
    driver: &dyn FieldBusDriver,
    address: &str,
) -> std::result::Result<PlcValue, DriverError> {
    let items = [address.to_string()];
    let mut values = driver.read_addresses(&items).await?;
    values
        .remove(address)
        .ok_or_else(|| DriverError::failed(format!("no value returned for {}", address)))
}

/// Reconnect the driver after it lost its session
///
/// Operations queued behind the failed one wait for the first attempt only.
/// Returns `false` when the worker must stop: the link was disconnected
/// meanwhile, or the policy ran out of attempts and the link was closed.
async fn reopen_session(
    shared: &LinkShared,
    driver: &dyn FieldBusDriver,
    endpoint: &S7Endpoint,
    policy: &ReconnectPolicy,
) -> bool {
    warn!("Lost PLC session at {}, reconnecting", endpoint);
    let mut backoff = Backoff::new(policy.clone());

    loop {
        if !shared.queue.lock().open {
            return false;
        }

        let err = match driver.connect(endpoint).await {
            Ok(()) => {
                shared.queue.lock().reconnecting = false;
                info!("Reconnected to PLC at {}", endpoint);
                return true;
            },
            Err(e) => e,
        };

        let waiting = {
            let mut queue = shared.queue.lock();
            queue.reconnecting = true;
            std::mem::take(&mut queue.ops)
        };
        for op in waiting {
            op.reject(GatewayError::NotConnected);
        }

        let Some(delay) = backoff.next_delay() else {
            error!(
                "Giving up on PLC at {} after {} reconnect attempts: {}",
                endpoint, policy.max_attempts, err
            );
            if let Some(rejected) = shared.close() {
                for op in rejected {
                    op.reject(GatewayError::Disconnected);
                }
            }
            return false;
        };
        warn!(
            "Reconnect to PLC at {} failed: {}. Retrying in {:?}",
            endpoint, err, delay
        );
        tokio::time::sleep(delay).await;
    }
}
