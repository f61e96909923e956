//! Siemens S7 driver over ISO-on-TCP
//!
//! One TCP session per driver. A write that finds the session occupied by
//! another request reports [`DriverError::Busy`] instead of queueing behind
//! it; the PLC link owns retrying.

pub mod address;
pub mod frame;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use address::S7Address;

use super::driver::{Address, DriverError, FieldBusDriver, PlcValue};
use crate::core::config::S7Endpoint;

/// Timeouts and negotiation parameters
#[derive(Debug, Clone)]
pub struct S7Settings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// PDU size proposed during setup; the PLC may answer with less
    pub pdu_size: u16,
}

impl Default for S7Settings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(3),
            pdu_size: 480,
        }
    }
}

struct Session {
    stream: TcpStream,
    pdu_size: u16,
}

/// S7comm [`FieldBusDriver`]
pub struct S7Driver {
    settings: S7Settings,
    session: Mutex<Option<Session>>,
    pdu_ref: AtomicU16,
}

impl Default for S7Driver {
    fn default() -> Self {
        Self::new()
    }
}

fn io_error(err: std::io::Error) -> DriverError {
    DriverError::failed(format!("I/O error: {}", err))
}

/// Send one frame and read back one TPKT frame
async fn exchange(
    stream: &mut TcpStream,
    request: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, DriverError> {
    let io = async {
        stream.write_all(request).await.map_err(io_error)?;

        let mut header = [0u8; frame::TPKT_HEADER_LEN];
        stream.read_exact(&mut header).await.map_err(io_error)?;
        let len = frame::tpkt_length(&header)?;

        let mut response = vec![0u8; len];
        response[..frame::TPKT_HEADER_LEN].copy_from_slice(&header);
        stream
            .read_exact(&mut response[frame::TPKT_HEADER_LEN..])
            .await
            .map_err(io_error)?;
        Ok::<_, DriverError>(response)
    };

    tokio::time::timeout(timeout, io)
        .await
        .map_err(|_| DriverError::failed(format!("no response within {:?}", timeout)))?
}

impl S7Driver {
    pub fn new() -> Self {
        Self::with_settings(S7Settings::default())
    }

    pub fn with_settings(settings: S7Settings) -> Self {
        Self {
            settings,
            session: Mutex::new(None),
            pdu_ref: AtomicU16::new(0),
        }
    }

    fn next_ref(&self) -> u16 {
        self.pdu_ref.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Exchange on the live session; a transport failure tears it down
    async fn roundtrip(
        &self,
        slot: &mut Option<Session>,
        request: &[u8],
    ) -> Result<Vec<u8>, DriverError> {
        let session = slot.as_mut().ok_or(DriverError::NotConnected)?;
        let result = exchange(&mut session.stream, request, self.settings.request_timeout).await;
        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("Dropping S7 session after transport failure: {}", e);
                *slot = None;
                Err(DriverError::ConnectionLost(e.to_string()))
            },
        }
    }

    /// Negotiated PDU size of the live session
    pub async fn pdu_size(&self) -> Option<u16> {
        self.session.lock().await.as_ref().map(|s| s.pdu_size)
    }
}

#[async_trait]
impl FieldBusDriver for S7Driver {
    fn name(&self) -> &'static str {
        "s7"
    }

    async fn connect(&self, endpoint: &S7Endpoint) -> Result<(), DriverError> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Err(DriverError::failed("already connected"));
        }

        let target = format!("{}:{}", endpoint.host, endpoint.port);
        let mut stream =
            tokio::time::timeout(self.settings.connect_timeout, TcpStream::connect(&target))
                .await
                .map_err(|_| DriverError::failed(format!("connect to {} timed out", target)))?
                .map_err(io_error)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY on {}: {}", target, e);
        }

        let request = frame::connect_request(
            frame::LOCAL_TSAP,
            frame::remote_tsap(endpoint.rack, endpoint.slot),
        );
        let response = exchange(&mut stream, &request, self.settings.request_timeout).await?;
        frame::check_connect_confirm(&response)?;

        let pdu_ref = self.next_ref();
        let request = frame::setup_communication(pdu_ref, self.settings.pdu_size);
        let response = exchange(&mut stream, &request, self.settings.request_timeout).await?;
        let pdu_size = frame::parse_setup_response(&response, pdu_ref)?;

        info!("S7 session established with {} (PDU size {})", endpoint, pdu_size);
        *slot = Some(Session { stream, pdu_size });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        let session = self.session.lock().await.take();
        match session {
            Some(mut session) => {
                if let Err(e) = session.stream.shutdown().await {
                    debug!("S7 socket shutdown: {}", e);
                }
                Ok(())
            },
            None => Err(DriverError::NotConnected),
        }
    }

    async fn read_addresses(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, PlcValue>, DriverError> {
        let parsed = addresses
            .iter()
            .map(|a| a.parse::<S7Address>())
            .collect::<Result<Vec<_>, _>>()?;

        let mut slot = self.session.lock().await;
        let mut values = HashMap::with_capacity(addresses.len());

        for (names, items) in addresses
            .chunks(frame::MAX_ITEMS_PER_REQUEST)
            .zip(parsed.chunks(frame::MAX_ITEMS_PER_REQUEST))
        {
            let pdu_ref = self.next_ref();
            let request = frame::read_request(pdu_ref, items);
            let response = self.roundtrip(&mut slot, &request).await?;
            let results = frame::parse_read_response(&response, pdu_ref, items.len())?;

            for ((name, item), result) in names.iter().zip(items).zip(results) {
                match result {
                    Ok(bytes) => {
                        values.insert(name.clone(), item.decode(&bytes)?);
                    },
                    Err(code) => {
                        return Err(DriverError::failed(format!(
                            "read of {} failed: {}",
                            name,
                            frame::describe_return_code(code)
                        )))
                    },
                }
            }
        }
        Ok(values)
    }

    async fn write_address(&self, address: &str, value: &PlcValue) -> Result<(), DriverError> {
        let target = address.parse::<S7Address>()?;
        let payload = target.encode(value)?;

        let mut slot = self.session.try_lock().map_err(|_| DriverError::Busy)?;
        let pdu_ref = self.next_ref();
        let request = frame::write_request(pdu_ref, &target, &payload);
        let response = self.roundtrip(&mut slot, &request).await?;
        frame::parse_write_response(&response, pdu_ref)
    }
}
