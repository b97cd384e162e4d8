//! Radio transport boundary.
//!
//! The engine never performs I/O itself. It calls a [`Transport`] to start
//! radio operations and is told about their completion through the engine's
//! `on_*` inputs.

use crate::AdapterStatus;
use thiserror::Error;
use uuid::Uuid;

/// A discovered vehicle peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    /// Platform identifier (address or UUID).
    pub id: String,
    /// Advertised local name.
    pub name: String,
    /// Signal strength at discovery, if known.
    pub rssi: Option<i16>,
}

impl Peripheral {
    /// Create a peripheral description.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Peripheral {
            id: id.into(),
            name: name.into(),
            rssi: None,
        }
    }
}

/// Synchronous refusal of a transport request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Adapter cannot be used.
    #[error("adapter unavailable")]
    Unavailable,
    /// No link to write to or tear down.
    #[error("not connected")]
    NotConnected,
    /// Platform refused the request.
    #[error("{0}")]
    Refused(String),
}

/// Radio operations the engine drives.
///
/// Every method returns immediately. Outcomes of `connect`, `write` and
/// `disconnect` arrive later as engine inputs.
pub trait Transport {
    /// Current adapter status.
    fn adapter_status(&self) -> AdapterStatus;

    /// Start scanning for peripherals advertising `service_uuid`.
    fn start_scan(&mut self, service_uuid: &Uuid) -> Result<(), TransportError>;

    /// Stop scanning.
    fn stop_scan(&mut self) -> Result<(), TransportError>;

    /// Request a link to `peripheral`.
    fn connect(&mut self, peripheral: &Peripheral) -> Result<(), TransportError>;

    /// Write one encoded frame to the vehicle.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Request link teardown.
    fn disconnect(&mut self) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn adapter_status(&self) -> AdapterStatus {
        (**self).adapter_status()
    }

    fn start_scan(&mut self, service_uuid: &Uuid) -> Result<(), TransportError> {
        (**self).start_scan(service_uuid)
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        (**self).stop_scan()
    }

    fn connect(&mut self, peripheral: &Peripheral) -> Result<(), TransportError> {
        (**self).connect(peripheral)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(data)
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        (**self).disconnect()
    }
}

/// Transport that records every request and completes nothing on its own.
///
/// Used by tests and dry runs; the caller feeds completions back into the
/// engine by hand.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    /// Adapter status reported to the engine.
    pub adapter: AdapterStatus,
    /// Whether a scan is running.
    pub scanning: bool,
    /// Peripheral of the last accepted connect.
    pub connected_to: Option<Peripheral>,
    /// Every frame written, in order.
    pub writes: Vec<Vec<u8>>,
    /// Number of disconnect requests.
    pub disconnects: usize,
    /// Refuse the next connect with this message.
    pub refuse_connect: Option<String>,
    /// Refuse the next disconnect with this message.
    pub refuse_disconnect: Option<String>,
}

impl RecordingTransport {
    /// Create a transport with the adapter powered on.
    pub fn powered_on() -> Self {
        RecordingTransport {
            adapter: AdapterStatus::PoweredOn,
            ..Default::default()
        }
    }

    /// Remove and return the writes recorded so far.
    pub fn take_writes(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.writes)
    }
}

impl Transport for RecordingTransport {
    fn adapter_status(&self) -> AdapterStatus {
        self.adapter
    }

    fn start_scan(&mut self, _service_uuid: &Uuid) -> Result<(), TransportError> {
        if !self.adapter.is_available() {
            return Err(TransportError::Unavailable);
        }
        self.scanning = true;
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.scanning = false;
        Ok(())
    }

    fn connect(&mut self, peripheral: &Peripheral) -> Result<(), TransportError> {
        if let Some(reason) = self.refuse_connect.take() {
            return Err(TransportError::Refused(reason));
        }
        self.connected_to = Some(peripheral.clone());
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.connected_to.is_none() {
            return Err(TransportError::NotConnected);
        }
        self.writes.push(data.to_vec());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.disconnects += 1;
        if let Some(reason) = self.refuse_disconnect.take() {
            return Err(TransportError::Refused(reason));
        }
        self.connected_to = None;
        Ok(())
    }
}
