//! In-process radio.
//!
//! [`LoopbackTransport`] accepts every request and posts it as a
//! [`RadioOp`] on a channel. The runner drains the channel and plays the
//! completions back into the engine.

use crossbeam_channel::Sender;
use dkey_ble::{AdapterStatus, Peripheral, Transport, TransportError};
use tracing::trace;
use uuid::Uuid;

/// A radio request made by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioOp {
    StartScan,
    StopScan,
    Connect(Peripheral),
    Write(Vec<u8>),
    Disconnect,
}

/// Transport that forwards requests to the simulation loop.
#[derive(Debug)]
pub struct LoopbackTransport {
    adapter: AdapterStatus,
    connected: bool,
    ops: Sender<RadioOp>,
}

impl LoopbackTransport {
    /// Create a powered-on transport posting to `ops`.
    pub fn new(ops: Sender<RadioOp>) -> Self {
        LoopbackTransport {
            adapter: AdapterStatus::PoweredOn,
            connected: false,
            ops,
        }
    }

    /// Change the reported adapter status.
    pub fn set_adapter(&mut self, status: AdapterStatus) {
        self.adapter = status;
        if !status.is_available() {
            self.connected = false;
        }
    }

    fn post(&self, op: RadioOp) -> Result<(), TransportError> {
        trace!("Loopback: {:?}", op);
        self.ops
            .send(op)
            .map_err(|_| TransportError::Refused("simulation stopped".to_string()))
    }
}

impl Transport for LoopbackTransport {
    fn adapter_status(&self) -> AdapterStatus {
        self.adapter
    }

    fn start_scan(&mut self, service_uuid: &Uuid) -> Result<(), TransportError> {
        if !self.adapter.is_available() {
            return Err(TransportError::Unavailable);
        }
        trace!("Loopback: scanning for {}", service_uuid);
        self.post(RadioOp::StartScan)
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.post(RadioOp::StopScan)
    }

    fn connect(&mut self, peripheral: &Peripheral) -> Result<(), TransportError> {
        if !self.adapter.is_available() {
            return Err(TransportError::Unavailable);
        }
        self.connected = true;
        self.post(RadioOp::Connect(peripheral.clone()))
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.post(RadioOp::Write(data.to_vec()))
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.connected = false;
        self.post(RadioOp::Disconnect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_requires_connect() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut transport = LoopbackTransport::new(tx);
        assert_eq!(transport.write(&[1]), Err(TransportError::NotConnected));

        let peripheral = Peripheral::new("A", "DKEY");
        transport.connect(&peripheral).unwrap();
        transport.write(&[1]).unwrap();
        transport.disconnect().unwrap();
        assert_eq!(transport.disconnect(), Err(TransportError::NotConnected));

        let ops: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            ops,
            vec![
                RadioOp::Connect(peripheral),
                RadioOp::Write(vec![1]),
                RadioOp::Disconnect
            ]
        );
    }

    #[test]
    fn test_adapter_off_refuses() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut transport = LoopbackTransport::new(tx);
        transport.set_adapter(AdapterStatus::PoweredOff);
        assert_eq!(transport.start_scan(&dkey_ble::short_uuid(0xfff0)), Err(TransportError::Unavailable));
    }
}
