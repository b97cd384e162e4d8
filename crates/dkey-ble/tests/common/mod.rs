//! Shared harness: an engine wired to an in-process vehicle.

#![allow(dead_code)]

use crossbeam_channel::Receiver;
use dkey_ble::handshake::MSG_MOBILE_HELLO;
use dkey_ble::{
    ConnectionState, DigitalKeyEngine, EngineConfig, Peripheral, RecordingTransport,
    RejectReason, SessionEvent, VehicleResponder,
};
use dkey_frame::{decode_frame, encode_frame, CommandFrame, CommandType};
use dkey_keys::{
    DigitalKeyInfo, InstalledKey, KeyMaterial, Permission, PermissionScope,
};
use ed25519_dalek::SigningKey;

pub const VEHICLE_SEED: [u8; 32] = [0x11; 32];
pub const MOBILE_SEED: [u8; 32] = [0x22; 32];
pub const KEY_ID: &str = "dk-0001";
pub const VEHICLE_NAME: &str = "DKEY-TEST";

/// Key record granting near-field mask `0x03`.
pub fn key_info() -> DigitalKeyInfo {
    DigitalKeyInfo {
        dk_id: KEY_ID.to_string(),
        vin: "LVIN0000000000001".to_string(),
        permission_list: vec![Permission {
            permission_mask: "0x03".to_string(),
            permission_description: "doors".to_string(),
            permission_type: PermissionScope::Near,
            is_choice: true,
        }],
        ..Default::default()
    }
}

pub fn mobile_public_key() -> [u8; 32] {
    SigningKey::from_bytes(&MOBILE_SEED).verifying_key().to_bytes()
}

pub struct Harness {
    pub engine: DigitalKeyEngine<RecordingTransport>,
    pub events: Receiver<SessionEvent>,
    pub vehicle: VehicleResponder,
    /// Vehicle handshake reply (0-based) whose last byte gets flipped.
    pub tamper_round: Option<usize>,
    /// Rejection raised by the vehicle, if any.
    pub vehicle_rejection: Option<RejectReason>,
    /// Non-handshake frames the vehicle received.
    pub vehicle_rx: Vec<CommandFrame>,
    /// Every `MOBILE_HELLO` payload seen by the vehicle.
    pub hellos: Vec<Vec<u8>>,
    round: usize,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_vehicle(VehicleResponder::new(&VEHICLE_SEED))
    }

    pub fn with_vehicle(mut vehicle: VehicleResponder) -> Self {
        vehicle.trust(KEY_ID, &mobile_public_key()).unwrap();
        let material = KeyMaterial::new(MOBILE_SEED, vehicle.public_key());

        let (mut engine, events) = DigitalKeyEngine::new(
            EngineConfig::default(),
            b"test-device",
            RecordingTransport::powered_on(),
        )
        .unwrap();
        engine
            .keys_mut()
            .install(InstalledKey::new(key_info(), material));
        assert!(engine.set_current_key(KEY_ID));

        Harness {
            engine,
            events,
            vehicle,
            tamper_round: None,
            vehicle_rejection: None,
            vehicle_rx: Vec::new(),
            hellos: Vec::new(),
            round: 0,
        }
    }

    /// Events emitted since the last call.
    pub fn drain(&self) -> Vec<SessionEvent> {
        self.events.try_iter().collect()
    }

    /// Scan and discover the vehicle.
    pub fn find(&mut self) {
        assert!(self.engine.start_scan());
        assert!(self
            .engine
            .on_peripheral_found(Peripheral::new("AA:BB:CC:DD:EE:FF", VEHICLE_NAME)));
    }

    /// Connect to the found vehicle and run the handshake to completion.
    pub fn connect_and_pump(&mut self) {
        self.round = 0;
        self.engine.connect().unwrap();
        self.engine.on_connected();
        self.pump();
    }

    /// Full path from idle to authenticated.
    pub fn authenticate(&mut self) {
        self.find();
        self.connect_and_pump();
        assert_eq!(self.engine.state(), ConnectionState::Authenticated);
    }

    /// Complete every write and deliver it to the vehicle until nothing
    /// more is written.
    pub fn pump(&mut self) {
        loop {
            let writes = self.engine.transport_mut().take_writes();
            if writes.is_empty() {
                return;
            }
            for bytes in writes {
                self.engine.on_write_complete(Ok(()));
                self.deliver_to_vehicle(&bytes);
            }
        }
    }

    fn deliver_to_vehicle(&mut self, bytes: &[u8]) {
        let frame = match decode_frame(bytes, self.vehicle.session_key()) {
            Ok(frame) => frame,
            Err(e) => panic!("vehicle could not decode frame: {}", e),
        };
        if frame.command_type != CommandType::Auth {
            self.vehicle_rx.push(frame);
            return;
        }
        if frame.payload.first() == Some(&MSG_MOBILE_HELLO) {
            self.hellos.push(frame.payload.clone());
        }
        match self.vehicle.handle(&frame.payload) {
            Ok(mut reply) => {
                if self.tamper_round == Some(self.round) {
                    if let Some(last) = reply.last_mut() {
                        *last ^= 0x01;
                    }
                }
                self.round += 1;
                let reply = encode_frame(&CommandFrame::auth(reply), None).unwrap();
                self.engine.on_data(&reply);
            }
            Err(reason) => self.vehicle_rejection = Some(reason),
        }
    }

    /// Send a frame from the vehicle under its session key.
    pub fn vehicle_send(&mut self, frame: CommandFrame) {
        let bytes = encode_frame(&frame, self.vehicle.session_key()).unwrap();
        self.engine.on_data(&bytes);
    }
}
