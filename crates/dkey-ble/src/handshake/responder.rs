//! Vehicle side of the signed ECDH handshake.
//!
//! Used by the simulator and by tests to stand in for real vehicle firmware.

use super::*;
use crate::{DeviceFingerprint, EngineError, EngineResult};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use std::collections::HashMap;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};

enum Stage {
    AwaitHello,
    AwaitProof {
        mobile: VerifyingKey,
        schedule: KeySchedule,
        th1: [u8; 32],
    },
    AwaitConfirm {
        schedule: KeySchedule,
        th1: [u8; 32],
    },
    Done,
}

/// Vehicle-side handshake state machine.
pub struct VehicleResponder {
    signing_key: SigningKey,
    trusted: HashMap<String, VerifyingKey>,
    ledger: ChallengeLedger,
    result_status: u8,
    stage: Stage,
    peer: Option<DeviceFingerprint>,
    session_key: Option<SessionKey>,
}

impl std::fmt::Debug for VehicleResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VehicleResponder")
            .field("trusted", &self.trusted.keys().collect::<Vec<_>>())
            .field("result_status", &self.result_status)
            .field("peer", &self.peer)
            .field("session_key", &self.session_key)
            .finish()
    }
}

impl VehicleResponder {
    /// Create a responder signing with `vehicle_seed`.
    pub fn new(vehicle_seed: &[u8; 32]) -> Self {
        VehicleResponder {
            signing_key: SigningKey::from_bytes(vehicle_seed),
            trusted: HashMap::new(),
            ledger: ChallengeLedger::default(),
            result_status: RESULT_ACCEPTED,
            stage: Stage::AwaitHello,
            peer: None,
            session_key: None,
        }
    }

    /// Report `status` in `AUTH_RESULT` instead of accepting.
    pub fn with_result_status(mut self, status: u8) -> Self {
        self.result_status = status;
        self
    }

    /// Vehicle public key, as pinned in issued key material.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Trust the mobile key registered under `key_id`.
    pub fn trust(&mut self, key_id: &str, mobile_public_key: &[u8; 32]) -> EngineResult<()> {
        let key = VerifyingKey::from_bytes(mobile_public_key)
            .map_err(|e| EngineError::InvalidKey(format!("mobile public key: {}", e)))?;
        self.trusted.insert(key_id.to_string(), key);
        Ok(())
    }

    /// Session key of the last accepted handshake.
    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    /// Device that opened the current or last exchange.
    pub fn peer(&self) -> Option<&DeviceFingerprint> {
        self.peer.as_ref()
    }

    /// Forget the current exchange and session key.
    pub fn reset(&mut self) {
        self.stage = Stage::AwaitHello;
        self.peer = None;
        self.session_key = None;
    }

    /// Handle one `Auth` payload from the mobile.
    ///
    /// A `MOBILE_HELLO` always starts a fresh exchange. Returns the reply to
    /// send.
    pub fn handle(&mut self, payload: &[u8]) -> Result<Vec<u8>, RejectReason> {
        if payload.first() == Some(&MSG_MOBILE_HELLO) {
            self.reset();
            let result = self.on_hello(payload);
            if result.is_err() {
                self.stage = Stage::Done;
            }
            return result;
        }

        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::AwaitProof {
                mobile,
                schedule,
                th1,
            } => {
                let body = expect_message(payload, MSG_MOBILE_PROOF, MOBILE_PROOF_LEN)?;
                let signature = Signature::from_bytes(&field(body, 0));
                mobile
                    .verify_strict(&mobile_signed_message(&th1), &signature)
                    .map_err(|_| RejectReason::BadSignature)?;
                let mut reply = Vec::with_capacity(CONFIRM_LEN);
                reply.push(MSG_VEHICLE_CONFIRM);
                reply.extend_from_slice(&confirm_tag(&schedule.vehicle_confirm, &[&th1[..]]));
                self.stage = Stage::AwaitConfirm { schedule, th1 };
                Ok(reply)
            }
            Stage::AwaitConfirm { schedule, th1 } => {
                let body = expect_message(payload, MSG_MOBILE_CONFIRM, CONFIRM_LEN)?;
                if !verify_tag(&schedule.mobile_confirm, &[&th1[..]], body) {
                    return Err(RejectReason::BadConfirmation);
                }
                let status = self.result_status;
                let mut reply = Vec::with_capacity(AUTH_RESULT_LEN);
                reply.push(MSG_AUTH_RESULT);
                reply.push(status);
                reply.extend_from_slice(&confirm_tag(&schedule.result, &[&[status][..], &th1[..]]));
                if status == RESULT_ACCEPTED {
                    self.session_key = Some(schedule.session_key());
                }
                debug!(
                    "VehicleResponder: exchange finished with status {} for {:?}",
                    status, self.peer
                );
                Ok(reply)
            }
            Stage::AwaitHello => Err(match payload.first() {
                Some(&msg_type) => RejectReason::UnexpectedMessage(msg_type),
                None => RejectReason::Malformed("empty message"),
            }),
            Stage::Done => Err(RejectReason::RoundCountExceeded),
        }
    }

    fn on_hello(&mut self, payload: &[u8]) -> Result<Vec<u8>, RejectReason> {
        let fixed = 3 + FINGERPRINT_SIZE + CHALLENGE_SIZE + SHARE_SIZE;
        if payload.len() < 3 {
            return Err(RejectReason::Malformed("hello too short"));
        }
        if payload[1] != PROTOCOL_VERSION {
            return Err(RejectReason::Malformed("unsupported handshake version"));
        }
        let id_len = payload[2] as usize;
        if payload.len() != fixed + id_len {
            return Err(RejectReason::Malformed("wrong message length"));
        }
        let key_id = std::str::from_utf8(&payload[3..3 + id_len])
            .map_err(|_| RejectReason::Malformed("key id is not utf-8"))?;
        let mobile = *self.trusted.get(key_id).ok_or(RejectReason::UntrustedPeer)?;

        let rest = &payload[3 + id_len..];
        let fingerprint: [u8; FINGERPRINT_SIZE] = field(rest, 0);
        let mobile_challenge: [u8; CHALLENGE_SIZE] = field(rest, FINGERPRINT_SIZE);
        let mobile_share: [u8; SHARE_SIZE] = field(rest, FINGERPRINT_SIZE + CHALLENGE_SIZE);
        if !self.ledger.record(&mobile_challenge) {
            return Err(RejectReason::ReplayedChallenge);
        }
        self.peer = Some(DeviceFingerprint::from_bytes(fingerprint));

        let vehicle_challenge = self.ledger.fresh_challenge();
        let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let vehicle_share = PublicKey::from(&secret);
        let th1 = transcript_hash(payload, &vehicle_challenge, vehicle_share.as_bytes());

        let shared = secret.diffie_hellman(&PublicKey::from(mobile_share));
        if !shared.was_contributory() {
            return Err(RejectReason::Malformed("non-contributory key share"));
        }
        let schedule =
            KeySchedule::derive(shared.as_bytes(), &mobile_challenge, &vehicle_challenge, &th1)?;
        let signature = self.signing_key.sign(&vehicle_signed_message(&th1));

        let mut reply = Vec::with_capacity(VEHICLE_HELLO_LEN);
        reply.push(MSG_VEHICLE_HELLO);
        reply.extend_from_slice(&vehicle_challenge);
        reply.extend_from_slice(vehicle_share.as_bytes());
        reply.extend_from_slice(&signature.to_bytes());

        self.stage = Stage::AwaitProof {
            mobile,
            schedule,
            th1,
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dkey_keys::{DigitalKeyInfo, InstalledKey, KeyMaterial};

    const MOBILE_SEED: [u8; 32] = [11u8; 32];
    const VEHICLE_SEED: [u8; 32] = [22u8; 32];

    fn setup(status: u8) -> (SignedEcdhHandshake, VehicleResponder, ChallengeLedger) {
        let mut vehicle = VehicleResponder::new(&VEHICLE_SEED).with_result_status(status);
        let mobile_public = SigningKey::from_bytes(&MOBILE_SEED).verifying_key().to_bytes();
        vehicle.trust("dk-1", &mobile_public).unwrap();

        let info = DigitalKeyInfo {
            dk_id: "dk-1".to_string(),
            ..Default::default()
        };
        let key = InstalledKey::new(info, KeyMaterial::new(MOBILE_SEED, vehicle.public_key()));
        let fp = DeviceFingerprint::from_seed(b"phone");
        let mobile = SignedEcdhHandshake::new(&fp, &key).unwrap();
        (mobile, vehicle, ChallengeLedger::default())
    }

    /// Run the exchange, letting `tamper` modify each vehicle reply.
    fn run(
        mobile: &mut SignedEcdhHandshake,
        vehicle: &mut VehicleResponder,
        ledger: &mut ChallengeLedger,
        mut tamper: impl FnMut(usize, &mut Vec<u8>),
    ) -> RoundOutcome {
        let mut outbound = mobile.begin(ledger);
        for round in 0.. {
            let mut reply = match vehicle.handle(&outbound) {
                Ok(reply) => reply,
                Err(reason) => return RoundOutcome::Failure(reason),
            };
            tamper(round, &mut reply);
            match mobile.consume(&reply, ledger) {
                RoundOutcome::Continue(next) => outbound = next,
                other => return other,
            }
        }
        unreachable!()
    }

    #[test]
    fn test_full_exchange_agrees_on_key() {
        let (mut mobile, mut vehicle, mut ledger) = setup(RESULT_ACCEPTED);
        match run(&mut mobile, &mut vehicle, &mut ledger, |_, _| {}) {
            RoundOutcome::Success { reply, key } => {
                assert!(reply.is_none());
                assert_eq!(Some(&key), vehicle.session_key());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(vehicle.peer(), Some(&DeviceFingerprint::from_seed(b"phone")));
    }

    #[test]
    fn test_tampered_rounds_are_rejected() {
        let expected = [
            RejectReason::BadSignature,
            RejectReason::BadConfirmation,
            RejectReason::BadConfirmation,
        ];
        for (target, reason) in expected.iter().enumerate() {
            let (mut mobile, mut vehicle, mut ledger) = setup(RESULT_ACCEPTED);
            let outcome = run(&mut mobile, &mut vehicle, &mut ledger, |round, reply| {
                if round == target {
                    let last = reply.len() - 1;
                    reply[last] ^= 0x01;
                }
            });
            assert_eq!(outcome, RoundOutcome::Failure(*reason), "round {}", target);
        }
    }

    #[test]
    fn test_vehicle_refusal() {
        let (mut mobile, mut vehicle, mut ledger) = setup(7);
        assert_eq!(
            run(&mut mobile, &mut vehicle, &mut ledger, |_, _| {}),
            RoundOutcome::Failure(RejectReason::VehicleRefused(7))
        );
        assert!(vehicle.session_key().is_none());
    }

    #[test]
    fn test_untrusted_key_id() {
        let (mut mobile, _, mut ledger) = setup(RESULT_ACCEPTED);
        let mut stranger = VehicleResponder::new(&VEHICLE_SEED);
        assert_eq!(
            stranger.handle(&mobile.begin(&mut ledger)),
            Err(RejectReason::UntrustedPeer)
        );
    }

    #[test]
    fn test_replayed_hello_is_refused() {
        let (mut mobile, mut vehicle, mut ledger) = setup(RESULT_ACCEPTED);
        let hello = mobile.begin(&mut ledger);
        assert!(vehicle.handle(&hello).is_ok());
        assert_eq!(vehicle.handle(&hello), Err(RejectReason::ReplayedChallenge));
    }

    #[test]
    fn test_replayed_vehicle_hello_is_refused() {
        let (mut first, mut vehicle, mut ledger) = setup(RESULT_ACCEPTED);
        let vehicle_hello = vehicle.handle(&first.begin(&mut ledger)).unwrap();
        assert!(matches!(
            first.consume(&vehicle_hello, &mut ledger),
            RoundOutcome::Continue(_)
        ));

        // A second attempt sharing the ledger sees the same vehicle message.
        let (mut second, _, _) = setup(RESULT_ACCEPTED);
        second.begin(&mut ledger);
        let outcome = second.consume(&vehicle_hello, &mut ledger);
        assert!(matches!(outcome, RoundOutcome::Failure(_)));
    }
}
