//! Mobile side of the signed ECDH handshake.

use super::*;
use crate::{DeviceFingerprint, EngineError, EngineResult};
use dkey_keys::InstalledKey;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use tracing::trace;
use x25519_dalek::{EphemeralSecret, PublicKey};

enum Stage {
    Idle,
    AwaitVehicleHello {
        hello: Vec<u8>,
        challenge: [u8; CHALLENGE_SIZE],
        secret: EphemeralSecret,
    },
    AwaitVehicleConfirm {
        schedule: KeySchedule,
        th1: [u8; 32],
    },
    AwaitResult {
        schedule: KeySchedule,
        th1: [u8; 32],
    },
    Done,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::AwaitVehicleHello { .. } => "await_vehicle_hello",
            Stage::AwaitVehicleConfirm { .. } => "await_vehicle_confirm",
            Stage::AwaitResult { .. } => "await_result",
            Stage::Done => "done",
        }
    }
}

/// Ephemeral X25519 exchange authenticated by Ed25519 signatures.
///
/// The mobile signs with the key's signing seed and pins the vehicle's
/// public key from the installed key material.
pub struct SignedEcdhHandshake {
    key_id: Vec<u8>,
    fingerprint: DeviceFingerprint,
    signing_key: SigningKey,
    vehicle_key: VerifyingKey,
    stage: Stage,
}

impl SignedEcdhHandshake {
    /// Build a handshake for `key` on the device identified by `fingerprint`.
    pub fn new(fingerprint: &DeviceFingerprint, key: &InstalledKey) -> EngineResult<Self> {
        let key_id = key.id().as_bytes().to_vec();
        if key_id.is_empty() || key_id.len() > u8::MAX as usize {
            return Err(EngineError::InvalidKey(format!(
                "key id length {} out of range",
                key_id.len()
            )));
        }
        let vehicle_key = VerifyingKey::from_bytes(key.material.vehicle_public_key())
            .map_err(|e| EngineError::InvalidKey(format!("vehicle public key: {}", e)))?;
        Ok(SignedEcdhHandshake {
            key_id,
            fingerprint: *fingerprint,
            signing_key: SigningKey::from_bytes(key.material.signing_seed()),
            vehicle_key,
            stage: Stage::Idle,
        })
    }

    fn on_vehicle_hello(
        &mut self,
        payload: &[u8],
        hello: Vec<u8>,
        challenge: [u8; CHALLENGE_SIZE],
        secret: EphemeralSecret,
        ledger: &mut ChallengeLedger,
    ) -> Result<Vec<u8>, RejectReason> {
        let body = expect_message(payload, MSG_VEHICLE_HELLO, VEHICLE_HELLO_LEN)?;
        let vehicle_challenge: [u8; CHALLENGE_SIZE] = field(body, 0);
        let vehicle_share: [u8; SHARE_SIZE] = field(body, CHALLENGE_SIZE);
        let signature: [u8; SIGNATURE_SIZE] = field(body, CHALLENGE_SIZE + SHARE_SIZE);

        let th1 = transcript_hash(&hello, &vehicle_challenge, &vehicle_share);
        self.vehicle_key
            .verify_strict(
                &vehicle_signed_message(&th1),
                &Signature::from_bytes(&signature),
            )
            .map_err(|_| RejectReason::BadSignature)?;

        if vehicle_challenge == challenge || !ledger.record(&vehicle_challenge) {
            return Err(RejectReason::ReplayedChallenge);
        }

        let shared = secret.diffie_hellman(&PublicKey::from(vehicle_share));
        if !shared.was_contributory() {
            return Err(RejectReason::Malformed("non-contributory key share"));
        }
        let schedule = KeySchedule::derive(shared.as_bytes(), &challenge, &vehicle_challenge, &th1)?;

        let proof = self.signing_key.sign(&mobile_signed_message(&th1));
        let mut reply = Vec::with_capacity(MOBILE_PROOF_LEN);
        reply.push(MSG_MOBILE_PROOF);
        reply.extend_from_slice(&proof.to_bytes());

        self.stage = Stage::AwaitVehicleConfirm { schedule, th1 };
        Ok(reply)
    }

    fn step(
        &mut self,
        payload: &[u8],
        ledger: &mut ChallengeLedger,
    ) -> Result<RoundOutcome, RejectReason> {
        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Idle => Err(RejectReason::Malformed("handshake not started")),
            Stage::Done => Err(RejectReason::RoundCountExceeded),
            Stage::AwaitVehicleHello {
                hello,
                challenge,
                secret,
            } => self
                .on_vehicle_hello(payload, hello, challenge, secret, ledger)
                .map(RoundOutcome::Continue),
            Stage::AwaitVehicleConfirm { schedule, th1 } => {
                let body = expect_message(payload, MSG_VEHICLE_CONFIRM, CONFIRM_LEN)?;
                if !verify_tag(&schedule.vehicle_confirm, &[&th1[..]], body) {
                    return Err(RejectReason::BadConfirmation);
                }
                let mut reply = Vec::with_capacity(CONFIRM_LEN);
                reply.push(MSG_MOBILE_CONFIRM);
                reply.extend_from_slice(&confirm_tag(&schedule.mobile_confirm, &[&th1[..]]));
                self.stage = Stage::AwaitResult { schedule, th1 };
                Ok(RoundOutcome::Continue(reply))
            }
            Stage::AwaitResult { schedule, th1 } => {
                let body = expect_message(payload, MSG_AUTH_RESULT, AUTH_RESULT_LEN)?;
                let status = body[0];
                if !verify_tag(&schedule.result, &[&[status][..], &th1[..]], &body[1..]) {
                    return Err(RejectReason::BadConfirmation);
                }
                if status != RESULT_ACCEPTED {
                    return Err(RejectReason::VehicleRefused(status));
                }
                Ok(RoundOutcome::Success {
                    reply: None,
                    key: schedule.session_key(),
                })
            }
        }
    }
}

impl KeyAgreement for SignedEcdhHandshake {
    fn begin(&mut self, ledger: &mut ChallengeLedger) -> Vec<u8> {
        let challenge = ledger.fresh_challenge();
        let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let share = PublicKey::from(&secret);

        let mut hello =
            Vec::with_capacity(3 + self.key_id.len() + FINGERPRINT_SIZE + CHALLENGE_SIZE + SHARE_SIZE);
        hello.push(MSG_MOBILE_HELLO);
        hello.push(PROTOCOL_VERSION);
        hello.push(self.key_id.len() as u8);
        hello.extend_from_slice(&self.key_id);
        hello.extend_from_slice(self.fingerprint.as_bytes());
        hello.extend_from_slice(&challenge);
        hello.extend_from_slice(share.as_bytes());

        self.stage = Stage::AwaitVehicleHello {
            hello: hello.clone(),
            challenge,
            secret,
        };
        hello
    }

    fn consume(&mut self, payload: &[u8], ledger: &mut ChallengeLedger) -> RoundOutcome {
        trace!(
            "SignedEcdhHandshake: consume {} bytes at {}",
            payload.len(),
            self.stage.name()
        );
        match self.step(payload, ledger) {
            Ok(outcome) => outcome,
            Err(reason) => {
                // Dropping the stage zeroizes any derived keys.
                self.stage = Stage::Done;
                RoundOutcome::Failure(reason)
            }
        }
    }

    fn name(&self) -> &'static str {
        "signed-ecdh-v1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dkey_keys::{DigitalKeyInfo, KeyMaterial};

    fn key_pair() -> (InstalledKey, SigningKey, SigningKey) {
        let mobile = SigningKey::from_bytes(&[11u8; 32]);
        let vehicle = SigningKey::from_bytes(&[22u8; 32]);
        let info = DigitalKeyInfo {
            dk_id: "dk-1".to_string(),
            ..Default::default()
        };
        let material = KeyMaterial::new([11u8; 32], vehicle.verifying_key().to_bytes());
        (InstalledKey::new(info, material), mobile, vehicle)
    }

    #[test]
    fn test_hello_layout() {
        let (key, _, _) = key_pair();
        let fp = DeviceFingerprint::from_seed(b"phone");
        let mut hs = SignedEcdhHandshake::new(&fp, &key).unwrap();
        let mut ledger = ChallengeLedger::default();
        let hello = hs.begin(&mut ledger);

        assert_eq!(hello[0], MSG_MOBILE_HELLO);
        assert_eq!(hello[1], PROTOCOL_VERSION);
        assert_eq!(hello[2] as usize, 4);
        assert_eq!(&hello[3..7], b"dk-1");
        assert_eq!(&hello[7..39], fp.as_bytes());
        assert_eq!(hello.len(), 7 + FINGERPRINT_SIZE + CHALLENGE_SIZE + SHARE_SIZE);
        let challenge: [u8; 32] = field(&hello, 39);
        assert!(ledger.contains(&challenge));
    }

    #[test]
    fn test_consume_before_begin() {
        let (key, _, _) = key_pair();
        let fp = DeviceFingerprint::from_seed(b"phone");
        let mut hs = SignedEcdhHandshake::new(&fp, &key).unwrap();
        let mut ledger = ChallengeLedger::default();
        assert!(matches!(
            hs.consume(&[MSG_VEHICLE_HELLO], &mut ledger),
            RoundOutcome::Failure(RejectReason::Malformed(_))
        ));
    }

    #[test]
    fn test_wrong_message_is_terminal() {
        let (key, _, _) = key_pair();
        let fp = DeviceFingerprint::from_seed(b"phone");
        let mut hs = SignedEcdhHandshake::new(&fp, &key).unwrap();
        let mut ledger = ChallengeLedger::default();
        hs.begin(&mut ledger);
        assert_eq!(
            hs.consume(&[MSG_AUTH_RESULT; AUTH_RESULT_LEN], &mut ledger),
            RoundOutcome::Failure(RejectReason::UnexpectedMessage(MSG_AUTH_RESULT))
        );
        assert_eq!(
            hs.consume(&[MSG_VEHICLE_HELLO; VEHICLE_HELLO_LEN], &mut ledger),
            RoundOutcome::Failure(RejectReason::RoundCountExceeded)
        );
    }
}
