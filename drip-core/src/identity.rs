use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// Length of a serialized public key on the wire.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of a serialized signature on the wire.
pub const SIGNATURE_LEN: usize = 64;

/// Ephemeral per-run signing identity.
///
/// Generated when a node starts and dropped when it stops; deliberately
/// never persisted. It signs outgoing negotiation envelopes and is the
/// identity the peer verifies during pairing, which is a different thing
/// from the PAKE-derived session key: the key authenticates the channel,
/// the identity binds individual messages to the peer that won pairing.
pub struct Identity {
    signing: SigningKey,
    node_id: String,
}

impl Identity {
    /// Generates a fresh keypair from the OS entropy source.
    #[must_use]
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let node_id = node_id_for(signing.verifying_key().as_bytes());
        Self { signing, node_id }
    }

    /// Short hex fingerprint of the public key, used as the node id in
    /// advertisements and envelopes.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Derives the node id fingerprint for a public key: the first 12 bytes of
/// its SHA-256 digest, hex encoded.
#[must_use]
pub fn node_id_for(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..12])
}

/// Verifies `signature` over `message` under `public_key`.
///
/// Returns `false` on malformed keys or signatures rather than erroring —
/// a peer that sends garbage is simply not verified.
#[must_use]
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; PUBLIC_KEY_LEN]>::try_from(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn when_signing_expect_verification_under_own_key() {
        let id = Identity::generate();
        let sig = id.sign(b"hello drip");
        assert!(verify(&id.public_key(), b"hello drip", &sig));
    }

    #[test]
    fn when_message_tampered_expect_verification_failure() {
        let id = Identity::generate();
        let sig = id.sign(b"hello drip");
        assert!(!verify(&id.public_key(), b"hello drop", &sig));
    }

    #[test]
    fn when_key_differs_expect_verification_failure() {
        let a = Identity::generate();
        let b = Identity::generate();
        let sig = a.sign(b"hello");
        assert!(!verify(&b.public_key(), b"hello", &sig));
    }

    #[test]
    fn when_inputs_malformed_expect_false_not_panic() {
        let id = Identity::generate();
        let sig = id.sign(b"x");
        assert!(!verify(&[1, 2, 3], b"x", &sig));
        assert!(!verify(&id.public_key(), b"x", &[0u8; 10]));
    }

    #[test]
    fn when_generating_expect_stable_node_id_shape() {
        let id = Identity::generate();
        assert_eq!(id.node_id().len(), 24);
        assert_eq!(id.node_id(), node_id_for(&id.public_key()));
    }

    #[test]
    fn when_debug_printed_expect_no_key_material() {
        let id = Identity::generate();
        let debug = format!("{id:?}");
        assert!(debug.contains(id.node_id()));
        assert!(!debug.contains(&hex::encode(id.public_key())));
    }
}
