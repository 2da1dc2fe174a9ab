use anyhow::{Result, bail, ensure};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::DripError;
use crate::identity::{self, Identity};

/// ASCII magic bytes that open every Drip frame.
const MAGIC: &[u8; 5] = b"DRIP!";
/// Protocol version understood by this build.
const VERSION: u8 = 0x01;
/// Total header size: magic(5) + version(1) + type(1) + flags(2) + length(4).
pub const HEADER_LEN: usize = 13;
/// Upper bound on a single frame payload to protect against malicious peers.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 5;
const OFF_TYPE: usize = 6;
const OFF_FLAGS: usize = 7;
const OFF_LENGTH: usize = 9;

/// Protocol-level message type codes (v1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// SPAKE2 exchange message, either direction.
    PakeMsg = 0x10,
    /// Key-confirmation tag derived from the exchanged key.
    PakeConfirm = 0x11,
    /// Signed identity announcement bound to the session key.
    PeerInfo = 0x12,
    /// Signed negotiation envelope (SendRequest / SendResponse).
    Envelope = 0x20,
    /// Raw file bytes, sent only after an accepted response.
    FileChunk = 0x30,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x10 => Ok(Self::PakeMsg),
            0x11 => Ok(Self::PakeConfirm),
            0x12 => Ok(Self::PeerInfo),
            0x20 => Ok(Self::Envelope),
            0x30 => Ok(Self::FileChunk),
            other => bail!("unknown message type: 0x{other:02X}"),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(mt: MessageType) -> u8 {
        mt as u8
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    /// Reserved flags — MUST be `0x0000` in v1.
    pub flags: u16,
    pub payload_length: u32,
}

/// A fully decoded frame (header + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Attempts to decode one complete frame from the front of `buf`.
///
/// * `Ok(Some(frame))` — a full frame was present; its bytes have been
///   consumed from `buf`.
/// * `Ok(None)` — not enough bytes yet; `buf` is left untouched. The caller
///   should read more data and try again.
/// * `Err(..)` — protocol violation (bad magic, unsupported version, unknown
///   message type, oversized payload). The caller should close the session.
///
/// # Errors
///
/// Returns an error on protocol violations as listed above.
///
/// # Panics
///
/// Cannot panic. The `expect` calls on slice conversions are guarded by the
/// `HEADER_LEN` check at the top of the function.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    ensure!(
        &buf[OFF_MAGIC..OFF_MAGIC + MAGIC.len()] == MAGIC,
        "bad magic: expected DRIP!"
    );

    let version = buf[OFF_VERSION];
    ensure!(version == VERSION, "unsupported version: 0x{version:02X}");

    let msg_type = MessageType::try_from(buf[OFF_TYPE])?;

    // These slices are exactly 2 and 4 bytes respectively (guaranteed by
    // the HEADER_LEN check above), so the conversions cannot fail.
    let flags = u16::from_be_bytes(
        buf[OFF_FLAGS..OFF_FLAGS + 2]
            .try_into()
            .expect("flags slice is exactly 2 bytes"),
    );

    let payload_len = u32::from_be_bytes(
        buf[OFF_LENGTH..OFF_LENGTH + 4]
            .try_into()
            .expect("length slice is exactly 4 bytes"),
    ) as usize;

    ensure!(
        payload_len <= MAX_PAYLOAD_LEN,
        "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_LEN})"
    );

    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(payload_len).to_vec();

    let header = Header {
        version,
        msg_type,
        flags,
        #[allow(clippy::cast_possible_truncation)] // guarded by MAX_PAYLOAD_LEN (fits in u32)
        payload_length: payload_len as u32,
    };

    Ok(Some(Frame { header, payload }))
}

/// Encodes a frame into `buf`: the 13-byte header followed by `payload`.
pub fn encode_frame(msg_type: MessageType, payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(msg_type.into());
    buf.put_u16(0x0000);
    #[allow(clippy::cast_possible_truncation)] // frame payloads are bounded by MAX_PAYLOAD_LEN
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
#[must_use]
pub fn encode_frame_to_bytes(msg_type: MessageType, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(msg_type, payload, &mut buf);
    buf
}

/// Encodes a serializable payload into a frame stored in a new `BytesMut`.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode_payload_frame<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<BytesMut> {
    let json = serde_json::to_vec(payload)?;
    ensure!(
        json.len() <= MAX_PAYLOAD_LEN,
        "payload too large to frame: {} bytes",
        json.len()
    );
    Ok(encode_frame_to_bytes(msg_type, &json))
}

/// Decodes a frame's payload bytes into the requested type.
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON or does not match `T`.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(Into::into)
}

// ── Pairing payloads ────────────────────────────────────────────────

/// Payload for [`MessageType::PakeMsg`]: one side's SPAKE2 message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PakePayload {
    pub body_hex: String,
}

/// Payload for [`MessageType::PakeConfirm`]: direction-keyed confirmation
/// tag proving possession of the derived session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmPayload {
    pub tag_hex: String,
}

/// Payload for [`MessageType::PeerInfo`]: the per-run identity, with a
/// signature over the session-key transcript binding it to this pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfoPayload {
    pub node_id: String,
    pub public_key_hex: String,
    pub signature_hex: String,
}

// ── Negotiation envelope ────────────────────────────────────────────

/// The one-of payload carried by a [`TransferEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopePayload {
    SendRequest { file_name: String, file_size: u64 },
    SendResponse { accepted: bool },
}

/// Signed negotiation message.
///
/// The symmetric session key already authenticates the transport; signing
/// each envelope with the per-run identity additionally binds the message
/// to the specific peer verified during pairing, so a confused transport
/// layer cannot substitute messages mid-session.
///
/// The signature covers the canonical serialization of every field except
/// `signature_hex` itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEnvelope {
    /// Unix time in milliseconds.
    pub timestamp: i64,
    /// The id of the node that created the message.
    pub node_id: String,
    /// Authoring node Ed25519 public key, hex encoded.
    pub node_pub_key_hex: String,
    /// Signature over the envelope with this field empty, hex encoded.
    pub signature_hex: String,
    pub payload: EnvelopePayload,
}

impl TransferEnvelope {
    /// Builds and signs an envelope for `payload`.
    ///
    /// # Errors
    ///
    /// Returns an error if canonical serialization fails.
    pub fn signed(identity: &Identity, payload: EnvelopePayload) -> Result<Self> {
        let mut envelope = Self {
            timestamp: unix_millis(),
            node_id: identity.node_id().to_string(),
            node_pub_key_hex: hex::encode(identity.public_key()),
            signature_hex: String::new(),
            payload,
        };
        let signable = envelope.signable_bytes()?;
        envelope.signature_hex = hex::encode(identity.sign(&signable));
        Ok(envelope)
    }

    /// Verifies the envelope against the public key recorded at pairing
    /// success: the signature must verify under the declared key AND the
    /// declared key must be the paired peer's.
    ///
    /// # Errors
    ///
    /// [`DripError::ProtocolViolation`] on any mismatch — a forged or
    /// substituted envelope, not merely a rejection.
    pub fn verify_from(&self, expected_public_key: &[u8]) -> Result<(), DripError> {
        let declared = hex::decode(&self.node_pub_key_hex)
            .map_err(|_| DripError::ProtocolViolation("envelope public key is not hex".into()))?;
        if declared != expected_public_key {
            return Err(DripError::ProtocolViolation(
                "envelope public key does not match the paired peer".into(),
            ));
        }
        let signature = hex::decode(&self.signature_hex)
            .map_err(|_| DripError::ProtocolViolation("envelope signature is not hex".into()))?;
        let signable = self
            .signable_bytes()
            .map_err(|e| DripError::ProtocolViolation(format!("unserializable envelope: {e}")))?;
        if !identity::verify(&declared, &signable, &signature) {
            return Err(DripError::ProtocolViolation(
                "envelope signature verification failed".into(),
            ));
        }
        Ok(())
    }

    fn signable_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature_hex = String::new();
        // serde_json writes struct fields in declaration order, so this
        // serialization is canonical for signing purposes.
        Ok(serde_json::to_vec(&unsigned)?)
    }
}

fn unix_millis() -> i64 {
    #[allow(clippy::cast_possible_truncation)]
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    millis
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Frame codec ─────────────────────────────────────────────────

    #[test]
    fn given_empty_payload_when_round_tripped_then_frame_matches() {
        let mut buf = encode_frame_to_bytes(MessageType::PakeMsg, &[]);
        let frame = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MessageType::PakeMsg);
        assert_eq!(frame.header.version, VERSION);
        assert_eq!(frame.header.flags, 0);
        assert!(frame.payload.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn given_partial_header_when_decoded_then_returns_none() {
        let full = encode_frame_to_bytes(MessageType::Envelope, b"{}");
        let mut buf = BytesMut::from(&full[..7]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn given_truncated_payload_when_decoded_then_returns_none() {
        let payload = b"hello drip";
        let full = encode_frame_to_bytes(MessageType::FileChunk, payload);
        let partial_len = HEADER_LEN + payload.len() / 2;
        let mut buf = BytesMut::from(&full[..partial_len]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn given_bad_magic_when_decoded_then_returns_error() {
        let mut buf = BytesMut::from(&b"XXXXX\x01\x10\x00\x00\x00\x00\x00\x00"[..]);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn given_unsupported_version_when_decoded_then_returns_error() {
        let mut buf = BytesMut::from(&b"DRIP!\xFF\x10\x00\x00\x00\x00\x00\x00"[..]);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    #[test]
    fn given_unknown_message_type_when_decoded_then_returns_error() {
        let mut buf = BytesMut::from(&b"DRIP!\x01\xFE\x00\x00\x00\x00\x00\x00"[..]);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("unknown message type"));
    }

    #[test]
    fn given_two_frames_in_buffer_when_decoded_then_both_drain_in_order() {
        let mut buf = encode_frame_to_bytes(MessageType::PakeMsg, b"first");
        encode_frame(MessageType::PakeConfirm, b"second", &mut buf);

        let first = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(first.header.msg_type, MessageType::PakeMsg);
        assert_eq!(first.payload, b"first");

        let second = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(second.header.msg_type, MessageType::PakeConfirm);
        assert_eq!(second.payload, b"second");
        assert!(buf.is_empty());
    }

    // ── Envelope signing ────────────────────────────────────────────

    #[test]
    fn given_signed_envelope_when_verified_under_signer_key_then_ok() {
        let id = Identity::generate();
        let envelope = TransferEnvelope::signed(
            &id,
            EnvelopePayload::SendRequest {
                file_name: "notes.txt".into(),
                file_size: 1024,
            },
        )
        .unwrap();
        envelope.verify_from(&id.public_key()).unwrap();
    }

    #[test]
    fn given_tampered_payload_when_verified_then_protocol_violation() {
        let id = Identity::generate();
        let mut envelope = TransferEnvelope::signed(
            &id,
            EnvelopePayload::SendRequest {
                file_name: "notes.txt".into(),
                file_size: 1024,
            },
        )
        .unwrap();
        envelope.payload = EnvelopePayload::SendRequest {
            file_name: "notes.txt".into(),
            file_size: 999_999,
        };
        let err = envelope.verify_from(&id.public_key()).unwrap_err();
        assert!(matches!(err, DripError::ProtocolViolation(_)));
    }

    #[test]
    fn given_wrong_expected_key_when_verified_then_protocol_violation() {
        let signer = Identity::generate();
        let other = Identity::generate();
        let envelope = TransferEnvelope::signed(
            &signer,
            EnvelopePayload::SendResponse { accepted: true },
        )
        .unwrap();
        let err = envelope.verify_from(&other.public_key()).unwrap_err();
        assert!(matches!(err, DripError::ProtocolViolation(_)));
    }

    #[test]
    fn given_substituted_key_when_verified_then_protocol_violation() {
        // A peer re-signing the envelope under a different key must still
        // fail: the declared key is checked against the paired identity.
        let signer = Identity::generate();
        let imposter = Identity::generate();
        let mut envelope = TransferEnvelope::signed(
            &imposter,
            EnvelopePayload::SendResponse { accepted: true },
        )
        .unwrap();
        envelope.node_pub_key_hex = hex::encode(imposter.public_key());
        let err = envelope.verify_from(&signer.public_key()).unwrap_err();
        assert!(matches!(err, DripError::ProtocolViolation(_)));
    }

    #[test]
    fn given_envelope_when_framed_then_round_trips_through_codec() {
        let id = Identity::generate();
        let envelope = TransferEnvelope::signed(
            &id,
            EnvelopePayload::SendResponse { accepted: false },
        )
        .unwrap();
        let mut buf = encode_payload_frame(MessageType::Envelope, &envelope).unwrap();
        let frame = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MessageType::Envelope);
        let decoded: TransferEnvelope = decode_payload(&frame.payload).unwrap();
        assert_eq!(decoded, envelope);
        decoded.verify_from(&id.public_key()).unwrap();
    }
}
