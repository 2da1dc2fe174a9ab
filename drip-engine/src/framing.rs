use anyhow::{Context, Result};
use bytes::BytesMut;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use drip_core::envelope::{
    self, Frame, MessageType, encode_frame_to_bytes, encode_payload_frame, try_decode_frame,
};
use drip_core::error::DripError;

use crate::transport::Connection;

const READ_CHUNK: usize = 16 * 1024;

/// The peer closed the connection before a complete frame arrived.
///
/// Kept as its own type so callers can tell a close apart from transport
/// and codec errors by downcasting instead of matching message text.
#[derive(Debug, Error)]
#[error("connection closed by peer")]
pub struct ConnectionClosed;

/// Frame-level reader/writer over a [`Connection`].
///
/// Owns the accumulation buffer so partial reads carry over between
/// frames; every protocol layer (pairing, negotiation, streaming) talks
/// through one of these.
pub struct Framed<C: Connection> {
    conn: C,
    accum: BytesMut,
    scratch: Box<[u8; READ_CHUNK]>,
}

impl<C: Connection> Framed<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            accum: BytesMut::with_capacity(2 * READ_CHUNK),
            scratch: Box::new([0u8; READ_CHUNK]),
        }
    }

    #[must_use]
    pub fn peer(&self) -> String {
        self.conn.peer()
    }

    /// Reads until one complete frame is available.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or a frame-level protocol violation; a
    /// peer close surfaces as a downcastable [`ConnectionClosed`].
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = try_decode_frame(&mut self.accum)? {
                return Ok(frame);
            }
            let n = self.conn.read(&mut self.scratch[..]).await?;
            if n == 0 {
                return Err(ConnectionClosed.into());
            }
            self.accum.extend_from_slice(&self.scratch[..n]);
        }
    }

    /// Reads one frame and requires it to be of `expected` type.
    ///
    /// # Errors
    ///
    /// [`DripError::ProtocolViolation`] when a different type arrives —
    /// out-of-order messages terminate the session.
    pub async fn expect_frame(&mut self, expected: MessageType) -> Result<Frame, DripError> {
        let frame = self
            .read_frame()
            .await
            .map_err(|e| DripError::ProtocolViolation(e.to_string()))?;
        if frame.header.msg_type != expected {
            return Err(DripError::ProtocolViolation(format!(
                "expected {expected:?}, got {:?}",
                frame.header.msg_type
            )));
        }
        Ok(frame)
    }

    /// Writes a raw-payload frame.
    ///
    /// # Errors
    ///
    /// Fails on transport errors.
    pub async fn write_raw(&mut self, msg_type: MessageType, payload: &[u8]) -> Result<()> {
        let bytes = encode_frame_to_bytes(msg_type, payload);
        self.conn.write_all(&bytes).await
    }

    /// Serializes `payload` to JSON and writes it as a frame.
    ///
    /// # Errors
    ///
    /// Fails on serialization or transport errors.
    pub async fn write_json<T: Serialize>(
        &mut self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<()> {
        let bytes = encode_payload_frame(msg_type, payload)?;
        self.conn.write_all(&bytes).await
    }

    /// Reads a frame of `expected` type and decodes its JSON payload.
    ///
    /// # Errors
    ///
    /// [`DripError::ProtocolViolation`] on the wrong type or a payload that
    /// does not parse as `T`.
    pub async fn read_json<T: DeserializeOwned>(
        &mut self,
        expected: MessageType,
    ) -> Result<T, DripError> {
        let frame = self.expect_frame(expected).await?;
        envelope::decode_payload(&frame.payload)
            .map_err(|e| DripError::ProtocolViolation(format!("bad {expected:?} payload: {e}")))
    }

    /// Shuts down the write half of the underlying connection.
    ///
    /// # Errors
    ///
    /// Fails on transport errors.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.conn.shutdown().await.context("shutdown failed")
    }
}
