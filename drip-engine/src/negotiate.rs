//! Transfer negotiation and file streaming over a paired session.
//!
//! After pairing, the sender offers the file in a signed envelope and the
//! receiver answers with a signed accept or deny. Both envelopes are
//! verified against the public key recorded at pairing time, so a message
//! signed by anyone but the verified peer terminates the session. Only an
//! accepted offer is followed by file bytes.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use drip_core::envelope::{EnvelopePayload, MessageType, TransferEnvelope};
use drip_core::error::DripError;
use drip_core::file::FileRecord;
use drip_core::identity::Identity;

use crate::cancel::CancelToken;
use crate::framing::ConnectionClosed;
use crate::pairing::PairedSession;
use crate::transport::Connection;

/// Bytes per [`MessageType::FileChunk`] frame. Well under the frame
/// payload cap so a chunk never gets rejected by the codec.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// An incoming offer, already signature-verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    pub file_name: String,
    pub file_size: u64,
}

/// Byte-level transfer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub transferred: u64,
    pub total: u64,
}

/// Sends a signed offer for `file` and waits for the peer's decision.
///
/// Returns whether the peer accepted.
///
/// # Errors
///
/// [`DripError::ProtocolViolation`] when the response fails signature
/// verification, carries the wrong key, or is not a response at all.
pub async fn offer<C: Connection>(
    session: &mut PairedSession<C>,
    identity: &Identity,
    file: &FileRecord,
) -> Result<bool, DripError> {
    let request = TransferEnvelope::signed(
        identity,
        EnvelopePayload::SendRequest {
            file_name: file.name.clone(),
            file_size: file.size,
        },
    )
    .map_err(DripError::Other)?;
    session
        .framed
        .write_json(MessageType::Envelope, &request)
        .await?;
    info!(file = %file.name, size = file.size, peer = %session.peer.node_id, "Offer sent");

    let response: TransferEnvelope = session.framed.read_json(MessageType::Envelope).await?;
    response.verify_from(&session.peer.public_key)?;
    match response.payload {
        EnvelopePayload::SendResponse { accepted } => {
            debug!(accepted, "Offer answered");
            Ok(accepted)
        }
        EnvelopePayload::SendRequest { .. } => Err(DripError::ProtocolViolation(
            "peer sent a request where a response was expected".into(),
        )),
    }
}

/// Waits for the peer's signed offer.
///
/// # Errors
///
/// [`DripError::ProtocolViolation`] on a bad signature, the wrong key, or
/// an unsolicited response envelope.
pub async fn await_offer<C: Connection>(
    session: &mut PairedSession<C>,
) -> Result<FileOffer, DripError> {
    let request: TransferEnvelope = session.framed.read_json(MessageType::Envelope).await?;
    request.verify_from(&session.peer.public_key)?;
    match request.payload {
        EnvelopePayload::SendRequest {
            file_name,
            file_size,
        } => {
            info!(file = %file_name, size = file_size, peer = %session.peer.node_id, "Offer received");
            Ok(FileOffer {
                file_name,
                file_size,
            })
        }
        EnvelopePayload::SendResponse { .. } => Err(DripError::ProtocolViolation(
            "peer sent an unsolicited response".into(),
        )),
    }
}

/// Answers a received offer with a signed accept or deny.
///
/// # Errors
///
/// Fails on serialization or transport errors.
pub async fn respond<C: Connection>(
    session: &mut PairedSession<C>,
    identity: &Identity,
    accept: bool,
) -> Result<(), DripError> {
    let response =
        TransferEnvelope::signed(identity, EnvelopePayload::SendResponse { accepted: accept })
            .map_err(DripError::Other)?;
    session
        .framed
        .write_json(MessageType::Envelope, &response)
        .await?;
    debug!(accept, "Response sent");
    Ok(())
}

/// Streams the file content as chunk frames. Call only after an accepted
/// offer.
///
/// Progress updates are best-effort; a slow or dropped observer never
/// stalls the transfer.
///
/// # Errors
///
/// [`DripError::UserCancelled`] when the token fires mid-stream; transport
/// and file I/O errors otherwise.
pub async fn stream_file<C: Connection>(
    session: &mut PairedSession<C>,
    file: &FileRecord,
    progress: &mpsc::Sender<Progress>,
    cancel: &CancelToken,
) -> Result<(), DripError> {
    use tokio::io::AsyncReadExt;

    let mut reader = tokio::fs::File::open(&file.path)
        .await
        .map_err(|e| DripError::Other(anyhow::Error::new(e).context("cannot open file")))?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;

    while sent < file.size {
        if cancel.is_cancelled() {
            return Err(DripError::UserCancelled);
        }
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| DripError::Other(anyhow::Error::new(e).context("file read failed")))?;
        if n == 0 {
            // File shrank underneath us since it was fingerprinted.
            return Err(DripError::TransferIncomplete {
                expected: file.size,
                received: sent,
            });
        }
        session
            .framed
            .write_raw(MessageType::FileChunk, &buf[..n])
            .await?;
        sent += n as u64;
        let _ = progress.try_send(Progress {
            transferred: sent,
            total: file.size,
        });
    }
    info!(file = %file.name, bytes = sent, "File streamed");
    Ok(())
}

/// Receives exactly `expected` bytes of chunk frames into `sink`.
///
/// # Errors
///
/// [`DripError::TransferIncomplete`] when the connection ends short,
/// [`DripError::ProtocolViolation`] when the peer sends more bytes than it
/// offered or a non-chunk frame mid-stream.
pub async fn receive_file<C, W>(
    session: &mut PairedSession<C>,
    expected: u64,
    sink: &mut W,
    progress: &mpsc::Sender<Progress>,
) -> Result<(), DripError>
where
    C: Connection,
    W: AsyncWrite + Unpin,
{
    let mut received: u64 = 0;
    while received < expected {
        let frame = match session.framed.read_frame().await {
            Ok(frame) => frame,
            // A peer close mid-transfer means the stream came up short.
            Err(e) if e.is::<ConnectionClosed>() => {
                return Err(DripError::TransferIncomplete { expected, received });
            }
            Err(e) => return Err(DripError::ProtocolViolation(e.to_string())),
        };
        if frame.header.msg_type != MessageType::FileChunk {
            return Err(DripError::ProtocolViolation(format!(
                "expected a file chunk, got {:?}",
                frame.header.msg_type
            )));
        }
        received += frame.payload.len() as u64;
        if received > expected {
            return Err(DripError::ProtocolViolation(format!(
                "peer sent {received} bytes but offered {expected}"
            )));
        }
        sink.write_all(&frame.payload)
            .await
            .map_err(|e| DripError::Other(anyhow::Error::new(e).context("sink write failed")))?;
        let _ = progress.try_send(Progress {
            transferred: received,
            total: expected,
        });
    }
    sink.flush()
        .await
        .map_err(|e| DripError::Other(anyhow::Error::new(e).context("sink flush failed")))?;
    info!(bytes = received, "File received");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Framed;
    use crate::memory::{MemoryConnection, MemoryNet};
    use crate::pairing::{Direction, VerifiedPeer};
    use crate::transport::{Connector, Listener, ListenerFactory};

    struct TestPeer {
        session: PairedSession<MemoryConnection>,
        identity: Identity,
    }

    /// Two sessions wired back-to-back, as pairing would have left them.
    async fn paired() -> (TestPeer, TestPeer) {
        let net = MemoryNet::new();
        let mut listener = net.factory().bind("mem:negotiate").await.unwrap();
        let dial = net.connector();
        let (client, server) = tokio::join!(dial.connect("mem:negotiate"), listener.accept());

        let sender_id = Identity::generate();
        let receiver_id = Identity::generate();
        let key = vec![7u8; 32];

        let sender = TestPeer {
            session: PairedSession {
                framed: Framed::new(client.unwrap()),
                session_key: key.clone(),
                peer: VerifiedPeer {
                    node_id: receiver_id.node_id().to_string(),
                    public_key: receiver_id.public_key(),
                },
                endpoint: "mem:negotiate".into(),
                direction: Direction::Dialer,
            },
            identity: sender_id,
        };
        let receiver_peer = VerifiedPeer {
            node_id: sender.identity.node_id().to_string(),
            public_key: sender.identity.public_key(),
        };
        let receiver = TestPeer {
            session: PairedSession {
                framed: Framed::new(server.unwrap()),
                session_key: key,
                peer: receiver_peer,
                endpoint: "mem:negotiate#dialer".into(),
                direction: Direction::Acceptor,
            },
            identity: receiver_id,
        };
        (sender, receiver)
    }

    async fn temp_file(content: &[u8]) -> (tempfile::TempDir, FileRecord) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, content).await.unwrap();
        let record = FileRecord::open(&path).await.unwrap();
        (dir, record)
    }

    fn sink_progress() -> mpsc::Sender<Progress> {
        mpsc::channel(64).0
    }

    #[tokio::test]
    async fn when_offer_accepted_expect_file_to_arrive_intact() {
        let (mut sender, mut receiver) = paired().await;
        let content: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let (_dir, record) = temp_file(&content).await;
        let expected_content = content.clone();

        let receive = tokio::spawn(async move {
            let offer = await_offer(&mut receiver.session).await.unwrap();
            assert_eq!(offer.file_name, "notes.txt");
            assert_eq!(offer.file_size, 1024);
            respond(&mut receiver.session, &receiver.identity, true)
                .await
                .unwrap();
            let mut out = Vec::new();
            receive_file(&mut receiver.session, offer.file_size, &mut out, &sink_progress())
                .await
                .unwrap();
            out
        });

        let accepted = offer(&mut sender.session, &sender.identity, &record)
            .await
            .unwrap();
        assert!(accepted);
        let cancel = crate::cancel::CancelSignal::new();
        stream_file(&mut sender.session, &record, &sink_progress(), &cancel.token())
            .await
            .unwrap();

        let got = receive.await.unwrap();
        assert_eq!(got, expected_content);
    }

    #[tokio::test]
    async fn when_offer_denied_expect_false_and_no_bytes() {
        let (mut sender, mut receiver) = paired().await;
        let (_dir, record) = temp_file(b"unwanted").await;

        let deny = tokio::spawn(async move {
            let _ = await_offer(&mut receiver.session).await.unwrap();
            respond(&mut receiver.session, &receiver.identity, false)
                .await
                .unwrap();
        });

        let accepted = offer(&mut sender.session, &sender.identity, &record)
            .await
            .unwrap();
        assert!(!accepted);
        deny.await.unwrap();
    }

    #[tokio::test]
    async fn when_response_arrives_unsolicited_expect_protocol_violation() {
        let (mut sender, mut receiver) = paired().await;

        // A response with no preceding request.
        respond(&mut sender.session, &sender.identity, true)
            .await
            .unwrap();
        let err = await_offer(&mut receiver.session).await.unwrap_err();
        assert!(matches!(err, DripError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn when_envelope_signed_by_stranger_expect_protocol_violation() {
        let (mut sender, mut receiver) = paired().await;
        let stranger = Identity::generate();
        let (_dir, record) = temp_file(b"payload").await;

        // Signed by a key that is not the paired peer's.
        let accepted = tokio::spawn(async move {
            offer(&mut sender.session, &stranger, &record).await
        });
        let err = await_offer(&mut receiver.session).await.unwrap_err();
        assert!(matches!(err, DripError::ProtocolViolation(_)));
        accepted.abort();
    }

    #[tokio::test]
    async fn when_stream_ends_short_expect_transfer_incomplete() {
        let (mut sender, mut receiver) = paired().await;

        let receive = tokio::spawn(async move {
            let mut out = Vec::new();
            receive_file(&mut receiver.session, 1024, &mut out, &sink_progress()).await
        });

        // Half the promised bytes, then a clean close.
        sender
            .session
            .framed
            .write_raw(MessageType::FileChunk, &[0u8; 512])
            .await
            .unwrap();
        sender.session.framed.shutdown().await.unwrap();
        drop(sender);

        let err = receive.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            DripError::TransferIncomplete {
                expected: 1024,
                received: 512
            }
        ));
    }

    #[tokio::test]
    async fn when_peer_sends_more_than_offered_expect_protocol_violation() {
        let (mut sender, mut receiver) = paired().await;

        let receive = tokio::spawn(async move {
            let mut out = Vec::new();
            receive_file(&mut receiver.session, 100, &mut out, &sink_progress()).await
        });

        sender
            .session
            .framed
            .write_raw(MessageType::FileChunk, &[0u8; 512])
            .await
            .unwrap();

        let err = receive.await.unwrap().unwrap_err();
        assert!(matches!(err, DripError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn when_cancelled_mid_stream_expect_user_cancelled() {
        let (mut sender, _receiver) = paired().await;
        let (_dir, record) = temp_file(&[0u8; 4096]).await;

        let cancel = crate::cancel::CancelSignal::new();
        cancel.cancel();
        let err = stream_file(&mut sender.session, &record, &sink_progress(), &cancel.token())
            .await
            .unwrap_err();
        assert!(matches!(err, DripError::UserCancelled));
    }

    #[tokio::test]
    async fn when_file_is_empty_expect_receive_to_complete_immediately() {
        let (_sender, mut receiver) = paired().await;
        let mut out = Vec::new();
        receive_file(&mut receiver.session, 0, &mut out, &sink_progress())
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
