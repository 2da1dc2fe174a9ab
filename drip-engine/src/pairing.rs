//! Candidate authentication race.
//!
//! Discovery produces candidates faster than authentication can vet them,
//! so pairing runs several attempts concurrently and keeps exactly one
//! winner: the first candidate to complete the SPAKE2 exchange, confirm
//! the derived key, and present a verifiable identity. Everything else is
//! cancelled. The single event loop in [`run_pairing`] is the only place
//! that decides who won, which is what makes "exactly one" hold even when
//! two attempts succeed in the same instant.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use spake2::{Ed25519Group, Identity as PakeIdentity, Password, Spake2};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use drip_core::code::SecretPhrase;
use drip_core::envelope::{ConfirmPayload, MessageType, PakePayload, PeerInfoPayload};
use drip_core::error::DripError;
use drip_core::identity::{self, Identity, PUBLIC_KEY_LEN};

use crate::cancel::{CancelSignal, CancelToken};
use crate::discovery::Candidate;
use crate::framing::Framed;
use crate::transport::{Connection, Connector};

/// How many authentication attempts may run at once.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Shared identity string for the symmetric SPAKE2 exchange.
const PAKE_ID: &[u8] = b"drip:pake:v1";
/// Domain prefix for the session-key binding that PeerInfo signs over.
const BINDING_CONTEXT: &[u8] = b"drip:ident:v1";

/// Who initiated the underlying connection. The PAKE itself is symmetric;
/// the direction only keys the confirmation tags so each side proves the
/// key without echoing the other's proof back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Dialer,
    Acceptor,
}

impl Direction {
    fn opposite(self) -> Self {
        match self {
            Self::Dialer => Self::Acceptor,
            Self::Acceptor => Self::Dialer,
        }
    }

    fn confirm_context(self) -> &'static [u8] {
        match self {
            Self::Dialer => b"drip:confirm:dialer",
            Self::Acceptor => b"drip:confirm:acceptor",
        }
    }
}

/// One unit of work for the race: either a discovered endpoint to dial or
/// a connection a stranger already opened to us.
pub enum PairingInput<C: Connection> {
    Outbound(Candidate),
    Inbound(C),
}

/// The peer identity verified during pairing.
#[derive(Debug, Clone)]
pub struct VerifiedPeer {
    pub node_id: String,
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

/// An authenticated session: the winner of the race.
pub struct PairedSession<C: Connection> {
    pub framed: Framed<C>,
    pub session_key: Vec<u8>,
    pub peer: VerifiedPeer,
    pub endpoint: String,
    pub direction: Direction,
}

// Manual impl: the session key must never reach a log line.
impl<C: Connection> fmt::Debug for PairedSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairedSession")
            .field("peer", &self.peer)
            .field("endpoint", &self.endpoint)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Per-attempt status, for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptStatus {
    Pending,
    Authenticating,
    Succeeded,
    Failed(String),
    /// Cancelled because another attempt already won.
    Abandoned,
}

/// Status change for one endpoint's attempt.
#[derive(Debug, Clone)]
pub struct AttemptUpdate {
    pub endpoint: String,
    pub status: AttemptStatus,
}

/// Race parameters.
pub struct PairingConfig {
    pub secret: SecretPhrase,
    pub max_in_flight: usize,
}

impl PairingConfig {
    #[must_use]
    pub fn new(secret: SecretPhrase) -> Self {
        Self {
            secret,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

enum Outcome<C: Connection> {
    Success(Box<PairedSession<C>>),
    Failed { endpoint: String, message: String },
    Abandoned { endpoint: String },
}

/// Runs the pairing race until one candidate wins, every candidate has
/// failed, or the run is cancelled.
///
/// Candidates arrive on `inputs`; closing that channel tells the race no
/// more will come. Attempt status changes go out on `updates` best-effort.
/// When a winner emerges, the remaining attempts are cancelled and the
/// loop waits for them to acknowledge before returning, so no attempt is
/// left holding a half-authenticated connection.
///
/// # Errors
///
/// [`DripError::PairingFailed`] when the input stream ends with no winner,
/// [`DripError::UserCancelled`] when `cancel` fires first.
pub async fn run_pairing<K>(
    config: PairingConfig,
    identity: Arc<Identity>,
    connector: Arc<K>,
    mut inputs: mpsc::Receiver<PairingInput<K::Conn>>,
    updates: mpsc::Sender<AttemptUpdate>,
    cancel: &CancelToken,
) -> Result<PairedSession<K::Conn>, DripError>
where
    K: Connector,
{
    let mut cancel = cancel.clone();
    let attempts = CancelSignal::new();
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<Outcome<K::Conn>>(16);

    let mut pending: VecDeque<PairingInput<K::Conn>> = VecDeque::new();
    let mut in_flight = 0usize;
    let mut inputs_open = true;
    let mut winner: Option<PairedSession<K::Conn>> = None;

    loop {
        if let Some(session) = winner.take() {
            if in_flight == 0 {
                return Ok(session);
            }
            winner = Some(session);
        } else if !inputs_open && in_flight == 0 && pending.is_empty() {
            return Err(DripError::PairingFailed(
                "no candidate completed authentication".into(),
            ));
        }

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                attempts.cancel();
                return Err(DripError::UserCancelled);
            }

            outcome = outcome_rx.recv() => {
                // Senders outlive the loop via outcome_tx; recv cannot
                // return None while we hold it.
                let Some(outcome) = outcome else { continue };
                in_flight -= 1;
                match outcome {
                    Outcome::Success(session) => {
                        if winner.is_some() {
                            // Both passed authentication before the cancel
                            // landed; the slot already has its occupant.
                            error!(
                                endpoint = %session.endpoint,
                                "Second pairing success after a winner was chosen; dropping"
                            );
                            let _ = send_update(&updates, &session.endpoint, AttemptStatus::Abandoned).await;
                            continue;
                        }
                        info!(
                            endpoint = %session.endpoint,
                            peer = %session.peer.node_id,
                            "Pairing won"
                        );
                        let _ = send_update(&updates, &session.endpoint, AttemptStatus::Succeeded).await;
                        attempts.cancel();
                        inputs.close();
                        for input in pending.drain(..) {
                            if let PairingInput::Outbound(c) = input {
                                let _ = send_update(&updates, &c.endpoint, AttemptStatus::Abandoned).await;
                            }
                        }
                        winner = Some(*session);
                    }
                    Outcome::Failed { endpoint, message } => {
                        warn!(endpoint = %endpoint, reason = %message, "Pairing attempt failed");
                        let _ = send_update(&updates, &endpoint, AttemptStatus::Failed(message)).await;
                        maybe_spawn(
                            &mut pending,
                            &mut in_flight,
                            winner.is_some(),
                            config.max_in_flight,
                            &config.secret,
                            &identity,
                            &connector,
                            &outcome_tx,
                            &updates,
                            &attempts,
                        );
                    }
                    Outcome::Abandoned { endpoint } => {
                        debug!(endpoint = %endpoint, "Pairing attempt abandoned");
                        let _ = send_update(&updates, &endpoint, AttemptStatus::Abandoned).await;
                    }
                }
            }

            input = inputs.recv(), if inputs_open && winner.is_none() => {
                let Some(input) = input else {
                    inputs_open = false;
                    continue;
                };
                let endpoint = input_endpoint(&input);
                let _ = send_update(&updates, &endpoint, AttemptStatus::Pending).await;
                pending.push_back(input);
                maybe_spawn(
                    &mut pending,
                    &mut in_flight,
                    winner.is_some(),
                    config.max_in_flight,
                    &config.secret,
                    &identity,
                    &connector,
                    &outcome_tx,
                    &updates,
                    &attempts,
                );
            }
        }
    }
}

fn input_endpoint<C: Connection>(input: &PairingInput<C>) -> String {
    match input {
        PairingInput::Outbound(candidate) => candidate.endpoint.clone(),
        PairingInput::Inbound(conn) => conn.peer(),
    }
}

#[allow(clippy::too_many_arguments)]
fn maybe_spawn<K>(
    pending: &mut VecDeque<PairingInput<K::Conn>>,
    in_flight: &mut usize,
    winner_known: bool,
    max_in_flight: usize,
    secret: &SecretPhrase,
    identity: &Arc<Identity>,
    connector: &Arc<K>,
    outcome_tx: &mpsc::Sender<Outcome<K::Conn>>,
    updates: &mpsc::Sender<AttemptUpdate>,
    attempts: &CancelSignal,
) where
    K: Connector,
{
    while !winner_known && *in_flight < max_in_flight {
        let Some(input) = pending.pop_front() else {
            return;
        };
        *in_flight += 1;
        let secret = secret.clone();
        let identity = Arc::clone(identity);
        let connector = Arc::clone(connector);
        let outcome_tx = outcome_tx.clone();
        let updates = updates.clone();
        let mut token = attempts.token();
        tokio::spawn(async move {
            let endpoint = input_endpoint(&input);
            let _ = send_update(&updates, &endpoint, AttemptStatus::Authenticating).await;
            let outcome = tokio::select! {
                () = token.cancelled() => Outcome::Abandoned { endpoint },
                result = attempt(input, &secret, &identity, connector.as_ref()) => {
                    match result {
                        Ok(session) => Outcome::Success(Box::new(session)),
                        Err(e) => Outcome::Failed { endpoint, message: e.to_string() },
                    }
                }
            };
            let _ = outcome_tx.send(outcome).await;
        });
    }
}

async fn send_update(
    updates: &mpsc::Sender<AttemptUpdate>,
    endpoint: &str,
    status: AttemptStatus,
) -> Result<(), mpsc::error::SendError<AttemptUpdate>> {
    updates
        .send(AttemptUpdate {
            endpoint: endpoint.to_string(),
            status,
        })
        .await
}

async fn attempt<K>(
    input: PairingInput<K::Conn>,
    secret: &SecretPhrase,
    identity: &Identity,
    connector: &K,
) -> Result<PairedSession<K::Conn>, DripError>
where
    K: Connector,
{
    match input {
        PairingInput::Outbound(candidate) => {
            let conn = connector
                .connect(&candidate.endpoint)
                .await
                .map_err(|e| DripError::PairingFailed(format!("dial failed: {e}")))?;
            authenticate(
                Framed::new(conn),
                candidate.endpoint,
                secret,
                identity,
                Direction::Dialer,
            )
            .await
        }
        PairingInput::Inbound(conn) => {
            let endpoint = conn.peer();
            authenticate(Framed::new(conn), endpoint, secret, identity, Direction::Acceptor).await
        }
    }
}

/// Runs the three-step handshake over an established connection:
/// SPAKE2 message swap, direction-keyed key confirmation, and a signed
/// identity announcement bound to the session key.
async fn authenticate<C: Connection>(
    mut framed: Framed<C>,
    endpoint: String,
    secret: &SecretPhrase,
    identity: &Identity,
    direction: Direction,
) -> Result<PairedSession<C>, DripError> {
    // Step 1: SPAKE2. Both sides derive the same key iff the secret
    // phrases match; a mismatch surfaces in step 2, not here.
    let (state, outbound) = Spake2::<Ed25519Group>::start_symmetric(
        &Password::new(secret.as_bytes()),
        &PakeIdentity::new(PAKE_ID),
    );
    framed
        .write_json(
            MessageType::PakeMsg,
            &PakePayload {
                body_hex: hex::encode(&outbound),
            },
        )
        .await
        .map_err(|e| DripError::PairingFailed(format!("pake send failed: {e}")))?;
    let inbound: PakePayload = framed.read_json(MessageType::PakeMsg).await?;
    let inbound_bytes = hex::decode(&inbound.body_hex)
        .map_err(|_| DripError::ProtocolViolation("pake message is not hex".into()))?;
    let session_key = state
        .finish(&inbound_bytes)
        .map_err(|e| DripError::PairingFailed(format!("pake exchange failed: {e}")))?;

    // Step 2: key confirmation. Direction-keyed so a reflected tag proves
    // nothing; an unexpected tag means the secrets differed.
    let mine = confirm_tag(&session_key, direction);
    framed
        .write_json(
            MessageType::PakeConfirm,
            &ConfirmPayload {
                tag_hex: hex::encode(mine),
            },
        )
        .await
        .map_err(|e| DripError::PairingFailed(format!("confirm send failed: {e}")))?;
    let theirs: ConfirmPayload = framed.read_json(MessageType::PakeConfirm).await?;
    let expected = confirm_tag(&session_key, direction.opposite());
    let theirs_bytes = hex::decode(&theirs.tag_hex)
        .map_err(|_| DripError::ProtocolViolation("confirm tag is not hex".into()))?;
    if theirs_bytes != expected {
        return Err(DripError::PairingFailed(
            "key confirmation failed; the codes do not match".into(),
        ));
    }

    // Step 3: identity, signed over the session-key binding so a key
    // holder cannot present someone else's public key.
    let binding = session_binding(&session_key);
    framed
        .write_json(
            MessageType::PeerInfo,
            &PeerInfoPayload {
                node_id: identity.node_id().to_string(),
                public_key_hex: hex::encode(identity.public_key()),
                signature_hex: hex::encode(identity.sign(&binding)),
            },
        )
        .await
        .map_err(|e| DripError::PairingFailed(format!("peer info send failed: {e}")))?;
    let info: PeerInfoPayload = framed.read_json(MessageType::PeerInfo).await?;
    let peer = verify_peer_info(&info, &binding)?;

    debug!(endpoint = %endpoint, peer = %peer.node_id, "Authentication complete");
    Ok(PairedSession {
        framed,
        session_key,
        peer,
        endpoint,
        direction,
    })
}

fn verify_peer_info(info: &PeerInfoPayload, binding: &[u8]) -> Result<VerifiedPeer, DripError> {
    let key_bytes = hex::decode(&info.public_key_hex)
        .map_err(|_| DripError::ProtocolViolation("peer public key is not hex".into()))?;
    let public_key = <[u8; PUBLIC_KEY_LEN]>::try_from(key_bytes.as_slice())
        .map_err(|_| DripError::ProtocolViolation("peer public key has wrong length".into()))?;
    if identity::node_id_for(&public_key) != info.node_id {
        return Err(DripError::ProtocolViolation(
            "peer node id does not match its public key".into(),
        ));
    }
    let signature = hex::decode(&info.signature_hex)
        .map_err(|_| DripError::ProtocolViolation("peer signature is not hex".into()))?;
    if !identity::verify(&public_key, binding, &signature) {
        return Err(DripError::ProtocolViolation(
            "peer identity signature does not cover this session".into(),
        ));
    }
    Ok(VerifiedPeer {
        node_id: info.node_id.clone(),
        public_key,
    })
}

fn confirm_tag(session_key: &[u8], direction: Direction) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(direction.confirm_context());
    hasher.update(session_key);
    hasher.finalize().to_vec()
}

fn session_binding(session_key: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(BINDING_CONTEXT);
    hasher.update(session_key);
    hasher.finalize().to_vec()
}
