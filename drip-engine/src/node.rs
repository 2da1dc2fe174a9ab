//! The node state machine: one transfer, start to finish.
//!
//! A node owns the whole pipeline for a single run — derive the channel
//! from the code, advertise or search, race the candidates through
//! pairing, negotiate, and move the bytes. The caller drives it through a
//! command channel and observes it through a broadcast event channel, in
//! the same handle style as the rest of the engine.
//!
//! Roles are asymmetric on purpose: the sender advertises and accepts
//! inbound connections, the receiver searches and dials. If both sides
//! did both, each could crown a different connection as its pairing
//! winner and the session would split.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use drip_core::channel::{self, ChannelId};
use drip_core::code::TransferCode;
use drip_core::error::DripError;
use drip_core::file::FileRecord;
use drip_core::identity::Identity;

use crate::cancel::CancelSignal;
use crate::discovery::{
    AdvertRecord, DEFAULT_ADVERTISE_INTERVAL, DiscoveryCoordinator, DiscoveryEvent, Substrate,
};
use crate::negotiate::{self, Progress};
use crate::pairing::{
    self, DEFAULT_MAX_IN_FLIGHT, PairedSession, PairingConfig, PairingInput,
};
use crate::transport::{Connection, Connector, Listener, ListenerFactory};

// ── States ──────────────────────────────────────────────────────────

/// Lifecycle of a node run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Discovering,
    Pairing,
    Negotiating,
    Transferring,
    Done,
    Cancelled,
    Errored,
}

impl NodeState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `Cancelled` and `Errored` are reachable from any live state;
    /// `Done`, `Cancelled`, and `Errored` are terminal.
    #[must_use]
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::{
            Cancelled, Discovering, Done, Errored, Idle, Negotiating, Pairing, Transferring,
        };
        if matches!(self, Done | Cancelled | Errored) {
            return false;
        }
        if matches!(next, Cancelled | Errored) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Discovering)
                | (Discovering, Pairing)
                | (Pairing, Negotiating)
                | (Negotiating, Transferring)
                | (Negotiating, Done)
                | (Transferring, Done)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Errored)
    }
}

/// What this node is here to do.
pub enum Role {
    Send { file: FileRecord },
    Receive { output_dir: PathBuf },
}

// ── Commands and events ─────────────────────────────────────────────

/// Commands sent by the CLI / embedder to control the node.
#[derive(Clone, Debug)]
pub enum NodeCmd {
    /// Answer a pending offer (receiver only).
    RespondToOffer { accept: bool },
    /// Abort the run wherever it is.
    Shutdown,
}

/// Events emitted by the node for the CLI / embedder to observe.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    StateChanged { from: NodeState, to: NodeState },
    /// The transfer code for this run, in human form.
    CodeReady { code: String },
    Listening { addr: String },
    CandidateFound { endpoint: String },
    /// One discovery substrate died; the search continues on the rest.
    DiscoveryDegraded { substrate: &'static str, message: String },
    Paired { peer_node_id: String, endpoint: String },
    OfferReceived { file_name: String, file_size: u64 },
    OfferAnswered { accepted: bool },
    Progress { transferred: u64, total: u64 },
    Done { file_name: String, bytes: u64 },
    Error { message: String },
}

/// Handle returned by [`Node::start`].
pub struct NodeHandle {
    pub cmd_tx: mpsc::Sender<NodeCmd>,
    pub events_tx: broadcast::Sender<NodeEvent>,
}

/// Per-run parameters shared by both roles.
pub struct NodeConfig {
    pub code: TransferCode,
    /// Address to bind the transfer listener on; `":0"` forms pick a port.
    pub listen_addr: String,
    pub substrates: Vec<Arc<dyn Substrate>>,
    /// Channel time-bucket width.
    pub granularity: Duration,
    pub advertise_interval: Duration,
    pub max_in_flight: usize,
}

impl NodeConfig {
    #[must_use]
    pub fn new(code: TransferCode, listen_addr: impl Into<String>) -> Self {
        Self {
            code,
            listen_addr: listen_addr.into(),
            substrates: Vec::new(),
            granularity: channel::DEFAULT_BUCKET,
            advertise_interval: DEFAULT_ADVERTISE_INTERVAL,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

// ── Node ────────────────────────────────────────────────────────────

/// A single-transfer node.
pub struct Node;

impl Node {
    /// Spawns the node run loop and returns a handle to control it.
    ///
    /// The run starts immediately; subscribe to `events_tx` before the
    /// first `.await` to observe it from the beginning.
    pub fn start<F, K>(factory: F, connector: K, role: Role, config: NodeConfig) -> NodeHandle
    where
        F: ListenerFactory,
        K: Connector<Conn = <F::L as Listener>::Conn>,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<NodeCmd>(32);
        let (events_tx, _) = broadcast::channel::<NodeEvent>(128);

        let events = events_tx.clone();
        info!("Spawning node run loop");
        tokio::spawn(run_node::<F, K>(factory, connector, role, config, cmd_rx, events));

        NodeHandle { cmd_tx, events_tx }
    }
}

/// Tracks the current state and emits `StateChanged` on every move.
struct StateTracker {
    current: NodeState,
    events: broadcast::Sender<NodeEvent>,
}

impl StateTracker {
    fn new(events: broadcast::Sender<NodeEvent>) -> Self {
        Self {
            current: NodeState::Idle,
            events,
        }
    }

    fn set(&mut self, next: NodeState) {
        debug_assert!(
            self.current.can_transition_to(next),
            "illegal transition {:?} -> {next:?}",
            self.current
        );
        debug!(from = ?self.current, to = ?next, "State change");
        let _ = self.events.send(NodeEvent::StateChanged {
            from: self.current,
            to: next,
        });
        self.current = next;
    }

    fn fail(&mut self, error: &DripError) {
        warn!(error = %error, "Node run failed");
        let _ = self.events.send(NodeEvent::Error {
            message: error.to_string(),
        });
        self.set(NodeState::Errored);
    }

    fn cancelled(&mut self) {
        info!("Node run cancelled");
        self.set(NodeState::Cancelled);
    }
}

#[allow(clippy::too_many_lines)]
async fn run_node<F, K>(
    factory: F,
    connector: K,
    role: Role,
    config: NodeConfig,
    mut cmd_rx: mpsc::Receiver<NodeCmd>,
    events: broadcast::Sender<NodeEvent>,
) where
    F: ListenerFactory,
    K: Connector<Conn = <F::L as Listener>::Conn>,
{
    let mut state = StateTracker::new(events.clone());
    let identity = Arc::new(Identity::generate());
    let _ = events.send(NodeEvent::CodeReady {
        code: config.code.to_string(),
    });

    let mut listener = match factory.bind(&config.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            state.fail(&DripError::Other(e.context("failed to bind listener")));
            return;
        }
    };
    let local_addr = listener.local_addr();
    info!(addr = %local_addr, node_id = %identity.node_id(), "Node listening");
    let _ = events.send(NodeEvent::Listening {
        addr: local_addr.clone(),
    });

    // Two cancellation scopes: discovery stops as soon as pairing is won,
    // the run signal covers everything until the node exits.
    let run_signal = CancelSignal::new();
    let discovery_stop = CancelSignal::new();

    let channel_id = ChannelId::derive(&config.code.channel_phrase(), config.granularity);
    let coordinator = DiscoveryCoordinator::new(
        config.substrates.clone(),
        AdvertRecord {
            node_id: identity.node_id().to_string(),
            addr: local_addr,
        },
    )
    .with_advertise_interval(config.advertise_interval);

    let sending = matches!(role, Role::Send { .. });
    state.set(NodeState::Discovering);
    // The sender's stream carries only substrate health; the receiver's
    // carries candidates too. Total substrate failure surfaces on both.
    let mut search_rx = Some(if sending {
        coordinator.advertise(channel_id, &discovery_stop.token())
    } else {
        coordinator.search(channel_id, &discovery_stop.token())
    });

    let (pair_tx, pair_rx) = mpsc::channel::<PairingInput<K::Conn>>(32);
    let mut pair_tx = Some(pair_tx);
    let (update_tx, mut update_rx) = mpsc::channel(64);
    let race_token = run_signal.token();
    let race_config = PairingConfig {
        secret: config.code.secret_phrase(),
        max_in_flight: config.max_in_flight,
    };
    let race_identity = Arc::clone(&identity);
    let connector = Arc::new(connector);
    let race_connector = Arc::clone(&connector);
    let mut race = tokio::spawn(async move {
        pairing::run_pairing(
            race_config,
            race_identity,
            race_connector,
            pair_rx,
            update_tx,
            &race_token,
        )
        .await
    });

    let mut discovery_unavailable = false;
    let mut updates_open = true;
    let mut session: PairedSession<K::Conn> = loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(NodeCmd::Shutdown) | None => {
                        run_signal.cancel();
                        discovery_stop.cancel();
                        state.cancelled();
                        return;
                    }
                    Some(NodeCmd::RespondToOffer { .. }) => {
                        warn!("RespondToOffer received before any offer; ignoring");
                    }
                }
            }

            joined = &mut race => {
                discovery_stop.cancel();
                match joined {
                    Ok(Ok(session)) => break session,
                    Ok(Err(e)) => {
                        // Discovery dying upstream is the root cause when
                        // the race starved because of it.
                        if discovery_unavailable
                            && matches!(e, DripError::PairingFailed(_))
                        {
                            state.fail(&DripError::DiscoveryUnavailable);
                        } else {
                            state.fail(&e);
                        }
                        return;
                    }
                    Err(e) => {
                        state.fail(&DripError::Other(anyhow::Error::new(e)));
                        return;
                    }
                }
            }

            event = async { search_rx.as_mut().expect("guarded").recv().await },
                if search_rx.is_some() =>
            {
                match event {
                    Some(DiscoveryEvent::Candidate(candidate)) => {
                        let _ = events.send(NodeEvent::CandidateFound {
                            endpoint: candidate.endpoint.clone(),
                        });
                        if state.current == NodeState::Discovering {
                            state.set(NodeState::Pairing);
                        }
                        if let Some(tx) = &pair_tx {
                            let _ = tx.send(PairingInput::Outbound(candidate)).await;
                        }
                    }
                    Some(DiscoveryEvent::SubstrateFailed { name, message }) => {
                        let _ = events.send(NodeEvent::DiscoveryDegraded {
                            substrate: name,
                            message,
                        });
                    }
                    Some(DiscoveryEvent::Unavailable) => {
                        discovery_unavailable = true;
                        // No more candidates will ever arrive; let the
                        // race drain what it has and report.
                        pair_tx = None;
                    }
                    None => {
                        search_rx = None;
                    }
                }
            }

            accepted = listener.accept(), if sending && pair_tx.is_some() => {
                match accepted {
                    Ok(conn) => {
                        let _ = events.send(NodeEvent::CandidateFound {
                            endpoint: conn.peer(),
                        });
                        if state.current == NodeState::Discovering {
                            state.set(NodeState::Pairing);
                        }
                        if let Some(tx) = &pair_tx {
                            let _ = tx.send(PairingInput::Inbound(conn)).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }

            update = update_rx.recv(), if updates_open => {
                match update {
                    Some(update) => {
                        debug!(endpoint = %update.endpoint, status = ?update.status, "Pairing attempt");
                    }
                    None => updates_open = false,
                }
            }
        }
    };

    let _ = events.send(NodeEvent::Paired {
        peer_node_id: session.peer.node_id.clone(),
        endpoint: session.endpoint.clone(),
    });
    if state.current == NodeState::Discovering {
        // An inbound winner can land before any candidate event did.
        state.set(NodeState::Pairing);
    }
    state.set(NodeState::Negotiating);

    // Forward byte progress to the event channel.
    let (progress_tx, mut progress_rx) = mpsc::channel::<Progress>(64);
    let progress_events = events.clone();
    tokio::spawn(async move {
        while let Some(p) = progress_rx.recv().await {
            let _ = progress_events.send(NodeEvent::Progress {
                transferred: p.transferred,
                total: p.total,
            });
        }
    });

    match role {
        Role::Send { file } => {
            let Some(result) =
                drive(negotiate::offer(&mut session, &identity, &file), &mut cmd_rx, &run_signal).await
            else {
                state.cancelled();
                return;
            };
            let accepted = match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    state.fail(&e);
                    return;
                }
            };
            let _ = events.send(NodeEvent::OfferAnswered { accepted });
            if !accepted {
                info!("Peer declined the offer");
                let _ = events.send(NodeEvent::Done {
                    file_name: file.name.clone(),
                    bytes: 0,
                });
                state.set(NodeState::Done);
                return;
            }

            state.set(NodeState::Transferring);
            let stream_cancel = run_signal.token();
            let stream =
                negotiate::stream_file(&mut session, &file, &progress_tx, &stream_cancel);
            let Some(result) = drive(stream, &mut cmd_rx, &run_signal).await else {
                state.cancelled();
                return;
            };
            match result {
                Ok(()) => {
                    let _ = events.send(NodeEvent::Done {
                        file_name: file.name.clone(),
                        bytes: file.size,
                    });
                    state.set(NodeState::Done);
                }
                Err(DripError::UserCancelled) => state.cancelled(),
                Err(e) => state.fail(&e),
            }
        }

        Role::Receive { output_dir } => {
            let Some(result) = drive(negotiate::await_offer(&mut session), &mut cmd_rx, &run_signal).await
            else {
                state.cancelled();
                return;
            };
            let offer = match result {
                Ok(offer) => offer,
                Err(e) => {
                    state.fail(&e);
                    return;
                }
            };
            let _ = events.send(NodeEvent::OfferReceived {
                file_name: offer.file_name.clone(),
                file_size: offer.file_size,
            });

            // Wait for the embedder's decision.
            let accept = loop {
                match cmd_rx.recv().await {
                    Some(NodeCmd::RespondToOffer { accept }) => break accept,
                    Some(NodeCmd::Shutdown) | None => {
                        run_signal.cancel();
                        state.cancelled();
                        return;
                    }
                }
            };
            if let Err(e) = negotiate::respond(&mut session, &identity, accept).await {
                state.fail(&e);
                return;
            }
            let _ = events.send(NodeEvent::OfferAnswered { accepted: accept });
            if !accept {
                let _ = events.send(NodeEvent::Done {
                    file_name: offer.file_name.clone(),
                    bytes: 0,
                });
                state.set(NodeState::Done);
                return;
            }

            state.set(NodeState::Transferring);
            // Strip any directory components a malicious sender slipped in.
            let safe_name = Path::new(&offer.file_name)
                .file_name()
                .map_or_else(|| "received".to_string(), |n| n.to_string_lossy().to_string());
            let target = output_dir.join(&safe_name);
            let mut sink = match tokio::fs::File::create(&target).await {
                Ok(f) => f,
                Err(e) => {
                    state.fail(&DripError::Other(
                        anyhow::Error::new(e).context(format!("cannot create {}", target.display())),
                    ));
                    return;
                }
            };
            let receive =
                negotiate::receive_file(&mut session, offer.file_size, &mut sink, &progress_tx);
            let Some(result) = drive(receive, &mut cmd_rx, &run_signal).await else {
                state.cancelled();
                return;
            };
            match result {
                Ok(()) => {
                    info!(path = %target.display(), bytes = offer.file_size, "Transfer complete");
                    let _ = events.send(NodeEvent::Done {
                        file_name: safe_name,
                        bytes: offer.file_size,
                    });
                    state.set(NodeState::Done);
                }
                Err(e) => state.fail(&e),
            }
        }
    }
}

/// Runs `fut` to completion while still honoring `Shutdown` commands.
///
/// Returns `None` when the run was shut down; the run signal has already
/// been raised so any cancellation-aware work inside `fut` unwound before
/// the future was dropped.
async fn drive<T>(
    fut: impl Future<Output = T>,
    cmd_rx: &mut mpsc::Receiver<NodeCmd>,
    run_signal: &CancelSignal,
) -> Option<T> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(NodeCmd::Shutdown) | None => {
                        run_signal.cancel();
                        return None;
                    }
                    Some(other) => {
                        warn!(cmd = ?other, "Command not applicable right now; ignoring");
                    }
                }
            }
            out = &mut fut => return Some(out),
        }
    }
}
