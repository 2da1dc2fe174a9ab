mod ui;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, fmt};

use drip_core::code::TransferCode;
use drip_core::file::FileRecord;
use drip_core::words::MIN_WORDS;
use drip_engine::discovery::Substrate;
use drip_engine::lan::{DEFAULT_LAN_PORT, LanSubstrate};
use drip_engine::node::{Node, NodeCmd, NodeConfig, NodeEvent, NodeHandle, NodeState, Role};
use drip_engine::rendezvous::{self, RendezvousSubstrate};
use drip_engine::tcp::{TcpConnector, TcpListenerFactory};

use crate::ui::{confirm_offer, format_size, print_progress};

/// Drip — send a file to whoever can say the code.
///
/// The sender gets a short word code like `amber-river-stone-lamp`; the
/// receiver types it on the other machine. The first word finds the peer,
/// the rest authenticate it. Nothing else is exchanged out of band.
#[derive(Parser, Debug)]
#[command(name = "drip", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Offer a single file under a fresh word code.
    Send {
        /// The file to send.
        file: PathBuf,

        /// Number of words in the generated code.
        #[arg(short = 'w', long, default_value_t = TransferCode::DEFAULT_WORD_COUNT, env = "DRIP_WORD_COUNT")]
        word_count: usize,

        #[command(flatten)]
        net: NetArgs,
    },

    /// Fetch the file behind a word code.
    Receive {
        /// The code the sender gave you, e.g. `amber-river-stone-lamp`.
        code: String,

        /// Directory to store the received file in.
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// Accept the offer without prompting.
        #[arg(short = 'y', long)]
        yes: bool,

        #[command(flatten)]
        net: NetArgs,
    },

    /// Run a rendezvous server for the global discovery path.
    Serve {
        /// Address to listen on.
        #[arg(short, long, default_value = "0.0.0.0:4339")]
        listen: String,
    },
}

#[derive(Args, Debug)]
struct NetArgs {
    /// Address to bind the transfer listener on.
    #[arg(long, default_value = "0.0.0.0:0")]
    listen: String,

    /// UDP port for LAN discovery broadcasts.
    #[arg(long, default_value_t = DEFAULT_LAN_PORT)]
    lan_port: u16,

    /// Rendezvous server for discovery beyond the local network.
    #[arg(long)]
    rendezvous: Option<String>,
}

impl NetArgs {
    fn substrates(&self) -> Vec<Arc<dyn Substrate>> {
        let mut substrates: Vec<Arc<dyn Substrate>> =
            vec![Arc::new(LanSubstrate::new(self.lan_port))];
        if let Some(server) = &self.rendezvous {
            substrates.push(Arc::new(RendezvousSubstrate::new(server.clone())));
        }
        substrates
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Tracing goes to stderr so it doesn't mix with operator output on
    // stdout. Default to "warn" for library crates.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("drip_cli=info,warn")),
        )
        .init();

    match cli.command {
        Command::Send {
            file,
            word_count,
            net,
        } => run_send(file, word_count, &net).await,
        Command::Receive {
            code,
            out,
            yes,
            net,
        } => run_receive(&code, out, yes, &net).await,
        Command::Serve { listen } => run_serve(&listen).await,
    }
}

async fn run_send(file: PathBuf, word_count: usize, net: &NetArgs) -> ExitCode {
    if word_count < MIN_WORDS {
        eprintln!("A code needs at least {MIN_WORDS} words.");
        return ExitCode::FAILURE;
    }
    let record = match FileRecord::open(&file).await {
        Ok(record) => record,
        Err(e) => {
            eprintln!("Cannot send {}: {e:#}", file.display());
            return ExitCode::FAILURE;
        }
    };
    let code = match TransferCode::generate(word_count) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Cannot generate a code: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("Sending \"{}\" ({})", record.name, format_size(record.size));
    println!("Code is: {code}");
    println!("On the other machine run:");
    println!("\tdrip receive {code}");

    let mut config = NodeConfig::new(code, net.listen.clone());
    config.substrates = net.substrates();
    let handle = Node::start(
        TcpListenerFactory,
        TcpConnector,
        Role::Send { file: record },
        config,
    );
    drive_node(handle, false).await
}

async fn run_receive(code: &str, out: PathBuf, yes: bool, net: &NetArgs) -> ExitCode {
    let code = match TransferCode::parse(code) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Bad code: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = std::fs::create_dir_all(&out) {
        eprintln!("Cannot create {}: {e}", out.display());
        return ExitCode::FAILURE;
    }

    println!("Looking for the sender of {}...", code.channel_phrase());

    let mut config = NodeConfig::new(code, net.listen.clone());
    config.substrates = net.substrates();
    let handle = Node::start(
        TcpListenerFactory,
        TcpConnector,
        Role::Receive { output_dir: out },
        config,
    );
    drive_node(handle, yes).await
}

async fn run_serve(listen: &str) -> ExitCode {
    println!("Rendezvous server on {listen} (ctrl-c to stop)");
    tokio::select! {
        result = async {
            let listener = tokio::net::TcpListener::bind(listen).await?;
            rendezvous::serve(listener).await
        } => {
            if let Err(e) = result {
                eprintln!("Rendezvous server failed: {e:#}");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nBye.");
            ExitCode::SUCCESS
        }
    }
}

/// Relays node events to the terminal until the run reaches a terminal
/// state. Exit code 0 for a completed or user-cancelled run, 1 for an
/// errored one.
async fn drive_node(handle: NodeHandle, auto_accept: bool) -> ExitCode {
    let mut events = handle.events_tx.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut progress_drawn = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                println!("\nCancelling...");
                let _ = handle.cmd_tx.send(NodeCmd::Shutdown).await;
                continue;
            }
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                eprintln!("Node stopped unexpectedly.");
                return ExitCode::FAILURE;
            }
        };

        match event {
            NodeEvent::CandidateFound { endpoint } => {
                println!("  Found a peer at {endpoint}, verifying...");
            }
            NodeEvent::Paired {
                peer_node_id,
                endpoint,
            } => {
                println!("  Verified peer {peer_node_id} at {endpoint}");
            }
            NodeEvent::DiscoveryDegraded { substrate, message } => {
                eprintln!("  ({substrate} discovery unavailable: {message})");
            }
            NodeEvent::OfferReceived {
                file_name,
                file_size,
            } => {
                let accept = if auto_accept {
                    println!(
                        "  Incoming: \"{file_name}\" ({}), accepting.",
                        format_size(file_size)
                    );
                    true
                } else {
                    confirm_offer(&mut stdin, &file_name, file_size).await
                };
                if handle
                    .cmd_tx
                    .send(NodeCmd::RespondToOffer { accept })
                    .await
                    .is_err()
                {
                    eprintln!("Node stopped unexpectedly.");
                    return ExitCode::FAILURE;
                }
            }
            NodeEvent::OfferAnswered { accepted } => {
                if !accepted {
                    println!("  Offer declined.");
                }
            }
            NodeEvent::Progress { transferred, total } => {
                print_progress(transferred, total);
                progress_drawn = true;
            }
            NodeEvent::Done { file_name, bytes } => {
                if progress_drawn {
                    println!();
                }
                if bytes > 0 {
                    println!("  Done: {file_name} ({})", format_size(bytes));
                }
            }
            NodeEvent::Error { message } => {
                if progress_drawn {
                    println!();
                    progress_drawn = false;
                }
                eprintln!("  Error: {message}");
            }
            NodeEvent::StateChanged { to, .. } if to.is_terminal() => {
                // Let any straggling sockets unwind.
                tokio::time::sleep(Duration::from_millis(50)).await;
                return match to {
                    NodeState::Errored => ExitCode::FAILURE,
                    _ => ExitCode::SUCCESS,
                };
            }
            NodeEvent::StateChanged { .. }
            | NodeEvent::CodeReady { .. }
            | NodeEvent::Listening { .. } => {}
        }
    }
}
