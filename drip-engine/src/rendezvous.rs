//! Global discovery via a rendezvous server.
//!
//! The original global path for word-code transfers is a public DHT; Drip
//! keeps that concern behind the [`Substrate`] trait and ships a small
//! line-protocol rendezvous service so the global path works without
//! third-party infrastructure. A DHT-backed substrate can replace this one
//! without touching the coordinator.
//!
//! Protocol, one command per connection:
//!
//! ```text
//! client → server:  PUT <channel-hex> <node-id> <addr>\n     (then EOF)
//! client → server:  GET <channel-hex>\n
//! server → client:  PEER <node-id> <addr>\n                  (repeated,
//!                   replayed for known records and pushed live for new
//!                   ones until either side closes)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use drip_core::channel::ChannelId;

use crate::discovery::{AdvertRecord, Substrate};

/// Rendezvous client substrate pointed at a server address.
pub struct RendezvousSubstrate {
    server_addr: String,
}

impl RendezvousSubstrate {
    #[must_use]
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
        }
    }
}

#[async_trait]
impl Substrate for RendezvousSubstrate {
    fn name(&self) -> &'static str {
        "rendezvous"
    }

    async fn publish(&self, channel: &ChannelId, record: &AdvertRecord) -> Result<()> {
        let mut stream = TcpStream::connect(&self.server_addr)
            .await
            .with_context(|| format!("failed to reach rendezvous server {}", self.server_addr))?;
        let line = format!("PUT {channel} {}\n", record.to_line());
        stream.write_all(line.as_bytes()).await?;
        stream.shutdown().await?;
        debug!(channel = %channel, server = %self.server_addr, "Rendezvous record published");
        Ok(())
    }

    async fn lookup(&self, channel: &ChannelId, found: mpsc::Sender<AdvertRecord>) -> Result<()> {
        let stream = TcpStream::connect(&self.server_addr)
            .await
            .with_context(|| format!("failed to reach rendezvous server {}", self.server_addr))?;
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(format!("GET {channel}\n").as_bytes())
            .await?;

        let mut lines = BufReader::new(read_half).lines();
        while let Some(line) = lines.next_line().await? {
            let Some(rest) = line.strip_prefix("PEER ") else {
                warn!(line = %line, "Unexpected rendezvous response line");
                continue;
            };
            let Some(record) = AdvertRecord::parse_line(rest) else {
                continue;
            };
            if found.send(record).await.is_err() {
                return Ok(());
            }
        }
        // Server went away. The coordinator treats a clean end like a
        // failure only when every other substrate is gone too.
        Ok(())
    }
}

// ── Server ──────────────────────────────────────────────────────────

struct ChannelSlot {
    records: Vec<AdvertRecord>,
    notify: broadcast::Sender<AdvertRecord>,
}

impl Default for ChannelSlot {
    fn default() -> Self {
        let (notify, _) = broadcast::channel(64);
        Self {
            records: Vec::new(),
            notify,
        }
    }
}

type Registry = Arc<Mutex<HashMap<String, ChannelSlot>>>;

/// Runs a rendezvous server on `listener` until the task is dropped.
///
/// Records live for the process lifetime; channel ids are time-bucketed,
/// so stale entries age out of relevance with their bucket.
pub async fn serve(listener: TcpListener) -> Result<()> {
    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
    let local = listener.local_addr().context("no local addr")?;
    info!(addr = %local, "Rendezvous server listening");

    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, &registry).await {
                debug!(peer = %peer, error = %e, "Rendezvous client ended with error");
            }
        });
    }
}

/// Binds a listener on `addr` and spawns [`serve`] on it.
///
/// # Errors
///
/// Fails when the address cannot be bound.
pub async fn spawn_server(addr: &str) -> Result<(String, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind rendezvous server on {addr}"))?;
    let local = listener.local_addr()?.to_string();
    let handle = tokio::spawn(async move {
        if let Err(e) = serve(listener).await {
            warn!(error = %e, "Rendezvous server stopped");
        }
    });
    Ok((local, handle))
}

async fn handle_client(stream: TcpStream, registry: &Registry) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    if let Some(rest) = line.strip_prefix("PUT ") {
        let Some((channel_hex, record_line)) = rest.split_once(' ') else {
            bail!("malformed PUT");
        };
        let Some(record) = AdvertRecord::parse_line(record_line) else {
            bail!("malformed PUT record");
        };
        let mut reg = registry.lock().expect("registry lock poisoned");
        let slot = reg.entry(channel_hex.to_string()).or_default();
        if !slot.records.contains(&record) {
            debug!(channel = %channel_hex, endpoint = %record.addr, "Record stored");
            slot.records.push(record.clone());
        }
        let _ = slot.notify.send(record);
        return Ok(());
    }

    if let Some(channel_hex) = line.strip_prefix("GET ") {
        let (existing, mut live) = {
            let mut reg = registry.lock().expect("registry lock poisoned");
            let slot = reg.entry(channel_hex.to_string()).or_default();
            (slot.records.clone(), slot.notify.subscribe())
        };
        for record in existing {
            write_half
                .write_all(format!("PEER {}\n", record.to_line()).as_bytes())
                .await?;
        }
        loop {
            match live.recv().await {
                Ok(record) => {
                    write_half
                        .write_all(format!("PEER {}\n", record.to_line()).as_bytes())
                        .await?;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    bail!("unknown command: {line}");
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;

    fn channel() -> ChannelId {
        ChannelId::derive_at("amber", Duration::from_secs(3600), SystemTime::UNIX_EPOCH)
    }

    fn record(node: &str, addr: &str) -> AdvertRecord {
        AdvertRecord {
            node_id: node.into(),
            addr: addr.into(),
        }
    }

    #[tokio::test]
    async fn when_record_put_before_get_expect_replay() {
        let (addr, server) = spawn_server("127.0.0.1:0").await.unwrap();
        let substrate = RendezvousSubstrate::new(addr.clone());
        let peer = record("peer-node", "10.0.0.7:4242");
        substrate.publish(&channel(), &peer).await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let lookup_channel = channel();
        let lookup = tokio::spawn(async move {
            let _ = RendezvousSubstrate::new(addr).lookup(&lookup_channel, tx).await;
        });

        let heard = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("lookup ended early");
        assert_eq!(heard, peer);
        lookup.abort();
        server.abort();
    }

    #[tokio::test]
    async fn when_record_put_after_get_expect_live_push() {
        let (addr, server) = spawn_server("127.0.0.1:0").await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let lookup_addr = addr.clone();
        let lookup_channel = channel();
        let lookup = tokio::spawn(async move {
            let _ = RendezvousSubstrate::new(lookup_addr)
                .lookup(&lookup_channel, tx)
                .await;
        });
        // Let the GET register before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let peer = record("peer-node", "10.0.0.7:4242");
        RendezvousSubstrate::new(addr)
            .publish(&channel(), &peer)
            .await
            .unwrap();

        let heard = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("lookup ended early");
        assert_eq!(heard, peer);
        lookup.abort();
        server.abort();
    }

    #[tokio::test]
    async fn when_channels_differ_expect_no_cross_talk() {
        let (addr, server) = spawn_server("127.0.0.1:0").await.unwrap();
        let other = ChannelId::derive_at(
            "river",
            Duration::from_secs(3600),
            SystemTime::UNIX_EPOCH,
        );
        RendezvousSubstrate::new(addr.clone())
            .publish(&channel(), &record("peer-node", "10.0.0.7:4242"))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let lookup = tokio::spawn(async move {
            let _ = RendezvousSubstrate::new(addr).lookup(&other, tx).await;
        });

        let heard = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(heard.is_err(), "record leaked across channels");
        lookup.abort();
        server.abort();
    }

    #[tokio::test]
    async fn when_server_is_unreachable_expect_publish_error() {
        // Bind-then-drop to get a dead port.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap().to_string();
        drop(probe);

        let substrate = RendezvousSubstrate::new(addr);
        assert!(
            substrate
                .publish(&channel(), &record("n", "a:1"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn when_duplicate_records_put_expect_single_replay() {
        let (addr, server) = spawn_server("127.0.0.1:0").await.unwrap();
        let substrate = RendezvousSubstrate::new(addr.clone());
        let peer = record("peer-node", "10.0.0.7:4242");
        substrate.publish(&channel(), &peer).await.unwrap();
        substrate.publish(&channel(), &peer).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let lookup_channel = channel();
        let lookup = tokio::spawn(async move {
            let _ = RendezvousSubstrate::new(addr).lookup(&lookup_channel, tx).await;
        });

        assert_eq!(rx.recv().await.unwrap(), peer);
        let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err(), "duplicate record replayed");
        lookup.abort();
        server.abort();
    }
}
