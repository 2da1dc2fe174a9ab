//! In-memory transport and discovery substrate.
//!
//! Everything the engine needs to run two full nodes inside one process:
//! a duplex-pipe transport behind the [`transport`](crate::transport)
//! traits and a shared-hub [`Substrate`](crate::discovery::Substrate).
//! Used heavily by the engine's own tests and available to embedders that
//! want to exercise the pipeline without touching the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, mpsc};

use drip_core::channel::ChannelId;

use crate::discovery::{AdvertRecord, Substrate};
use crate::transport::{Connection, Connector, Listener, ListenerFactory};

const PIPE_CAPACITY: usize = 256 * 1024;

// ── Transport ───────────────────────────────────────────────────────

/// One end of an in-memory duplex pipe.
pub struct MemoryConnection {
    io: DuplexStream,
    peer: String,
}

impl Connection for MemoryConnection {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.io
                .read(buf)
                .await
                .context("failed to read from memory connection")
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.io
                .write_all(buf)
                .await
                .context("failed to write to memory connection")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.io
                .shutdown()
                .await
                .context("failed to shut down memory connection")
        }
    }
}

type AcceptQueue = mpsc::UnboundedSender<MemoryConnection>;

#[derive(Default)]
struct NetInner {
    listeners: HashMap<String, AcceptQueue>,
}

/// A process-local network: listeners register under string addresses and
/// connectors dial them by name.
#[derive(Clone, Default)]
pub struct MemoryNet {
    inner: Arc<Mutex<NetInner>>,
    next_auto: Arc<AtomicU64>,
}

impl MemoryNet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn factory(&self) -> MemoryListenerFactory {
        MemoryListenerFactory { net: self.clone() }
    }

    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { net: self.clone() }
    }
}

/// Listener over a [`MemoryNet`].
pub struct MemoryListener {
    local_addr: String,
    accept_rx: mpsc::UnboundedReceiver<MemoryConnection>,
}

impl Listener for MemoryListener {
    type Conn = MemoryConnection;

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            self.accept_rx
                .recv()
                .await
                .ok_or_else(|| anyhow!("memory listener closed"))
        }
    }
}

/// Factory that registers [`MemoryListener`]s on a [`MemoryNet`].
pub struct MemoryListenerFactory {
    net: MemoryNet,
}

impl ListenerFactory for MemoryListenerFactory {
    type L = MemoryListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            // ":0" asks for an auto-assigned address, like TCP.
            let local_addr = if addr.ends_with(":0") || addr.is_empty() {
                let n = self.net.next_auto.fetch_add(1, Ordering::Relaxed);
                format!("mem:auto-{n}")
            } else {
                addr.to_string()
            };

            let (tx, rx) = mpsc::unbounded_channel();
            let mut inner = self.net.inner.lock().expect("memory net lock poisoned");
            if inner.listeners.contains_key(&local_addr) {
                return Err(anyhow!("address {local_addr} already in use"));
            }
            inner.listeners.insert(local_addr.clone(), tx);
            Ok(MemoryListener {
                local_addr,
                accept_rx: rx,
            })
        }
    }
}

/// Connector that dials [`MemoryListener`]s by address.
#[derive(Clone)]
pub struct MemoryConnector {
    net: MemoryNet,
}

impl Connector for MemoryConnector {
    type Conn = MemoryConnection;

    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        async move {
            let queue = {
                let inner = self.net.inner.lock().expect("memory net lock poisoned");
                inner
                    .listeners
                    .get(addr)
                    .cloned()
                    .ok_or_else(|| anyhow!("nothing listening on {addr}"))?
            };

            let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
            let accepted = MemoryConnection {
                io: b,
                peer: format!("{addr}#dialer"),
            };
            queue
                .send(accepted)
                .map_err(|_| anyhow!("listener on {addr} is gone"))?;
            Ok(MemoryConnection {
                io: a,
                peer: addr.to_string(),
            })
        }
    }
}

// ── Discovery substrate ─────────────────────────────────────────────

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

/// Shared registry behind one or more [`MemorySubstrate`]s.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HashMap<ChannelId, ChannelSlot>>>,
}

impl MemoryHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A substrate view onto this hub. Several named substrates can share
    /// one hub to model independent discovery paths finding the same peer.
    #[must_use]
    pub fn substrate(&self, name: &'static str) -> MemorySubstrate {
        MemorySubstrate {
            hub: self.clone(),
            name,
        }
    }
}

/// In-memory implementation of the discovery capability.
pub struct MemorySubstrate {
    hub: MemoryHub,
    name: &'static str,
}

#[async_trait]
impl Substrate for MemorySubstrate {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn publish(&self, channel: &ChannelId, record: &AdvertRecord) -> Result<()> {
        let mut inner = self.hub.inner.lock().expect("memory hub lock poisoned");
        let slot = inner.entry(*channel).or_default();
        if !slot.records.contains(record) {
            slot.records.push(record.clone());
        }
        let _ = slot.notify.send(record.clone());
        Ok(())
    }

    async fn lookup(
        &self,
        channel: &ChannelId,
        found: mpsc::Sender<AdvertRecord>,
    ) -> Result<()> {
        let (existing, mut live) = {
            let mut inner = self.hub.inner.lock().expect("memory hub lock poisoned");
            let slot = inner.entry(*channel).or_default();
            (slot.records.clone(), slot.notify.subscribe())
        };

        for record in existing {
            if found.send(record).await.is_err() {
                return Ok(());
            }
        }
        loop {
            match live.recv().await {
                Ok(record) => {
                    if found.send(record).await.is_err() {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}
