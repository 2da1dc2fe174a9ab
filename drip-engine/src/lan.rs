//! Local-network discovery over UDP broadcast.
//!
//! Each publish sends one datagram `DRIP1 <channel-hex> <node-id> <addr>`
//! to the broadcast address; lookup binds the shared port and reports
//! every datagram whose channel id matches. When the advertised address
//! carries an unspecified host (`0.0.0.0:4242`), the datagram's source IP
//! is substituted so the record is actually dialable.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use drip_core::channel::ChannelId;

use crate::discovery::{AdvertRecord, Substrate};

/// Default UDP port for Drip LAN discovery.
pub const DEFAULT_LAN_PORT: u16 = 4337;

const DATAGRAM_PREFIX: &str = "DRIP1";
const MAX_DATAGRAM: usize = 512;

/// UDP-broadcast implementation of the discovery capability.
pub struct LanSubstrate {
    port: u16,
    broadcast_host: String,
}

impl LanSubstrate {
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            broadcast_host: "255.255.255.255".to_string(),
        }
    }

    /// Overrides the broadcast destination host. Tests point this at
    /// loopback; production uses the limited broadcast address.
    #[must_use]
    pub fn with_broadcast_host(mut self, host: impl Into<String>) -> Self {
        self.broadcast_host = host.into();
        self
    }
}

impl Default for LanSubstrate {
    fn default() -> Self {
        Self::new(DEFAULT_LAN_PORT)
    }
}

fn encode_datagram(channel: &ChannelId, record: &AdvertRecord) -> String {
    format!("{DATAGRAM_PREFIX} {channel} {}", record.to_line())
}

fn decode_datagram(data: &str, channel: &ChannelId, src_ip: &str) -> Option<AdvertRecord> {
    let rest = data.strip_prefix(DATAGRAM_PREFIX)?.trim_start();
    let (channel_hex, line) = rest.split_once(' ')?;
    if ChannelId::parse_hex(channel_hex).ok()? != *channel {
        return None;
    }
    let mut record = AdvertRecord::parse_line(line)?;
    // An advertiser listening on the wildcard address does not know its
    // own LAN IP; the datagram source does.
    if let Some(port) = record.addr.strip_prefix("0.0.0.0:") {
        record.addr = format!("{src_ip}:{port}");
    }
    Some(record)
}

#[async_trait]
impl Substrate for LanSubstrate {
    fn name(&self) -> &'static str {
        "lan"
    }

    async fn publish(&self, channel: &ChannelId, record: &AdvertRecord) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind LAN publish socket")?;
        socket
            .set_broadcast(true)
            .context("failed to enable broadcast")?;

        let datagram = encode_datagram(channel, record);
        let target = format!("{}:{}", self.broadcast_host, self.port);
        socket
            .send_to(datagram.as_bytes(), &target)
            .await
            .with_context(|| format!("failed to broadcast to {target}"))?;
        debug!(channel = %channel, "LAN advertisement broadcast");
        Ok(())
    }

    async fn lookup(&self, channel: &ChannelId, found: mpsc::Sender<AdvertRecord>) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("failed to bind LAN discovery port {}", self.port))?;

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (n, src) = socket
                .recv_from(&mut buf)
                .await
                .context("LAN discovery socket failed")?;
            let Ok(text) = std::str::from_utf8(&buf[..n]) else {
                warn!(src = %src, "Dropping non-UTF-8 discovery datagram");
                continue;
            };
            let Some(record) = decode_datagram(text, channel, &src.ip().to_string()) else {
                continue;
            };
            debug!(src = %src, endpoint = %record.addr, "LAN peer heard");
            if found.send(record).await.is_err() {
                // Search was cancelled; stop listening.
                return Ok(());
            }
        }
    }
}
