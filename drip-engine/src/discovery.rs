use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use drip_core::channel::ChannelId;

use crate::cancel::CancelToken;

/// How often a node re-publishes its advertisement.
pub const DEFAULT_ADVERTISE_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive publish failures after which a substrate is declared dead.
pub const ADVERTISE_FAILURE_LIMIT: usize = 3;

/// What a node publishes under its channel: who it is and where to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertRecord {
    pub node_id: String,
    pub addr: String,
}

impl AdvertRecord {
    /// Single-line wire form used by the LAN and rendezvous substrates.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{} {}", self.node_id, self.addr)
    }

    /// Parses the form produced by [`AdvertRecord::to_line`].
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let (node_id, addr) = line.trim().split_once(' ')?;
        if node_id.is_empty() || addr.is_empty() {
            return None;
        }
        Some(Self {
            node_id: node_id.to_string(),
            addr: addr.to_string(),
        })
    }
}

/// A discovery substrate: some mechanism that can publish a record under a
/// channel id and look up the records other nodes published there.
///
/// Substrates are injected, not hard-coded — the coordinator treats a LAN
/// broadcaster, a rendezvous server, and an in-memory hub identically, and
/// new mechanisms slot in without touching coordinator logic.
#[async_trait]
pub trait Substrate: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Publishes `record` under `channel` once. The coordinator calls this
    /// periodically until cancelled.
    async fn publish(&self, channel: &ChannelId, record: &AdvertRecord) -> Result<()>;

    /// Looks up records under `channel`, pushing each one into `found` as
    /// it appears. Runs until the receiver is dropped or the substrate
    /// fails; returning `Ok` means the lookup ended cleanly.
    async fn lookup(&self, channel: &ChannelId, found: mpsc::Sender<AdvertRecord>) -> Result<()>;
}

/// Which mechanism first reported a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    /// A discovery substrate, by name.
    Substrate(&'static str),
    /// The candidate connected to us directly.
    Inbound,
}

/// A discovered remote endpoint, not yet authenticated.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Dialable address; also the de-duplication key.
    pub endpoint: String,
    pub node_id: String,
    pub source: CandidateSource,
    pub discovered_at: Instant,
}

/// Events emitted by a running search.
#[derive(Debug)]
pub enum DiscoveryEvent {
    Candidate(Candidate),
    /// One substrate died; the search degrades to the remaining ones.
    SubstrateFailed {
        name: &'static str,
        message: String,
    },
    /// Every substrate has failed. Nothing more will ever be found.
    Unavailable,
}

/// Runs publish/search across several substrates concurrently and merges
/// the results into one de-duplicated candidate stream.
///
/// Running the substrates concurrently rather than in sequence matters:
/// a LAN-only peer is invisible to the global path and vice versa, and
/// serializing them adds their latencies. The search keeps emitting even
/// after a candidate enters pairing — the current one may fail the
/// authentication, so stopping early would strand the transfer.
pub struct DiscoveryCoordinator {
    substrates: Vec<Arc<dyn Substrate>>,
    self_record: AdvertRecord,
    advertise_interval: Duration,
}

impl DiscoveryCoordinator {
    #[must_use]
    pub fn new(substrates: Vec<Arc<dyn Substrate>>, self_record: AdvertRecord) -> Self {
        Self {
            substrates,
            self_record,
            advertise_interval: DEFAULT_ADVERTISE_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_advertise_interval(mut self, interval: Duration) -> Self {
        self.advertise_interval = interval;
        self
    }

    /// Begins publishing presence under `channel` on every substrate and
    /// returns a health stream.
    ///
    /// Each substrate republishes on its own task until the token fires.
    /// A failed publish is retried on the next tick; after
    /// [`ADVERTISE_FAILURE_LIMIT`] consecutive failures the substrate is
    /// declared dead and [`DiscoveryEvent::SubstrateFailed`] is emitted.
    /// When the last one dies, [`DiscoveryEvent::Unavailable`] follows —
    /// nobody can find this node anymore.
    #[must_use]
    pub fn advertise(&self, channel: ChannelId, cancel: &CancelToken) -> mpsc::Receiver<DiscoveryEvent> {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (fail_tx, fail_rx) = mpsc::channel::<(&'static str, String)>(16);

        for substrate in &self.substrates {
            let substrate = Arc::clone(substrate);
            let record = self.self_record.clone();
            let interval = self.advertise_interval;
            let fail_tx = fail_tx.clone();
            let mut cancel = cancel.clone();
            tokio::spawn(async move {
                info!(substrate = substrate.name(), channel = %channel, "Advertising");
                let mut consecutive = 0usize;
                loop {
                    match substrate.publish(&channel, &record).await {
                        Ok(()) => consecutive = 0,
                        Err(e) => {
                            warn!(
                                substrate = substrate.name(),
                                error = %e,
                                "Publish failed; will retry"
                            );
                            consecutive += 1;
                            if consecutive >= ADVERTISE_FAILURE_LIMIT {
                                let _ = fail_tx.send((substrate.name(), e.to_string())).await;
                                break;
                            }
                        }
                    }
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(interval) => {}
                    }
                }
                debug!(substrate = substrate.name(), "Advertising stopped");
            });
        }
        drop(fail_tx);

        tokio::spawn(advert_health_loop(
            fail_rx,
            events_tx,
            self.substrates.len(),
        ));

        events_rx
    }

    /// Starts searching `channel` on every substrate and returns the merged
    /// event stream.
    ///
    /// The same endpoint reported by several substrates is emitted once,
    /// keyed by address, regardless of which mechanism found it first. Our
    /// own advertisements are filtered out by node id. When the last
    /// substrate dies, [`DiscoveryEvent::Unavailable`] is emitted and the
    /// stream ends.
    #[must_use]
    pub fn search(&self, channel: ChannelId, cancel: &CancelToken) -> mpsc::Receiver<DiscoveryEvent> {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (raw_tx, raw_rx) = mpsc::channel::<(&'static str, AdvertRecord)>(64);
        let (fail_tx, fail_rx) = mpsc::channel::<(&'static str, String)>(16);

        for substrate in &self.substrates {
            let substrate = Arc::clone(substrate);
            let raw_tx = raw_tx.clone();
            let fail_tx = fail_tx.clone();
            let mut cancel = cancel.clone();
            tokio::spawn(async move {
                let name = substrate.name();
                let (found_tx, mut found_rx) = mpsc::channel(64);
                let mut lookup = std::pin::pin!(substrate.lookup(&channel, found_tx));
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        result = &mut lookup => {
                            match result {
                                Ok(()) => debug!(substrate = name, "Lookup ended"),
                                Err(e) => {
                                    warn!(substrate = name, error = %e, "Lookup failed");
                                    let _ = fail_tx.send((name, e.to_string())).await;
                                }
                            }
                            break;
                        }
                        record = found_rx.recv() => {
                            let Some(record) = record else { break };
                            if raw_tx.send((name, record)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
        drop(raw_tx);
        drop(fail_tx);

        let self_node_id = self.self_record.node_id.clone();
        let substrate_count = self.substrates.len();
        tokio::spawn(merge_loop(
            raw_rx,
            fail_rx,
            events_tx,
            self_node_id,
            substrate_count,
        ));

        events_rx
    }
}

/// Tracks substrate deaths on the advertising side, reporting total
/// failure upward the same way the search does.
async fn advert_health_loop(
    mut fail_rx: mpsc::Receiver<(&'static str, String)>,
    events_tx: mpsc::Sender<DiscoveryEvent>,
    substrate_count: usize,
) {
    if substrate_count == 0 {
        let _ = events_tx.send(DiscoveryEvent::Unavailable).await;
        return;
    }
    let mut failed = 0usize;
    while let Some((name, message)) = fail_rx.recv().await {
        failed += 1;
        if events_tx
            .send(DiscoveryEvent::SubstrateFailed { name, message })
            .await
            .is_err()
        {
            return;
        }
        if failed == substrate_count {
            warn!("All advertising substrates failed");
            let _ = events_tx.send(DiscoveryEvent::Unavailable).await;
            return;
        }
    }
}

/// Fan-in task: de-duplicates records, filters our own advertisements, and
/// tracks substrate deaths so total failure is reported upward instead of
/// silently producing an empty stream.
async fn merge_loop(
    mut raw_rx: mpsc::Receiver<(&'static str, AdvertRecord)>,
    mut fail_rx: mpsc::Receiver<(&'static str, String)>,
    events_tx: mpsc::Sender<DiscoveryEvent>,
    self_node_id: String,
    substrate_count: usize,
) {
    let mut seen = HashSet::new();
    let mut failed = 0usize;
    let mut fail_closed = false;

    if substrate_count == 0 {
        let _ = events_tx.send(DiscoveryEvent::Unavailable).await;
        return;
    }

    loop {
        tokio::select! {
            record = raw_rx.recv() => {
                let Some((name, record)) = record else { break };
                if record.node_id == self_node_id {
                    continue;
                }
                if !seen.insert(record.addr.clone()) {
                    debug!(endpoint = %record.addr, substrate = name, "Duplicate candidate dropped");
                    continue;
                }
                info!(endpoint = %record.addr, substrate = name, "Candidate discovered");
                let candidate = Candidate {
                    endpoint: record.addr,
                    node_id: record.node_id,
                    source: CandidateSource::Substrate(name),
                    discovered_at: Instant::now(),
                };
                if events_tx.send(DiscoveryEvent::Candidate(candidate)).await.is_err() {
                    break;
                }
            }
            failure = fail_rx.recv(), if !fail_closed => {
                let Some((name, message)) = failure else {
                    fail_closed = true;
                    continue;
                };
                failed += 1;
                let total = failed == substrate_count;
                if events_tx
                    .send(DiscoveryEvent::SubstrateFailed { name, message })
                    .await
                    .is_err()
                {
                    break;
                }
                if total {
                    warn!("All discovery substrates failed");
                    let _ = events_tx.send(DiscoveryEvent::Unavailable).await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use anyhow::bail;

    use super::*;
    use crate::cancel::CancelSignal;
    use crate::memory::MemoryHub;

    fn test_channel() -> ChannelId {
        ChannelId::derive_at("amber", Duration::from_secs(3600), SystemTime::UNIX_EPOCH)
    }

    fn record(node: &str, addr: &str) -> AdvertRecord {
        AdvertRecord {
            node_id: node.into(),
            addr: addr.into(),
        }
    }

    /// Substrate that fails lookup immediately.
    struct BrokenSubstrate;

    #[async_trait]
    impl Substrate for BrokenSubstrate {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn publish(&self, _: &ChannelId, _: &AdvertRecord) -> Result<()> {
            bail!("no network")
        }
        async fn lookup(&self, _: &ChannelId, _: mpsc::Sender<AdvertRecord>) -> Result<()> {
            bail!("no network")
        }
    }

    async fn next_candidate(rx: &mut mpsc::Receiver<DiscoveryEvent>) -> Candidate {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for discovery event")
                .expect("stream ended")
            {
                DiscoveryEvent::Candidate(c) => return c,
                DiscoveryEvent::SubstrateFailed { .. } => {}
                DiscoveryEvent::Unavailable => panic!("discovery unavailable"),
            }
        }
    }

    #[tokio::test]
    async fn when_record_line_round_tripped_expect_same_record() {
        let r = record("abc123", "10.0.0.5:4242");
        assert_eq!(AdvertRecord::parse_line(&r.to_line()), Some(r));
        assert_eq!(AdvertRecord::parse_line("garbage"), None);
        assert_eq!(AdvertRecord::parse_line(""), None);
    }

    #[tokio::test]
    async fn when_both_substrates_report_same_endpoint_expect_single_emission() {
        let hub_a = MemoryHub::new();
        let hub_b = MemoryHub::new();
        let channel = test_channel();
        let peer = record("peer-node", "mem:peer");
        hub_a
            .substrate("mem-a")
            .publish(&channel, &peer)
            .await
            .unwrap();
        hub_b
            .substrate("mem-b")
            .publish(&channel, &peer)
            .await
            .unwrap();

        let coordinator = DiscoveryCoordinator::new(
            vec![
                Arc::new(hub_a.substrate("mem-a")),
                Arc::new(hub_b.substrate("mem-b")),
            ],
            record("self-node", "mem:self"),
        );
        let signal = CancelSignal::new();
        let mut events = coordinator.search(channel, &signal.token());

        let candidate = next_candidate(&mut events).await;
        assert_eq!(candidate.endpoint, "mem:peer");

        // The duplicate from the other substrate must not surface.
        let extra = tokio::time::timeout(Duration::from_millis(100), async {
            next_candidate(&mut events).await
        })
        .await;
        assert!(extra.is_err(), "same endpoint emitted twice");
        signal.cancel();
    }

    #[tokio::test]
    async fn when_own_advertisement_is_seen_expect_it_filtered() {
        let hub = MemoryHub::new();
        let channel = test_channel();
        let me = record("self-node", "mem:self");
        hub.substrate("mem-a").publish(&channel, &me).await.unwrap();

        let coordinator =
            DiscoveryCoordinator::new(vec![Arc::new(hub.substrate("mem-a"))], me.clone());
        let signal = CancelSignal::new();
        let mut events = coordinator.search(channel, &signal.token());

        let got = tokio::time::timeout(Duration::from_millis(100), async {
            next_candidate(&mut events).await
        })
        .await;
        assert!(got.is_err(), "own advertisement must not become a candidate");
        signal.cancel();
    }

    #[tokio::test]
    async fn when_one_substrate_fails_expect_degraded_search_still_finds_peers() {
        let hub = MemoryHub::new();
        let channel = test_channel();
        hub.substrate("mem-a")
            .publish(&channel, &record("peer-node", "mem:peer"))
            .await
            .unwrap();

        let coordinator = DiscoveryCoordinator::new(
            vec![Arc::new(BrokenSubstrate), Arc::new(hub.substrate("mem-a"))],
            record("self-node", "mem:self"),
        );
        let signal = CancelSignal::new();
        let mut events = coordinator.search(channel, &signal.token());

        let candidate = next_candidate(&mut events).await;
        assert_eq!(candidate.endpoint, "mem:peer");
        signal.cancel();
    }

    #[tokio::test]
    async fn when_every_substrate_fails_expect_unavailable() {
        let coordinator = DiscoveryCoordinator::new(
            vec![Arc::new(BrokenSubstrate), Arc::new(BrokenSubstrate)],
            record("self-node", "mem:self"),
        );
        let signal = CancelSignal::new();
        let mut events = coordinator.search(test_channel(), &signal.token());

        let mut saw_unavailable = false;
        while let Some(event) = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out")
        {
            if matches!(event, DiscoveryEvent::Unavailable) {
                saw_unavailable = true;
                break;
            }
        }
        assert!(saw_unavailable);
    }

    #[tokio::test]
    async fn when_cancelled_expect_stream_to_end() {
        let hub = MemoryHub::new();
        let coordinator = DiscoveryCoordinator::new(
            vec![Arc::new(hub.substrate("mem-a"))],
            record("self-node", "mem:self"),
        );
        let signal = CancelSignal::new();
        let mut events = coordinator.search(test_channel(), &signal.token());
        signal.cancel();

        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if events.recv().await.is_none() {
                    break;
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "search stream should end after cancel");
    }

    #[tokio::test]
    async fn when_advertising_expect_record_visible_to_lookup() {
        let hub = MemoryHub::new();
        let channel = test_channel();
        let me = record("self-node", "mem:self");
        let coordinator = DiscoveryCoordinator::new(
            vec![Arc::new(hub.substrate("mem-a"))],
            me.clone(),
        )
        .with_advertise_interval(Duration::from_millis(50));

        let signal = CancelSignal::new();
        let _health = coordinator.advertise(channel, &signal.token());

        let (tx, mut rx) = mpsc::channel(4);
        let lookup_hub = hub.clone();
        tokio::spawn(async move {
            let _ = lookup_hub.substrate("mem-a").lookup(&channel, tx).await;
        });
        let seen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("lookup ended");
        assert_eq!(seen, me);
        signal.cancel();
    }

    #[tokio::test]
    async fn when_every_substrate_fails_to_publish_expect_unavailable() {
        let coordinator = DiscoveryCoordinator::new(
            vec![Arc::new(BrokenSubstrate), Arc::new(BrokenSubstrate)],
            record("self-node", "mem:self"),
        )
        .with_advertise_interval(Duration::from_millis(10));
        let signal = CancelSignal::new();
        let mut health = coordinator.advertise(test_channel(), &signal.token());

        let mut failures = 0;
        let mut saw_unavailable = false;
        while let Some(event) = tokio::time::timeout(Duration::from_secs(2), health.recv())
            .await
            .expect("timed out")
        {
            match event {
                DiscoveryEvent::SubstrateFailed { .. } => failures += 1,
                DiscoveryEvent::Unavailable => {
                    saw_unavailable = true;
                    break;
                }
                DiscoveryEvent::Candidate(_) => panic!("advertise cannot find candidates"),
            }
        }
        assert_eq!(failures, 2);
        assert!(saw_unavailable);
    }

    #[tokio::test]
    async fn when_one_publish_path_survives_expect_no_unavailable() {
        let hub = MemoryHub::new();
        let coordinator = DiscoveryCoordinator::new(
            vec![Arc::new(BrokenSubstrate), Arc::new(hub.substrate("mem-a"))],
            record("self-node", "mem:self"),
        )
        .with_advertise_interval(Duration::from_millis(10));
        let signal = CancelSignal::new();
        let mut health = coordinator.advertise(test_channel(), &signal.token());

        // The broken substrate dies, the healthy one keeps publishing, so
        // the stream must degrade without going unavailable.
        let first = tokio::time::timeout(Duration::from_secs(2), health.recv())
            .await
            .expect("timed out")
            .expect("health stream ended");
        assert!(matches!(first, DiscoveryEvent::SubstrateFailed { .. }));
        let more = tokio::time::timeout(Duration::from_millis(100), health.recv()).await;
        assert!(more.is_err(), "surviving substrate must keep the node findable");
        signal.cancel();
    }
}
