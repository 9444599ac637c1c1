//! SWIM-style gossip substrate: peer membership, failure detection,
//! transmit-limited delta broadcast, and full-state anti-entropy.
//!
//! Registry deltas queue into [`Broadcasts`] and piggy-back on periodic
//! probe rounds; each queued message is retransmitted a bounded number of
//! times proportional to log(N) of the cluster size. Divergence that
//! slips past the delta path is healed by push-pull state sync on join
//! and a periodic full-state push to a random peer.

use crate::error::{ProxyError, Result};
use crate::registry::{Delta, DeltaSink, Registry, ServiceMap};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Largest datagram the serializer will emit. Anything bigger is
/// dropped (deltas) or replaced with an empty payload (state sync).
const MAX_DATAGRAM: usize = 1400;

/// Byte budget for deltas piggy-backed on a single message, leaving
/// headroom for the message envelope.
const DELTA_BUDGET: usize = 1024;

/// Tuning for the gossip layer.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Address to bind the UDP socket on.
    pub bind_addr: String,
    /// Gossip port; 0 picks an ephemeral port (tests).
    pub port: u16,
    /// Optional `host:port` of a peer to join on startup.
    pub join: Option<String>,
    /// Multiplier on the log-scaled retransmit count.
    pub retransmit_mult: usize,
    /// How often a probe round runs.
    pub probe_interval: Duration,
    /// How long to wait for an ack before counting a miss.
    pub probe_timeout: Duration,
    /// How often to push full state to a random peer.
    pub sync_interval: Duration,
    /// How many peers each broadcast round fans out to.
    pub fanout: usize,
    /// Consecutive misses before a peer is declared dead.
    pub suspect_limit: u32,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 7946,
            join: None,
            retransmit_mult: 3,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            sync_interval: Duration::from_secs(30),
            fanout: 3,
            suspect_limit: 3,
        }
    }
}

/// Wire messages exchanged between peers.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Message {
    Ping { seq: u64, deltas: Vec<Delta> },
    Ack { seq: u64, deltas: Vec<Delta> },
    Gossip { deltas: Vec<Delta> },
    Join,
    StateSync { state: ServiceMap, reply: bool },
    Leave,
}

struct QueuedDelta {
    delta: Delta,
    size: usize,
    transmits_left: usize,
}

/// Transmit-limited broadcast queue.
///
/// The registry pushes locally originated deltas here through the
/// [`DeltaSink`] trait; probe rounds drain batches that fit the byte
/// budget, requeueing entries until their transmit allowance runs out.
pub struct Broadcasts {
    queue: Mutex<VecDeque<QueuedDelta>>,
    num_nodes: AtomicUsize,
    retransmit_mult: usize,
}

impl Broadcasts {
    pub fn new(retransmit_mult: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            num_nodes: AtomicUsize::new(1),
            retransmit_mult,
        }
    }

    /// Updates the cluster size the retransmit count scales with.
    pub fn set_num_nodes(&self, n: usize) {
        self.num_nodes.store(n.max(1), Ordering::Relaxed);
    }

    fn retransmit_limit(&self) -> usize {
        let n = self.num_nodes.load(Ordering::Relaxed);
        let scale = ((n + 1) as f64).log10().ceil() as usize;
        (self.retransmit_mult * scale).max(self.retransmit_mult)
    }

    /// Queues a delta for broadcast. Oversize payloads are dropped.
    pub fn queue_delta(&self, delta: &Delta) {
        let size = match serde_json::to_vec(delta) {
            Ok(bytes) => bytes.len(),
            Err(e) => {
                warn!(error = %e, "failed to encode delta for broadcast");
                return;
            }
        };
        if size > DELTA_BUDGET {
            warn!(size, "dropping oversize delta broadcast");
            return;
        }
        self.queue.lock().push_back(QueuedDelta {
            delta: delta.clone(),
            size,
            transmits_left: self.retransmit_limit(),
        });
    }

    /// Pops deltas fitting the byte budget, decrementing each entry's
    /// transmit allowance and requeueing those that still have sends
    /// left.
    pub fn next_batch(&self, budget: usize) -> Vec<Delta> {
        let mut queue = self.queue.lock();
        let mut batch = Vec::new();
        let mut used = 0;
        let mut requeue = Vec::new();

        for _ in 0..queue.len() {
            let size = match queue.front() {
                Some(entry) => entry.size,
                None => break,
            };
            if used + size > budget {
                break;
            }
            let mut entry = queue.pop_front().expect("front checked above");
            used += entry.size;
            batch.push(entry.delta.clone());
            entry.transmits_left -= 1;
            if entry.transmits_left > 0 {
                requeue.push(entry);
            }
        }

        queue.extend(requeue);
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl DeltaSink for Broadcasts {
    fn broadcast(&self, delta: &Delta) {
        self.queue_delta(delta);
    }
}

#[derive(Debug, Default)]
struct Peer {
    missed: u32,
}

struct PendingPing {
    peer: SocketAddr,
    sent_at: Instant,
}

/// Gossip endpoint bound to one UDP socket.
pub struct Gossip {
    socket: UdpSocket,
    registry: Arc<Registry>,
    broadcasts: Arc<Broadcasts>,
    peers: RwLock<HashMap<SocketAddr, Peer>>,
    pending_acks: Mutex<HashMap<u64, PendingPing>>,
    seq: AtomicU64,
    config: GossipConfig,
    local_addr: SocketAddr,
}

impl Gossip {
    /// Binds the gossip socket and wires the registry's delta sink to
    /// the broadcast queue. Bind failure is fatal to startup.
    pub async fn bind(config: GossipConfig, registry: Arc<Registry>) -> Result<Arc<Self>> {
        let addr = format!("{}:{}", config.bind_addr, config.port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|e| ProxyError::GossipBind {
                addr: addr.clone(),
                source: e,
            })?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| ProxyError::GossipBind { addr, source: e })?;

        let broadcasts = Arc::new(Broadcasts::new(config.retransmit_mult));
        registry.set_delta_sink(Arc::clone(&broadcasts) as Arc<dyn DeltaSink>);

        info!(addr = %local_addr, "gossip socket bound");

        Ok(Arc::new(Self {
            socket,
            registry,
            broadcasts,
            peers: RwLock::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            config,
            local_addr,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Known cluster size, including this node.
    pub fn member_count(&self) -> usize {
        self.peers.read().len() + 1
    }

    /// Runs the receive loop, probe rounds, and anti-entropy ticks
    /// until shutdown, then announces departure to every known peer.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        if let Some(seed) = self.config.join.clone() {
            self.join(&seed).await?;
        }

        let mut probe = tokio::time::interval(self.config.probe_interval);
        let mut sync = tokio::time::interval(self.config.sync_interval);
        sync.tick().await;

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => warn!(error = %e, "gossip recv error"),
                    }
                }
                _ = probe.tick() => self.probe_round().await,
                _ = sync.tick() => self.anti_entropy().await,
                _ = shutdown.recv() => {
                    self.leave().await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn join(&self, seed: &str) -> Result<()> {
        let addr = tokio::net::lookup_host(seed)
            .await
            .map_err(|e| ProxyError::ClusterJoin {
                addr: seed.to_string(),
                source: e,
            })?
            .next()
            .ok_or_else(|| ProxyError::ClusterJoin {
                addr: seed.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no address resolved"),
            })?;

        self.add_peer(addr);
        self.send(addr, &Message::Join).await;
        info!(seed = %addr, "joining cluster");
        Ok(())
    }

    async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let message: Message = match serde_json::from_slice(bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %from, error = %e, "dropping unparseable gossip message");
                return;
            }
        };

        match message {
            Message::Ping { seq, deltas } => {
                self.add_peer(from);
                self.apply_deltas(deltas);
                let ack = Message::Ack {
                    seq,
                    deltas: self.broadcasts.next_batch(DELTA_BUDGET),
                };
                self.send(from, &ack).await;
            }
            Message::Ack { seq, deltas } => {
                self.pending_acks.lock().remove(&seq);
                self.add_peer(from);
                self.apply_deltas(deltas);
            }
            Message::Gossip { deltas } => {
                self.add_peer(from);
                self.apply_deltas(deltas);
            }
            Message::Join => {
                info!(peer = %from, "node joined");
                self.add_peer(from);
                let reply = self.state_sync_message(true);
                self.send(from, &reply).await;
            }
            Message::StateSync { state, reply } => {
                self.add_peer(from);
                self.registry.merge_remote_state(state);
                if reply {
                    let push = self.state_sync_message(false);
                    self.send(from, &push).await;
                }
            }
            Message::Leave => {
                info!(peer = %from, "node left");
                self.remove_peer(from);
            }
        }
    }

    fn apply_deltas(&self, deltas: Vec<Delta>) {
        for delta in deltas {
            self.registry.apply_delta(delta);
        }
    }

    /// One probe round: expire unanswered pings, probe one random peer,
    /// and fan queued broadcasts out to a few more.
    async fn probe_round(&self) {
        self.sweep_pending();

        if let Some(peer) = self.random_peers(1).first().copied() {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            self.pending_acks.lock().insert(
                seq,
                PendingPing {
                    peer,
                    sent_at: Instant::now(),
                },
            );
            let ping = Message::Ping {
                seq,
                deltas: self.broadcasts.next_batch(DELTA_BUDGET),
            };
            self.send(peer, &ping).await;
        }

        if !self.broadcasts.is_empty() {
            for peer in self.random_peers(self.config.fanout) {
                let deltas = self.broadcasts.next_batch(DELTA_BUDGET);
                if deltas.is_empty() {
                    break;
                }
                self.send(peer, &Message::Gossip { deltas }).await;
            }
        }
    }

    fn sweep_pending(&self) {
        let timeout = self.config.probe_timeout;
        let expired: Vec<(u64, SocketAddr)> = {
            let pending = self.pending_acks.lock();
            pending
                .iter()
                .filter(|(_, p)| p.sent_at.elapsed() > timeout)
                .map(|(seq, p)| (*seq, p.peer))
                .collect()
        };

        for (seq, peer) in expired {
            self.pending_acks.lock().remove(&seq);
            self.record_miss(peer);
        }
    }

    fn record_miss(&self, addr: SocketAddr) {
        let removed = {
            let mut peers = self.peers.write();
            match peers.get_mut(&addr) {
                Some(peer) => {
                    peer.missed += 1;
                    if peer.missed == 1 {
                        warn!(peer = %addr, "peer suspected");
                    }
                    if peer.missed >= self.config.suspect_limit {
                        peers.remove(&addr);
                        warn!(peer = %addr, "peer declared dead");
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if removed {
            self.broadcasts.set_num_nodes(self.member_count());
        }
    }

    async fn anti_entropy(&self) {
        if let Some(peer) = self.random_peers(1).first().copied() {
            let push = self.state_sync_message(false);
            self.send(peer, &push).await;
        }
    }

    /// Builds the full-state payload; if it exceeds the datagram limit
    /// the payload is emptied and deltas repair the gap over time.
    fn state_sync_message(&self, reply: bool) -> Message {
        let state = self.registry.get_all_services();
        let message = Message::StateSync { state, reply };
        match serde_json::to_vec(&message) {
            Ok(bytes) if bytes.len() <= MAX_DATAGRAM => message,
            _ => {
                debug!("state snapshot exceeds datagram limit, sending empty payload");
                Message::StateSync {
                    state: ServiceMap::new(),
                    reply,
                }
            }
        }
    }

    fn add_peer(&self, addr: SocketAddr) {
        if addr == self.local_addr {
            return;
        }
        let inserted = {
            let mut peers = self.peers.write();
            match peers.get_mut(&addr) {
                Some(peer) => {
                    peer.missed = 0;
                    false
                }
                None => {
                    peers.insert(addr, Peer::default());
                    debug!(peer = %addr, "peer discovered");
                    true
                }
            }
        };
        if inserted {
            self.broadcasts.set_num_nodes(self.member_count());
        }
    }

    fn remove_peer(&self, addr: SocketAddr) {
        self.peers.write().remove(&addr);
        self.broadcasts.set_num_nodes(self.member_count());
    }

    fn random_peers(&self, n: usize) -> Vec<SocketAddr> {
        let peers: Vec<SocketAddr> = self.peers.read().keys().copied().collect();
        peers
            .choose_multiple(&mut rand::thread_rng(), n)
            .copied()
            .collect()
    }

    async fn send(&self, addr: SocketAddr, message: &Message) {
        let bytes = match serde_json::to_vec(message) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode gossip message");
                return;
            }
        };
        if bytes.len() > MAX_DATAGRAM {
            warn!(size = bytes.len(), "dropping oversize gossip message");
            return;
        }
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            warn!(peer = %addr, error = %e, "gossip send failed");
        }
    }

    async fn leave(&self) {
        let peers: Vec<SocketAddr> = self.peers.read().keys().copied().collect();
        for peer in peers {
            self.send(peer, &Message::Leave).await;
        }
        info!("left cluster");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceInstance;
    use std::collections::HashMap as StdHashMap;

    fn instance(id: &str, service: &str, port: u16) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            service: service.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            metadata: StdHashMap::new(),
        }
    }

    fn delta(id: &str) -> Delta {
        Delta::Register {
            instance: instance(id, "svc", 9001),
        }
    }

    #[test]
    fn test_retransmit_limit_scales_with_cluster_size() {
        let broadcasts = Broadcasts::new(3);
        assert_eq!(broadcasts.retransmit_limit(), 3);

        broadcasts.set_num_nodes(12);
        assert_eq!(broadcasts.retransmit_limit(), 6);
    }

    #[test]
    fn test_queue_drains_after_transmit_limit() {
        let broadcasts = Broadcasts::new(3);
        broadcasts.queue_delta(&delta("a1"));

        for _ in 0..3 {
            assert_eq!(broadcasts.next_batch(DELTA_BUDGET).len(), 1);
        }
        assert!(broadcasts.next_batch(DELTA_BUDGET).is_empty());
        assert!(broadcasts.is_empty());
    }

    #[test]
    fn test_batch_respects_byte_budget() {
        let broadcasts = Broadcasts::new(3);
        for i in 0..20 {
            broadcasts.queue_delta(&delta(&format!("instance-{i}")));
        }

        let batch = broadcasts.next_batch(200);
        assert!(!batch.is_empty());
        assert!(batch.len() < 20);
    }

    #[test]
    fn test_oversize_delta_dropped() {
        let broadcasts = Broadcasts::new(3);
        let mut big = instance("big", "svc", 9001);
        big.metadata
            .insert("blob".to_string(), "x".repeat(4 * DELTA_BUDGET));
        broadcasts.queue_delta(&Delta::Register { instance: big });

        assert!(broadcasts.is_empty());
    }

    #[tokio::test]
    async fn test_oversize_state_sync_sends_empty_payload() {
        let registry = Arc::new(Registry::new());
        for i in 0..100 {
            registry
                .register(instance(&format!("inst-{i}"), "svc", 9000 + i))
                .unwrap();
        }

        let config = GossipConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        let gossip = Gossip::bind(config, registry).await.unwrap();

        match gossip.state_sync_message(false) {
            Message::StateSync { state, .. } => assert!(state.is_empty()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_node_convergence_via_deltas() {
        let fast = |join: Option<String>| GossipConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            join,
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(200),
            ..Default::default()
        };

        let registry1 = Arc::new(Registry::new());
        let node1 = Gossip::bind(fast(None), Arc::clone(&registry1)).await.unwrap();

        let registry2 = Arc::new(Registry::new());
        let node2 = Gossip::bind(
            fast(Some(node1.local_addr().to_string())),
            Arc::clone(&registry2),
        )
        .await
        .unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(Arc::clone(&node1).run(shutdown_tx.subscribe()));
        tokio::spawn(Arc::clone(&node2).run(shutdown_tx.subscribe()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        registry1.register(instance("x", "svc", 9001)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let instances = registry2.get_instances("svc");
            if instances.len() == 1 && instances[0].id == "x" {
                break;
            }
            assert!(Instant::now() < deadline, "registries did not converge");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let _ = shutdown_tx.send(());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_join_receives_existing_state() {
        let registry1 = Arc::new(Registry::new());
        registry1.register(instance("pre", "svc", 9001)).unwrap();

        let node1 = Gossip::bind(
            GossipConfig {
                bind_addr: "127.0.0.1".to_string(),
                port: 0,
                ..Default::default()
            },
            Arc::clone(&registry1),
        )
        .await
        .unwrap();

        let registry2 = Arc::new(Registry::new());
        let node2 = Gossip::bind(
            GossipConfig {
                bind_addr: "127.0.0.1".to_string(),
                port: 0,
                join: Some(node1.local_addr().to_string()),
                ..Default::default()
            },
            Arc::clone(&registry2),
        )
        .await
        .unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(Arc::clone(&node1).run(shutdown_tx.subscribe()));
        tokio::spawn(Arc::clone(&node2).run(shutdown_tx.subscribe()));

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if registry2.get_instances("svc").len() == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "join state sync never arrived");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let _ = shutdown_tx.send(());
    }
}
