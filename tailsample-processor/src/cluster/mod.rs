// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cluster coordination: gossip membership and best-effort broadcast of
//! anomaly notifications.
//!
//! Every node binds one UDP socket for gossip traffic (join, probe, leave,
//! notify) and one TCP listener on the same port for join-time membership
//! sync. Delivery of notifications is lossy by contract: duplicates and
//! drops are possible, receivers are idempotent, and ordering is never
//! promised.

mod member;
mod message;

pub use member::Member;
pub use message::{AnomalyAction, AnomalyNotification};

use crate::config::ClusterConfig;
use member::Membership;
use message::GossipMessage;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tailsample_common::MutexExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the inbound notification queue handed to the consumer.
const INBOUND_QUEUE_CAPACITY: usize = 1024;
/// Bound on notifications awaiting transmission.
const BROADCAST_QUEUE_CAPACITY: usize = 1024;
/// Largest datagram the receiver accepts.
const MAX_DATAGRAM: usize = 64 * 1024;
/// Largest membership frame the state sync accepts.
const MAX_SYNC_FRAME: usize = 1024 * 1024;
/// Deadline for one full TCP state sync exchange.
const STATE_SYNC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Errors starting the coordinator. Everything after a successful bind is
/// degraded-mode operation, not an error.
#[derive(Debug)]
pub enum ClusterError {
    /// The gossip sockets could not be bound.
    Bind(io::Error),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::Bind(err) => write!(f, "failed to bind gossip sockets: {}", err),
        }
    }
}

impl std::error::Error for ClusterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClusterError::Bind(err) => Some(err),
        }
    }
}

/// A queued broadcast with its remaining transmission budget.
#[derive(Debug)]
struct PendingBroadcast {
    payload: AnomalyNotification,
    remaining: u32,
}

/// Per-notification transmission budget, scaled to cluster size the way
/// epidemic broadcast queues do.
fn transmit_budget(retransmit_mult: u32, cluster_size: usize) -> u32 {
    let rounds = ((cluster_size + 1) as f64).log2().ceil() as u32 + 1;
    (retransmit_mult * rounds).max(1)
}

struct Shared {
    config: ClusterConfig,
    local: Member,
    socket: UdpSocket,
    membership: Mutex<Membership>,
    /// Sender side of the inbound queue; taken (and thereby closed) on stop.
    inbound_tx: Mutex<Option<mpsc::Sender<AnomalyNotification>>>,
    queue: Mutex<VecDeque<PendingBroadcast>>,
    next_seq: AtomicU64,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

/// Handle on the gossip layer: owns the sockets, the membership table and
/// the background loops.
///
/// Held as one instance by the span processor; the notification stream has a
/// single receiver obtained through [`ClusterCoordinator::inbound`].
pub struct ClusterCoordinator {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    inbound_rx: Mutex<Option<mpsc::Receiver<AnomalyNotification>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterCoordinator {
    /// Bind the gossip sockets, join the cluster through the configured seed
    /// peers and spawn the gossip loops.
    ///
    /// Unresolvable or unreachable seeds are warnings: the node then runs as
    /// a single-member cluster until peers find it.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        let bind_addr = SocketAddr::new(config.bind_ip, config.port);
        let socket = UdpSocket::bind(bind_addr).await.map_err(ClusterError::Bind)?;
        let bound = socket.local_addr().map_err(ClusterError::Bind)?;
        let listener = TcpListener::bind(SocketAddr::new(config.bind_ip, bound.port()))
            .await
            .map_err(ClusterError::Bind)?;

        let advertise_ip = config.advertise_ip.unwrap_or(if config.bind_ip.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            config.bind_ip
        });
        let local = Member {
            name: config.node_name.clone(),
            addr: SocketAddr::new(advertise_ip, bound.port()),
        };
        info!(node = %local.name, addr = %local.addr, "cluster coordinator starting");

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            local: local.clone(),
            socket,
            membership: Mutex::new(Membership::new(local)),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            queue: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            pending_acks: Mutex::new(HashMap::new()),
            config,
        });

        shared.join_seeds().await;

        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(run_udp_receiver(shared.clone(), shutdown.clone())),
            tokio::spawn(run_state_sync_listener(
                listener,
                shared.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(run_gossip_loop(shared.clone(), shutdown.clone())),
            tokio::spawn(run_probe_loop(shared.clone(), shutdown.clone())),
        ];

        Ok(Self {
            shared,
            shutdown,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            tasks: Mutex::new(tasks),
        })
    }

    /// Enqueue a notification for transmission to all peers, best effort.
    ///
    /// Never blocks. When the queue is full the oldest pending notification
    /// is dropped; with no peers the queue is held until some arrive.
    pub fn broadcast(&self, notification: AnomalyNotification) {
        let budget = transmit_budget(
            self.shared.config.retransmit_mult,
            self.shared.membership.lock_or_panic().len(),
        );
        let mut queue = self.shared.queue.lock_or_panic();
        if queue.len() >= BROADCAST_QUEUE_CAPACITY {
            queue.pop_front();
            warn!("broadcast queue full, dropping oldest notification");
        }
        queue.push_back(PendingBroadcast {
            payload: notification,
            remaining: budget,
        });
    }

    /// Take the inbound notification stream. There is exactly one receiver;
    /// subsequent calls return `None`.
    ///
    /// The stream yields until the coordinator is stopped, then terminates.
    pub fn inbound(&self) -> Option<mpsc::Receiver<AnomalyNotification>> {
        self.inbound_rx.lock_or_panic().take()
    }

    /// The local node as advertised to peers. The port is the bound port,
    /// which matters when configured with port 0.
    pub fn local_member(&self) -> Member {
        self.shared.local.clone()
    }

    /// Cluster size as seen from this node, local node included.
    pub fn member_count(&self) -> usize {
        self.shared.membership.lock_or_panic().len()
    }

    /// Notifications queued and not yet out of transmission budget.
    pub(crate) fn pending_broadcast_count(&self) -> usize {
        self.shared.queue.lock_or_panic().len()
    }

    /// Announce departure, stop the gossip loops and close the inbound
    /// stream.
    pub async fn stop(&self) {
        info!(node = %self.shared.local.name, "cluster coordinator stopping");
        let leave = GossipMessage::Leave {
            node: self.shared.local.name.clone(),
        };
        let peers = self.shared.membership.lock_or_panic().peers();
        for peer in peers {
            self.shared.send_to(&leave, peer.addr).await;
        }

        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock_or_panic());
        for task in tasks {
            let _ = task.await;
        }
        // Closing the sender terminates the consumer's stream.
        self.shared.inbound_tx.lock_or_panic().take();
    }
}

impl fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("local", &self.shared.local)
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Rendezvous join: announce over UDP and push-pull membership over TCP
    /// with every configured seed.
    async fn join_seeds(self: &Arc<Self>) {
        for seed in &self.config.seed_peers {
            let addr = match tokio::net::lookup_host(seed.as_str()).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => addr,
                    None => {
                        warn!(seed = %seed, "seed peer resolved to no addresses");
                        continue;
                    }
                },
                Err(err) => {
                    warn!(seed = %seed, %err, "cannot resolve seed peer");
                    continue;
                }
            };
            let join = GossipMessage::Join {
                from: self.local.clone(),
            };
            self.send_to(&join, addr).await;

            match timeout(STATE_SYNC_TIMEOUT, self.push_pull(addr)).await {
                Ok(Ok(added)) => debug!(seed = %seed, added, "state sync with seed complete"),
                Ok(Err(err)) => {
                    warn!(seed = %seed, %err, "state sync with seed failed, continuing without it")
                }
                Err(_) => warn!(seed = %seed, "state sync with seed timed out"),
            }
        }
    }

    /// One TCP push-pull: send our membership snapshot, merge the peer's.
    async fn push_pull(&self, addr: SocketAddr) -> anyhow::Result<usize> {
        let mut stream = TcpStream::connect(addr).await?;
        let frame = {
            let membership = self.membership.lock_or_panic();
            GossipMessage::StateSync {
                from: membership.local().clone(),
                members: membership.snapshot(),
            }
        };
        write_frame(&mut stream, &frame.encode()?).await?;
        let reply = read_frame(&mut stream).await?;
        match GossipMessage::decode(&reply)? {
            GossipMessage::StateSync { from, members } => {
                let mut membership = self.membership.lock_or_panic();
                membership.upsert(from);
                Ok(membership.merge(members))
            }
            other => anyhow::bail!("unexpected state sync reply: {:?}", other),
        }
    }

    /// Serve the remote half of a push-pull started by a joining peer.
    async fn answer_state_sync(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let frame = timeout(STATE_SYNC_TIMEOUT, read_frame(&mut stream)).await??;
        let reply = match GossipMessage::decode(&frame)? {
            GossipMessage::StateSync { from, members } => {
                let mut membership = self.membership.lock_or_panic();
                if membership.upsert(from.clone()) {
                    info!(node = %from.name, "peer joined via state sync");
                }
                membership.merge(members);
                GossipMessage::StateSync {
                    from: membership.local().clone(),
                    members: membership.snapshot(),
                }
            }
            other => anyhow::bail!("unexpected state sync frame: {:?}", other),
        };
        write_frame(&mut stream, &reply.encode()?).await?;
        Ok(())
    }

    async fn handle_datagram(&self, bytes: &[u8], src: SocketAddr) {
        let message = match GossipMessage::decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                debug!(%src, %err, "dropping malformed gossip datagram");
                return;
            }
        };
        match message {
            GossipMessage::Join { from } => {
                let reply = {
                    let mut membership = self.membership.lock_or_panic();
                    if membership.upsert(from.clone()) {
                        info!(node = %from.name, addr = %from.addr, "peer joined");
                    }
                    GossipMessage::JoinAck {
                        members: membership.snapshot(),
                    }
                };
                self.send_to(&reply, src).await;
            }
            GossipMessage::JoinAck { members } => {
                self.membership.lock_or_panic().merge(members);
            }
            GossipMessage::Ping { seq, from } => {
                self.membership.lock_or_panic().upsert(from);
                self.send_to(&GossipMessage::Ack { seq }, src).await;
            }
            GossipMessage::Ack { seq } => {
                if let Some(waiter) = self.pending_acks.lock_or_panic().remove(&seq) {
                    let _ = waiter.send(());
                }
            }
            GossipMessage::Leave { node } => {
                if self.membership.lock_or_panic().remove(&node).is_some() {
                    info!(node = %node, "peer left");
                }
            }
            GossipMessage::Notify { payload } => self.deliver_inbound(payload),
            GossipMessage::StateSync { from, members } => {
                // State sync normally runs over TCP; merge anyway.
                let mut membership = self.membership.lock_or_panic();
                membership.upsert(from);
                membership.merge(members);
            }
        }
    }

    fn deliver_inbound(&self, payload: AnomalyNotification) {
        let guard = self.inbound_tx.lock_or_panic();
        let Some(sender) = guard.as_ref() else {
            return;
        };
        match sender.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("inbound notification queue full, dropping notification");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("inbound receiver gone, dropping notification");
            }
        }
    }

    /// One gossip round: transmit every queued notification to a random
    /// sample of peers and decrement budgets. With no peers the queue is
    /// left untouched.
    async fn gossip_round(&self) {
        let targets = self
            .membership
            .lock_or_panic()
            .sample_peers(self.config.fanout);
        if targets.is_empty() {
            return;
        }
        let pending: Vec<Vec<u8>> = {
            let mut queue = self.queue.lock_or_panic();
            let frames = queue
                .iter()
                .filter_map(|entry| {
                    GossipMessage::Notify {
                        payload: entry.payload.clone(),
                    }
                    .encode()
                    .ok()
                })
                .collect();
            for entry in queue.iter_mut() {
                entry.remaining = entry.remaining.saturating_sub(1);
            }
            queue.retain(|entry| entry.remaining > 0);
            frames
        };
        for frame in &pending {
            for peer in &targets {
                if let Err(err) = self.socket.send_to(frame, peer.addr).await {
                    debug!(peer = %peer.name, %err, "gossip transmission failed");
                }
            }
        }
    }

    /// Probe one random peer and age it out after repeated silence.
    async fn probe_random_peer(&self) {
        let Some(peer) = self.membership.lock_or_panic().sample_peers(1).pop() else {
            return;
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks.lock_or_panic().insert(seq, ack_tx);
        let ping = GossipMessage::Ping {
            seq,
            from: self.local.clone(),
        };
        self.send_to(&ping, peer.addr).await;

        if matches!(timeout(self.config.probe_timeout, ack_rx).await, Ok(Ok(()))) {
            self.membership.lock_or_panic().record_probe_success(&peer.name);
            return;
        }
        self.pending_acks.lock_or_panic().remove(&seq);
        let failures = {
            let mut membership = self.membership.lock_or_panic();
            let failures = membership.record_probe_failure(&peer.name);
            if failures >= self.config.max_failed_probes {
                membership.remove(&peer.name);
            }
            failures
        };
        if failures >= self.config.max_failed_probes {
            info!(node = %peer.name, failures, "peer failed probing, removed from membership");
        } else if failures > 0 {
            debug!(node = %peer.name, failures, "probe timed out");
        }
    }

    async fn send_to(&self, message: &GossipMessage, addr: SocketAddr) {
        match message.encode() {
            Ok(bytes) => {
                if let Err(err) = self.socket.send_to(&bytes, addr).await {
                    debug!(%addr, %err, "gossip send failed");
                }
            }
            Err(err) => error!(%err, "failed to encode gossip message"),
        }
    }
}

async fn run_udp_receiver(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = shared.socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => shared.handle_datagram(&buf[..len], src).await,
                Err(err) => warn!(%err, "gossip socket receive failed"),
            }
        }
    }
}

async fn run_state_sync_listener(
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, src)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(err) = shared.answer_state_sync(stream).await {
                            debug!(%src, %err, "state sync with peer failed");
                        }
                    });
                }
                Err(err) => warn!(%err, "state sync accept failed"),
            }
        }
    }
}

async fn run_gossip_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(shared.config.gossip_interval) => shared.gossip_round().await,
        }
    }
}

async fn run_probe_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(shared.config.probe_interval) => shared.probe_random_peer().await,
        }
    }
}

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

async fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_SYNC_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "state sync frame too large",
        ));
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tailsample_trace::{SpanId, TraceId};

    fn test_config(name: &str, seeds: Vec<String>) -> ClusterConfig {
        ClusterConfig {
            node_name: name.to_owned(),
            port: 0,
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            seed_peers: seeds,
            gossip_interval: Duration::from_millis(50),
            probe_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn test_notification(group_key: &str) -> AnomalyNotification {
        AnomalyNotification::start(
            TraceId::from_bytes([7; 16]),
            SpanId::from_bytes([8; 8]),
            group_key.to_owned(),
        )
    }

    #[test]
    fn test_transmit_budget_scales_with_cluster_size() {
        assert_eq!(transmit_budget(2, 1), 4);
        assert!(transmit_budget(2, 10) > transmit_budget(2, 1));
        // Degenerate multiplier still yields one transmission.
        assert_eq!(transmit_budget(0, 5), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_member_with_unreachable_seed() {
        let coordinator =
            ClusterCoordinator::start(test_config("lonely", vec!["127.0.0.1:9".to_owned()]))
                .await
                .unwrap();
        assert_eq!(coordinator.member_count(), 1);
        // Broadcasts are queued, not errors, while the node is alone.
        coordinator.broadcast(test_notification("g"));
        coordinator.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_join_and_notify_between_two_nodes() {
        let node_a = ClusterCoordinator::start(test_config("node-a", vec![])).await.unwrap();
        let seed = node_a.local_member().addr.to_string();
        let node_b = ClusterCoordinator::start(test_config("node-b", vec![seed]))
            .await
            .unwrap();

        // The join-time push-pull is synchronous within start.
        assert_eq!(node_a.member_count(), 2);
        assert_eq!(node_b.member_count(), 2);

        let mut inbound = node_a.inbound().unwrap();
        assert!(node_a.inbound().is_none());

        let notification = test_notification("spike");
        node_b.broadcast(notification.clone());

        let received = timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("notification not delivered in time")
            .expect("inbound stream closed early");
        assert_eq!(received, notification);

        node_b.stop().await;
        node_a.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_terminates_inbound_stream() {
        let coordinator = ClusterCoordinator::start(test_config("solo", vec![])).await.unwrap();
        let mut inbound = coordinator.inbound().unwrap();
        coordinator.stop().await;
        assert!(inbound.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_leave_shrinks_membership() {
        let node_a = ClusterCoordinator::start(test_config("node-a", vec![])).await.unwrap();
        let seed = node_a.local_member().addr.to_string();
        let node_b = ClusterCoordinator::start(test_config("node-b", vec![seed]))
            .await
            .unwrap();
        assert_eq!(node_a.member_count(), 2);

        node_b.stop().await;
        // The leave message travels over UDP; give the receiver a moment.
        timeout(Duration::from_secs(5), async {
            while node_a.member_count() != 1 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("departed peer still in membership");
        node_a.stop().await;
    }
}
