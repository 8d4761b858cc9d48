use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{parse_datagram, DiscoveryMessage, PeerSnapshot};
use crate::protocol::types::{NodeId, PeerInfo};

const GENERIC_BROADCAST: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);
const MAX_DATAGRAM_BYTES: usize = 1024;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub node_id: NodeId,
    pub grpc_port: u16,
    pub discovery_port: u16,
    pub broadcast_interval: Duration,
    pub peer_timeout: Duration,
    pub reaper_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            node_id: NodeId::from("unnamed"),
            grpc_port: 50051,
            discovery_port: 5678,
            broadcast_interval: Duration::from_millis(2500),
            peer_timeout: Duration::from_millis(10_000),
            reaper_interval: Duration::from_millis(5_000),
        }
    }
}

struct Tasks {
    broadcaster: JoinHandle<()>,
    listener: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

/// Three cooperative tasks sharing one UDP socket: a broadcaster, a
/// listener, and a reaper (§4.4).
pub struct DiscoveryService {
    config: DiscoveryConfig,
    peers: Arc<DashMap<String, PeerInfo>>,
    change_tx: watch::Sender<PeerSnapshot>,
    change_rx: watch::Receiver<PeerSnapshot>,
    running: AtomicBool,
    tasks: tokio::sync::Mutex<Option<Tasks>>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig) -> Arc<Self> {
        let (change_tx, change_rx) = watch::channel(PeerSnapshot::new());
        Arc::new(DiscoveryService {
            config,
            peers: Arc::new(DashMap::new()),
            change_tx,
            change_rx,
            running: AtomicBool::new(false),
            tasks: tokio::sync::Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerSnapshot> {
        self.change_rx.clone()
    }

    pub fn peers(&self) -> PeerSnapshot {
        self.peers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn publish_snapshot(&self) {
        let snapshot = self.peers();
        let _ = self.change_tx.send(snapshot);
    }

    /// Idempotent: a second `start` while already running is a no-op.
    pub async fn start(self: &Arc<Self>) -> std::io::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let socket = UdpSocket::bind(("0.0.0.0", self.config.discovery_port)).await?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);

        let broadcaster = tokio::spawn(Self::run_broadcaster(self.clone(), socket.clone()));
        let listener = tokio::spawn(Self::run_listener(self.clone(), socket.clone()));
        let reaper = tokio::spawn(Self::run_reaper(self.clone()));

        *self.tasks.lock().await = Some(Tasks {
            broadcaster,
            listener,
            reaper,
        });
        info!(port = self.config.discovery_port, "discovery started");
        Ok(())
    }

    /// Idempotent: cancels all three tasks, and clears the peer map.
    pub async fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tasks) = self.tasks.lock().await.take() {
            tasks.broadcaster.abort();
            tasks.listener.abort();
            tasks.reaper.abort();
        }
        self.peers.clear();
        self.publish_snapshot();
        info!("discovery stopped");
    }

    async fn run_broadcaster(self_arc: Arc<Self>, socket: Arc<UdpSocket>) {
        let msg = DiscoveryMessage::new(self_arc.config.node_id.as_str(), self_arc.config.grpc_port);
        let payload = match serde_json::to_vec(&msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode discovery message");
                return;
            }
        };
        let mut ticker = tokio::time::interval(self_arc.config.broadcast_interval);
        loop {
            ticker.tick().await;
            let targets = broadcast_targets(self_arc.config.discovery_port);
            for target in &targets {
                if let Err(e) = socket.send_to(&payload, target).await {
                    debug!(error = %e, target = %target, "discovery broadcast send failed");
                }
            }
        }
    }

    async fn run_listener(self_arc: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = [0u8; MAX_DATAGRAM_BYTES];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "discovery recv failed");
                    continue;
                }
            };
            let Some((id, port)) = parse_datagram(&buf[..len]) else {
                debug!(from = %from, "dropping unparsable discovery datagram");
                continue;
            };
            let address = match from {
                SocketAddr::V4(v4) => v4.ip().to_string(),
                SocketAddr::V6(v6) => v6.ip().to_string(),
            };
            self_arc.record_report(id, port, address, now_ms());
        }
    }

    /// Applies one discovery report to the peer table: drops self-reports
    /// (§4.4 self-suppression) and otherwise overwrites any existing entry
    /// for `id` with the latest sighting, so repeated reports within the
    /// timeout never produce more than one `PeerInfo` (§4.4 idempotence).
    fn record_report(&self, id: String, port: u16, address: String, now: i64) {
        if id == self.config.node_id.as_str() {
            return;
        }
        self.peers.insert(
            id.clone(),
            PeerInfo {
                id: NodeId::from(id),
                address,
                port,
                last_seen_ms: now,
            },
        );
        self.publish_snapshot();
    }

    async fn run_reaper(self_arc: Arc<Self>) {
        let mut ticker = tokio::time::interval(self_arc.config.reaper_interval);
        loop {
            ticker.tick().await;
            let now = now_ms();
            let timeout_ms = self_arc.config.peer_timeout.as_millis() as i64;
            let expired: Vec<String> = self_arc
                .peers
                .iter()
                .filter(|e| now - e.value().last_seen_ms > timeout_ms)
                .map(|e| e.key().clone())
                .collect();
            if expired.is_empty() {
                continue;
            }
            for id in &expired {
                self_arc.peers.remove(id);
            }
            self_arc.publish_snapshot();
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// §4.4: broadcast to the generic broadcast address and to the subnet
/// broadcast address of every up, non-loopback IPv4 interface.
fn broadcast_targets(port: u16) -> Vec<SocketAddr> {
    let mut targets = vec![SocketAddr::new(IpAddr::V4(GENERIC_BROADCAST), port)];
    match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            for iface in interfaces {
                if iface.is_loopback() {
                    continue;
                }
                if let get_if_addrs::IfAddr::V4(v4) = iface.addr {
                    if let Some(broadcast) = v4.broadcast {
                        targets.push(SocketAddr::new(IpAddr::V4(broadcast), port));
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to enumerate network interfaces for discovery broadcast"),
    }
    targets
}
