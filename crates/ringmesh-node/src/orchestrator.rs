//! The node orchestrator — the hub of the system (§4.6).
//!
//! Owns discovery, the peer pool, the inbound server, the meter and the
//! backend reference. Implements request routing, ring forwarding,
//! topology merge and lifecycle.
//!
//! # Startup sequence
//!
//! [`NodeOrchestrator::start`] performs these steps in order:
//!
//! 1. Probe device capabilities.
//! 2. Start the inbound RPC server.
//! 3. Start discovery.
//! 4. Subscribe to the peer change stream and spawn the pool-maintenance task.
//! 5. Spawn the periodic topology refresh task.
//!
//! # Request routing
//!
//! ```text
//! Server::serve_connection
//!     │  decode RPC
//!     ▼
//! NodeOrchestrator::handle_send_prompt / handle_send_tensor
//!     │  first layer?  ── yes ──▶ backend.infer_*           ── last layer? ──▶ return
//!     │                                                       └─ no ──▶ forward to next peer
//!     └─ no ──▶ select peer, call peer.send_prompt/send_tensor verbatim
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use ringmesh_proto::{
    ContributionMeter, ContributionSnapshot, DeviceCapabilities, DiscoveryConfig,
    DiscoveryService, ErrorKind, InferenceState, NodeId, PeerHandle, PeerHandleConfig, PeerInfo,
    ProtoError, RequestId, Shard, Tensor, Topology,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::InferenceBackend;
use crate::capabilities;
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::server::{RequestHandler, RpcServer};

/// Closed set of lifecycle states (§9 "Tagged variants for status").
#[derive(Debug, Clone, PartialEq)]
pub enum NodeStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

/// Upstream updates delivered by `send_result` / `send_opaque_status`
/// (§4.6). The core only logs and forwards them; this is the optional
/// subscriber interface mentioned in the spec.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Result {
        request_id: RequestId,
        token_ids: Vec<i32>,
        is_finished: bool,
    },
    OpaqueStatus {
        request_id: RequestId,
        status: String,
    },
}

struct OutstandingRequest {
    started_at: Instant,
}

pub struct NodeOrchestrator {
    node_id: NodeId,
    config: NodeConfig,
    shard: Option<Shard>,
    capabilities: RwLock<DeviceCapabilities>,
    backend: Arc<dyn InferenceBackend>,
    discovery: Arc<DiscoveryService>,
    peer_pool: Arc<DashMap<NodeId, Arc<PeerHandle>>>,
    meter: Arc<ContributionMeter>,
    outstanding: Arc<DashMap<RequestId, OutstandingRequest>>,
    topology: RwLock<Arc<Topology>>,
    status_tx: watch::Sender<NodeStatus>,
    upstream_tx: tokio::sync::broadcast::Sender<UpstreamEvent>,
    shutdown_tx: watch::Sender<bool>,
    background: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl NodeOrchestrator {
    pub fn new(config: NodeConfig, backend: Arc<dyn InferenceBackend>) -> anyhow::Result<Arc<Self>> {
        let node_id = NodeId::from(config.node_id.clone());
        let shard = config
            .shard
            .clone()
            .map(|s| s.into_shard())
            .transpose()?;
        let discovery = DiscoveryService::new(DiscoveryConfig {
            node_id: node_id.clone(),
            grpc_port: config.grpc_port,
            discovery_port: config.discovery_port,
            broadcast_interval: config.broadcast_interval(),
            peer_timeout: config.peer_timeout(),
            reaper_interval: config.reaper_interval(),
        });
        let (status_tx, _) = watch::channel(NodeStatus::Stopped);
        let (upstream_tx, _) = tokio::sync::broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(NodeOrchestrator {
            node_id,
            config,
            shard,
            capabilities: RwLock::new(DeviceCapabilities::unknown()),
            backend,
            discovery,
            peer_pool: Arc::new(DashMap::new()),
            meter: Arc::new(ContributionMeter::new()),
            outstanding: Arc::new(DashMap::new()),
            topology: RwLock::new(Arc::new(Topology::empty())),
            status_tx,
            upstream_tx,
            shutdown_tx,
            background: std::sync::Mutex::new(Vec::new()),
        }))
    }

    pub fn status(&self) -> watch::Receiver<NodeStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_upstream(&self) -> tokio::sync::broadcast::Receiver<UpstreamEvent> {
        self.upstream_tx.subscribe()
    }

    pub fn meter_snapshot(&self) -> ContributionSnapshot {
        self.meter.snapshot()
    }

    pub fn topology_snapshot(&self) -> Arc<Topology> {
        self.topology.read().unwrap().clone()
    }

    fn set_status(&self, status: NodeStatus) {
        let _ = self.status_tx.send(status);
    }

    /// §4.6 start sequence. Idempotent only in the sense that calling it
    /// twice concurrently races; callers are expected to own the
    /// lifecycle from a single task.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, NodeError> {
        self.set_status(NodeStatus::Starting);

        *self.capabilities.write().unwrap() = capabilities::detect();

        let addr: SocketAddr = ([0, 0, 0, 0], self.config.grpc_port).into();
        let server = RpcServer::bind(
            addr,
            self.clone() as Arc<dyn RequestHandler>,
            self.config.max_message_bytes,
            self.config.worker_pool_size,
        )
        .await?;
        let bound_addr = server.local_addr()?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = *shutdown_rx.borrow_and_update();
        let server_task = server.serve(shutdown_rx);
        self.background.lock().unwrap().push(server_task);

        self.discovery.start().await?;

        let pool_task = tokio::spawn(Self::run_peer_pool_maintenance(self.clone()));
        self.background.lock().unwrap().push(pool_task);

        let topology_task = tokio::spawn(Self::run_topology_refresh(self.clone()));
        self.background.lock().unwrap().push(topology_task);

        self.set_status(NodeStatus::Running);
        info!(node_id = %self.node_id, addr = %bound_addr, "node started");
        Ok(bound_addr)
    }

    /// §4.6 stop sequence. Idempotent.
    pub async fn stop(self: &Arc<Self>) {
        self.set_status(NodeStatus::Stopping);
        let _ = self.shutdown_tx.send(true);
        self.discovery.stop().await;

        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }

        let peer_ids: Vec<NodeId> = self.peer_pool.iter().map(|e| e.key().clone()).collect();
        for id in peer_ids {
            if let Some((_, handle)) = self.peer_pool.remove(&id) {
                handle.close().await;
            }
        }

        self.set_status(NodeStatus::Stopped);
        info!(node_id = %self.node_id, "node stopped");
    }

    /// Wire a peer into the pool without waiting for discovery to find it —
    /// used for statically-configured peers and in tests that don't want
    /// to depend on UDP broadcast reachability.
    pub fn connect_peer(&self, id: NodeId, address: String, port: u16) {
        if id == self.node_id || self.peer_pool.contains_key(&id) {
            return;
        }
        let handle = PeerHandle::new(
            id.clone(),
            address,
            port,
            PeerHandleConfig {
                keepalive: self.config.rpc_keepalive(),
                call_deadline: self.config.rpc_call_deadline(),
                max_message_bytes: self.config.max_message_bytes,
                close_grace: Duration::from_millis(2_000),
            },
        );
        self.peer_pool.insert(id, handle);
    }

    async fn run_peer_pool_maintenance(self_arc: Arc<Self>) {
        let mut changes = self_arc.discovery.subscribe();
        loop {
            let snapshot = changes.borrow_and_update().clone();
            self_arc.reconcile_peer_pool(snapshot).await;
            if changes.changed().await.is_err() {
                break;
            }
        }
    }

    async fn reconcile_peer_pool(&self, snapshot: HashMap<String, PeerInfo>) {
        let current: Vec<NodeId> = self.peer_pool.iter().map(|e| e.key().clone()).collect();

        for (id, info) in &snapshot {
            let node_id = NodeId::from(id.clone());
            if !self.peer_pool.contains_key(&node_id) {
                let handle = PeerHandle::new(
                    node_id.clone(),
                    info.address.clone(),
                    info.port,
                    PeerHandleConfig {
                        keepalive: self.config.rpc_keepalive(),
                        call_deadline: self.config.rpc_call_deadline(),
                        max_message_bytes: self.config.max_message_bytes,
                        close_grace: Duration::from_millis(2_000),
                    },
                );
                self.peer_pool.insert(node_id, handle);
            }
        }

        for node_id in current {
            if !snapshot.contains_key(node_id.as_str()) {
                if let Some((_, handle)) = self.peer_pool.remove(&node_id) {
                    handle.close().await;
                }
            }
        }
    }

    async fn run_topology_refresh(self_arc: Arc<Self>) {
        let mut ticker = tokio::time::interval(self_arc.config.topology_interval());
        loop {
            ticker.tick().await;
            if self_arc.peer_pool.is_empty() {
                continue;
            }
            let _ = self_arc
                .handle_collect_topology(Vec::new(), self_arc.config.topology_max_depth)
                .await;
        }
    }

    /// §4.6 "Peer selection" — baseline "first in pool" contract: total
    /// whenever non-empty, never self (§9 open question 1: this does not
    /// implement real ring ordering).
    fn select_peer(&self) -> Result<Arc<PeerHandle>, ProtoError> {
        self.peer_pool
            .iter()
            .find(|e| e.key() != &self.node_id)
            .map(|e| e.value().clone())
            .ok_or(ProtoError::NoPeers)
    }

    fn is_first_layer(&self, shard: &Shard) -> bool {
        shard.is_first_layer()
    }

    fn is_last_layer(&self, shard: &Shard) -> bool {
        shard.is_last_layer()
    }

    fn record_outstanding(&self, request_id: RequestId) {
        self.outstanding.insert(
            request_id,
            OutstandingRequest {
                started_at: Instant::now(),
            },
        );
    }

    fn clear_outstanding(&self, request_id: &RequestId) -> Duration {
        self.outstanding
            .remove(request_id)
            .map(|(_, entry)| entry.started_at.elapsed())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RequestHandler for NodeOrchestrator {
    async fn handle_send_prompt(
        &self,
        shard: Shard,
        prompt: String,
        request_id: RequestId,
        state: InferenceState,
    ) -> Result<Tensor, ProtoError> {
        self.record_outstanding(request_id.clone());
        let result = self.do_handle_send_prompt(shard, prompt, request_id.clone(), state).await;
        self.clear_outstanding(&request_id);
        if result.is_err() {
            self.meter.record_failure();
        }
        result
    }

    async fn handle_send_tensor(
        &self,
        shard: Shard,
        tensor: Tensor,
        request_id: RequestId,
        state: InferenceState,
    ) -> Result<Tensor, ProtoError> {
        self.record_outstanding(request_id.clone());
        let result = self.do_handle_send_tensor(shard, tensor, request_id.clone(), state).await;
        self.clear_outstanding(&request_id);
        if result.is_err() {
            self.meter.record_failure();
        }
        result
    }

    async fn handle_collect_topology(
        &self,
        visited: Vec<String>,
        max_depth: i32,
    ) -> Result<Topology, ProtoError> {
        if visited.contains(&self.node_id.as_str().to_string()) {
            return Ok(Topology::empty());
        }
        let mut visited_next = visited;
        visited_next.push(self.node_id.as_str().to_string());

        let mut merged = Topology::empty();

        if max_depth > 0 {
            let peers: Vec<Arc<PeerHandle>> =
                self.peer_pool.iter().map(|e| e.value().clone()).collect();
            let futures = peers.into_iter().map(|peer| {
                let visited_next = visited_next.clone();
                async move {
                    match tokio::time::timeout(
                        Duration::from_secs(10),
                        peer.collect_topology(visited_next, max_depth - 1),
                    )
                    .await
                    {
                        Ok(Ok(t)) => Some(t),
                        Ok(Err(e)) => {
                            warn!(peer = %peer.peer_id(), error = %e, "topology peer call failed");
                            None
                        }
                        Err(_) => {
                            warn!(peer = %peer.peer_id(), "topology peer call timed out");
                            None
                        }
                    }
                }
            });
            for result in futures::future::join_all(futures).await {
                if let Some(t) = result {
                    merged.merge(t);
                }
            }
        }

        let caps = self.capabilities.read().unwrap().clone();
        merged.nodes.insert(self.node_id.as_str().to_string(), caps);
        let edges = self
            .peer_pool
            .iter()
            .map(|e| (e.key().as_str().to_string(), "RPC peer".to_string()))
            .collect();
        merged.peer_graph.insert(self.node_id.as_str().to_string(), edges);

        let shared = Arc::new(merged.clone());
        *self.topology.write().unwrap() = shared;
        Ok(merged)
    }

    async fn handle_send_result(
        &self,
        request_id: RequestId,
        token_ids: Vec<i32>,
        is_finished: bool,
    ) -> Result<(), ProtoError> {
        info!(request_id = %request_id, is_finished, "received result");
        let _ = self.upstream_tx.send(UpstreamEvent::Result {
            request_id,
            token_ids,
            is_finished,
        });
        Ok(())
    }

    async fn handle_send_opaque_status(
        &self,
        request_id: RequestId,
        status: String,
    ) -> Result<(), ProtoError> {
        info!(request_id = %request_id, %status, "received opaque status");
        let _ = self
            .upstream_tx
            .send(UpstreamEvent::OpaqueStatus { request_id, status });
        Ok(())
    }

    async fn handle_health_check(&self) -> bool {
        !self.capabilities.read().unwrap().is_unknown()
    }

    fn local_node_id(&self) -> NodeId {
        self.node_id.clone()
    }

    fn record_failure(&self) {
        self.meter.record_failure();
    }
}

impl NodeOrchestrator {
    /// §4.6 "Prompt handling" steps 2-6.
    async fn do_handle_send_prompt(
        &self,
        shard: Shard,
        prompt: String,
        request_id: RequestId,
        state: InferenceState,
    ) -> Result<Tensor, ProtoError> {
        let started = Instant::now();
        let prompt_bytes = prompt.len() as u64;
        let word_count = prompt.split_whitespace().count() as u64;

        // Routing is decided against this node's own configured shard, not
        // the caller-supplied one (see the `effective_shard` doc comment):
        // a relay-only node with no shard of its own falls back to the
        // incoming value so it still has something to forward.
        let effective = self.effective_shard(&shard);

        let output = if self.is_first_layer(&effective) {
            let (tensor, _next_state) = self
                .backend
                .infer_prompt(&request_id, &effective, &prompt, non_empty(state.clone()))
                .await
                .map_err(|e| ProtoError::BackendFailure {
                    cause: e.to_string(),
                })?;
            if self.is_last_layer(&effective) {
                tensor
            } else {
                self.forward_tensor(effective, tensor, request_id.clone(), state)
                    .await?
            }
        } else {
            let peer = self.select_peer()?;
            peer.send_prompt(shard, prompt, request_id.clone(), state)
                .await?
        };

        self.meter
            .record_prompt(word_count, started.elapsed().as_millis() as u64, prompt_bytes);
        Ok(output)
    }

    /// §4.6 "Tensor handling".
    async fn do_handle_send_tensor(
        &self,
        shard: Shard,
        tensor: Tensor,
        request_id: RequestId,
        state: InferenceState,
    ) -> Result<Tensor, ProtoError> {
        let started = Instant::now();
        let input_len = tensor.data.len() as u64;
        let effective = self.effective_shard(&shard);

        let (result, _next_state) = self
            .backend
            .infer_tensor(&request_id, &effective, &tensor, non_empty(state.clone()))
            .await
            .map_err(|e| ProtoError::BackendFailure {
                cause: e.to_string(),
            })?;

        let output = if self.is_last_layer(&effective) {
            result
        } else {
            self.forward_tensor(effective, result, request_id, state).await?
        };

        self.meter
            .record_tensor(started.elapsed().as_millis() as u64, input_len * 4);
        Ok(output)
    }

    /// Resolves which shard this call actually runs against: this node's
    /// own configured shard when it has one, else the caller-supplied
    /// shard (pure relay nodes have no shard to assert ownership of).
    ///
    /// Using the incoming RPC's shard field directly for the
    /// first/last-layer check (as a literal reading of §4.6 would) makes a
    /// non-owning node that relays a request right back into a ping-pong
    /// with its one peer, since neither side's decision ever changes. See
    /// the "peer selection" open question (§9): selection has no
    /// shard-affinity, so this is the node-identity anchor that keeps
    /// forwarding convergent in a two-node ring.
    fn effective_shard(&self, incoming: &Shard) -> Shard {
        self.shard.clone().unwrap_or_else(|| incoming.clone())
    }

    /// §4.6 "Forwarding to next layer".
    async fn forward_tensor(
        &self,
        shard: Shard,
        tensor: Tensor,
        request_id: RequestId,
        state: InferenceState,
    ) -> Result<Tensor, ProtoError> {
        let next_shard = shard.advance();
        let peer = self.select_peer()?;
        peer.send_tensor(next_shard, tensor, request_id, state).await
    }
}

fn non_empty(state: InferenceState) -> Option<InferenceState> {
    if state.is_absent() {
        None
    } else {
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EchoBackend;

    fn test_config(node_id: &str, grpc_port: u16, discovery_port: u16) -> NodeConfig {
        NodeConfig {
            node_id: node_id.to_string(),
            grpc_port,
            discovery_port,
            shard: Some(crate::config::ShardConfig {
                model_id: "m".to_string(),
                start_layer: 0,
                end_layer: 5,
                n_layers: 12,
            }),
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn select_peer_fails_with_no_peers_when_pool_empty() {
        let orch = NodeOrchestrator::new(
            test_config("n1", 0, 0),
            Arc::new(EchoBackend::new("echo")),
        )
        .unwrap();
        let err = orch.select_peer().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPeers);
    }

    #[tokio::test]
    async fn health_check_is_false_before_start() {
        let orch = NodeOrchestrator::new(
            test_config("n1", 0, 0),
            Arc::new(EchoBackend::new("echo")),
        )
        .unwrap();
        assert!(!orch.handle_health_check().await);
    }

    #[tokio::test]
    async fn topology_collection_prevents_cycles_on_self_visit() {
        let orch = NodeOrchestrator::new(
            test_config("n1", 0, 0),
            Arc::new(EchoBackend::new("echo")),
        )
        .unwrap();
        let topology = orch
            .handle_collect_topology(vec!["n1".to_string()], 2)
            .await
            .unwrap();
        assert!(topology.nodes.is_empty());
        assert!(topology.peer_graph.is_empty());
    }

    #[tokio::test]
    async fn prompt_on_first_and_last_layer_runs_locally_with_no_forward() {
        let mut config = test_config("n1", 0, 0);
        config.shard = Some(crate::config::ShardConfig {
            model_id: "m".to_string(),
            start_layer: 0,
            end_layer: 0,
            n_layers: 1,
        });
        let orch = NodeOrchestrator::new(config, Arc::new(EchoBackend::new("echo"))).unwrap();
        let shard = orch.shard.clone().unwrap();
        let result = orch
            .do_handle_send_prompt(
                shard,
                "hi there".to_string(),
                RequestId::from("r1"),
                InferenceState::absent(),
            )
            .await
            .unwrap();
        assert!(result.shape_product() > 0);
        assert_eq!(orch.meter_snapshot().requests, 1);
    }

    fn non_first_layer_config(node_id: &str) -> NodeConfig {
        let mut config = test_config(node_id, 0, 0);
        config.shard = Some(crate::config::ShardConfig {
            model_id: "m".to_string(),
            start_layer: 6,
            end_layer: 11,
            n_layers: 12,
        });
        config
    }

    #[tokio::test]
    async fn non_first_layer_prompt_fails_with_no_peers_when_pool_empty() {
        let orch = NodeOrchestrator::new(
            non_first_layer_config("n1"),
            Arc::new(EchoBackend::new("echo")),
        )
        .unwrap();
        let shard = orch.shard.clone().unwrap();
        let err = orch
            .do_handle_send_prompt(
                shard,
                "hi".to_string(),
                RequestId::from("r1"),
                InferenceState::absent(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPeers);
    }

    #[tokio::test]
    async fn failed_prompt_records_a_meter_failure() {
        let orch = NodeOrchestrator::new(
            non_first_layer_config("n1"),
            Arc::new(EchoBackend::new("echo")),
        )
        .unwrap();
        let shard = orch.shard.clone().unwrap();
        let _ = orch
            .handle_send_prompt(
                shard,
                "hi".to_string(),
                RequestId::from("r1"),
                InferenceState::absent(),
            )
            .await;
        assert_eq!(orch.meter_snapshot().failures, 1);
    }

    #[tokio::test]
    async fn outstanding_request_is_cleared_on_completion() {
        let mut config = test_config("n1", 0, 0);
        config.shard = Some(crate::config::ShardConfig {
            model_id: "m".to_string(),
            start_layer: 0,
            end_layer: 0,
            n_layers: 1,
        });
        let orch = NodeOrchestrator::new(config, Arc::new(EchoBackend::new("echo"))).unwrap();
        let shard = orch.shard.clone().unwrap();
        orch.handle_send_prompt(
            shard,
            "hi".to_string(),
            RequestId::from("r1"),
            InferenceState::absent(),
        )
        .await
        .unwrap();
        assert!(orch.outstanding.is_empty());
    }
}
