//! Outbound RPC client addressed to one remote peer (§4.3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{ErrorKind, ProtoError};
use crate::protocol::codec::{decode_tensor, encode_tensor, read_framed, write_framed, RpcRequest, RpcResponse};
use crate::protocol::types::{InferenceState, NodeId, RequestId, Shard, Tensor, Topology};

/// Keep-alive ping interval and per-call deadline, overridable from
/// configuration (§4.3, §6 `rpcKeepaliveMs` / `rpcCallDeadlineMs`).
#[derive(Debug, Clone, Copy)]
pub struct PeerHandleConfig {
    pub keepalive: Duration,
    pub call_deadline: Duration,
    pub max_message_bytes: usize,
    pub close_grace: Duration,
}

impl Default for PeerHandleConfig {
    fn default() -> Self {
        PeerHandleConfig {
            keepalive: Duration::from_millis(10_000),
            call_deadline: Duration::from_millis(30_000),
            max_message_bytes: crate::protocol::codec::DEFAULT_MAX_MESSAGE_BYTES,
            close_grace: Duration::from_millis(2_000),
        }
    }
}

/// An outbound RPC client addressed to one specific remote node.
///
/// The underlying connection is established lazily on the first call and
/// reused afterwards; `close` is idempotent and any call issued after it
/// fails with [`ErrorKind::PeerClosed`].
pub struct PeerHandle {
    peer_id: NodeId,
    address: String,
    port: u16,
    config: PeerHandleConfig,
    conn: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
    keepalive_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PeerHandle {
    pub fn new(peer_id: NodeId, address: String, port: u16, config: PeerHandleConfig) -> Arc<Self> {
        let handle = Arc::new(PeerHandle {
            peer_id,
            address,
            port,
            config,
            conn: Mutex::new(None),
            closed: AtomicBool::new(false),
            keepalive_task: Mutex::new(None),
        });
        PeerHandle::spawn_keepalive(handle.clone());
        handle
    }

    pub fn peer_id(&self) -> &NodeId {
        &self.peer_id
    }

    fn spawn_keepalive(self_arc: Arc<Self>) {
        let weak = Arc::downgrade(&self_arc);
        let interval = self_arc.config.keepalive;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(handle) if !handle.closed.load(Ordering::Relaxed) => {
                        let _ = handle.health_check().await;
                    }
                    _ => break,
                }
            }
        });
        // Stash the handle so `close` can abort it promptly rather than
        // waiting out the next keepalive tick.
        if let Ok(mut slot) = self_arc.keepalive_task.try_lock() {
            *slot = Some(task);
        }
    }

    async fn ensure_connected(&self) -> Result<(), ProtoError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ProtoError::PeerClosed);
        }
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let stream = timeout(
            self.config.call_deadline,
            TcpStream::connect((self.address.as_str(), self.port)),
        )
        .await
        .map_err(|_| ProtoError::Timeout)?
        .map_err(|e| self.wrap(e.into()))?;
        *guard = Some(stream);
        Ok(())
    }

    fn wrap(&self, cause: ProtoError) -> ProtoError {
        ProtoError::PeerCommunication {
            peer_id: self.peer_id.clone(),
            cause: cause.to_string(),
        }
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, ProtoError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ProtoError::PeerClosed);
        }
        self.ensure_connected().await?;

        let fut = async {
            let mut guard = self.conn.lock().await;
            let stream = guard.as_mut().ok_or(ProtoError::PeerClosed)?;
            write_framed(stream, &request, self.config.max_message_bytes).await?;
            read_framed::<_, RpcResponse>(stream, self.config.max_message_bytes).await
        };

        match timeout(self.config.call_deadline, fut).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                // The stream is presumed dead after any I/O error; drop it
                // so the next call reconnects.
                *self.conn.lock().await = None;
                Err(self.wrap(e))
            }
            Err(_) => Err(ProtoError::Timeout),
        }
    }

    pub async fn send_prompt(
        &self,
        shard: Shard,
        prompt: String,
        request_id: RequestId,
        state: InferenceState,
    ) -> Result<Tensor, ProtoError> {
        let resp = self
            .call(RpcRequest::SendPrompt {
                shard,
                prompt,
                request_id,
                state,
            })
            .await?;
        self.expect_tensor(resp)
    }

    pub async fn send_tensor(
        &self,
        shard: Shard,
        tensor: Tensor,
        request_id: RequestId,
        state: InferenceState,
    ) -> Result<Tensor, ProtoError> {
        let resp = self
            .call(RpcRequest::SendTensor {
                shard,
                tensor: encode_tensor(&tensor),
                request_id,
                state,
            })
            .await?;
        self.expect_tensor(resp)
    }

    pub async fn collect_topology(
        &self,
        visited: Vec<String>,
        max_depth: i32,
    ) -> Result<Topology, ProtoError> {
        let resp = self
            .call(RpcRequest::CollectTopology { visited, max_depth })
            .await?;
        match resp {
            RpcResponse::Topology(t) => Ok(t),
            RpcResponse::Error { kind, message } => Err(self.error_from_wire(&kind, message)),
            other => Err(self.wrap(ProtoError::Internal(format!(
                "unexpected response to collect_topology: {other:?}"
            )))),
        }
    }

    pub async fn send_result(
        &self,
        request_id: RequestId,
        token_ids: Vec<i32>,
        is_finished: bool,
    ) -> Result<(), ProtoError> {
        let resp = self
            .call(RpcRequest::SendResult {
                request_id,
                token_ids,
                is_finished,
            })
            .await?;
        self.expect_ack(resp)
    }

    pub async fn send_opaque_status(
        &self,
        request_id: RequestId,
        status: String,
    ) -> Result<(), ProtoError> {
        let resp = self
            .call(RpcRequest::SendOpaqueStatus { request_id, status })
            .await?;
        self.expect_ack(resp)
    }

    /// Never fails: any transport error is folded into `false` (§4.3).
    pub async fn health_check(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        match self.call(RpcRequest::HealthCheck).await {
            Ok(RpcResponse::Health { is_healthy }) => is_healthy,
            _ => false,
        }
    }

    /// Idempotent; any call after this returns `Kind::PeerClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(task) = self.keepalive_task.lock().await.take() {
            task.abort();
        }
        let grace = self.config.close_grace;
        let _ = timeout(grace, async {
            let mut guard = self.conn.lock().await;
            if let Some(stream) = guard.take() {
                drop(stream);
            }
        })
        .await;
    }

    fn expect_tensor(&self, resp: RpcResponse) -> Result<Tensor, ProtoError> {
        match resp {
            RpcResponse::Tensor(wire) => decode_tensor(&wire),
            RpcResponse::Error { kind, message } => Err(self.error_from_wire(&kind, message)),
            other => Err(self.wrap(ProtoError::Internal(format!(
                "unexpected response, wanted tensor: {other:?}"
            )))),
        }
    }

    fn expect_ack(&self, resp: RpcResponse) -> Result<(), ProtoError> {
        match resp {
            RpcResponse::Ack => Ok(()),
            RpcResponse::Error { kind, message } => Err(self.error_from_wire(&kind, message)),
            other => Err(self.wrap(ProtoError::Internal(format!(
                "unexpected response, wanted ack: {other:?}"
            )))),
        }
    }

    fn error_from_wire(&self, kind: &str, message: String) -> ProtoError {
        match kind {
            "MalformedRequest" => ProtoError::MalformedRequest(message),
            "NoPeers" => ProtoError::NoPeers,
            "BackendFailure" => ProtoError::BackendFailure { cause: message },
            "Timeout" => ProtoError::Timeout,
            "Cancelled" => ProtoError::Cancelled,
            _ => self.wrap(ProtoError::Internal(message)),
        }
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("peer_id", &self.peer_id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
