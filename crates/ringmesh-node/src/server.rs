//! Inbound RPC server (§4.5).
//!
//! Accepts TCP connections, decodes one length-framed request per call,
//! dispatches it to a [`RequestHandler`] and writes back the encoded
//! response. A bounded [`Semaphore`] caps concurrent in-flight handlers
//! at `worker_pool_size` (§5).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ringmesh_proto::{
    ErrorKind, InferenceState, NodeId, ProtoError, RequestId, Shard, Tensor, Topology,
};
use ringmesh_proto::protocol::codec::{ensure_request_id, read_framed, write_framed, RpcRequest, RpcResponse};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Implemented by the orchestrator; the server is agnostic to what
/// happens on each call.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_send_prompt(
        &self,
        shard: Shard,
        prompt: String,
        request_id: RequestId,
        state: InferenceState,
    ) -> Result<Tensor, ProtoError>;

    async fn handle_send_tensor(
        &self,
        shard: Shard,
        tensor: Tensor,
        request_id: RequestId,
        state: InferenceState,
    ) -> Result<Tensor, ProtoError>;

    async fn handle_collect_topology(
        &self,
        visited: Vec<String>,
        max_depth: i32,
    ) -> Result<Topology, ProtoError>;

    async fn handle_send_result(
        &self,
        request_id: RequestId,
        token_ids: Vec<i32>,
        is_finished: bool,
    ) -> Result<(), ProtoError>;

    async fn handle_send_opaque_status(
        &self,
        request_id: RequestId,
        status: String,
    ) -> Result<(), ProtoError>;

    async fn handle_health_check(&self) -> bool;

    fn local_node_id(&self) -> NodeId;

    /// Records one failed inbound call in the contribution meter. Called by
    /// `dispatch` for failures caught before a `handle_*` method runs (e.g.
    /// a malformed wire tensor), so every rejected request is counted (§7,
    /// Scenario S5).
    fn record_failure(&self);
}

pub struct RpcServer {
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    max_message_bytes: usize,
    permits: Arc<Semaphore>,
}

impl RpcServer {
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn RequestHandler>,
        max_message_bytes: usize,
        worker_pool_size: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(RpcServer {
            listener,
            handler,
            max_message_bytes,
            permits: Arc::new(Semaphore::new(worker_pool_size)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until `shutdown` resolves; each accepted connection is served
    /// on its own task so independent calls observe no ordering (§4.5).
    pub fn serve(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    accepted = self.listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                let handler = self.handler.clone();
                                let permits = self.permits.clone();
                                let max_bytes = self.max_message_bytes;
                                tokio::spawn(async move {
                                    let _permit = permits.acquire().await;
                                    if let Err(e) =
                                        serve_connection(stream, handler, max_bytes).await
                                    {
                                        debug!(peer = %peer_addr, error = %e, "rpc connection ended");
                                    }
                                });
                            }
                            Err(e) => warn!(error = %e, "rpc accept failed"),
                        }
                    }
                }
            }
        })
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
    max_bytes: usize,
) -> Result<(), ProtoError> {
    loop {
        let request: RpcRequest = match read_framed(&mut stream, max_bytes).await {
            Ok(r) => r,
            Err(e) => return Err(e),
        };
        let response = dispatch(&*handler, request).await;
        write_framed(&mut stream, &response, max_bytes).await?;
    }
}

async fn dispatch(handler: &dyn RequestHandler, request: RpcRequest) -> RpcResponse {
    let local = handler.local_node_id();
    match request {
        RpcRequest::SendPrompt {
            shard,
            prompt,
            request_id,
            state,
        } => {
            let request_id = ensure_request_id(request_id, &local);
            to_response(
                handler
                    .handle_send_prompt(shard, prompt, request_id, state)
                    .await,
            )
        }
        RpcRequest::SendTensor {
            shard,
            tensor,
            request_id,
            state,
        } => {
            let request_id = ensure_request_id(request_id, &local);
            let tensor = match ringmesh_proto::protocol::codec::decode_tensor(&tensor) {
                Ok(t) => t,
                Err(e) => {
                    handler.record_failure();
                    return error_response(e);
                }
            };
            to_response(
                handler
                    .handle_send_tensor(shard, tensor, request_id, state)
                    .await,
            )
        }
        RpcRequest::CollectTopology { visited, max_depth } => {
            match handler.handle_collect_topology(visited, max_depth).await {
                Ok(topology) => RpcResponse::Topology(topology),
                Err(e) => error_response(e),
            }
        }
        RpcRequest::SendResult {
            request_id,
            token_ids,
            is_finished,
        } => match handler
            .handle_send_result(request_id, token_ids, is_finished)
            .await
        {
            Ok(()) => RpcResponse::Ack,
            Err(e) => error_response(e),
        },
        RpcRequest::SendOpaqueStatus { request_id, status } => {
            match handler.handle_send_opaque_status(request_id, status).await {
                Ok(()) => RpcResponse::Ack,
                Err(e) => error_response(e),
            }
        }
        RpcRequest::HealthCheck => RpcResponse::Health {
            is_healthy: handler.handle_health_check().await,
        },
    }
}

fn to_response(result: Result<Tensor, ProtoError>) -> RpcResponse {
    match result {
        Ok(tensor) => RpcResponse::Tensor(ringmesh_proto::protocol::codec::encode_tensor(&tensor)),
        Err(e) => error_response(e),
    }
}

/// Maps the error kind to a transport status carried on the wire (§4.5
/// step v, §7 "surface the kind to the caller via the RPC transport's
/// status channel").
fn error_response(e: ProtoError) -> RpcResponse {
    let kind_name = match e.kind() {
        ErrorKind::MalformedRequest => "MalformedRequest",
        ErrorKind::NoPeers => "NoPeers",
        ErrorKind::PeerCommunication => "PeerCommunication",
        ErrorKind::PeerClosed => "PeerClosed",
        ErrorKind::Timeout => "Timeout",
        ErrorKind::Cancelled => "Cancelled",
        ErrorKind::BackendFailure => "BackendFailure",
        ErrorKind::Internal => "Internal",
    };
    RpcResponse::Error {
        kind: kind_name.to_string(),
        message: e.to_string(),
    }
}
