//! Wire codec: RPC envelope types, length-framed CBOR encoding, and the
//! tensor <-> wire-bytes conversion (§4.1).
//!
//! Frame shape on the wire, matching the length-prefix convention used
//! throughout this codebase's RPC layers:
//!
//! ```text
//! ┌────────────┬───────────────────────┐
//! │ u32 BE len │ CBOR payload          │
//! └────────────┴───────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;
use crate::protocol::types::{
    DType, InferenceState, NodeId, RequestId, Shard, Tensor, TensorData, Topology, WireTensor,
};

/// Default cap on a single RPC frame; overridable via `maxMessageBytes`.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024 * 1024;

// ── RPC envelope ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum RpcRequest {
    SendPrompt {
        shard: Shard,
        prompt: String,
        request_id: RequestId,
        state: InferenceState,
    },
    SendTensor {
        shard: Shard,
        tensor: WireTensor,
        request_id: RequestId,
        state: InferenceState,
    },
    CollectTopology {
        visited: Vec<String>,
        max_depth: i32,
    },
    SendResult {
        request_id: RequestId,
        token_ids: Vec<i32>,
        is_finished: bool,
    },
    SendOpaqueStatus {
        request_id: RequestId,
        status: String,
    },
    HealthCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum RpcResponse {
    Tensor(WireTensor),
    Topology(Topology),
    Ack,
    Health { is_healthy: bool },
    Error { kind: String, message: String },
}

impl RpcResponse {
    pub fn error(kind: crate::error::ErrorKind, message: impl Into<String>) -> Self {
        RpcResponse::Error {
            kind: format!("{kind:?}"),
            message: message.into(),
        }
    }
}

// ── Tensor <-> wire bytes ──────────────────────────────────────────────────────

/// Convert an in-memory [`Tensor`] to its little-endian wire form (§4.1:
/// "Endianness is fixed to little-endian on the wire").
pub fn encode_tensor(t: &Tensor) -> WireTensor {
    let (bytes, dtype) = match &t.data {
        TensorData::F32(v) => {
            let mut bytes = Vec::with_capacity(v.len() * 4);
            for x in v {
                bytes.extend_from_slice(&x.to_le_bytes());
            }
            (bytes, DType::Float32)
        }
        TensorData::I32(v) => {
            let mut bytes = Vec::with_capacity(v.len() * 4);
            for x in v {
                bytes.extend_from_slice(&x.to_le_bytes());
            }
            (bytes, DType::Int32)
        }
    };
    WireTensor {
        bytes,
        shape: t.shape.clone(),
        dtype,
    }
}

/// Decode a wire tensor, validating
/// `product(shape) * sizeof(dtype) == len(bytes)` (§4.1, invariant 2).
pub fn decode_tensor(w: &WireTensor) -> Result<Tensor, ProtoError> {
    let elem_count: i64 = w.shape.iter().map(|&d| d as i64).product();
    if elem_count < 0 {
        return Err(ProtoError::MalformedTensor(
            "negative dimension in shape".to_string(),
        ));
    }
    let expected_bytes = elem_count as usize * w.dtype.size_bytes();
    if expected_bytes != w.bytes.len() {
        return Err(ProtoError::MalformedTensor(format!(
            "shape {:?} with dtype {:?} implies {expected_bytes} bytes, got {}",
            w.shape,
            w.dtype,
            w.bytes.len()
        )));
    }

    let data = match w.dtype {
        DType::Float32 => {
            let v = w
                .bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            TensorData::F32(v)
        }
        DType::Int32 => {
            let v = w
                .bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            TensorData::I32(v)
        }
    };

    Ok(Tensor {
        shape: w.shape.clone(),
        data,
    })
}

// ── Length-framed CBOR I/O ────────────────────────────────────────────────────

pub fn cbor_encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ProtoError::Internal(format!("cbor encode: {e}")))?;
    Ok(buf)
}

pub fn cbor_decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, ProtoError> {
    ciborium::from_reader(data).map_err(|e| ProtoError::MalformedRequest(format!("cbor decode: {e}")))
}

pub async fn write_framed<W, T>(
    io: &mut W,
    value: &T,
    max_bytes: usize,
) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize,
{
    let payload = cbor_encode(value)?;
    if payload.len() > max_bytes {
        return Err(ProtoError::MalformedRequest(format!(
            "outgoing message of {} bytes exceeds max_bytes {max_bytes}",
            payload.len()
        )));
    }
    let len = payload.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&payload).await?;
    io.flush().await?;
    Ok(())
}

pub async fn read_framed<R, T>(io: &mut R, max_bytes: usize) -> Result<T, ProtoError>
where
    R: AsyncRead + Unpin + Send,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(ProtoError::MalformedRequest(format!(
            "incoming message of {len} bytes exceeds max_bytes {max_bytes}"
        )));
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    cbor_decode(&payload)
}

/// Synthesize a `requestId` when the caller sent an empty one (§4.5).
pub fn ensure_request_id(request_id: RequestId, local_node: &NodeId) -> RequestId {
    if request_id.is_empty() {
        RequestId::generate(local_node)
    } else {
        request_id
    }
}
