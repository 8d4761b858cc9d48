//! Error taxonomy shared by every ringmesh crate.
//!
//! Every variant carries enough context to be logged on its own and maps to
//! exactly one [`ErrorKind`] so callers (the RPC server, the meter) can branch
//! on the kind without string matching the `Display` output.

use thiserror::Error;

use crate::protocol::types::NodeId;

/// Coarse classification of a [`ProtoError`], used to pick a wire status code
/// and to decide whether a failure should be recorded against the meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedRequest,
    NoPeers,
    PeerCommunication,
    PeerClosed,
    Timeout,
    Cancelled,
    BackendFailure,
    Internal,
}

#[derive(Debug, Error, Clone)]
pub enum ProtoError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("malformed tensor: {0}")]
    MalformedTensor(String),

    #[error("no peers available")]
    NoPeers,

    #[error("peer {peer_id}: communication error: {cause}")]
    PeerCommunication { peer_id: NodeId, cause: String },

    #[error("peer handle already closed")]
    PeerClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("backend failure: {cause}")]
    BackendFailure { cause: String },

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl ProtoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtoError::MalformedRequest(_) | ProtoError::MalformedTensor(_) => {
                ErrorKind::MalformedRequest
            }
            ProtoError::NoPeers => ErrorKind::NoPeers,
            ProtoError::PeerCommunication { .. } => ErrorKind::PeerCommunication,
            ProtoError::PeerClosed => ErrorKind::PeerClosed,
            ProtoError::Timeout => ErrorKind::Timeout,
            ProtoError::Cancelled => ErrorKind::Cancelled,
            ProtoError::BackendFailure { .. } => ErrorKind::BackendFailure,
            ProtoError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<std::io::Error> for ProtoError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => ProtoError::Timeout,
            _ => ProtoError::Internal(e.to_string()),
        }
    }
}
