//! Node-level error taxonomy: startup, configuration and server-plumbing
//! failures that sit above the per-request [`ringmesh_proto::ProtoError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] ringmesh_proto::ProtoError),

    #[error("node is not running")]
    NotRunning,

    #[error("node already running")]
    AlreadyRunning,
}
