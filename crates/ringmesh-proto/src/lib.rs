pub mod discovery;
pub mod error;
pub mod meter;
pub mod peer;
pub mod protocol;

pub use discovery::{DiscoveryConfig, DiscoveryService, PeerSnapshot};
pub use error::{ErrorKind, ProtoError};
pub use meter::{ContributionMeter, ContributionSnapshot};
pub use peer::{PeerHandle, PeerHandleConfig};
pub use protocol::codec::{RpcRequest, RpcResponse, DEFAULT_MAX_MESSAGE_BYTES};
pub use protocol::types::{
    DType, DeviceCapabilities, DeviceFlops, InferenceState, NodeId, PeerInfo, RequestId, Shard,
    Tensor, TensorData, Topology, WireTensor,
};
