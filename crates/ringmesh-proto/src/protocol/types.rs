//! Core data model shared between the wire codec, the peer handle, the
//! discovery service and the orchestrator.
//!
//! All types here are value types: they flow by move/copy across RPC
//! boundaries and none of them own a connection or a lock.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

// ── Identity newtypes ─────────────────────────────────────────────────────────

/// A node's stable identity, broadcast in discovery and used as the peer-pool
/// key. Wrapping `String` keeps it from being confused with a `RequestId` or
/// an arbitrary label at call sites.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_owned())
    }
}

/// Opaque string, threaded unchanged through every hop of a prompt chain.
/// Maximum 256 bytes on the wire (§6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Synthesize a fresh id in the `node_<ts>_<rand>` shape used by the
    /// inbound server when a caller sends an empty `requestId` (§4.5).
    pub fn generate(node_id: &NodeId) -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let rand_suffix: u32 = rand::thread_rng().gen();
        RequestId(format!("{node_id}_{ts}_{rand_suffix:08x}"))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId(s.to_owned())
    }
}

// ── Shard ──────────────────────────────────────────────────────────────────────

/// An inclusive range of transformer layers of a specific model assigned to
/// one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub model_id: String,
    pub start_layer: u32,
    pub end_layer: u32,
    pub n_layers: u32,
}

impl Shard {
    /// Construct a shard, rejecting any bound violation of
    /// `0 <= start_layer <= end_layer <= n_layers - 1` up front so an invalid
    /// `Shard` value can never exist.
    pub fn new(
        model_id: impl Into<String>,
        start_layer: u32,
        end_layer: u32,
        n_layers: u32,
    ) -> Result<Self, crate::error::ProtoError> {
        if n_layers == 0 || start_layer > end_layer || end_layer > n_layers - 1 {
            return Err(crate::error::ProtoError::MalformedRequest(format!(
                "invalid shard bounds: start={start_layer} end={end_layer} n_layers={n_layers}"
            )));
        }
        Ok(Shard {
            model_id: model_id.into(),
            start_layer,
            end_layer,
            n_layers,
        })
    }

    pub fn layer_count(&self) -> u32 {
        self.end_layer - self.start_layer + 1
    }

    pub fn is_first_layer(&self) -> bool {
        self.start_layer == 0
    }

    pub fn is_last_layer(&self) -> bool {
        self.end_layer == self.n_layers - 1
    }

    /// Advance to the next contiguous range of the same layer count, clamped
    /// so `end_layer <= n_layers - 1` (§4.6 "Forwarding to next layer").
    pub fn advance(&self) -> Shard {
        let next_start = self.end_layer + 1;
        let next_end = std::cmp::min(self.end_layer + self.layer_count(), self.n_layers - 1);
        Shard {
            model_id: self.model_id.clone(),
            start_layer: next_start,
            end_layer: next_end,
            n_layers: self.n_layers,
        }
    }
}

// ── Device capabilities ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceFlops {
    pub fp32: f64,
    pub fp16: f64,
    pub int8: f64,
}

impl DeviceFlops {
    pub const ZERO: DeviceFlops = DeviceFlops {
        fp32: 0.0,
        fp16: 0.0,
        int8: 0.0,
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub model: String,
    pub chip: String,
    pub memory_mib: u32,
    pub flops: DeviceFlops,
}

impl DeviceCapabilities {
    /// Sentinel value used before a real probe has run.
    pub fn unknown() -> Self {
        DeviceCapabilities {
            model: "unknown".to_string(),
            chip: "unknown".to_string(),
            memory_mib: 0,
            flops: DeviceFlops::ZERO,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.model == "unknown" && self.chip == "unknown"
    }
}

// ── Peer info ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub address: String,
    pub port: u16,
    pub last_seen_ms: i64,
}

// ── Tensor ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    Float32,
    Int32,
}

impl DType {
    pub fn size_bytes(self) -> usize {
        match self {
            DType::Float32 => 4,
            DType::Int32 => 4,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Int32 => "int32",
        }
    }
}

/// In-memory tensor payload: typed host-order scalars plus a shape.
///
/// Endianness only matters once this is turned into wire bytes by
/// [`crate::protocol::codec`] — in memory we just keep native `f32`/`i32`.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::Float32,
            TensorData::I32(_) => DType::Int32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<i32>,
    pub data: TensorData,
}

impl Tensor {
    pub fn new(shape: Vec<i32>, data: TensorData) -> Self {
        Tensor { shape, data }
    }

    /// Product of the shape dimensions — the element count a well-formed
    /// tensor's `data` must match.
    pub fn shape_product(&self) -> i64 {
        self.shape.iter().map(|&d| d as i64).product()
    }
}

/// Wire-level tensor representation: a little-endian byte buffer, the shape
/// and a dtype tag (§4.1, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTensor {
    pub bytes: Vec<u8>,
    pub shape: Vec<i32>,
    pub dtype: DType,
}

// ── Inference state ────────────────────────────────────────────────────────────

/// Opaque kv-cache / metadata blob. The core never inspects its contents; an
/// empty payload on the wire decodes to `None` (§4.1).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceState(pub Option<Vec<u8>>);

impl InferenceState {
    pub fn absent() -> Self {
        InferenceState(None)
    }

    pub fn is_absent(&self) -> bool {
        self.0.is_none()
    }
}

// ── Topology ───────────────────────────────────────────────────────────────────

/// A snapshot of which nodes exist in the cluster and how they are pairwise
/// connected. `peer_graph` maps a source node id to a list of
/// `(to_id, description)` edges; edges may be unidirectional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub nodes: HashMap<String, DeviceCapabilities>,
    pub peer_graph: HashMap<String, Vec<(String, String)>>,
}

impl Topology {
    pub fn empty() -> Self {
        Topology::default()
    }

    /// Merge `other` into `self`: union of node maps (later writer wins on a
    /// duplicate id), concatenation of edge lists per source node, deduped on
    /// `(from, to)` (§4.6 "Merge each peer result").
    pub fn merge(&mut self, other: Topology) {
        for (id, caps) in other.nodes {
            self.nodes.insert(id, caps);
        }
        for (from, edges) in other.peer_graph {
            let entry = self.peer_graph.entry(from.clone()).or_default();
            for (to, desc) in edges {
                if !entry.iter().any(|(t, _)| *t == to) {
                    entry.push((to, desc));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest::proptest! {
        /// A `Shard` can only ever exist with `start <= end <= n_layers - 1`
        /// (§4.1, invariant 1) — construction is the sole gate.
        #[test]
        fn shard_new_enforces_bounds(
            n_layers in 1u32..64,
            start_layer in 0u32..64,
            end_layer in 0u32..64,
        ) {
            let result = Shard::new("m", start_layer, end_layer, n_layers);
            let should_be_valid = start_layer <= end_layer && end_layer <= n_layers - 1;
            proptest::prop_assert_eq!(result.is_ok(), should_be_valid);
        }

        /// Advancing a shard never produces a range whose end exceeds the
        /// model's last layer, and the new start is exactly one past the old
        /// end (§4.6 "Forwarding to next layer").
        /// Merging never drops an edge present in either side, and never
        /// produces a duplicate `(from, to)` pair (§4.6 "Merge each peer
        /// result").
        #[test]
        fn topology_merge_dedups_edges_and_drops_none(
            edges_a in proptest::collection::vec((0u8..5, 0u8..5), 0..10),
            edges_b in proptest::collection::vec((0u8..5, 0u8..5), 0..10),
        ) {
            let mut a = Topology::empty();
            for (from, to) in &edges_a {
                a.peer_graph.entry(from.to_string()).or_default().push((to.to_string(), "e".to_string()));
            }
            let mut b = Topology::empty();
            for (from, to) in &edges_b {
                b.peer_graph.entry(from.to_string()).or_default().push((to.to_string(), "e".to_string()));
            }
            a.merge(b);

            let mut expected_pairs: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();
            for (from, to) in edges_a.iter().chain(edges_b.iter()) {
                expected_pairs.insert((from.to_string(), to.to_string()));
            }
            let mut actual_pairs: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();
            for (from, edges) in &a.peer_graph {
                for (to, _) in edges {
                    proptest::prop_assert!(
                        actual_pairs.insert((from.clone(), to.clone())),
                        "duplicate edge ({from}, {to}) after merge"
                    );
                }
            }
            proptest::prop_assert_eq!(actual_pairs, expected_pairs);
        }

        #[test]
        fn shard_advance_stays_in_bounds(
            n_layers in 2u32..64,
            start_layer in 0u32..64,
        ) {
            let start_layer = start_layer % (n_layers - 1);
            let end_layer = start_layer + ((n_layers - start_layer - 2).min(3));
            let shard = Shard::new("m", start_layer, end_layer, n_layers).unwrap();
            proptest::prop_assume!(!shard.is_last_layer());
            let next = shard.advance();
            proptest::prop_assert_eq!(next.start_layer, shard.end_layer + 1);
            proptest::prop_assert!(next.end_layer <= n_layers - 1);
            proptest::prop_assert!(next.start_layer <= next.end_layer);
        }
    }
}
