//! Node configuration loaded from YAML.
//!
//! Configuration is YAML, never TOML. Layers are **deep-merged** — later
//! layers override only the fields they set.
//!
//! Search order (later overrides earlier):
//! 1. `/etc/ringmesh/node.yaml`
//! 2. `~/.config/ringmesh/node.yaml`
//! 3. `.ringmesh/node.yaml` (workspace-local)
//! 4. Path given to [`load`] explicitly.
//!
//! # Example
//! ```yaml
//! node_id: "node-a"
//! grpc_port: 50051
//! discovery_port: 5678
//! shard:
//!   model_id: "llama-3-8b"
//!   start_layer: 0
//!   end_layer: 5
//!   n_layers: 12
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ringmesh_proto::Shard;

fn default_node_id() -> String {
    "unnamed-node".to_string()
}
fn default_grpc_port() -> u16 {
    50051
}
fn default_discovery_port() -> u16 {
    5678
}
fn default_broadcast_interval_ms() -> u64 {
    2500
}
fn default_peer_timeout_ms() -> u64 {
    10_000
}
fn default_reaper_interval_ms() -> u64 {
    5_000
}
fn default_topology_interval_ms() -> u64 {
    5_000
}
fn default_rpc_keepalive_ms() -> u64 {
    10_000
}
fn default_rpc_call_deadline_ms() -> u64 {
    30_000
}
fn default_max_message_bytes() -> usize {
    256 * 1024 * 1024
}
fn default_worker_pool_size() -> usize {
    32
}
fn default_topology_max_depth() -> i32 {
    2
}

/// The shard this node claims at startup; `None` means no layers are
/// owned (the node may still route and collect topology).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub model_id: String,
    pub start_layer: u32,
    pub end_layer: u32,
    pub n_layers: u32,
}

impl ShardConfig {
    pub fn into_shard(self) -> anyhow::Result<Shard> {
        Shard::new(self.model_id, self.start_layer, self.end_layer, self.n_layers)
            .map_err(anyhow::Error::from)
    }
}

/// Top-level node configuration (§6 "Configuration recognized by the core").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity broadcast in discovery; should be stable across restarts.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Inbound RPC port.
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,

    /// UDP discovery port.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,

    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,

    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    #[serde(default = "default_topology_interval_ms")]
    pub topology_interval_ms: u64,

    #[serde(default = "default_rpc_keepalive_ms")]
    pub rpc_keepalive_ms: u64,

    #[serde(default = "default_rpc_call_deadline_ms")]
    pub rpc_call_deadline_ms: u64,

    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Size of the bounded worker pool carrying out inbound RPC handlers
    /// (§5, default 32).
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// `maxDepth` passed to the background topology refresh task.
    #[serde(default = "default_topology_max_depth")]
    pub topology_max_depth: i32,

    /// The layer range this node serves, if any.
    pub shard: Option<ShardConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: default_node_id(),
            grpc_port: default_grpc_port(),
            discovery_port: default_discovery_port(),
            broadcast_interval_ms: default_broadcast_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
            topology_interval_ms: default_topology_interval_ms(),
            rpc_keepalive_ms: default_rpc_keepalive_ms(),
            rpc_call_deadline_ms: default_rpc_call_deadline_ms(),
            max_message_bytes: default_max_message_bytes(),
            worker_pool_size: default_worker_pool_size(),
            topology_max_depth: default_topology_max_depth(),
            shard: None,
        }
    }
}

impl NodeConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
    pub fn topology_interval(&self) -> Duration {
        Duration::from_millis(self.topology_interval_ms)
    }
    pub fn rpc_keepalive(&self) -> Duration {
        Duration::from_millis(self.rpc_keepalive_ms)
    }
    pub fn rpc_call_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_call_deadline_ms)
    }
}

// ── Loader ────────────────────────────────────────────────────────────────────

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    paths.push(PathBuf::from("/etc/ringmesh/node.yaml"));
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/ringmesh/node.yaml"));
    }
    paths.push(PathBuf::from(".ringmesh/node.yaml"));
    paths
}

pub fn load(extra: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading node config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit node config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let config: NodeConfig = if matches!(&merged, serde_yaml::Value::Mapping(m) if m.is_empty()) {
        NodeConfig::default()
    } else {
        serde_yaml::from_value(merged).context("deserializing merged node config")?
    };
    Ok(config)
}

fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grpc_port_matches_spec() {
        let c = NodeConfig::default();
        assert_eq!(c.grpc_port, 50051);
    }

    #[test]
    fn default_discovery_port_matches_spec() {
        let c = NodeConfig::default();
        assert_eq!(c.discovery_port, 5678);
    }

    #[test]
    fn default_max_message_bytes_is_256_mib() {
        let c = NodeConfig::default();
        assert_eq!(c.max_message_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn config_yaml_round_trip() {
        let c = NodeConfig::default();
        let yaml = serde_yaml::to_string(&c).unwrap();
        let back: NodeConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.node_id, c.node_id);
        assert_eq!(back.grpc_port, c.grpc_port);
    }

    #[test]
    fn partial_yaml_only_overrides_given_fields() {
        let yaml = "node_id: \"node-a\"\ngrpc_port: 50052\n";
        let c: NodeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.node_id, "node-a");
        assert_eq!(c.grpc_port, 50052);
        assert_eq!(c.discovery_port, default_discovery_port());
    }

    #[test]
    fn load_returns_defaults_when_no_files_exist() {
        let c = load(None).unwrap();
        assert_eq!(c.grpc_port, default_grpc_port());
    }

    #[test]
    fn shard_config_rejects_invalid_bounds() {
        let bad = ShardConfig {
            model_id: "m".to_string(),
            start_layer: 5,
            end_layer: 2,
            n_layers: 12,
        };
        assert!(bad.into_shard().is_err());
    }

    #[test]
    fn load_applies_an_explicit_config_path_on_top_of_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(&path, "node_id: \"explicit-node\"\ngrpc_port: 60000\n").unwrap();

        let c = load(Some(&path)).unwrap();
        assert_eq!(c.node_id, "explicit-node");
        assert_eq!(c.grpc_port, 60000);
        assert_eq!(c.discovery_port, default_discovery_port());
    }

    #[test]
    fn shard_config_converts_valid_bounds() {
        let good = ShardConfig {
            model_id: "m".to_string(),
            start_layer: 0,
            end_layer: 5,
            n_layers: 12,
        };
        assert!(good.into_shard().is_ok());
    }
}
