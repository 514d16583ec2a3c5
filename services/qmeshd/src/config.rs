//! Daemon configuration: TOML file plus CLI overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use qmesh_chat::{ChannelSyncPolicy, ChatConfig, NodeMode, RetentionConfig, SyncConfig};
use qmesh_codec::NodeId;
use qmesh_link::{ArdopLinkConfig, TcpClientConfig, TcpServerConfig};
use qmesh_mesh::MeshConfig;
use serde::{Deserialize, Serialize};

/// Whole daemon configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub mesh: MeshSection,
    #[serde(default)]
    pub ardop: Option<ArdopSection>,
    #[serde(default)]
    pub tcp_mesh: Option<TcpMeshSection>,
    pub chat: ChatSection,
    #[serde(default)]
    pub security: SecuritySection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeshSection {
    pub callsign: String,
    #[serde(default = "default_ogm_interval")]
    pub ogm_interval_s: f64,
    #[serde(default = "default_initial_ttl")]
    pub initial_ttl: u8,
    #[serde(default = "default_neighbor_timeout")]
    pub neighbor_timeout_s: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_s: u64,
    #[serde(default = "default_link_cost")]
    pub link_cost: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArdopSection {
    #[serde(default = "default_ardop_host")]
    pub host: String,
    #[serde(default = "default_ardop_port")]
    pub port: u16,
    #[serde(default = "default_backoff_base")]
    pub reconnect_backoff_base_s: f64,
    #[serde(default = "default_backoff_max")]
    pub reconnect_backoff_max_s: f64,
    #[serde(default = "default_tx_queue")]
    pub tx_queue_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpMeshSection {
    /// Port to accept mesh peers on, if this node listens
    #[serde(default)]
    pub listen: Option<u16>,
    /// Shared link password for both directions
    #[serde(default)]
    pub password: String,
    /// Outbound peer connections
    #[serde(default)]
    pub peers: Vec<TcpPeerSection>,
    #[serde(default = "default_backoff_base")]
    pub reconnect_backoff_base_s: f64,
    #[serde(default = "default_backoff_max")]
    pub reconnect_backoff_max_s: f64,
    #[serde(default = "default_tx_queue")]
    pub tx_queue_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpPeerSection {
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatSection {
    pub db_path: PathBuf,
    #[serde(default = "default_node_mode")]
    pub node_mode: NodeMode,
    /// Display nickname; the callsign when absent
    #[serde(default)]
    pub nick: Option<String>,
    /// Peer that receives channel (non-DM) traffic
    #[serde(default)]
    pub default_peer: Option<String>,
    /// Known peers by nickname
    #[serde(default)]
    pub peers: HashMap<String, PeerEntry>,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub retention: RetentionSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerEntry {
    pub node_id_hex: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncSection {
    #[serde(default = "default_inventory_last_n")]
    pub inventory_last_n: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_s: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_confirm_margin")]
    pub confirm_margin: u32,
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_s: u64,
    #[serde(default = "default_responder_interval")]
    pub responder_min_interval_s: u64,
    #[serde(default = "default_rows_per_response")]
    pub max_rows_per_response: usize,
    #[serde(default)]
    pub per_channel: HashMap<String, ChannelSyncPolicy>,
}

impl Default for SyncSection {
    fn default() -> Self {
        toml::from_str("").expect("empty sync section must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_retention_days")]
    pub days: u32,
}

impl Default for RetentionSection {
    fn default() -> Self {
        RetentionSection {
            enabled: false,
            days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecuritySection {
    /// Payload encryption stays off unless this is set explicitly
    #[serde(default)]
    pub enable_encryption: bool,
    /// 32-byte key, hex encoded
    #[serde(default)]
    pub key_hex: Option<String>,
}

impl DaemonConfig {
    /// Read and parse the config file.
    pub fn load(path: &Path) -> Result<DaemonConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&raw)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Check invariants that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.mesh.callsign.trim().is_empty() {
            bail!("mesh.callsign must not be empty");
        }
        if self.mesh.initial_ttl == 0 {
            bail!("mesh.initial_ttl must be at least 1");
        }
        if self.ardop.is_none() && self.tcp_mesh.is_none() {
            bail!("no links configured: set up [ardop] and/or [tcp_mesh]");
        }
        if let Some(tcp) = &self.tcp_mesh {
            if (tcp.listen.is_some() || !tcp.peers.is_empty()) && tcp.password.is_empty() {
                bail!("tcp_mesh.password is required when tcp_mesh is in use");
            }
        }
        if self.chat.sync.inventory_last_n == 0 {
            bail!("chat.sync.inventory_last_n must be at least 1");
        }
        if self.chat.sync.max_rows_per_response == 0 {
            bail!("chat.sync.max_rows_per_response must be at least 1");
        }
        if let Some(default_peer) = &self.chat.default_peer {
            if !self.chat.peers.contains_key(default_peer) {
                bail!("chat.default_peer {:?} is not in chat.peers", default_peer);
            }
        }
        for (nick, peer) in &self.chat.peers {
            NodeId::from_hex(&peer.node_id_hex)
                .with_context(|| format!("chat.peers.{}: bad node_id_hex", nick))?;
        }
        if self.security.enable_encryption {
            let key_hex = self
                .security
                .key_hex
                .as_deref()
                .context("security.enable_encryption requires security.key_hex")?;
            let key = hex::decode(key_hex).context("security.key_hex is not valid hex")?;
            if key.len() != 32 {
                bail!("security.key_hex must decode to 32 bytes, got {}", key.len());
            }
        }
        Ok(())
    }

    /// Decoded encryption key, when encryption is enabled.
    pub fn encryption_key(&self) -> Option<Vec<u8>> {
        if !self.security.enable_encryption {
            return None;
        }
        self.security
            .key_hex
            .as_deref()
            .and_then(|k| hex::decode(k).ok())
    }

    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            ogm_interval_s: self.mesh.ogm_interval_s,
            initial_ttl: self.mesh.initial_ttl,
            neighbor_timeout_s: self.mesh.neighbor_timeout_s,
            dedup_capacity: self.mesh.dedup_capacity,
            dedup_ttl_s: self.mesh.dedup_ttl_s,
            link_cost: self.mesh.link_cost,
            ..MeshConfig::default()
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        let sync = &self.chat.sync;
        SyncConfig {
            inventory_last_n: sync.inventory_last_n,
            request_timeout_s: sync.request_timeout_s,
            max_retries: sync.max_retries,
            confirm_margin: sync.confirm_margin,
            confirm_timeout_s: sync.confirm_timeout_s,
            responder_min_interval_s: sync.responder_min_interval_s,
            max_rows_per_response: sync.max_rows_per_response,
            per_channel: sync.per_channel.clone(),
            ..SyncConfig::default()
        }
    }

    pub fn chat_config(&self) -> Result<ChatConfig> {
        let mut peers = HashMap::new();
        for (nick, peer) in &self.chat.peers {
            peers.insert(nick.clone(), NodeId::from_hex(&peer.node_id_hex)?);
        }
        Ok(ChatConfig {
            nick: self
                .chat
                .nick
                .clone()
                .unwrap_or_else(|| self.mesh.callsign.clone()),
            mode: self.chat.node_mode,
            peers,
            default_peer: self.chat.default_peer.clone(),
            retention: RetentionConfig {
                enabled: self.chat.retention.enabled,
                days: self.chat.retention.days,
            },
        })
    }

    pub fn ardop_link_config(&self) -> Option<ArdopLinkConfig> {
        self.ardop.as_ref().map(|a| ArdopLinkConfig {
            host: a.host.clone(),
            port: a.port,
            reconnect_backoff_base_s: a.reconnect_backoff_base_s,
            reconnect_backoff_max_s: a.reconnect_backoff_max_s,
            tx_queue_size: a.tx_queue_size,
        })
    }

    pub fn tcp_server_config(&self) -> Option<TcpServerConfig> {
        let tcp = self.tcp_mesh.as_ref()?;
        let port = tcp.listen?;
        Some(TcpServerConfig {
            port,
            password: tcp.password.clone(),
            tx_queue_size: tcp.tx_queue_size,
        })
    }

    pub fn tcp_client_configs(&self) -> Vec<(String, TcpClientConfig)> {
        let Some(tcp) = self.tcp_mesh.as_ref() else {
            return Vec::new();
        };
        tcp.peers
            .iter()
            .enumerate()
            .map(|(idx, peer)| {
                let name = peer
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("tcp-{}", idx));
                let config = TcpClientConfig {
                    host: peer.host.clone(),
                    port: peer.port,
                    password: tcp.password.clone(),
                    reconnect_backoff_base_s: tcp.reconnect_backoff_base_s,
                    reconnect_backoff_max_s: tcp.reconnect_backoff_max_s,
                    tx_queue_size: tcp.tx_queue_size,
                };
                (name, config)
            })
            .collect()
    }

    /// Node id of the configured default peer, if any.
    pub fn default_peer_node_id(&self) -> Option<NodeId> {
        let nick = self.chat.default_peer.as_ref()?;
        let peer = self.chat.peers.get(nick)?;
        NodeId::from_hex(&peer.node_id_hex).ok()
    }
}

fn default_ogm_interval() -> f64 {
    600.0
}
fn default_initial_ttl() -> u8 {
    5
}
fn default_neighbor_timeout() -> u64 {
    60
}
fn default_dedup_capacity() -> usize {
    4096
}
fn default_dedup_ttl() -> u64 {
    300
}
fn default_link_cost() -> u8 {
    1
}
fn default_ardop_host() -> String {
    "127.0.0.1".to_string()
}
fn default_ardop_port() -> u16 {
    8515
}
fn default_backoff_base() -> f64 {
    5.0
}
fn default_backoff_max() -> f64 {
    60.0
}
fn default_tx_queue() -> usize {
    1000
}
fn default_node_mode() -> NodeMode {
    NodeMode::Full
}
fn default_inventory_last_n() -> usize {
    200
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    4
}
fn default_confirm_margin() -> u32 {
    3
}
fn default_confirm_timeout() -> u64 {
    120
}
fn default_responder_interval() -> u64 {
    30
}
fn default_rows_per_response() -> usize {
    50
}
fn default_retention_days() -> u32 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmesh_chat::SyncPolicyMode;

    const MINIMAL: &str = r#"
        [mesh]
        callsign = "NOCALL-1"

        [ardop]

        [chat]
        db_path = "chat.db"
    "#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: DaemonConfig = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.mesh.ogm_interval_s, 600.0);
        assert_eq!(config.mesh.initial_ttl, 5);
        assert_eq!(config.mesh.dedup_capacity, 4096);
        assert_eq!(config.chat.node_mode, NodeMode::Full);
        assert_eq!(config.chat.sync.inventory_last_n, 200);
        assert!(!config.chat.retention.enabled);
        assert!(!config.security.enable_encryption);

        let ardop = config.ardop_link_config().unwrap();
        assert_eq!(ardop.host, "127.0.0.1");
        assert_eq!(ardop.port, 8515);
    }

    #[test]
    fn test_full_config_parses() {
        let raw = r##"
            [mesh]
            callsign = "kd9yqk-1"
            ogm_interval_s = 120.0
            initial_ttl = 8

            [tcp_mesh]
            listen = 9000
            password = "sekrit"
            peers = [
                { name = "hub", host = "10.0.0.1", port = 9000 },
                { host = "10.0.0.2", port = 9001 },
            ]

            [chat]
            db_path = "/var/lib/qmesh/chat.db"
            node_mode = "relay"
            default_peer = "hub"

            [chat.peers.hub]
            node_id_hex = "4b44395951482d31"

            [chat.sync]
            inventory_last_n = 50
            max_retries = 2

            [chat.sync.per_channel."#general"]
            mode = "eager"
            max_burst = 25

            [chat.sync.per_channel."#bulk"]
            mode = "deferred"
            max_burst = 10

            [chat.retention]
            enabled = true
            days = 14
        "##;
        let config: DaemonConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.chat.node_mode, NodeMode::Relay);
        let clients = config.tcp_client_configs();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].0, "hub");
        assert_eq!(clients[1].0, "tcp-1");
        assert_eq!(config.tcp_server_config().unwrap().port, 9000);

        let sync = config.sync_config();
        assert_eq!(sync.inventory_last_n, 50);
        assert_eq!(sync.max_retries, 2);
        assert_eq!(
            sync.per_channel.get("#bulk").unwrap().mode,
            SyncPolicyMode::Deferred
        );

        let chat = config.chat_config().unwrap();
        assert_eq!(chat.nick, "kd9yqk-1");
        assert!(chat.peers.contains_key("hub"));
        assert!(config.default_peer_node_id().is_some());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qmesh.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.mesh.callsign, "NOCALL-1");

        assert!(DaemonConfig::load(&dir.path().join("missing.toml")).is_err());
        std::fs::write(&path, "not = [ toml").unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let no_links: DaemonConfig = toml::from_str(
            r#"
            [mesh]
            callsign = "NOCALL-1"
            [chat]
            db_path = "chat.db"
        "#,
        )
        .unwrap();
        assert!(no_links.validate().is_err());

        let missing_pw: DaemonConfig = toml::from_str(
            r#"
            [mesh]
            callsign = "NOCALL-1"
            [tcp_mesh]
            listen = 9000
            [chat]
            db_path = "chat.db"
        "#,
        )
        .unwrap();
        assert!(missing_pw.validate().is_err());

        let bad_default_peer: DaemonConfig = toml::from_str(
            r#"
            [mesh]
            callsign = "NOCALL-1"
            [ardop]
            [chat]
            db_path = "chat.db"
            default_peer = "nobody"
        "#,
        )
        .unwrap();
        assert!(bad_default_peer.validate().is_err());
    }

    #[test]
    fn test_encryption_requires_full_key() {
        let short_key: DaemonConfig = toml::from_str(
            r#"
            [mesh]
            callsign = "NOCALL-1"
            [ardop]
            [chat]
            db_path = "chat.db"
            [security]
            enable_encryption = true
            key_hex = "deadbeef"
        "#,
        )
        .unwrap();
        assert!(short_key.validate().is_err());

        let good: DaemonConfig = toml::from_str(&format!(
            r#"
            [mesh]
            callsign = "NOCALL-1"
            [ardop]
            [chat]
            db_path = "chat.db"
            [security]
            enable_encryption = true
            key_hex = "{}"
        "#,
            "ab".repeat(32)
        ))
        .unwrap();
        good.validate().unwrap();
        assert_eq!(good.encryption_key().unwrap().len(), 32);
    }
}
