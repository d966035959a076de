use crate::error::{BlockchainError, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub static GLOBAL_CONFIG: Lazy<NodeConfig> = Lazy::new(NodeConfig::from_env);

static DEFAULT_HOST: &str = "127.0.0.1";
static DEFAULT_GENESIS_PAYLOAD: &str = "Genesis Block";

const HOST_KEY: &str = "PEERCHAIN_HOST";
const DIFFICULTY_KEY: &str = "PEERCHAIN_DIFFICULTY";
const BLOCK_INTERVAL_KEY: &str = "PEERCHAIN_BLOCK_INTERVAL_SECS";
const ADJUSTMENT_PERIOD_KEY: &str = "PEERCHAIN_ADJUSTMENT_PERIOD";
const TIMESTAMP_SKEW_KEY: &str = "PEERCHAIN_TIMESTAMP_SKEW_SECS";
const RESYNC_INTERVAL_KEY: &str = "PEERCHAIN_RESYNC_INTERVAL_SECS";
const MINING_KEY: &str = "PEERCHAIN_MINING";
const CHAIN_SELECTION_KEY: &str = "PEERCHAIN_CHAIN_SELECTION";
const MAX_PEERS_KEY: &str = "PEERCHAIN_MAX_PEERS";
const MAX_PENDING_PEERS_KEY: &str = "PEERCHAIN_MAX_PENDING_PEERS";
const HANDSHAKE_TIMEOUT_KEY: &str = "PEERCHAIN_HANDSHAKE_TIMEOUT_MS";

/// Metric used to decide whether a peer's chain replaces ours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainSelection {
    /// Sum of `2^difficulty` over all blocks
    #[default]
    CumulativeWork,
    /// Number of blocks
    Length,
}

impl FromStr for ChainSelection {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cumulative_work" | "work" => Ok(ChainSelection::CumulativeWork),
            "length" => Ok(ChainSelection::Length),
            _ => Err(BlockchainError::Config(format!(
                "Invalid chain selection: {s}. Valid options: cumulative_work, length"
            ))),
        }
    }
}

/// Tunables for one node. Every field has a default so a partial TOML file works.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Interface the listener binds to and the host advertised to peers
    pub host: String,
    /// Difficulty of the genesis block and of the first mining rounds
    pub initial_difficulty: u32,
    pub block_interval_target_secs: u64,
    pub difficulty_adjustment_period: usize,
    /// Accepted clock skew for appended blocks; 0 disables the check
    pub max_timestamp_skew_secs: u64,
    /// Period of the background SYNC_REQUEST broadcast; 0 disables it
    pub resync_interval_secs: u64,
    pub mining_enabled: bool,
    pub chain_selection: ChainSelection,
    pub max_frame_bytes: usize,
    /// Consecutive undecodable frames tolerated before a link is dropped
    pub max_protocol_errors: u32,
    pub connect_timeout_ms: u64,
    /// Registered peers beyond which dials and inbound handshakes are refused
    pub max_peers: usize,
    /// Inbound links still waiting for CONNECT; more are refused at accept time
    pub max_pending_peers: usize,
    /// How long an inbound link may stay unregistered before it is closed
    pub handshake_timeout_ms: u64,
    pub genesis_payload: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            host: String::from(DEFAULT_HOST),
            initial_difficulty: 1,
            block_interval_target_secs: 10,
            difficulty_adjustment_period: 10,
            max_timestamp_skew_secs: 60,
            resync_interval_secs: 30,
            mining_enabled: true,
            chain_selection: ChainSelection::CumulativeWork,
            max_frame_bytes: 16 * 1024 * 1024,
            max_protocol_errors: 5,
            connect_timeout_ms: 5000,
            max_peers: 32,
            max_pending_peers: 16,
            handshake_timeout_ms: 5000,
            genesis_payload: String::from(DEFAULT_GENESIS_PAYLOAD),
        }
    }
}

impl NodeConfig {
    /// Defaults overridden by any `PEERCHAIN_*` variables that parse. Malformed values are
    /// logged and ignored so a bad environment never prevents startup.
    pub fn from_env() -> NodeConfig {
        let mut config = NodeConfig::default();
        if let Err(e) = config.apply_env() {
            log::warn!("Ignoring environment overrides: {e}");
            return NodeConfig::default();
        }
        config
    }

    pub fn from_toml_str(input: &str) -> Result<NodeConfig> {
        let config: NodeConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<NodeConfig> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BlockchainError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var(HOST_KEY) {
            self.host = host;
        }
        if let Some(v) = parse_env(DIFFICULTY_KEY)? {
            self.initial_difficulty = v;
        }
        if let Some(v) = parse_env(BLOCK_INTERVAL_KEY)? {
            self.block_interval_target_secs = v;
        }
        if let Some(v) = parse_env(ADJUSTMENT_PERIOD_KEY)? {
            self.difficulty_adjustment_period = v;
        }
        if let Some(v) = parse_env(TIMESTAMP_SKEW_KEY)? {
            self.max_timestamp_skew_secs = v;
        }
        if let Some(v) = parse_env(RESYNC_INTERVAL_KEY)? {
            self.resync_interval_secs = v;
        }
        if let Some(v) = parse_env(MINING_KEY)? {
            self.mining_enabled = v;
        }
        if let Some(v) = parse_env(CHAIN_SELECTION_KEY)? {
            self.chain_selection = v;
        }
        if let Some(v) = parse_env(MAX_PEERS_KEY)? {
            self.max_peers = v;
        }
        if let Some(v) = parse_env(MAX_PENDING_PEERS_KEY)? {
            self.max_pending_peers = v;
        }
        if let Some(v) = parse_env(HANDSHAKE_TIMEOUT_KEY)? {
            self.handshake_timeout_ms = v;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.difficulty_adjustment_period == 0 {
            return Err(BlockchainError::Config(
                "difficulty_adjustment_period must be at least 1".to_string(),
            ));
        }
        if self.block_interval_target_secs == 0 {
            return Err(BlockchainError::Config(
                "block_interval_target_secs must be at least 1".to_string(),
            ));
        }
        if self.max_peers == 0 {
            return Err(BlockchainError::Config(
                "max_peers must be at least 1".to_string(),
            ));
        }
        if self.max_pending_peers == 0 {
            return Err(BlockchainError::Config(
                "max_pending_peers must be at least 1".to_string(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(BlockchainError::Config(
                "handshake_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(BlockchainError::Config(
                "max_frame_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timestamp_skew(&self) -> Option<Duration> {
        match self.max_timestamp_skew_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        match self.resync_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| BlockchainError::Config(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
