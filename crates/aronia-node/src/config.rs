//! Node configuration.
//!
//! Every option has a default; a node started with `NodeConfig::default()`
//! behaves per the protocol's standard timings. Keys appear in hex form
//! here (the config file is for humans) and are decoded once at startup.

use std::collections::HashSet;
use std::path::PathBuf;

use aronia_crypto::{peer_id_from_hex, PeerId};
use aronia_trust::TrustConfig;
use aronia_wire::payload::Capabilities;
use serde::{Deserialize, Serialize};

use crate::{NodeError, Result};

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Period of outbound heartbeat frames, ms.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Maximum inbound silence before a session is torn down, ms.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Request deadline when the caller omits one, ms.
    #[serde(default = "default_request_timeout_ms")]
    pub default_request_timeout_ms: u64,
    /// Reject introductions older than this, ms.
    #[serde(default = "default_introduction_max_age_ms")]
    pub introduction_max_age_ms: u64,
    /// Maximum accepted `trustPath` length.
    #[serde(default = "default_max_trust_depth")]
    pub max_trust_depth: usize,
    /// How long an outbound write may stay parked before it fails, ms.
    #[serde(default = "default_backpressure_timeout_ms")]
    pub backpressure_timeout_ms: u64,
    /// Agent name announced in capabilities.
    #[serde(default = "default_agent")]
    pub agent: String,
    /// Agent version announced in capabilities.
    #[serde(default = "default_agent_version")]
    pub agent_version: String,
    /// Capability tokens announced in capabilities.
    #[serde(default)]
    pub accepts: Vec<String>,
    /// Hex public keys admitted at startup.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Trust-delegation policy.
    #[serde(default)]
    pub trust: TrustSection,
}

/// The `[trust]` section: introduction auto-accept policy, hex keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustSection {
    /// Introducers whose introductions are accepted automatically.
    #[serde(default)]
    pub auto_accept_from: Vec<String>,
    /// Capability tokens that always force manual review.
    #[serde(default)]
    pub require_approval_for: Vec<String>,
}

// Default value functions

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    90_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_introduction_max_age_ms() -> u64 {
    aronia_trust::DEFAULT_INTRODUCTION_MAX_AGE_MS
}

fn default_max_trust_depth() -> usize {
    aronia_trust::DEFAULT_MAX_TRUST_DEPTH
}

fn default_backpressure_timeout_ms() -> u64 {
    30_000
}

fn default_agent() -> String {
    "aronia".to_string()
}

fn default_agent_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            default_request_timeout_ms: default_request_timeout_ms(),
            introduction_max_age_ms: default_introduction_max_age_ms(),
            max_trust_depth: default_max_trust_depth(),
            backpressure_timeout_ms: default_backpressure_timeout_ms(),
            agent: default_agent(),
            agent_version: default_agent_version(),
            accepts: Vec::new(),
            whitelist: Vec::new(),
            trust: TrustSection::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from the default config file location,
    /// falling back to defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path();
        if path.exists() {
            Self::from_path(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from an explicit TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// The config file path: `$ARONIA_DATA_DIR/config.toml`, else
    /// `$HOME/.aronia/config.toml`.
    fn config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("ARONIA_DATA_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".aronia"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/aronia"))
            .join("config.toml")
    }

    /// The capabilities this node announces after each handshake.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            agent: self.agent.clone(),
            version: self.agent_version.clone(),
            accepts: self.accepts.clone(),
        }
    }

    /// Decode the configured whitelist into raw peer ids.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Config`] if any entry is not a 32-byte hex key.
    pub fn whitelist_ids(&self) -> Result<HashSet<PeerId>> {
        decode_keys(&self.whitelist)
    }

    /// Decode the trust section into the runtime policy.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Config`] if any entry is not a 32-byte hex key.
    pub fn trust_config(&self) -> Result<TrustConfig> {
        Ok(TrustConfig {
            auto_accept_from: decode_keys(&self.trust.auto_accept_from)?,
            require_approval_for: self.trust.require_approval_for.iter().cloned().collect(),
        })
    }
}

fn decode_keys(keys: &[String]) -> Result<HashSet<PeerId>> {
    keys.iter()
        .map(|k| peer_id_from_hex(k).map_err(|e| NodeError::Config(format!("key '{k}': {e}"))))
        .collect()
}
