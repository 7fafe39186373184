//! Wallet configuration
//!
//! Read from `~/.thin-wallet/config.toml` unless a path is given; every
//! field has a default, so a missing file is a valid configuration.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batch::AutoExecute;
use crate::cipher::{CipherSuite, EncryptionScheme, KdfParams};
use crate::subscription::{Commitment, DEFAULT_MAX_MESSAGE_BYTES};

/// Thin wallet configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletConfig {
    /// JSON-RPC endpoint for batched queries
    #[serde(default = "default_rpc_endpoint")]
    pub rpc_endpoint: String,

    /// WebSocket endpoint for push subscriptions
    #[serde(default = "default_ws_endpoint")]
    pub ws_endpoint: String,

    /// Encrypted credential location. Defaults to `credential.json` next to
    /// the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_path: Option<PathBuf>,

    /// Periodically refresh balances while loaded
    #[serde(default = "default_true")]
    pub auto_refresh: bool,

    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    #[serde(default)]
    pub commitment: Commitment,

    /// Largest subscription message accepted, in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoExecuteMode {
    #[default]
    Manual,
    Threshold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub auto_execute: AutoExecuteMode,

    /// Pending calls that trigger a flush in threshold mode
    #[serde(default = "default_trigger_count")]
    pub trigger_count: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            auto_execute: AutoExecuteMode::default(),
            trigger_count: default_trigger_count(),
        }
    }
}

impl BatchConfig {
    pub fn policy(&self) -> AutoExecute {
        match self.auto_execute {
            AutoExecuteMode::Manual => AutoExecute::Manual,
            AutoExecuteMode::Threshold => AutoExecute::Threshold(self.trigger_count),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfKind {
    /// SHA-256 fingerprint of the password
    #[default]
    Sha256,
    Argon2id,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub kdf: KdfKind,

    #[serde(default)]
    pub cipher: CipherSuite,

    /// Argon2 memory cost in KiB
    #[serde(default = "default_argon2_memory_kib")]
    pub memory_kib: u32,

    /// Argon2 time cost
    #[serde(default = "default_argon2_iterations")]
    pub iterations: u32,

    /// Argon2 lanes
    #[serde(default = "default_argon2_parallelism")]
    pub parallelism: u32,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            kdf: KdfKind::default(),
            cipher: CipherSuite::default(),
            memory_kib: default_argon2_memory_kib(),
            iterations: default_argon2_iterations(),
            parallelism: default_argon2_parallelism(),
        }
    }
}

impl EncryptionConfig {
    /// Scheme for newly sealed records
    pub fn scheme(&self) -> EncryptionScheme {
        let kdf = match self.kdf {
            KdfKind::Sha256 => KdfParams::Sha256,
            KdfKind::Argon2id => {
                KdfParams::argon2id_with(self.memory_kib, self.iterations, self.parallelism)
            }
        };
        EncryptionScheme::new(kdf, self.cipher)
    }
}

fn default_rpc_endpoint() -> String {
    "https://api.devnet.solana.com".to_string()
}

fn default_ws_endpoint() -> String {
    "wss://api.devnet.solana.com".to_string()
}

fn default_true() -> bool {
    true
}

fn default_refresh_secs() -> u64 {
    30
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

fn default_trigger_count() -> usize {
    1
}

fn default_argon2_memory_kib() -> u32 {
    65536
}

fn default_argon2_iterations() -> u32 {
    3
}

fn default_argon2_parallelism() -> u32 {
    4
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            rpc_endpoint: default_rpc_endpoint(),
            ws_endpoint: default_ws_endpoint(),
            credential_path: None,
            batch: BatchConfig::default(),
            auto_refresh: true,
            refresh_secs: default_refresh_secs(),
            commitment: Commitment::default(),
            max_message_bytes: default_max_message_bytes(),
            encryption: EncryptionConfig::default(),
        }
    }
}

impl WalletConfig {
    /// Load config from a file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file, or defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_endpoint.is_empty() {
            return Err(anyhow!("rpc_endpoint must not be empty"));
        }
        if self.batch.auto_execute == AutoExecuteMode::Threshold && self.batch.trigger_count == 0 {
            return Err(anyhow!("batch.trigger_count must be at least 1"));
        }
        if self.refresh_secs == 0 {
            return Err(anyhow!("refresh_secs must be at least 1"));
        }
        if self.max_message_bytes == 0 {
            return Err(anyhow!("max_message_bytes must be at least 1"));
        }
        Ok(())
    }

    /// Credential path, resolved against the config file's directory
    pub fn resolve_credential_path(&self, config_path: &Path) -> PathBuf {
        match &self.credential_path {
            Some(path) => path.clone(),
            None => config_path
                .parent()
                .unwrap_or(config_path)
                .join("credential.json"),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}

/// Get the default data directory path
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".thin-wallet"))
        .ok_or_else(|| anyhow!("Could not determine home directory"))
}

/// Get the default config file path
pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_data_dir()?.join("config.toml"))
}
