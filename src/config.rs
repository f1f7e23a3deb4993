//! Store configuration: filesystem locations and resource limits.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Symlinks maintained for the TLS stack, pointing at the selected V2G leaf.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct LinkPaths {
    #[serde(default)]
    pub secc_leaf_cert_link: PathBuf,
    #[serde(default)]
    pub secc_leaf_key_link: PathBuf,
    #[serde(default)]
    pub cpo_cert_chain_link: PathBuf,
}

/// Directories holding leaf certificates and their private keys.
#[derive(Debug, Deserialize, Clone)]
pub struct DirectoryPaths {
    /// CSMS (OCPP) leaf certificates live here.
    pub csms_leaf_cert_directory: PathBuf,
    pub csms_leaf_key_directory: PathBuf,
    /// SECC (ISO 15118) leaf certificates live here.
    pub secc_leaf_cert_directory: PathBuf,
    pub secc_leaf_key_directory: PathBuf,
}

/// Trust anchor bundles plus the leaf directories and symlink targets.
#[derive(Debug, Deserialize, Clone)]
pub struct FilePaths {
    pub csms_ca_bundle: PathBuf,
    pub mf_ca_bundle: PathBuf,
    pub mo_ca_bundle: PathBuf,
    pub v2g_ca_bundle: PathBuf,

    pub directories: DirectoryPaths,
    #[serde(default)]
    pub links: LinkPaths,
}

/// Resource limits and timers, all optional with safe defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct SecurityLimits {
    #[serde(default = "default_max_fs_usage_bytes")]
    pub max_fs_usage_bytes: u64,
    #[serde(default = "default_max_fs_certificate_store_entries")]
    pub max_fs_certificate_store_entries: u64,
    #[serde(default = "default_csr_expiry_seconds")]
    pub csr_expiry_seconds: u64,
    #[serde(default = "default_garbage_collect_time_seconds")]
    pub garbage_collect_time_seconds: u64,
}

impl Default for SecurityLimits {
    fn default() -> Self {
        Self {
            max_fs_usage_bytes: default_max_fs_usage_bytes(),
            max_fs_certificate_store_entries: default_max_fs_certificate_store_entries(),
            csr_expiry_seconds: default_csr_expiry_seconds(),
            garbage_collect_time_seconds: default_garbage_collect_time_seconds(),
        }
    }
}

impl SecurityLimits {
    pub fn csr_expiry(&self) -> Duration {
        Duration::from_secs(self.csr_expiry_seconds)
    }

    pub fn garbage_collect_time(&self) -> Duration {
        Duration::from_secs(self.garbage_collect_time_seconds)
    }
}

/// A minimum number of newest certificate entries is always kept per leaf
/// directory, as a safeguard against a poorly set system clock.
pub const DEFAULT_MINIMUM_CERTIFICATE_ENTRIES: usize = 10;

fn default_max_fs_usage_bytes() -> u64 {
    // 50 MB
    1024 * 1024 * 50
}

fn default_max_fs_certificate_store_entries() -> u64 {
    2000
}

fn default_csr_expiry_seconds() -> u64 {
    // CSRs that did not receive a signed response within an hour are reaped
    3600
}

fn default_garbage_collect_time_seconds() -> u64 {
    20 * 60
}

/// Top-level configuration, loadable from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub paths: FilePaths,
    #[serde(default)]
    pub limits: SecurityLimits,
    /// Password used to decrypt encrypted private keys.
    #[serde(default)]
    pub private_key_password: Option<String>,
}

impl StoreConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let config_str =
            std::fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        let config: StoreConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration with default path (certstore.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("certstore.toml")
    }
}
