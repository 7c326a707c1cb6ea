use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::retry::RetryConfig;
use crate::types::MemberId;

pub const DEFAULT_ROOT_PATH: &str = "/ledgerkv";

/// Configuration of one cluster member's environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub member_id: MemberId,
    /// Every configured member, this one included. Its length is the cluster
    /// size used for new ledgers and commits publish to each member's list.
    pub members: Vec<MemberId>,
    /// Root of this cluster's coordination nodes.
    pub root_path: String,
    /// Local files root for the caller building the local engine; `Env`
    /// itself never touches the filesystem.
    pub data_dir: Option<PathBuf>,
    /// Digest key protecting ledger entries.
    pub digest_key: String,
    pub retry: RetryConfig,
    pub replay: ReplayConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Spawn the replay loop when the environment opens.
    pub enabled: bool,
    pub interval_ms: u64,
    /// Run a garbage collection sweep every this many cycles while leader.
    /// Zero disables collection.
    pub gc_every: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            gc_every: 30,
        }
    }
}

impl ReplayConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            member_id: 1,
            members: vec![1],
            root_path: DEFAULT_ROOT_PATH.to_string(),
            data_dir: None,
            digest_key: String::new(),
            retry: RetryConfig::default(),
            replay: ReplayConfig::default(),
        }
    }
}

impl EnvConfig {
    pub fn new(member_id: MemberId, members: Vec<MemberId>) -> Self {
        Self {
            member_id,
            members,
            ..Default::default()
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs_err::read_to_string(path).map_err(|e| Error::Config(e.to_string()))?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(Error::Config("members must not be empty".into()));
        }
        if !self.members.contains(&self.member_id) {
            return Err(Error::Config(format!(
                "member {} is not listed in members {:?}",
                self.member_id, self.members
            )));
        }
        if self.retry.cas_attempts == 0 {
            return Err(Error::Config("retry.cas_attempts must be at least 1".into()));
        }
        if self.replay.enabled && self.replay.interval_ms == 0 {
            return Err(Error::Config("replay.interval_ms must be positive".into()));
        }
        if !self.root_path.starts_with('/') || self.root_path.len() < 2 {
            return Err(Error::Config(format!(
                "root_path must be an absolute node path, got {:?}",
                self.root_path
            )));
        }
        Ok(())
    }

    pub fn cluster_size(&self) -> usize {
        self.members.len()
    }

    pub fn digest(&self) -> &[u8] {
        self.digest_key.as_bytes()
    }
}
