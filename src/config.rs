//! Configuration file for the rfio binaries.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compress::{CompressAlg, Compression, DEFAULT_LEVEL, MAX_LEVEL};
use crate::pages::{PageRequest, SkipPolicy, RECORD_HEADER_SIZE};
use crate::protocol::{BLOCK_SIZE, MAX_PAYLOAD, PAGE_READ_ATTEMPTS};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub pages: PagesConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Page transfer defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PagesConfig {
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Reads of an invalid block before giving up
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u8,
    #[serde(default)]
    pub skip_policy: SkipPolicy,
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionConfig {
    #[serde(default)]
    pub algorithm: CompressAlg,
    #[serde(default = "default_level")]
    pub level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Address `rfio-agent --listen` binds when none is given
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Agent address the client connects to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<String>,
    /// Command the client spawns to reach an agent, e.g. `ssh db01 rfio-agent`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// JSON-lines journal of page transfers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal: Option<PathBuf>,
}

fn default_block_size() -> u32 {
    BLOCK_SIZE as u32
}

fn default_read_attempts() -> u8 {
    PAGE_READ_ATTEMPTS
}

fn default_true() -> bool {
    true
}

fn default_level() -> u32 {
    DEFAULT_LEVEL
}

fn default_listen_addr() -> String {
    "0.0.0.0:9041".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PagesConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            read_attempts: default_read_attempts(),
            skip_policy: SkipPolicy::default(),
            verify_checksums: true,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressAlg::default(),
            level: default_level(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect: None,
            command: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            journal: None,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let bs = self.pages.block_size as usize;
        if bs == 0 || !bs.is_power_of_two() || bs + RECORD_HEADER_SIZE > MAX_PAYLOAD {
            anyhow::bail!(
                "block size {} must be a power of two below {} bytes",
                bs,
                MAX_PAYLOAD - RECORD_HEADER_SIZE
            );
        }
        if self.pages.read_attempts == 0 {
            anyhow::bail!("read_attempts must be at least 1");
        }
        if self.compression.level > MAX_LEVEL {
            anyhow::bail!(
                "compression level {} out of range 0..={}",
                self.compression.level,
                MAX_LEVEL
            );
        }
        self.agent
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid listen address {}: {}", self.agent.listen_addr, e))?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }
        Ok(())
    }

    pub fn compression(&self) -> Compression {
        match self.compression.algorithm {
            CompressAlg::None => Compression::none(),
            CompressAlg::Zlib => Compression::zlib(self.compression.level),
        }
    }

    /// Page request for `nblocks` blocks carrying the configured defaults.
    pub fn page_request(&self, nblocks: u32) -> PageRequest {
        PageRequest {
            nblocks,
            block_size: self.pages.block_size,
            read_attempts: self.pages.read_attempts,
            skip_policy: self.pages.skip_policy,
            verify_checksums: self.pages.verify_checksums,
            compression: self.compression(),
            ..PageRequest::new(nblocks)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        let req = config.page_request(10);
        assert_eq!(req.block_size, 8192);
        assert_eq!(req.read_attempts, 2);
        assert_eq!(req.skip_policy, SkipPolicy::ZeroOrBelowHorizon);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [pages]
            skip_policy = "below-horizon"

            [compression]
            algorithm = "zlib"
            level = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.pages.block_size, 8192);
        assert_eq!(config.pages.skip_policy, SkipPolicy::BelowHorizon);
        assert_eq!(config.compression(), Compression::zlib(3));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = Config::default();
        config.pages.block_size = 3000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.compression.level = 12;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("etc/rfio.toml");
        let mut config = Config::default();
        config.agent.command = Some("ssh db01 rfio-agent".to_string());
        config.logging.journal = Some(PathBuf::from("/var/log/rfio/pages.jsonl"));
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
        assert_eq!(Config::load_or_default(None).unwrap(), Config::default());
    }
}
