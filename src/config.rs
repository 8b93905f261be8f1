//! Ledger configuration, loadable from TOML

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::blockchain::crypto::{Blake3Provider, HashProvider, Sha256Provider};
use crate::blockchain::difficulty::DifficultyController;
use crate::blockchain::mining::MAX_DIFFICULTY;

/// Errors that can occur while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Digest backend used for block hashing and signing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    pub fn provider(self) -> Arc<dyn HashProvider> {
        match self {
            HashAlgorithm::Sha256 => Arc::new(Sha256Provider),
            HashAlgorithm::Blake3 => Arc::new(Blake3Provider),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Amount minted to the miner with every block
    pub mining_reward: i64,

    /// Difficulty of the first mined block
    pub initial_difficulty: u32,

    pub hash_algorithm: HashAlgorithm,

    pub difficulty: DifficultyConfig,

    pub mining: MiningConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DifficultyConfig {
    /// Run the difficulty controller after every mined block
    pub auto_adjust: bool,

    pub target_block_time_ms: u64,

    pub min: u32,

    pub max: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    /// Parallel nonce partitions; 1 mines on the calling thread
    pub workers: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            mining_reward: 100,
            initial_difficulty: 2,
            hash_algorithm: HashAlgorithm::default(),
            difficulty: DifficultyConfig::default(),
            mining: MiningConfig::default(),
        }
    }
}

impl Default for DifficultyConfig {
    fn default() -> Self {
        Self {
            auto_adjust: true,
            target_block_time_ms: 15_000,
            min: 1,
            max: MAX_DIFFICULTY,
        }
    }
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

impl DifficultyConfig {
    pub fn target_block_time(&self) -> Duration {
        Duration::from_millis(self.target_block_time_ms)
    }

    /// The controller to run after each block, if adjustment is enabled
    pub fn controller(&self) -> Option<DifficultyController> {
        self.auto_adjust
            .then(|| DifficultyController::new(self.target_block_time(), self.min, self.max))
    }
}

impl LedgerConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: LedgerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mining_reward <= 0 {
            return Err(ConfigError::Invalid(format!(
                "mining_reward must be positive, got {}",
                self.mining_reward
            )));
        }

        let difficulty = &self.difficulty;
        if difficulty.min < 1 {
            return Err(ConfigError::Invalid(
                "difficulty.min must be at least 1".to_string(),
            ));
        }
        if difficulty.max > MAX_DIFFICULTY || difficulty.min > difficulty.max {
            return Err(ConfigError::Invalid(format!(
                "difficulty bounds [{}, {}] must lie within [1, {}]",
                difficulty.min, difficulty.max, MAX_DIFFICULTY
            )));
        }
        if self.initial_difficulty < difficulty.min || self.initial_difficulty > difficulty.max {
            return Err(ConfigError::Invalid(format!(
                "initial_difficulty {} is outside [{}, {}]",
                self.initial_difficulty, difficulty.min, difficulty.max
            )));
        }
        if difficulty.target_block_time_ms == 0 {
            return Err(ConfigError::Invalid(
                "difficulty.target_block_time_ms must be positive".to_string(),
            ));
        }

        if self.mining.workers == 0 {
            return Err(ConfigError::Invalid(
                "mining.workers must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = LedgerConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.mining_reward, 100);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(
            config.difficulty.target_block_time(),
            Duration::from_secs(15)
        );
        assert!(config.difficulty.controller().is_some());
    }

    #[test]
    fn test_parse_full_config() {
        let config = LedgerConfig::from_toml_str(
            r#"
            mining_reward = 50
            initial_difficulty = 3
            hash_algorithm = "blake3"

            [difficulty]
            auto_adjust = false
            target_block_time_ms = 2000
            min = 2
            max = 8

            [mining]
            workers = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.mining_reward, 50);
        assert_eq!(config.initial_difficulty, 3);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Blake3);
        assert_eq!(config.hash_algorithm.provider().name(), "blake3");
        assert!(config.difficulty.controller().is_none());
        assert_eq!(config.difficulty.min, 2);
        assert_eq!(config.mining.workers, 4);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = LedgerConfig::from_toml_str("mining_reward = 25").unwrap();

        assert_eq!(config.mining_reward, 25);
        assert_eq!(config.initial_difficulty, 2);
        assert!(config.difficulty.auto_adjust);
        assert_eq!(config.mining.workers, 1);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for contents in [
            "mining_reward = 0",
            "initial_difficulty = 0",
            "initial_difficulty = 65",
            "[difficulty]\nmin = 0",
            "[difficulty]\nmax = 65",
            "[difficulty]\ntarget_block_time_ms = 0",
            "[mining]\nworkers = 0",
        ] {
            assert!(
                matches!(
                    LedgerConfig::from_toml_str(contents),
                    Err(ConfigError::Invalid(_))
                ),
                "expected rejection of {:?}",
                contents
            );
        }
    }

    #[test]
    fn test_unknown_algorithm_is_a_parse_error() {
        assert!(matches!(
            LedgerConfig::from_toml_str(r#"hash_algorithm = "md5""#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mining_reward = 75").unwrap();

        let config = LedgerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.mining_reward, 75);

        assert!(matches!(
            LedgerConfig::from_file("/nonexistent/ledger.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
