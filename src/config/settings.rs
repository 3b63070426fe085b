use crate::core::{MAX_TARGET_BITS, MIN_TARGET_BITS, TARGET_BITS};
use crate::error::{BlockchainError, Result};
use crate::wallet::WALLET_FILE;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_DATA_DIR: &str = "data";
const BLOCKS_DIR: &str = "blocks";

const DATA_DIR_KEY: &str = "LEDGER_DATA_DIR";
const TARGET_BITS_KEY: &str = "LEDGER_TARGET_BITS";

/// Where the ledger and the wallet file live, and how hard blocks are to mine.
///
/// Passed explicitly to [`crate::Blockchain`] and [`crate::Wallets`]
/// constructors; there is no process-wide instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    data_dir: PathBuf,
    target_bits: u32,
}

// Shape of the optional TOML file; every key may be omitted
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    target_bits: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            target_bits: TARGET_BITS,
        }
    }
}

impl Config {
    pub fn new(data_dir: impl Into<PathBuf>) -> Config {
        Config {
            data_dir: data_dir.into(),
            ..Config::default()
        }
    }

    pub fn with_target_bits(mut self, target_bits: u32) -> Result<Config> {
        if !(MIN_TARGET_BITS..=MAX_TARGET_BITS).contains(&target_bits) {
            return Err(BlockchainError::Config(format!(
                "target_bits must be in {MIN_TARGET_BITS}..={MAX_TARGET_BITS}, got {target_bits}"
            )));
        }
        self.target_bits = target_bits;
        Ok(self)
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Config {
        self.data_dir = data_dir.into();
        self
    }

    /// Defaults, then the TOML file (if any), then `LEDGER_*` environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Config> {
        let config = match config_file {
            Some(path) => Config::default().merge_file(path)?,
            None => Config::default(),
        };
        config.merge_env(
            env::var(DATA_DIR_KEY).ok(),
            env::var(TARGET_BITS_KEY).ok(),
        )
    }

    fn merge_file(self, path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path).map_err(|e| {
            BlockchainError::Config(format!("Cannot read {}: {e}", path.display()))
        })?;
        let file: ConfigFile = toml::from_str(&contents)?;

        let mut config = self;
        if let Some(data_dir) = file.data_dir {
            config = config.with_data_dir(data_dir);
        }
        if let Some(bits) = file.target_bits {
            config = config.with_target_bits(bits)?;
        }
        Ok(config)
    }

    fn merge_env(self, data_dir: Option<String>, target_bits: Option<String>) -> Result<Config> {
        let mut config = self;
        if let Some(data_dir) = data_dir {
            config = config.with_data_dir(data_dir);
        }
        if let Some(bits) = target_bits {
            let bits = bits.trim().parse::<u32>().map_err(|e| {
                BlockchainError::Config(format!("{TARGET_BITS_KEY} is not a number: {e}"))
            })?;
            config = config.with_target_bits(bits)?;
        }
        Ok(config)
    }

    pub fn get_data_dir(&self) -> &Path {
        self.data_dir.as_path()
    }

    pub fn get_target_bits(&self) -> u32 {
        self.target_bits
    }

    /// Directory of the sled block store
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(BLOCKS_DIR)
    }

    pub fn wallet_file(&self) -> PathBuf {
        self.data_dir.join(WALLET_FILE)
    }
}
