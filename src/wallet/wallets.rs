use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use crate::wallet::Wallet;
use log::{debug, info};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const WALLET_FILE: &str = "wallet.dat";

/// Address -> key pair, persisted as one file.
///
/// The whole map is read on [`Wallets::load`] and written on
/// [`Wallets::save`]; nothing is written implicitly.
pub struct Wallets {
    wallets: HashMap<String, Wallet>,
    path: PathBuf,
}

impl Wallets {
    /// Load the collection at `path`, creating an empty file when none exists.
    pub fn load(path: &Path) -> Result<Wallets> {
        let mut wallets = Wallets {
            wallets: HashMap::new(),
            path: path.to_path_buf(),
        };
        if !path.exists() {
            debug!("No wallet file at {}, creating one", path.display());
            wallets.save()?;
            return Ok(wallets);
        }

        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        wallets.wallets = deserialize(&buf[..])?;
        debug!(
            "Loaded {} wallets from {}",
            wallets.wallets.len(),
            path.display()
        );
        Ok(wallets)
    }

    /// Generate a key pair and record it under its address. Call [`Wallets::save`] to persist.
    pub fn create_wallet(&mut self) -> Result<String> {
        let wallet = Wallet::new()?;
        let address = wallet.get_address();
        self.wallets.insert(address.clone(), wallet);
        info!("Created wallet {address}");
        Ok(address)
    }

    pub fn get_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.wallets.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn get_wallet(&self, address: &str) -> Result<&Wallet> {
        self.wallets
            .get(address)
            .ok_or_else(|| BlockchainError::NoSuchWallet(address.to_string()))
    }

    pub fn get_path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        let wallets_bytes = serialize(&self.wallets)?;
        writer.write_all(wallets_bytes.as_slice())?;
        writer.flush()?;
        Ok(())
    }
}
