//! Error handling for the ledger
//!
//! Every fallible operation in the crate returns [`Result`], so verification,
//! lookup and storage failures all travel back to the caller the same way.

use std::fmt;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    /// Spendable outputs do not cover the requested amount
    InsufficientFunds { required: u64, available: u64 },
    /// Signature or structural verification failed
    IncorrectTransaction(String),
    /// No transaction with this (hex) id exists on chain
    TransactionNotFound(String),
    /// Address is not part of the wallet collection
    NoSuchWallet(String),
    /// The store at this path holds no chain yet
    LedgerNotFound(String),
    InvalidAddress(String),
    Database(String),
    Crypto(String),
    Serialization(String),
    Io(String),
    Config(String),
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::InsufficientFunds {
                required,
                available,
            } => {
                write!(
                    f,
                    "Insufficient funds: required {required}, available {available}"
                )
            }
            BlockchainError::IncorrectTransaction(msg) => {
                write!(f, "Incorrect transaction: {msg}")
            }
            BlockchainError::TransactionNotFound(txid) => {
                write!(f, "Transaction not found: {txid}")
            }
            BlockchainError::NoSuchWallet(addr) => write!(f, "No such wallet: {addr}"),
            BlockchainError::LedgerNotFound(path) => {
                write!(f, "No existing ledger found at {path}. Create one first.")
            }
            BlockchainError::InvalidAddress(addr) => write!(f, "Invalid address: {addr}"),
            BlockchainError::Database(msg) => write!(f, "Database error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        BlockchainError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BlockchainError {
    fn from(err: toml::de::Error) -> Self {
        BlockchainError::Config(err.to_string())
    }
}
