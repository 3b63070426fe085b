//! # UTXO Chain - a single-node proof-of-work ledger
//!
//! A hash-linked chain of mined blocks holding transactions that move value
//! between P-256 key holders through unspent transaction outputs.
//!
//! ## How the code is organized
//! - `core/`: blocks, proof-of-work, transactions and the persistent chain
//! - `wallet/`: key pairs, address derivation, the wallet file
//! - `config/`: where the store and wallet file live, mining difficulty
//! - `utils/`: hashing, Base58, ECDSA and the bincode layer
//! - `cli/`: command-line argument definitions
//!
//! ## Where to start
//! 1. `core/blockchain.rs` for creating, mining and scanning the chain
//! 2. `core/transaction.rs` for how transfers are built and signed
//! 3. `core/proof_of_work.rs` for the mining puzzle
//!
//! Everything runs on the calling thread; mining blocks until a nonce is found.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod utils;
pub mod wallet;

pub use cli::{Command, Opt};
pub use config::Config;
pub use core::{
    Block, Blockchain, BlockchainIterator, ProofOfWork, TXInput, TXOutput, Transaction, SUBSIDY,
    TARGET_BITS,
};
pub use error::{BlockchainError, Result};
pub use utils::{base58_decode, base58_encode, ripemd160_digest, sha256_digest};
pub use wallet::{
    address_to_pub_key_hash, convert_address, hash_pub_key, validate_address, Wallet, Wallets,
    ADDRESS_CHECK_SUM_LEN,
};
