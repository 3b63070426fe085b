//! Core ledger functionality
//!
//! Blocks, proof-of-work mining, the transaction/UTXO model and the
//! persistent chain that ties them together.

pub mod block;
pub mod blockchain;
pub mod proof_of_work;
pub mod transaction;

pub use block::Block;
pub use blockchain::{BlockSource, Blockchain, BlockchainIterator};
pub use proof_of_work::{ProofOfWork, MAX_TARGET_BITS, MIN_TARGET_BITS, TARGET_BITS};
pub use transaction::{TXInput, TXOutput, Transaction, SUBSIDY};
