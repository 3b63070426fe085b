use crate::core::{ProofOfWork, Transaction, MAX_TARGET_BITS, MIN_TARGET_BITS, TARGET_BITS};
use crate::error::{BlockchainError, Result};
use crate::utils::{current_timestamp, deserialize, serialize, sha256_digest};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    timestamp: i64,
    transactions: Vec<Transaction>,
    prev_block_hash: Vec<u8>, // Empty only for the genesis block
    hash: Vec<u8>,
    nonce: i64,
}

impl Block {
    /// Mine a block at the default difficulty.
    pub fn new_block(transactions: &[Transaction], prev_block_hash: &[u8]) -> Result<Block> {
        Self::new_block_with_target_bits(transactions, prev_block_hash, TARGET_BITS)
    }

    pub fn new_block_with_target_bits(
        transactions: &[Transaction],
        prev_block_hash: &[u8],
        target_bits: u32,
    ) -> Result<Block> {
        if !(MIN_TARGET_BITS..=MAX_TARGET_BITS).contains(&target_bits) {
            return Err(BlockchainError::Config(format!(
                "target_bits must be in {MIN_TARGET_BITS}..={MAX_TARGET_BITS}, got {target_bits}"
            )));
        }
        let mut block = Block {
            timestamp: current_timestamp()?,
            transactions: transactions.to_vec(),
            prev_block_hash: prev_block_hash.to_vec(),
            hash: vec![],
            nonce: 0,
        };

        let (nonce, hash) = ProofOfWork::with_target_bits(&block, target_bits).run();
        block.nonce = nonce;
        block.hash = hash;
        info!(
            "Proof-of-work completed for block {} (nonce {nonce})",
            HEXLOWER.encode(&block.hash)
        );

        Ok(block)
    }

    pub fn generate_genesis_block(coinbase: &Transaction) -> Result<Block> {
        Self::generate_genesis_block_with_target_bits(coinbase, TARGET_BITS)
    }

    pub fn generate_genesis_block_with_target_bits(
        coinbase: &Transaction,
        target_bits: u32,
    ) -> Result<Block> {
        Block::new_block_with_target_bits(std::slice::from_ref(coinbase), &[], target_bits)
    }

    /// SHA-256 over the transaction ids concatenated in block order.
    ///
    /// Not a Merkle root: the flat concatenation is part of the block hash format.
    pub fn hash_transactions(&self) -> Vec<u8> {
        let mut txhashs = vec![];
        for transaction in &self.transactions {
            txhashs.extend(transaction.get_id());
        }
        sha256_digest(txhashs.as_slice())
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block_hash.is_empty()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_prev_block_hash(&self) -> &[u8] {
        self.prev_block_hash.as_slice()
    }

    pub fn get_hash(&self) -> &[u8] {
        self.hash.as_slice()
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_nonce(&self) -> i64 {
        self.nonce
    }

    #[cfg(test)]
    pub(crate) fn with_nonce(&self, nonce: i64) -> Block {
        Block {
            nonce,
            ..self.clone()
        }
    }
}
