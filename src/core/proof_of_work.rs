use crate::core::Block;
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use log::{debug, info};
use num_bigint::BigUint;

/// Default difficulty: a block hash must fall below 2^(256 - TARGET_BITS).
pub const TARGET_BITS: u32 = 24;

/// Difficulties a target can be built from: 1 ..= 255 leading zero bits.
pub const MIN_TARGET_BITS: u32 = 1;
pub const MAX_TARGET_BITS: u32 = 255;

const MAX_NONCE: i64 = i64::MAX;

pub struct ProofOfWork<'a> {
    block: &'a Block,
    target: BigUint,
    target_bits: u32,
}

impl<'a> ProofOfWork<'a> {
    pub fn new_proof_of_work(block: &'a Block) -> ProofOfWork<'a> {
        Self::with_target_bits(block, TARGET_BITS)
    }

    /// Values outside `MIN_TARGET_BITS..=MAX_TARGET_BITS` are clamped to the range.
    pub fn with_target_bits(block: &'a Block, target_bits: u32) -> ProofOfWork<'a> {
        let target_bits = target_bits.clamp(MIN_TARGET_BITS, MAX_TARGET_BITS);
        let target = BigUint::from(1u8) << (256 - target_bits);
        ProofOfWork {
            block,
            target,
            target_bits,
        }
    }

    pub fn get_target(&self) -> &BigUint {
        &self.target
    }

    // prev_hash || hash_transactions || timestamp || target_bits || nonce,
    // integers as 8-byte big endian
    fn prepare_data(&self, nonce: i64) -> Vec<u8> {
        let mut data_bytes = self.header_prefix();
        data_bytes.extend(nonce.to_be_bytes());
        data_bytes
    }

    fn header_prefix(&self) -> Vec<u8> {
        let mut data_bytes = vec![];
        data_bytes.extend(self.block.get_prev_block_hash());
        data_bytes.extend(self.block.hash_transactions());
        data_bytes.extend(self.block.get_timestamp().to_be_bytes());
        data_bytes.extend(i64::from(self.target_bits).to_be_bytes());
        data_bytes
    }

    fn meets_target(&self, hash: &[u8]) -> bool {
        BigUint::from_bytes_be(hash) < self.target
    }

    /// Search nonces upward from zero until the hash falls below target.
    ///
    /// Blocks the calling thread for as long as the search takes.
    pub fn run(&self) -> (i64, Vec<u8>) {
        let prefix = self.header_prefix();
        let mut data = Vec::with_capacity(prefix.len() + 8);
        let mut nonce = 0;
        let mut hash = Vec::new();
        debug!(
            "Mining a block with {} transactions at {} target bits",
            self.block.get_transactions().len(),
            self.target_bits
        );
        while nonce < MAX_NONCE {
            data.clear();
            data.extend_from_slice(&prefix);
            data.extend_from_slice(&nonce.to_be_bytes());
            hash = sha256_digest(data.as_slice());

            if self.meets_target(&hash) {
                info!("Found nonce {nonce}: {}", HEXLOWER.encode(&hash));
                break;
            }
            nonce += 1;
        }
        (nonce, hash)
    }

    /// Recompute the hash at the block's stored nonce and compare with the target.
    pub fn validate(&self) -> bool {
        let hash = sha256_digest(self.prepare_data(self.block.get_nonce()).as_slice());
        self.meets_target(&hash)
    }
}
