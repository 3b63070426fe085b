// This is the ledger - an append-only chain of mined blocks kept in a Sled store
// Blocks live in the "blocks" tree keyed by their hash; key "l" holds the tip hash

use crate::config::Config;
use crate::core::{Block, ProofOfWork, TXOutput, Transaction};
use crate::error::{BlockchainError, Result};
use data_encoding::HEXLOWER;
use log::{debug, info, warn};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, IVec, Tree};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

const TIP_BLOCK_HASH_KEY: &str = "l";
const BLOCKS_TREE: &str = "blocks";

// A transaction together with the positions of its outputs that are still unspent
type UnspentEntry = (Transaction, Vec<usize>);

pub struct Blockchain {
    tip_hash: Vec<u8>, // Hash of the most recent block
    db: Db,
    blocks: Tree,
    db_path: PathBuf,
    target_bits: u32,
}

impl Blockchain {
    /// Open the store at `config.db_path()`, minting a genesis block paying
    /// `genesis_address` if the store has no chain yet. An existing chain is
    /// returned unchanged.
    pub fn create_blockchain(config: &Config, genesis_address: &str) -> Result<Blockchain> {
        Self::create_blockchain_with_memo(config, genesis_address, "")
    }

    pub fn create_blockchain_with_memo(
        config: &Config,
        genesis_address: &str,
        memo: &str,
    ) -> Result<Blockchain> {
        // Built up front so a bad address never creates an empty store
        let coinbase_tx = Transaction::new_coinbase_tx(genesis_address, memo)?;

        let mut blockchain = Self::open_store(config)?;
        match blockchain.blocks.get(TIP_BLOCK_HASH_KEY)? {
            Some(tip) => {
                info!(
                    "Ledger already exists at {}, keeping its chain",
                    blockchain.db_path.display()
                );
                blockchain.tip_hash = tip.to_vec();
            }
            None => {
                info!("Creating genesis block for address: {genesis_address}");
                let block = Block::generate_genesis_block_with_target_bits(
                    &coinbase_tx,
                    blockchain.target_bits,
                )?;
                blockchain.append_block(&block, None)?;
                blockchain.tip_hash = block.get_hash().to_vec();
            }
        }
        Ok(blockchain)
    }

    /// Open an existing ledger; fails with `LedgerNotFound` if none was created.
    pub fn open_blockchain(config: &Config) -> Result<Blockchain> {
        let db_path = config.db_path();
        if !db_path.exists() {
            return Err(BlockchainError::LedgerNotFound(
                db_path.display().to_string(),
            ));
        }

        let mut blockchain = Self::open_store(config)?;
        let tip = blockchain.blocks.get(TIP_BLOCK_HASH_KEY)?.ok_or_else(|| {
            BlockchainError::LedgerNotFound(blockchain.db_path.display().to_string())
        })?;
        blockchain.tip_hash = tip.to_vec();
        Ok(blockchain)
    }

    fn open_store(config: &Config) -> Result<Blockchain> {
        let db_path = config.db_path();
        let db = sled::open(&db_path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        let blocks = db
            .open_tree(BLOCKS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open blocks tree: {e}")))?;
        Ok(Blockchain {
            tip_hash: vec![],
            db,
            blocks,
            db_path,
            target_bits: config.get_target_bits(),
        })
    }

    // Block and tip go in together or not at all. `expected_tip` is the tip the
    // block was mined on; the write is refused if the store has moved since.
    fn append_block(&self, block: &Block, expected_tip: Option<&[u8]>) -> Result<()> {
        let block_hash = block.get_hash();
        let block_data = block.serialize()?;

        self.blocks
            .transaction(|tx_db| {
                let current_tip = tx_db.get(TIP_BLOCK_HASH_KEY)?;
                if current_tip.as_deref() != expected_tip {
                    return Err(ConflictableTransactionError::Abort(
                        BlockchainError::Database(
                            "Chain tip moved while the block was being mined".to_string(),
                        ),
                    ));
                }
                tx_db.insert(block_hash, block_data.as_slice())?;
                tx_db.insert(TIP_BLOCK_HASH_KEY, block_hash)?;
                Ok(())
            })
            .map_err(Self::from_transaction_error)?;

        self.db.flush()?;
        Ok(())
    }

    fn from_transaction_error(err: TransactionError<BlockchainError>) -> BlockchainError {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => e.into(),
        }
    }

    /// Verify `transactions` against the chain, mine them into a block on top
    /// of the current tip and append it. Nothing is written if any check fails.
    pub fn mine_block(&mut self, transactions: &[Transaction]) -> Result<Block> {
        let coinbase_count = transactions.iter().filter(|tx| tx.is_coinbase()).count();
        if coinbase_count > 1 {
            return Err(BlockchainError::IncorrectTransaction(format!(
                "A block holds at most one coinbase transaction, got {coinbase_count}"
            )));
        }
        for (i, transaction) in transactions.iter().enumerate() {
            if !self.verify_transaction(transaction)? {
                warn!(
                    "Rejecting transaction {} at index {i}",
                    HEXLOWER.encode(transaction.get_id())
                );
                return Err(BlockchainError::IncorrectTransaction(format!(
                    "Transaction {} at index {i} failed verification",
                    HEXLOWER.encode(transaction.get_id())
                )));
            }
        }
        self.check_for_double_spending(transactions)?;

        let tip_hash = self
            .blocks
            .get(TIP_BLOCK_HASH_KEY)?
            .ok_or_else(|| BlockchainError::LedgerNotFound(self.db_path.display().to_string()))?
            .to_vec();

        info!(
            "Mining block with {} transactions on top of {}",
            transactions.len(),
            HEXLOWER.encode(&tip_hash)
        );
        let block = Block::new_block_with_target_bits(transactions, &tip_hash, self.target_bits)?;
        self.append_block(&block, Some(&tip_hash))?;
        self.tip_hash = block.get_hash().to_vec();

        info!("Successfully mined block: {}", HEXLOWER.encode(block.get_hash()));
        Ok(block)
    }

    // An output may be spent once: not twice within the batch, and not again
    // if some block already spends it
    fn check_for_double_spending(&self, transactions: &[Transaction]) -> Result<()> {
        if transactions.iter().all(Transaction::is_coinbase) {
            return Ok(());
        }
        let chain_spent = self.spent_outputs()?;
        let mut batch_spent: HashSet<(Vec<u8>, i64)> = HashSet::new();

        for (tx_index, transaction) in transactions.iter().enumerate() {
            if transaction.is_coinbase() {
                continue;
            }

            for input in transaction.get_vin() {
                let output_reference = (input.get_txid().to_vec(), input.get_vout());
                if chain_spent.contains(&output_reference) || !batch_spent.insert(output_reference)
                {
                    return Err(BlockchainError::IncorrectTransaction(format!(
                        "Transaction {tx_index} spends output {}:{} which is already spent",
                        HEXLOWER.encode(input.get_txid()),
                        input.get_vout()
                    )));
                }
            }
        }
        Ok(())
    }

    fn spent_outputs(&self) -> Result<HashSet<(Vec<u8>, i64)>> {
        self.with_snapshot(|blocks| {
            let mut spent = HashSet::new();
            for block in blocks {
                for tx in block?.get_transactions() {
                    if tx.is_coinbase() {
                        continue;
                    }
                    for input in tx.get_vin() {
                        spent.insert((input.get_txid().to_vec(), input.get_vout()));
                    }
                }
            }
            Ok(spent)
        })
    }

    /// Blocks from the tip back to genesis, read lazily from the store.
    pub fn iterator(&self) -> BlockchainIterator<'_, Tree> {
        BlockchainIterator::new(&self.blocks, self.tip_hash.clone())
    }

    // Run a full chain walk inside one read transaction so it sees a single
    // consistent state of the store
    fn with_snapshot<T, F>(&self, walk: F) -> Result<T>
    where
        F: Fn(BlockchainIterator<'_, TransactionalTree>) -> Result<T>,
    {
        self.blocks
            .transaction(|view| {
                let tip = view.get(TIP_BLOCK_HASH_KEY)?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(BlockchainError::LedgerNotFound(
                        self.db_path.display().to_string(),
                    ))
                })?;
                walk(BlockchainIterator::new(view, tip.to_vec()))
                    .map_err(ConflictableTransactionError::Abort)
            })
            .map_err(Self::from_transaction_error)
    }

    fn scan_unspent(&self, pub_key_hash: &[u8]) -> Result<Vec<UnspentEntry>> {
        self.with_snapshot(|blocks| {
            // K -> txid_hex, V -> spent output indices
            let mut spent_txos: HashMap<String, Vec<i64>> = HashMap::new();
            let mut unspent: Vec<UnspentEntry> = vec![];

            for block in blocks {
                let block = block?;
                // Spends recorded in this block apply to outputs created in it as well
                for tx in block.get_transactions() {
                    if tx.is_coinbase() {
                        continue;
                    }
                    for txin in tx.get_vin() {
                        spent_txos
                            .entry(HEXLOWER.encode(txin.get_txid()))
                            .or_default()
                            .push(txin.get_vout());
                    }
                }

                for tx in block.get_transactions() {
                    let spent = spent_txos.get(&HEXLOWER.encode(tx.get_id()));
                    let outputs: Vec<usize> = tx
                        .get_vout()
                        .iter()
                        .enumerate()
                        .filter(|(idx, out)| {
                            out.is_locked_with_key(pub_key_hash)
                                && !spent.is_some_and(|outs| outs.contains(&(*idx as i64)))
                        })
                        .map(|(idx, _)| idx)
                        .collect();
                    if !outputs.is_empty() {
                        unspent.push((tx.clone(), outputs));
                    }
                }
            }
            Ok(unspent)
        })
    }

    /// Transactions holding at least one unspent output locked to `pub_key_hash`,
    /// newest first.
    pub fn find_unspent_transactions(&self, pub_key_hash: &[u8]) -> Result<Vec<Transaction>> {
        Ok(self
            .scan_unspent(pub_key_hash)?
            .into_iter()
            .map(|(tx, _)| tx)
            .collect())
    }

    /// Every unspent output locked to `pub_key_hash`.
    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        let mut utxos = vec![];
        for (tx, outputs) in self.scan_unspent(pub_key_hash)? {
            for idx in outputs {
                utxos.push(tx.get_vout()[idx].clone());
            }
        }
        Ok(utxos)
    }

    /// Sum of all unspent outputs locked to `pub_key_hash`.
    pub fn get_balance(&self, pub_key_hash: &[u8]) -> Result<u64> {
        Ok(self
            .find_utxo(pub_key_hash)?
            .iter()
            .map(TXOutput::get_value)
            .sum())
    }

    /// Greedily take unspent outputs in scan order until `amount` is covered.
    ///
    /// Returns the accumulated value and the chosen outputs as
    /// txid_hex -> output indices. The accumulated value is below `amount`
    /// only when the key does not own that much.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, HashMap<String, Vec<i64>>)> {
        let mut unspent_outputs: HashMap<String, Vec<i64>> = HashMap::new();
        let mut accumulated = 0u64;

        'scan: for (tx, outputs) in self.scan_unspent(pub_key_hash)? {
            let txid_hex = HEXLOWER.encode(tx.get_id());
            for idx in outputs {
                if accumulated >= amount {
                    break 'scan;
                }
                accumulated = accumulated.saturating_add(tx.get_vout()[idx].get_value());
                unspent_outputs
                    .entry(txid_hex.clone())
                    .or_default()
                    .push(idx as i64);
            }
        }
        debug!(
            "Selected outputs from {} transactions worth {accumulated} (wanted {amount})",
            unspent_outputs.len()
        );
        Ok((accumulated, unspent_outputs))
    }

    pub fn find_transaction(&self, txid: &[u8]) -> Result<Transaction> {
        self.with_snapshot(|blocks| {
            for block in blocks {
                let block = block?;
                if let Some(tx) = block
                    .get_transactions()
                    .iter()
                    .find(|tx| tx.get_id() == txid)
                {
                    return Ok(tx.clone());
                }
            }
            Err(BlockchainError::TransactionNotFound(HEXLOWER.encode(txid)))
        })
    }

    /// Look up every transaction `tx` spends from and sign it with `pkcs8`.
    pub fn sign_transaction(&self, tx: &mut Transaction, pkcs8: &[u8]) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let mut prev_txs = HashMap::new();
        for vin in tx.get_vin() {
            let prev_tx = self.find_transaction(vin.get_txid())?;
            prev_txs.insert(HEXLOWER.encode(prev_tx.get_id()), prev_tx);
        }
        tx.sign(pkcs8, &prev_txs)
    }

    /// Verify `tx` against the transactions it spends from. Inputs pointing at
    /// transactions that are not on chain make it invalid.
    ///
    /// A transaction with valid signatures that pays out more than it spends,
    /// or a coinbase minting more than the subsidy, is an `IncorrectTransaction`
    /// error.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        let mut prev_txs = HashMap::new();
        if !tx.is_coinbase() {
            for vin in tx.get_vin() {
                match self.find_transaction(vin.get_txid()) {
                    Ok(prev_tx) => {
                        prev_txs.insert(HEXLOWER.encode(prev_tx.get_id()), prev_tx);
                    }
                    Err(BlockchainError::TransactionNotFound(txid)) => {
                        debug!("Input references unknown transaction {txid}");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if !tx.verify(&prev_txs)? {
            return Ok(false);
        }
        tx.check_value_balance(&prev_txs)?;
        Ok(true)
    }

    /// Proof-of-work check at this ledger's difficulty.
    pub fn validate_block(&self, block: &Block) -> bool {
        ProofOfWork::with_target_bits(block, self.target_bits).validate()
    }

    /// Check every block's proof-of-work, that each block carries the hash it
    /// was reached by, and that the walk ends at a genesis block.
    pub fn validate_chain(&self) -> Result<bool> {
        let target_bits = self.target_bits;
        self.with_snapshot(|blocks| {
            let mut last_was_genesis = false;
            let mut expected_hash: Option<Vec<u8>> = None;
            for block in blocks {
                let block = block?;
                if let Some(expected) = expected_hash.as_deref() {
                    if block.get_hash() != expected {
                        warn!(
                            "Block {} is stored under {}",
                            HEXLOWER.encode(block.get_hash()),
                            HEXLOWER.encode(expected)
                        );
                        return Ok(false);
                    }
                }
                expected_hash = Some(block.get_prev_block_hash().to_vec());
                if !ProofOfWork::with_target_bits(&block, target_bits).validate() {
                    warn!(
                        "Block {} fails proof-of-work",
                        HEXLOWER.encode(block.get_hash())
                    );
                    return Ok(false);
                }
                last_was_genesis = block.is_genesis();
            }
            Ok(last_was_genesis)
        })
    }

    /// Number of blocks above genesis: a chain holding only genesis is at height 0.
    pub fn get_best_height(&self) -> Result<usize> {
        self.with_snapshot(|blocks| {
            let mut count = 0usize;
            for block in blocks {
                block?;
                count += 1;
            }
            Ok(count.saturating_sub(1))
        })
    }

    pub fn get_tip_hash(&self) -> &[u8] {
        self.tip_hash.as_slice()
    }

    pub fn get_db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub fn get_target_bits(&self) -> u32 {
        self.target_bits
    }
}

/// Read access to serialized blocks by hash.
///
/// Implemented for the plain tree (lazy iteration) and for a transactional
/// view of it (snapshot walks).
pub trait BlockSource {
    fn fetch(&self, hash: &[u8]) -> Result<Option<IVec>>;
}

impl BlockSource for Tree {
    fn fetch(&self, hash: &[u8]) -> Result<Option<IVec>> {
        Ok(self.get(hash)?)
    }
}

impl BlockSource for TransactionalTree {
    fn fetch(&self, hash: &[u8]) -> Result<Option<IVec>> {
        self.get(hash)
            .map_err(|e| BlockchainError::Database(format!("Snapshot read failed: {e}")))
    }
}

/// Walks from a starting hash back to genesis, one store read per step.
///
/// Finite and single-use: it stops after the block with an empty previous
/// hash, or after the first error.
pub struct BlockchainIterator<'a, S: BlockSource> {
    source: &'a S,
    current_hash: Vec<u8>,
}

impl<'a, S: BlockSource> BlockchainIterator<'a, S> {
    fn new(source: &'a S, tip_hash: Vec<u8>) -> BlockchainIterator<'a, S> {
        BlockchainIterator {
            source,
            current_hash: tip_hash,
        }
    }

    fn load_current(&self) -> Result<Block> {
        let data = self.source.fetch(&self.current_hash)?.ok_or_else(|| {
            BlockchainError::Database(format!(
                "Block {} is missing from the store",
                HEXLOWER.encode(&self.current_hash)
            ))
        })?;
        Block::deserialize(data.as_ref())
    }
}

impl<S: BlockSource> Iterator for BlockchainIterator<'_, S> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_hash.is_empty() {
            return None;
        }
        match self.load_current() {
            Ok(block) => {
                self.current_hash = block.get_prev_block_hash().to_vec();
                Some(Ok(block))
            }
            Err(e) => {
                self.current_hash.clear();
                Some(Err(e))
            }
        }
    }
}
