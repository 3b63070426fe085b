//! Ledger integration tests
//!
//! Drives the public API end to end: creating and reopening a ledger,
//! transfers between wallets, balance and supply accounting.

use std::collections::HashMap;
use tempfile::{tempdir, TempDir};
use utxo_chain::core::{Block, Blockchain, ProofOfWork, Transaction, SUBSIDY};
use utxo_chain::wallet::{hash_pub_key, Wallets};
use utxo_chain::{BlockchainError, Config};

const TEST_BITS: u32 = 8;

fn test_config(dir: &TempDir) -> Config {
    Config::new(dir.path()).with_target_bits(TEST_BITS).unwrap()
}

fn pub_key_hash(wallets: &Wallets, address: &str) -> Vec<u8> {
    hash_pub_key(wallets.get_wallet(address).unwrap().get_public_key())
}

fn balance(blockchain: &Blockchain, wallets: &Wallets, address: &str) -> u64 {
    blockchain
        .get_balance(&pub_key_hash(wallets, address))
        .unwrap()
}

fn total_supply(blockchain: &Blockchain, wallets: &Wallets) -> u64 {
    wallets
        .get_addresses()
        .iter()
        .map(|address| balance(blockchain, wallets, address))
        .sum()
}

#[test]
fn test_fresh_ledger_holds_only_the_subsidy() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let mut wallets = Wallets::load(&config.wallet_file()).unwrap();
    let genesis = wallets.create_wallet().unwrap();
    let stranger = wallets.create_wallet().unwrap();

    let blockchain = Blockchain::create_blockchain(&config, &genesis).unwrap();

    let utxos = blockchain
        .find_utxo(&pub_key_hash(&wallets, &genesis))
        .unwrap();
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].get_value(), SUBSIDY);
    assert!(blockchain
        .find_utxo(&pub_key_hash(&wallets, &stranger))
        .unwrap()
        .is_empty());
    assert_eq!(blockchain.get_best_height().unwrap(), 0);
}

#[test]
fn test_create_is_idempotent() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let mut wallets = Wallets::load(&config.wallet_file()).unwrap();
    let first = wallets.create_wallet().unwrap();
    let second = wallets.create_wallet().unwrap();

    let tip = {
        let blockchain = Blockchain::create_blockchain(&config, &first).unwrap();
        blockchain.get_tip_hash().to_vec()
    };

    let blockchain = Blockchain::create_blockchain(&config, &second).unwrap();
    assert_eq!(blockchain.get_tip_hash(), tip.as_slice());
    assert_eq!(balance(&blockchain, &wallets, &first), SUBSIDY);
    assert_eq!(balance(&blockchain, &wallets, &second), 0);
}

#[test]
fn test_open_before_create_fails() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);

    assert!(matches!(
        Blockchain::open_blockchain(&config),
        Err(BlockchainError::LedgerNotFound(_))
    ));
}

#[test]
fn test_reopen_keeps_chain() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let mut wallets = Wallets::load(&config.wallet_file()).unwrap();
    let owner = wallets.create_wallet().unwrap();
    let friend = wallets.create_wallet().unwrap();

    let tip = {
        let mut blockchain = Blockchain::create_blockchain(&config, &owner).unwrap();
        let tx =
            Transaction::new_utxo_transaction(&owner, &friend, 3, &wallets, &blockchain).unwrap();
        blockchain.mine_block(&[tx]).unwrap();
        blockchain.get_tip_hash().to_vec()
    };

    let blockchain = Blockchain::open_blockchain(&config).unwrap();
    assert_eq!(blockchain.get_tip_hash(), tip.as_slice());
    assert_eq!(blockchain.get_best_height().unwrap(), 1);
    assert_eq!(balance(&blockchain, &wallets, &friend), 3);
}

#[test]
fn test_invalid_genesis_address_creates_nothing() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);

    assert!(matches!(
        Blockchain::create_blockchain(&config, "definitely-not-an-address"),
        Err(BlockchainError::InvalidAddress(_))
    ));
    assert!(matches!(
        Blockchain::open_blockchain(&config),
        Err(BlockchainError::LedgerNotFound(_))
    ));
}

#[test]
fn test_send_four_from_x_to_y() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let mut wallets = Wallets::load(&config.wallet_file()).unwrap();
    let x = wallets.create_wallet().unwrap();
    let y = wallets.create_wallet().unwrap();

    let mut blockchain = Blockchain::create_blockchain(&config, &x).unwrap();
    let tx = Transaction::new_utxo_transaction(&x, &y, 4, &wallets, &blockchain).unwrap();

    // One input (the genesis output), payment plus change
    assert!(!tx.is_coinbase());
    assert_eq!(tx.get_vin().len(), 1);
    assert_eq!(tx.get_vout().len(), 2);
    assert_eq!(tx.get_vout()[0].get_value(), 4);
    assert_eq!(tx.get_vout()[1].get_value(), 6);
    assert!(blockchain.verify_transaction(&tx).unwrap());

    blockchain.mine_block(&[tx]).unwrap();

    assert_eq!(balance(&blockchain, &wallets, &y), 4);
    assert_eq!(balance(&blockchain, &wallets, &x), 6);

    // Two blocks on chain. Height counts blocks above genesis, so it is 1.
    let blocks: Vec<Block> = blockchain.iterator().map(|b| b.unwrap()).collect();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blockchain.get_best_height().unwrap(), 1);
    for block in &blocks {
        assert!(ProofOfWork::with_target_bits(block, TEST_BITS).validate());
    }
    assert!(blockchain.validate_chain().unwrap());
}

#[test]
fn test_exact_amount_has_no_change() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let mut wallets = Wallets::load(&config.wallet_file()).unwrap();
    let x = wallets.create_wallet().unwrap();
    let y = wallets.create_wallet().unwrap();

    let mut blockchain = Blockchain::create_blockchain(&config, &x).unwrap();
    let tx = Transaction::new_utxo_transaction(&x, &y, SUBSIDY, &wallets, &blockchain).unwrap();
    assert_eq!(tx.get_vout().len(), 1);
    blockchain.mine_block(&[tx]).unwrap();

    assert_eq!(balance(&blockchain, &wallets, &x), 0);
    assert_eq!(balance(&blockchain, &wallets, &y), SUBSIDY);
}

#[test]
fn test_chained_transfers_conserve_supply() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let mut wallets = Wallets::load(&config.wallet_file()).unwrap();
    let a = wallets.create_wallet().unwrap();
    let b = wallets.create_wallet().unwrap();
    let c = wallets.create_wallet().unwrap();

    let mut blockchain = Blockchain::create_blockchain(&config, &a).unwrap();
    assert_eq!(total_supply(&blockchain, &wallets), SUBSIDY);

    for (from, to, amount) in [(&a, &b, 7), (&b, &c, 5), (&a, &c, 2), (&c, &b, 6)] {
        let tx =
            Transaction::new_utxo_transaction(from, to, amount, &wallets, &blockchain).unwrap();
        blockchain.mine_block(&[tx]).unwrap();
        assert_eq!(total_supply(&blockchain, &wallets), SUBSIDY);
    }

    assert_eq!(balance(&blockchain, &wallets, &a), 1);
    assert_eq!(balance(&blockchain, &wallets, &b), 8);
    assert_eq!(balance(&blockchain, &wallets, &c), 1);

    // A coinbase is the only thing that adds to the supply
    let reward = Transaction::new_coinbase_tx(&c, "block reward").unwrap();
    blockchain.mine_block(&[reward]).unwrap();
    assert_eq!(total_supply(&blockchain, &wallets), 2 * SUBSIDY);
    assert_eq!(balance(&blockchain, &wallets, &c), 1 + SUBSIDY);
}

#[test]
fn test_insufficient_funds() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let mut wallets = Wallets::load(&config.wallet_file()).unwrap();
    let x = wallets.create_wallet().unwrap();
    let y = wallets.create_wallet().unwrap();

    let blockchain = Blockchain::create_blockchain(&config, &x).unwrap();
    let result = Transaction::new_utxo_transaction(&x, &y, SUBSIDY + 1, &wallets, &blockchain);
    assert_eq!(
        result.unwrap_err(),
        BlockchainError::InsufficientFunds {
            required: SUBSIDY + 1,
            available: SUBSIDY,
        }
    );

    let result = Transaction::new_utxo_transaction(&y, &x, 1, &wallets, &blockchain);
    assert!(matches!(
        result,
        Err(BlockchainError::InsufficientFunds { available: 0, .. })
    ));
}

#[test]
fn test_unknown_sender_wallet() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let mut wallets = Wallets::load(&config.wallet_file()).unwrap();
    let x = wallets.create_wallet().unwrap();
    let blockchain = Blockchain::create_blockchain(&config, &x).unwrap();

    let result = Transaction::new_utxo_transaction(
        "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
        &x,
        1,
        &wallets,
        &blockchain,
    );
    assert!(matches!(result, Err(BlockchainError::NoSuchWallet(_))));
}

#[test]
fn test_spendable_outputs_greedy_selection() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let mut wallets = Wallets::load(&config.wallet_file()).unwrap();
    let x = wallets.create_wallet().unwrap();

    let mut blockchain = Blockchain::create_blockchain(&config, &x).unwrap();
    for memo in ["second reward", "third reward"] {
        let reward = Transaction::new_coinbase_tx(&x, memo).unwrap();
        blockchain.mine_block(&[reward]).unwrap();
    }
    let key = pub_key_hash(&wallets, &x);
    assert_eq!(blockchain.get_balance(&key).unwrap(), 3 * SUBSIDY);

    // Stops as soon as the amount is covered
    let (accumulated, outputs) = blockchain.find_spendable_outputs(&key, 5).unwrap();
    assert_eq!(accumulated, SUBSIDY);
    assert_eq!(outputs.values().map(Vec::len).sum::<usize>(), 1);

    let (accumulated, outputs) = blockchain.find_spendable_outputs(&key, 11).unwrap();
    assert_eq!(accumulated, 2 * SUBSIDY);
    assert_eq!(outputs.len(), 2);

    // First-seen order: the newest block's output is taken first
    let newest = blockchain.iterator().next().unwrap().unwrap();
    let newest_id = data_encoding::HEXLOWER.encode(newest.get_transactions()[0].get_id());
    let (_, outputs) = blockchain.find_spendable_outputs(&key, 1).unwrap();
    assert_eq!(outputs, HashMap::from([(newest_id, vec![0])]));

    // Asking for more than exists returns everything there is
    let (accumulated, outputs) = blockchain.find_spendable_outputs(&key, 1000).unwrap();
    assert_eq!(accumulated, 3 * SUBSIDY);
    assert_eq!(outputs.len(), 3);
}

#[test]
fn test_multi_input_transfer() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let mut wallets = Wallets::load(&config.wallet_file()).unwrap();
    let x = wallets.create_wallet().unwrap();
    let y = wallets.create_wallet().unwrap();

    let mut blockchain = Blockchain::create_blockchain(&config, &x).unwrap();
    let reward = Transaction::new_coinbase_tx(&x, "second reward").unwrap();
    blockchain.mine_block(&[reward]).unwrap();

    let tx = Transaction::new_utxo_transaction(&x, &y, 15, &wallets, &blockchain).unwrap();
    assert_eq!(tx.get_vin().len(), 2);
    blockchain.mine_block(&[tx]).unwrap();

    assert_eq!(balance(&blockchain, &wallets, &x), 5);
    assert_eq!(balance(&blockchain, &wallets, &y), 15);
    assert_eq!(
        blockchain
            .find_unspent_transactions(&pub_key_hash(&wallets, &x))
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn test_tampered_transaction_aborts_mining() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let mut wallets = Wallets::load(&config.wallet_file()).unwrap();
    let x = wallets.create_wallet().unwrap();
    let y = wallets.create_wallet().unwrap();

    let mut blockchain = Blockchain::create_blockchain(&config, &x).unwrap();
    let tx = Transaction::new_utxo_transaction(&x, &y, 4, &wallets, &blockchain).unwrap();

    // Flip one signature byte by round-tripping through the encoding
    let mut bytes = tx.serialize().unwrap();
    let signature = tx.get_vin()[0].get_signature().to_vec();
    let position = bytes
        .windows(signature.len())
        .position(|window| window == signature.as_slice())
        .unwrap();
    bytes[position] ^= 0x80;
    let tampered = Transaction::deserialize(&bytes).unwrap();
    assert!(!blockchain.verify_transaction(&tampered).unwrap());

    let tip = blockchain.get_tip_hash().to_vec();
    let reward = Transaction::new_coinbase_tx(&y, "valid neighbour").unwrap();
    assert!(matches!(
        blockchain.mine_block(&[reward, tampered]),
        Err(BlockchainError::IncorrectTransaction(_))
    ));
    assert_eq!(blockchain.get_tip_hash(), tip.as_slice());
    assert_eq!(blockchain.get_best_height().unwrap(), 0);
    assert_eq!(balance(&blockchain, &wallets, &y), 0);
}

#[test]
fn test_find_transaction() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let mut wallets = Wallets::load(&config.wallet_file()).unwrap();
    let x = wallets.create_wallet().unwrap();
    let y = wallets.create_wallet().unwrap();

    let mut blockchain = Blockchain::create_blockchain(&config, &x).unwrap();
    let tx = Transaction::new_utxo_transaction(&x, &y, 2, &wallets, &blockchain).unwrap();
    blockchain.mine_block(&[tx.clone()]).unwrap();

    assert_eq!(blockchain.find_transaction(tx.get_id()).unwrap(), tx);
    assert!(matches!(
        blockchain.find_transaction(&[0u8; 32]),
        Err(BlockchainError::TransactionNotFound(_))
    ));
}

#[test]
fn test_stored_blocks_round_trip() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let mut wallets = Wallets::load(&config.wallet_file()).unwrap();
    let x = wallets.create_wallet().unwrap();
    let y = wallets.create_wallet().unwrap();

    let mut blockchain = Blockchain::create_blockchain(&config, &x).unwrap();
    let tx = Transaction::new_utxo_transaction(&x, &y, 4, &wallets, &blockchain).unwrap();
    let mined = blockchain.mine_block(&[tx]).unwrap();

    let stored = blockchain.iterator().next().unwrap().unwrap();
    assert_eq!(stored, mined);
    assert_eq!(Block::deserialize(&mined.serialize().unwrap()).unwrap(), mined);
}
