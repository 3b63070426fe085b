// Entry point for the ledger CLI: parse arguments, resolve configuration and
// hand each command to the core
use clap::Parser;
use data_encoding::HEXLOWER;
use log::{error, info, LevelFilter};
use std::env;
use std::process;
use utxo_chain::{
    address_to_pub_key_hash, convert_address, hash_pub_key, validate_address, Blockchain,
    Command, Config, Opt, Transaction, Wallets,
};

fn main() {
    let opt = Opt::parse();

    // VERBOSE=true behaves like --verbose; RUST_LOG still has the last word
    let verbose = opt.verbose
        || env::var("VERBOSE")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::builder()
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(e) = run(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(opt.config.as_deref())?;
    if let Some(data_dir) = opt.data_dir {
        config = config.with_data_dir(data_dir);
    }
    run_command(&config, opt.command)
}

fn run_command(config: &Config, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Createblockchain { address, memo } => {
            if !validate_address(&address) {
                return Err(format!("Invalid address: {address}").into());
            }
            let blockchain = Blockchain::create_blockchain_with_memo(config, &address, &memo)?;
            info!(
                "Ledger stored at {} ({} target bits)",
                blockchain.get_db_path().display(),
                blockchain.get_target_bits()
            );
            println!("Done! Tip: {}", HEXLOWER.encode(blockchain.get_tip_hash()));
        }
        Command::Createwallet => {
            let mut wallets = Wallets::load(&config.wallet_file())?;
            let address = wallets.create_wallet()?;
            wallets.save()?;
            info!("Wallet saved to {}", wallets.get_path().display());
            println!("Your new address: {address}")
        }
        Command::GetBalance { address } => {
            let pub_key_hash = address_to_pub_key_hash(&address)?;
            let blockchain = Blockchain::open_blockchain(config)?;
            let balance = blockchain.get_balance(&pub_key_hash)?;
            println!("Balance of {address}: {balance}");
        }
        Command::ListAddresses => {
            let wallets = Wallets::load(&config.wallet_file())?;
            for address in wallets.get_addresses() {
                println!("{address}")
            }
        }
        Command::Send { from, to, amount } => {
            if !validate_address(&from) {
                return Err(format!("Invalid sender address: {from}").into());
            }
            if !validate_address(&to) {
                return Err(format!("Invalid recipient address: {to}").into());
            }

            let wallets = Wallets::load(&config.wallet_file())?;
            let mut blockchain = Blockchain::open_blockchain(config)?;
            let transaction =
                Transaction::new_utxo_transaction(&from, &to, amount, &wallets, &blockchain)?;
            let block = blockchain.mine_block(&[transaction])?;
            println!("Success! Block {}", HEXLOWER.encode(block.get_hash()));
        }
        Command::Printchain => {
            let blockchain = Blockchain::open_blockchain(config)?;
            for block in blockchain.iterator() {
                let block = block?;
                println!("Prev. hash: {}", HEXLOWER.encode(block.get_prev_block_hash()));
                println!("Hash: {}", HEXLOWER.encode(block.get_hash()));
                println!("Timestamp: {}", block.get_timestamp());
                println!("Nonce: {}", block.get_nonce());
                println!("PoW: {}", blockchain.validate_block(&block));

                for tx in block.get_transactions() {
                    println!("- Transaction {}", HEXLOWER.encode(tx.get_id()));
                    if tx.is_coinbase() {
                        let memo = String::from_utf8_lossy(tx.get_vin()[0].get_pub_key());
                        println!("-- Coinbase: {memo}");
                    } else {
                        for input in tx.get_vin() {
                            let from = convert_address(&hash_pub_key(input.get_pub_key()));
                            println!(
                                "-- Input txid = {}, vout = {}, from = {from}",
                                HEXLOWER.encode(input.get_txid()),
                                input.get_vout(),
                            )
                        }
                    }
                    for output in tx.get_vout() {
                        let to = convert_address(output.get_pub_key_hash());
                        println!("-- Output value = {}, to = {to}", output.get_value())
                    }
                }
                println!()
            }
        }
    }
    Ok(())
}
