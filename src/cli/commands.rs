use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "utxo-chain", about = "Single-node proof-of-work UTXO ledger")]
pub struct Opt {
    #[arg(long, global = true, help = "TOML file with data_dir / target_bits")]
    pub config: Option<PathBuf>,
    #[arg(
        long = "data-dir",
        global = true,
        help = "Directory holding the block store and wallet file"
    )]
    pub data_dir: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Log debug output")]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "createblockchain", about = "Create a new blockchain")]
    Createblockchain {
        #[arg(help = "The address to send genesis block reward to")]
        address: String,
        #[arg(long, default_value = "", help = "Text stored in the genesis coinbase")]
        memo: String,
    },
    #[command(name = "createwallet", about = "Create a new wallet")]
    Createwallet,
    #[command(
        name = "getbalance",
        about = "Get the wallet balance of the target address"
    )]
    GetBalance {
        #[arg(help = "The wallet address")]
        address: String,
    },
    #[command(name = "listaddresses", about = "Print local wallet addresses")]
    ListAddresses,
    #[command(name = "send", about = "Send coins and mine the transaction into a block")]
    Send {
        #[arg(help = "Source wallet address")]
        from: String,
        #[arg(help = "Destination wallet address")]
        to: String,
        #[arg(help = "Amount to send")]
        amount: u64,
    },
    #[command(name = "printchain", about = "Print all blocks in the blockchain")]
    Printchain,
}
