//! Configuration management
//!
//! Store location, wallet file location and mining difficulty, resolved from
//! defaults, an optional TOML file and `LEDGER_*` environment variables.

pub mod settings;

pub use settings::{Config, DEFAULT_DATA_DIR};
