//! Utility functions and helpers
//!
//! Hashing, encoding, signing and the bincode layer used by blocks,
//! transactions and the wallet file.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    base58_decode, base58_encode, current_timestamp, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, new_key_pair, raw_public_key, ripemd160_digest,
    sha256_digest,
};

pub use serialization::{deserialize, serialize};
