use crate::error::{BlockchainError, Result};
use crate::utils::{base58_decode, base58_encode, new_key_pair, raw_public_key, sha256_digest};
use serde::{Deserialize, Serialize};

const VERSION: u8 = 0x00;
pub const ADDRESS_CHECK_SUM_LEN: usize = 4;

/// A P-256 key pair. The private half is kept as a PKCS#8 document,
/// the public half as the raw `X || Y` coordinates.
#[derive(Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Wallet {
    pkcs8: Vec<u8>,
    public_key: Vec<u8>,
}

impl Wallet {
    pub fn new() -> Result<Wallet> {
        let pkcs8 = new_key_pair()?;
        let public_key = raw_public_key(&pkcs8)?;
        Ok(Wallet { pkcs8, public_key })
    }

    pub fn get_address(&self) -> String {
        convert_address(hash_pub_key(self.public_key.as_slice()).as_slice())
    }

    pub fn get_public_key(&self) -> &[u8] {
        self.public_key.as_slice()
    }

    pub fn get_pkcs8(&self) -> &[u8] {
        self.pkcs8.as_slice()
    }
}

// Never print key material
impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.get_address())
            .finish_non_exhaustive()
    }
}

/// RIPEMD160(SHA256(pub_key))
pub fn hash_pub_key(pub_key: &[u8]) -> Vec<u8> {
    let pub_key_sha256 = sha256_digest(pub_key);
    crate::utils::ripemd160_digest(pub_key_sha256.as_slice())
}

fn checksum(payload: &[u8]) -> Vec<u8> {
    let first_sha = sha256_digest(payload);
    let second_sha = sha256_digest(first_sha.as_slice());
    second_sha[0..ADDRESS_CHECK_SUM_LEN].to_vec()
}

pub fn validate_address(address: &str) -> bool {
    address_to_pub_key_hash(address).is_ok()
}

/// Base58-decode an address and strip its version byte and checksum.
pub fn address_to_pub_key_hash(address: &str) -> Result<Vec<u8>> {
    let payload = base58_decode(address)?;
    if payload.len() < ADDRESS_CHECK_SUM_LEN + 1 {
        return Err(BlockchainError::InvalidAddress(format!(
            "Address too short: {address}"
        )));
    }

    let (versioned, actual_checksum) = payload.split_at(payload.len() - ADDRESS_CHECK_SUM_LEN);
    if checksum(versioned) != actual_checksum {
        return Err(BlockchainError::InvalidAddress(format!(
            "Checksum mismatch: {address}"
        )));
    }
    Ok(versioned[1..].to_vec())
}

/// Version byte + pub key hash + checksum, Base58 encoded.
pub fn convert_address(pub_hash_key: &[u8]) -> String {
    let mut payload: Vec<u8> = vec![VERSION];
    payload.extend(pub_hash_key);
    let checksum = checksum(payload.as_slice());
    payload.extend(checksum.as_slice());
    base58_encode(payload.as_slice())
}
