use ring::digest::{Context, SHA256};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED, ECDSA_P256_SHA256_FIXED_SIGNING,
};
use ripemd::{Digest as RipemdDigest, Ripemd160};

use crate::error::{BlockchainError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tag byte ring puts in front of an uncompressed SEC1 point.
const UNCOMPRESSED_POINT_TAG: u8 = 0x04;

/// Seconds since the Unix epoch.
pub fn current_timestamp() -> Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| BlockchainError::Crypto(format!("System time error: {e}")))?
        .as_secs();

    i64::try_from(duration).map_err(|_| BlockchainError::Crypto("Timestamp overflow".to_string()))
}

pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut context = Context::new(&SHA256);
    context.update(data);
    let digest = context.finish();
    digest.as_ref().to_vec()
}

pub fn ripemd160_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Ripemd160::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

pub fn base58_encode(data: &[u8]) -> String {
    bs58::encode(data).into_string()
}

pub fn base58_decode(data: &str) -> Result<Vec<u8>> {
    bs58::decode(data)
        .into_vec()
        .map_err(|e| BlockchainError::InvalidAddress(format!("Invalid base58 encoding: {e}")))
}

/// Generate a fresh P-256 key pair, returned as a PKCS#8 document.
pub fn new_key_pair() -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
        .map_err(|e| BlockchainError::Crypto(format!("Failed to generate ECDSA key pair: {e}")))?
        .as_ref()
        .to_vec();
    Ok(pkcs8)
}

/// Raw `X || Y` public key (64 bytes) of a PKCS#8 private key.
pub fn raw_public_key(pkcs8: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
        .map_err(|e| {
            BlockchainError::Crypto(format!("Failed to create key pair from PKCS8: {e}"))
        })?;
    let point = key_pair.public_key().as_ref();
    match point.split_first() {
        Some((&UNCOMPRESSED_POINT_TAG, coordinates)) => Ok(coordinates.to_vec()),
        _ => Err(BlockchainError::Crypto(
            "Unexpected public key encoding".to_string(),
        )),
    }
}

/// Sign `message` and return the fixed-width `r || s` signature.
pub fn ecdsa_p256_sha256_sign_digest(pkcs8: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
        .map_err(|e| {
            BlockchainError::Crypto(format!("Failed to create key pair from PKCS8: {e}"))
        })?;
    let signature = key_pair
        .sign(&rng, message)
        .map_err(|e| BlockchainError::Crypto(format!("Failed to sign message: {e}")))?
        .as_ref()
        .to_vec();
    Ok(signature)
}

/// Verify an `r || s` signature against a raw `X || Y` public key.
pub fn ecdsa_p256_sha256_sign_verify(public_key: &[u8], signature: &[u8], message: &[u8]) -> bool {
    let mut point = Vec::with_capacity(public_key.len() + 1);
    point.push(UNCOMPRESSED_POINT_TAG);
    point.extend_from_slice(public_key);
    let peer_public_key = ring::signature::UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, point);
    peer_public_key.verify(message, signature).is_ok()
}
