// Binary encoding shared by the block store, transaction ids and the wallet file
use crate::error::{BlockchainError, Result};
use serde::{Deserialize, Serialize};

fn config() -> bincode::config::Configuration {
    bincode::config::standard()
}

pub fn serialize<T: Serialize + bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    bincode::encode_to_vec(data, config())
        .map_err(|e| BlockchainError::Serialization(format!("Serialization failed: {e}")))
}

/// Decode a value, rejecting input with trailing bytes.
pub fn deserialize<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    let (data, read) = bincode::decode_from_slice(bytes, config())
        .map_err(|e| BlockchainError::Serialization(format!("Deserialization failed: {e}")))?;
    if read != bytes.len() {
        return Err(BlockchainError::Serialization(format!(
            "Deserialization left {} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(data)
}
