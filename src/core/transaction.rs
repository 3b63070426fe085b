// This file implements the transaction system - how value moves through the ledger
// Each transaction consumes earlier outputs and creates new ones (the UTXO model)

use crate::core::Blockchain;
use crate::error::{BlockchainError, Result};
use crate::utils::{
    deserialize, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, serialize,
    sha256_digest,
};
use crate::wallet::{address_to_pub_key_hash, hash_pub_key, Wallets};
use data_encoding::HEXLOWER;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Value minted by every coinbase transaction
pub const SUBSIDY: u64 = 10;

// A coinbase input points at no output
const COINBASE_VOUT: i64 = -1;

// Raw r || s and X || Y are both two 32-byte halves on P-256
const SIGNATURE_LEN: usize = 64;
const PUBLIC_KEY_LEN: usize = 64;

// A reference to an earlier output that this transaction spends
// Think of it as "I want to spend output #2 from transaction ABC123"
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXInput {
    txid: Vec<u8>,      // Id of the transaction holding the output
    vout: i64,          // Index of the output in that transaction (-1 for coinbase)
    signature: Vec<u8>, // r || s over the per-input digest
    pub_key: Vec<u8>,   // Spender's X || Y (arbitrary memo bytes for coinbase)
}

impl TXInput {
    pub fn new(txid: &[u8], vout: i64) -> TXInput {
        TXInput {
            txid: txid.to_vec(),
            vout,
            signature: vec![],
            pub_key: vec![],
        }
    }

    /// An unsigned input spending `txid:vout` on behalf of the holder of `pub_key`.
    pub fn new_with_key(txid: &[u8], vout: i64, pub_key: &[u8]) -> TXInput {
        TXInput {
            pub_key: pub_key.to_vec(),
            ..TXInput::new(txid, vout)
        }
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_vout(&self) -> i64 {
        self.vout
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_pub_key(&self) -> &[u8] {
        self.pub_key.as_slice()
    }

    /// Whether this input was created by the owner of `pub_key_hash`.
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        let locking_hash = hash_pub_key(self.pub_key.as_slice());
        locking_hash.eq(pub_key_hash)
    }
}

// "Pay this much to whoever holds the private key behind pub_key_hash"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXOutput {
    value: u64,
    pub_key_hash: Vec<u8>,
}

impl TXOutput {
    /// Create an output locked to `address`.
    pub fn new(value: u64, address: &str) -> Result<TXOutput> {
        Ok(TXOutput {
            value,
            pub_key_hash: address_to_pub_key_hash(address)?,
        })
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }
}

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    id: Vec<u8>,         // SHA-256 of the transaction with this field cleared
    vin: Vec<TXInput>,   // What I'm spending
    vout: Vec<TXOutput>, // Where the value goes
}

impl Transaction {
    /// Assemble a transaction and compute its id. Inputs are left unsigned.
    pub fn new(vin: Vec<TXInput>, vout: Vec<TXOutput>) -> Result<Transaction> {
        let mut tx = Transaction {
            id: vec![],
            vin,
            vout,
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Mint `SUBSIDY` to `to`. An empty `memo` becomes "Reward to '<to>'".
    pub fn new_coinbase_tx(to: &str, memo: &str) -> Result<Transaction> {
        let memo = if memo.is_empty() {
            format!("Reward to '{to}'")
        } else {
            memo.to_string()
        };

        let tx_input = TXInput {
            txid: vec![],
            vout: COINBASE_VOUT,
            signature: vec![],
            pub_key: memo.into_bytes(),
        };
        let mut tx = Transaction {
            id: vec![],
            vin: vec![tx_input],
            vout: vec![TXOutput::new(SUBSIDY, to)?],
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Build and sign a transfer of `amount` from `from` to `to`.
    ///
    /// Inputs are the outputs picked by [`Blockchain::find_spendable_outputs`];
    /// whatever they hold beyond `amount` goes back to `from` as change.
    pub fn new_utxo_transaction(
        from: &str,
        to: &str,
        amount: u64,
        wallets: &Wallets,
        blockchain: &Blockchain,
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(BlockchainError::IncorrectTransaction(
                "Amount must be positive".to_string(),
            ));
        }

        let wallet = wallets.get_wallet(from)?;
        let public_key_hash = hash_pub_key(wallet.get_public_key());

        let (accumulated, valid_outputs) =
            blockchain.find_spendable_outputs(public_key_hash.as_slice(), amount)?;
        if accumulated < amount {
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        let mut inputs = vec![];
        for (txid_hex, outs) in valid_outputs {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::IncorrectTransaction(format!("Invalid transaction ID: {e}"))
            })?;
            for out in outs {
                inputs.push(TXInput::new_with_key(&txid, out, wallet.get_public_key()));
            }
        }

        let mut outputs = vec![TXOutput::new(amount, to)?];
        if accumulated > amount {
            outputs.push(TXOutput::new(accumulated - amount, from)?); // Change output
        }

        let mut tx = Transaction {
            id: vec![],
            vin: inputs,
            vout: outputs,
        };
        tx.id = tx.hash()?;

        blockchain.sign_transaction(&mut tx, wallet.get_pkcs8())?;
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].txid.is_empty() && self.vin[0].vout == COINBASE_VOUT
    }

    /// Copy with every input's signature and public key cleared.
    pub fn trimmed_copy(&self) -> Transaction {
        Transaction {
            id: self.id.clone(),
            vin: self
                .vin
                .iter()
                .map(|input| TXInput::new(input.get_txid(), input.get_vout()))
                .collect(),
            vout: self.vout.clone(),
        }
    }

    // The digest input `idx` signs: the trimmed copy with that input's public key
    // slot holding the pub key hash of the output it spends. Built on a fresh
    // value so neither `self` nor the caller's copy is touched.
    fn signing_digest(
        trimmed: &Transaction,
        idx: usize,
        spent_pub_key_hash: &[u8],
    ) -> Result<Vec<u8>> {
        let mut view = trimmed.clone();
        view.vin[idx].signature = vec![];
        view.vin[idx].pub_key = spent_pub_key_hash.to_vec();
        view.hash()
    }

    /// Sign every input with `pkcs8`. Coinbase transactions are left untouched.
    ///
    /// `prev_txs` maps hex transaction ids to the transactions this one spends from.
    pub fn sign(&mut self, pkcs8: &[u8], prev_txs: &HashMap<String, Transaction>) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut spent_hashes = Vec::with_capacity(self.vin.len());
        for vin in &self.vin {
            let txid_hex = HEXLOWER.encode(vin.get_txid());
            let prev_tx = prev_txs
                .get(&txid_hex)
                .filter(|prev_tx| !prev_tx.id.is_empty())
                .ok_or_else(|| {
                    BlockchainError::IncorrectTransaction(format!(
                        "Previous transaction {txid_hex} is not available"
                    ))
                })?;
            let spent = prev_tx.output_at(vin.vout).ok_or_else(|| {
                BlockchainError::IncorrectTransaction(format!(
                    "Output {} does not exist in {txid_hex}",
                    vin.vout
                ))
            })?;
            spent_hashes.push(spent.pub_key_hash.clone());
        }

        let trimmed = self.trimmed_copy();
        for (idx, spent_hash) in spent_hashes.iter().enumerate() {
            let digest = Self::signing_digest(&trimmed, idx, spent_hash)?;
            self.vin[idx].signature = ecdsa_p256_sha256_sign_digest(pkcs8, &digest)?;
        }
        Ok(())
    }

    /// Check every input's signature against the output it spends.
    ///
    /// A missing previous transaction or a bad signature yields `Ok(false)`;
    /// only structural problems (no inputs, malformed key or signature
    /// lengths) are errors.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }
        if self.vin.is_empty() {
            return Err(BlockchainError::IncorrectTransaction(format!(
                "Transaction {} has no inputs",
                HEXLOWER.encode(&self.id)
            )));
        }

        let trimmed = self.trimmed_copy();
        for (idx, vin) in self.vin.iter().enumerate() {
            let spent = match prev_txs
                .get(&HEXLOWER.encode(vin.get_txid()))
                .and_then(|prev_tx| prev_tx.output_at(vin.vout))
            {
                Some(out) => out,
                None => {
                    debug!("Input {idx} references an unknown output");
                    return Ok(false);
                }
            };

            if vin.signature.len() != SIGNATURE_LEN || vin.pub_key.len() != PUBLIC_KEY_LEN {
                return Err(BlockchainError::IncorrectTransaction(format!(
                    "Input {idx} has a {}-byte signature and a {}-byte public key",
                    vin.signature.len(),
                    vin.pub_key.len()
                )));
            }

            let digest = Self::signing_digest(&trimmed, idx, spent.get_pub_key_hash())?;
            if !ecdsa_p256_sha256_sign_verify(&vin.pub_key, &vin.signature, &digest) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Check that value is moved, never created.
    ///
    /// A coinbase may mint at most `SUBSIDY`. Any other transaction must spend
    /// at least one output from `prev_txs` and may not pay out more than the
    /// outputs it spends hold.
    pub fn check_value_balance(&self, prev_txs: &HashMap<String, Transaction>) -> Result<()> {
        let txid_hex = HEXLOWER.encode(&self.id);
        let output_total = sum_values(self.vout.iter())?;

        if self.is_coinbase() {
            if output_total > SUBSIDY {
                return Err(BlockchainError::IncorrectTransaction(format!(
                    "Coinbase {txid_hex} mints {output_total}, the subsidy is {SUBSIDY}"
                )));
            }
            return Ok(());
        }
        if self.vin.is_empty() {
            return Err(BlockchainError::IncorrectTransaction(format!(
                "Transaction {txid_hex} has no inputs"
            )));
        }

        let mut spent = Vec::with_capacity(self.vin.len());
        for vin in &self.vin {
            let prev_hex = HEXLOWER.encode(vin.get_txid());
            let out = prev_txs
                .get(&prev_hex)
                .and_then(|prev_tx| prev_tx.output_at(vin.vout))
                .ok_or_else(|| {
                    BlockchainError::IncorrectTransaction(format!(
                        "Output {prev_hex}:{} is not available",
                        vin.vout
                    ))
                })?;
            spent.push(out);
        }
        let input_total = sum_values(spent.into_iter())?;

        if output_total > input_total {
            return Err(BlockchainError::IncorrectTransaction(format!(
                "Transaction {txid_hex} pays out {output_total} but spends only {input_total}"
            )));
        }
        Ok(())
    }

    fn output_at(&self, vout: i64) -> Option<&TXOutput> {
        usize::try_from(vout).ok().and_then(|idx| self.vout.get(idx))
    }

    /// SHA-256 over the encoding of a copy whose id is cleared.
    pub fn hash(&self) -> Result<Vec<u8>> {
        let tx_copy = Transaction {
            id: vec![],
            vin: self.vin.clone(),
            vout: self.vout.clone(),
        };
        Ok(sha256_digest(&tx_copy.serialize()?))
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }
}

fn sum_values<'a>(mut outputs: impl Iterator<Item = &'a TXOutput>) -> Result<u64> {
    outputs.try_fold(0u64, |total, out| {
        total.checked_add(out.value).ok_or_else(|| {
            BlockchainError::IncorrectTransaction("Output values overflow".to_string())
        })
    })
}
