use chrono::{SecondsFormat, Utc};
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{hash256, Hash};
use super::script::verify_ownership;

/// Output index carried by the sentinel input of a coinbase transaction
pub const COINBASE_VOUT: i64 = -1;

/// Errors that can occur during transaction operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Invalid output index {index} for transaction {txid}")]
    InvalidOutputIndex { txid: Hash, index: i64 },

    #[error("Value overflow while summing amounts")]
    ValueOverflow,
}

/// A transaction output: an amount locked by a script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub script_pub_key: String,
}

/// A transaction input: a reference to an earlier output plus its unlocking witness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    /// Id of the transaction holding the spent output
    pub txid: Hash,

    /// Index into that transaction's outputs, or `COINBASE_VOUT`
    pub vout: i64,

    /// Signature followed by the public key
    pub script_sig: Vec<u8>,
}

impl TxIn {
    /// The sentinel input of a coinbase transaction
    pub fn coinbase() -> Self {
        TxIn {
            txid: Hash::empty(),
            vout: COINBASE_VOUT,
            script_sig: Vec::new(),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.vout == COINBASE_VOUT
    }

    /// Index of the referenced output, `None` for the coinbase sentinel or a
    /// negative index
    pub fn output_index(&self) -> Option<usize> {
        usize::try_from(self.vout).ok()
    }

    /// Checks whether this input's witness satisfies the output's locking script
    pub fn can_unlock(&self, output: &TxOut) -> bool {
        verify_ownership(&self.script_sig, &output.script_pub_key)
    }
}

/// A value transfer consuming earlier outputs and creating new ones
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Hash,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
}

impl Transaction {
    /// Creates a transaction and assigns its id
    pub fn new(vin: Vec<TxIn>, vout: Vec<TxOut>) -> Self {
        let mut tx = Transaction {
            id: Hash::empty(),
            vin,
            vout,
        };
        tx.set_id();
        tx
    }

    /// Creates a coinbase transaction paying `reward` to the given locking script
    pub fn new_coinbase(script_pub_key: String, reward: u64) -> Self {
        Transaction::new(
            vec![TxIn::coinbase()],
            vec![TxOut {
                value: reward,
                script_pub_key,
            }],
        )
    }

    /// Assigns `id = hash256(content || creation time || salt)`.
    ///
    /// Ids are seeded with wall-clock time and a random salt, so two
    /// structurally identical transactions do not share an id. Use
    /// `set_id_with_nonce` for an id that depends on content alone.
    pub fn set_id(&mut self) {
        let mut data = self.content_bytes();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        data.extend_from_slice(now.as_bytes());
        data.extend_from_slice(&rand::thread_rng().gen::<u64>().to_be_bytes());
        self.id = hash256(&data);
    }

    /// Assigns `id = hash256(content || nonce)`, a pure function of its inputs
    ///
    /// # Arguments
    ///
    /// * `nonce` - Caller chosen value separating otherwise identical transactions
    pub fn set_id_with_nonce(&mut self, nonce: u64) {
        let mut data = self.content_bytes();
        data.extend_from_slice(&nonce.to_be_bytes());
        self.id = hash256(&data);
    }

    /// Hash committed to by the block's merkle root
    pub fn calculate_hash(&self) -> Hash {
        let mut data = Vec::new();
        write_bytes(&mut data, self.id.as_bytes());
        data.extend_from_slice(&self.content_bytes());
        hash256(&data)
    }

    /// Canonical encoding of the inputs and outputs
    fn content_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();

        data.extend_from_slice(&(self.vin.len() as u32).to_be_bytes());
        for input in &self.vin {
            write_bytes(&mut data, input.txid.as_bytes());
            data.extend_from_slice(&input.vout.to_be_bytes());
            write_bytes(&mut data, &input.script_sig);
        }

        data.extend_from_slice(&(self.vout.len() as u32).to_be_bytes());
        for output in &self.vout {
            data.extend_from_slice(&output.value.to_be_bytes());
            write_bytes(&mut data, output.script_pub_key.as_bytes());
        }

        data
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].is_coinbase()
    }

    /// Sum of all output values
    ///
    /// # Returns
    ///
    /// The total, or `TransactionError::ValueOverflow` if it exceeds `u64`
    pub fn total_output(&self) -> Result<u64, TransactionError> {
        self.vout.iter().try_fold(0u64, |total, output| {
            total
                .checked_add(output.value)
                .ok_or(TransactionError::ValueOverflow)
        })
    }

    /// Looks up one of this transaction's outputs
    pub fn output(&self, index: i64) -> Result<&TxOut, TransactionError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.vout.get(i))
            .ok_or_else(|| TransactionError::InvalidOutputIndex {
                txid: self.id.clone(),
                index,
            })
    }

    /// Logs the details of the transaction
    pub fn print(&self) {
        info!("Tx: {}", self.id);
        for input in &self.vin {
            info!(
                "  VIn: txid={} vout={} scriptSig={}",
                input.txid,
                input.vout,
                hex::encode(&input.script_sig)
            );
        }
        for output in &self.vout {
            info!(
                "  VOut: value={} scriptPubKey={}",
                output.value, output.script_pub_key
            );
        }
    }
}

/// Appends a length-prefixed byte string
fn write_bytes(data: &mut Vec<u8>, bytes: &[u8]) {
    data.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    data.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::account::Account;
    use crate::blockchain::script::p2pkh;

    #[test]
    fn test_coinbase_transaction() {
        let miner = Account::new();
        let tx = Transaction::new_coinbase(p2pkh(miner.address()), 5);

        assert!(tx.is_coinbase());
        assert_eq!(tx.vin.len(), 1);
        assert_eq!(tx.vin[0].vout, COINBASE_VOUT);
        assert!(tx.vin[0].txid.is_empty());
        assert!(tx.vin[0].script_sig.is_empty());
        assert_eq!(tx.vout.len(), 1);
        assert_eq!(tx.vout[0].value, 5);
        assert_eq!(tx.id.as_bytes().len(), 32);
    }

    #[test]
    fn test_identical_transactions_get_distinct_ids() {
        let script = p2pkh(Account::new().address());
        let a = Transaction::new_coinbase(script.clone(), 5);
        let b = Transaction::new_coinbase(script, 5);

        assert_eq!(a.vout, b.vout);
        assert_ne!(a.id, b.id);
        assert_ne!(a.calculate_hash(), b.calculate_hash());
    }

    #[test]
    fn test_nonce_ids_depend_only_on_content_and_nonce() {
        let script = p2pkh(Account::new().address());
        let mut a = Transaction::new_coinbase(script.clone(), 5);
        let mut b = Transaction::new_coinbase(script, 5);

        a.set_id_with_nonce(7);
        b.set_id_with_nonce(7);
        assert_eq!(a.id, b.id);

        b.set_id_with_nonce(8);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_hash_covers_contents() {
        let tx = Transaction::new_coinbase(p2pkh(Account::new().address()), 5);
        let mut changed = tx.clone();
        changed.vout[0].value = 6;

        assert_eq!(tx.calculate_hash(), tx.clone().calculate_hash());
        assert_ne!(tx.calculate_hash(), changed.calculate_hash());
    }

    #[test]
    fn test_can_unlock_delegates_to_script() {
        let owner = Account::new();
        let output = TxOut {
            value: 3,
            script_pub_key: p2pkh(owner.address()),
        };
        let input = TxIn {
            txid: hash256(b"origin"),
            vout: 0,
            script_sig: owner.script_sig(),
        };
        let foreign = TxIn {
            script_sig: Account::new().script_sig(),
            ..input.clone()
        };

        assert!(!input.is_coinbase());
        assert!(input.can_unlock(&output));
        assert!(!foreign.can_unlock(&output));
    }

    #[test]
    fn test_output_lookup() {
        let tx = Transaction::new_coinbase(p2pkh(Account::new().address()), 5);

        assert_eq!(tx.output(0).unwrap().value, 5);
        assert!(matches!(
            tx.output(1),
            Err(TransactionError::InvalidOutputIndex { index: 1, .. })
        ));
        assert!(tx.output(COINBASE_VOUT).is_err());
    }

    #[test]
    fn test_total_output_overflow() {
        let script = p2pkh(Account::new().address());
        let tx = Transaction::new(
            vec![],
            vec![
                TxOut { value: u64::MAX, script_pub_key: script.clone() },
                TxOut { value: 1, script_pub_key: script },
            ],
        );
        assert_eq!(tx.total_output(), Err(TransactionError::ValueOverflow));
    }

    #[test]
    fn test_bincode_round_trip_preserves_hash() {
        let tx = Transaction::new_coinbase(p2pkh(Account::new().address()), 5);
        let bytes = bincode::serialize(&tx).unwrap();
        let decoded: Transaction = bincode::deserialize(&bytes).unwrap();

        assert_eq!(decoded, tx);
        assert_eq!(decoded.calculate_hash(), tx.calculate_hash());
    }
}
