use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use super::crypto::{hash256, Hash};
use super::transaction::Transaction;

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Timestamp when the block was created
    pub timestamp: DateTime<Utc>,

    /// Hash of the parent block, empty for the genesis block
    pub prev_hash: Hash,

    /// Number of leading zero hex characters required in the block hash
    pub difficulty: u32,

    /// Proof of work
    pub nonce: u64,

    /// Transactions, the coinbase first
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Creates an unmined block on top of `prev_hash`
    ///
    /// # Arguments
    ///
    /// * `transactions` - The transactions to include, coinbase first
    /// * `prev_hash` - The hash of the parent block
    /// * `difficulty` - The proof of work target
    pub fn new(transactions: Vec<Transaction>, prev_hash: Hash, difficulty: u32) -> Self {
        Block {
            timestamp: Utc::now(),
            prev_hash,
            difficulty,
            nonce: 0,
            transactions,
        }
    }

    /// A block without a parent
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    /// Commitment to this block's ordered transactions
    pub fn merkle_root(&self) -> Hash {
        merkle_root(&self.transactions)
    }

    /// Header preimage for a candidate nonce.
    ///
    /// Layout: `timestamp || prev_hash || difficulty || nonce || merkle_root`.
    ///
    /// # Arguments
    ///
    /// * `merkle_root` - The precomputed transaction commitment
    /// * `nonce` - The candidate nonce, in place of `self.nonce`
    pub fn header_bytes(&self, merkle_root: &Hash, nonce: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(8 + self.prev_hash.as_bytes().len() + 12 + 32);
        data.extend_from_slice(&self.timestamp.timestamp_micros().to_be_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(&self.difficulty.to_be_bytes());
        data.extend_from_slice(&nonce.to_be_bytes());
        data.extend_from_slice(merkle_root.as_bytes());
        data
    }

    /// Calculates the hash of the block with its current nonce
    pub fn calculate_hash(&self) -> Hash {
        hash256(&self.header_bytes(&self.merkle_root(), self.nonce))
    }

    /// Logs the block header
    pub fn print(&self) {
        info!("Hash: {}", self.calculate_hash());
        info!("PrevHash: {}", self.prev_hash);
        info!("Nonce: {}", self.nonce);
    }
}

/// Computes the merkle root of an ordered transaction list.
///
/// An empty list commits to `hash256("")` and a single transaction is paired
/// with itself. Otherwise adjacent hashes are paired left to right, the last
/// one duplicated on odd levels, until one remains.
pub fn merkle_root(transactions: &[Transaction]) -> Hash {
    let mut level: Vec<Hash> = transactions.iter().map(Transaction::calculate_hash).collect();

    match level.len() {
        0 => return hash256(&[]),
        1 => return hash_pair(&level[0], &level[0]),
        _ => {}
    }

    while level.len() > 1 {
        if level.len() % 2 != 0 {
            let last = level[level.len() - 1].clone();
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }

    level.remove(0)
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut data = Vec::with_capacity(left.as_bytes().len() + right.as_bytes().len());
    data.extend_from_slice(left.as_bytes());
    data.extend_from_slice(right.as_bytes());
    hash256(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::account::Account;
    use crate::blockchain::script::p2pkh;

    fn coinbases(n: usize) -> Vec<Transaction> {
        let script = p2pkh(Account::new().address());
        (0..n)
            .map(|_| Transaction::new_coinbase(script.clone(), 5))
            .collect()
    }

    #[test]
    fn test_merkle_root_of_empty_list() {
        assert_eq!(merkle_root(&[]), hash256(b""));
    }

    #[test]
    fn test_merkle_root_of_single_transaction_is_self_paired() {
        let txs = coinbases(1);
        let leaf = txs[0].calculate_hash();
        assert_eq!(merkle_root(&txs), hash_pair(&leaf, &leaf));
    }

    #[test]
    fn test_merkle_root_duplicates_last_on_odd_levels() {
        let txs = coinbases(3);
        let h: Vec<Hash> = txs.iter().map(Transaction::calculate_hash).collect();

        let expected = hash_pair(&hash_pair(&h[0], &h[1]), &hash_pair(&h[2], &h[2]));
        assert_eq!(merkle_root(&txs), expected);
    }

    #[test]
    fn test_merkle_root_of_five() {
        let txs = coinbases(5);
        let h: Vec<Hash> = txs.iter().map(Transaction::calculate_hash).collect();

        let l1 = vec![
            hash_pair(&h[0], &h[1]),
            hash_pair(&h[2], &h[3]),
            hash_pair(&h[4], &h[4]),
        ];
        let l2 = vec![hash_pair(&l1[0], &l1[1]), hash_pair(&l1[2], &l1[2])];
        assert_eq!(merkle_root(&txs), hash_pair(&l2[0], &l2[1]));
    }

    #[test]
    fn test_merkle_root_is_order_sensitive() {
        let txs = coinbases(2);
        let reversed: Vec<Transaction> = txs.iter().rev().cloned().collect();

        assert_eq!(merkle_root(&txs), merkle_root(&txs.clone()));
        assert_ne!(merkle_root(&txs), merkle_root(&reversed));
    }

    #[test]
    fn test_new_block() {
        let block = Block::new(coinbases(1), Hash::empty(), 2);

        assert!(block.is_genesis());
        assert_eq!(block.nonce, 0);
        assert_eq!(block.difficulty, 2);
        assert_eq!(block.calculate_hash().as_bytes().len(), 32);
    }

    #[test]
    fn test_hash_depends_on_nonce_and_parent() {
        let block = Block::new(coinbases(2), hash256(b"parent"), 2);
        let mut other_nonce = block.clone();
        other_nonce.nonce += 1;
        let mut other_parent = block.clone();
        other_parent.prev_hash = hash256(b"someone else");

        assert!(!block.is_genesis());
        assert_ne!(block.calculate_hash(), other_nonce.calculate_hash());
        assert_ne!(block.calculate_hash(), other_parent.calculate_hash());
    }

    #[test]
    fn test_bincode_round_trip_preserves_hash() {
        let block = Block::new(coinbases(3), hash256(b"parent"), 2);
        let bytes = bincode::serialize(&block).unwrap();
        let decoded: Block = bincode::deserialize(&bytes).unwrap();

        assert_eq!(decoded, block);
        assert_eq!(decoded.calculate_hash(), block.calculate_hash());
    }
}
