// Blockchain module
//
// This module contains the ledger implementation including:
// - Hashing, addresses and signatures
// - The P2PKH script verifier
// - Transactions, blocks and merkle commitment
// - Proof of work
// - Byte stores and the chain itself

pub mod account;
pub mod block;
pub mod chain;
pub mod crypto;
pub mod pow;
pub mod script;
pub mod storage;
pub mod transaction;
pub mod wallet;

// Re-export main components for easier access
pub use account::Account;
pub use block::Block;
pub use chain::{Blockchain, BlockchainError, LedgerConfig};
pub use crypto::{Address, Hash};
pub use pow::{ProofOfWork, SimplePow};
pub use storage::{MemStore, SledStore, Store};
pub use transaction::{Transaction, TxIn, TxOut};
pub use wallet::Wallet;
