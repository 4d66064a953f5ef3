//! A minimal proof-of-work ledger over unspent transaction outputs.

pub mod blockchain;
