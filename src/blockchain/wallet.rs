use dashmap::DashMap;
use log::info;
use thiserror::Error;

use std::sync::Arc;

use super::account::Account;
use super::block::Block;
use super::chain::{Blockchain, BlockchainError};

/// Errors that can occur during wallet operations
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Blockchain error: {0}")]
    BlockchainError(#[from] BlockchainError),
}

/// Named accounts operating on one ledger
#[derive(Debug, Clone)]
pub struct Wallet {
    accounts: Arc<DashMap<String, Account>>,
    blockchain: Blockchain,
}

impl Wallet {
    /// Creates an empty wallet over a ledger
    pub fn new(blockchain: Blockchain) -> Self {
        Wallet {
            accounts: Arc::new(DashMap::new()),
            blockchain,
        }
    }

    /// Registers an account under a name, replacing any previous one
    pub fn add(&self, name: &str, account: Account) {
        self.accounts.insert(name.to_string(), account);
    }

    /// Gets an account by name
    pub fn get(&self, name: &str) -> Result<Account, WalletError> {
        self.accounts
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| WalletError::AccountNotFound(name.to_string()))
    }

    /// Names of all registered accounts, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.accounts.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Gets the spendable balance of a named account
    ///
    /// # Returns
    ///
    /// The balance, or `WalletError::AccountNotFound` for an unknown name
    pub fn balance(&self, name: &str) -> Result<u64, WalletError> {
        let account = self.get(name)?;
        Ok(self.blockchain.balance(&account)?)
    }

    /// Sends money from one named account to another
    pub fn send(&self, from: &str, to: &str, amount: u64) -> Result<Block, WalletError> {
        let sender = self.get(from)?;
        let recipient = self.get(to)?;
        Ok(self.blockchain.send(&sender, recipient.address(), amount)?)
    }

    /// Logs the address and balance of an account
    pub fn info(&self, name: &str) -> Result<(), WalletError> {
        let account = self.get(name)?;
        let balance = self.blockchain.balance(&account)?;
        info!("Name: {} Address: {} Balance: {}", name, account.address(), balance);
        Ok(())
    }

    /// Logs every account
    pub fn print(&self) -> Result<(), WalletError> {
        for name in self.names() {
            self.info(&name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::chain::DEFAULT_REWARD;
    use crate::blockchain::storage::MemStore;

    fn setup() -> Wallet {
        let miner = Account::new();
        let blockchain = Blockchain::new(miner.clone(), Arc::new(MemStore::new())).unwrap();
        let wallet = Wallet::new(blockchain);
        wallet.add("miner", miner);
        wallet.add("alice", Account::new());
        wallet.add("bob", Account::new());
        wallet
    }

    #[test]
    fn test_transfers_between_named_accounts() {
        let wallet = setup();
        wallet.blockchain.mine(5).unwrap();

        assert_eq!(wallet.balance("miner").unwrap(), 5 * DEFAULT_REWARD);
        assert_eq!(wallet.balance("alice").unwrap(), 0);
        assert_eq!(wallet.balance("bob").unwrap(), 0);

        wallet.send("miner", "alice", 2).unwrap();
        wallet.send("miner", "bob", 2).unwrap();
        wallet.send("alice", "bob", 1).unwrap();

        // 25 mined, 4 sent away, 3 more blocks mined by the ledger's miner
        assert_eq!(wallet.balance("miner").unwrap(), 36);
        assert_eq!(wallet.balance("bob").unwrap(), 3);
        assert_eq!(wallet.balance("alice").unwrap(), 1);
        assert!(wallet.blockchain.validate().is_ok());
        wallet.print().unwrap();
    }

    #[test]
    fn test_unknown_account() {
        let wallet = setup();

        assert!(matches!(
            wallet.balance("carol"),
            Err(WalletError::AccountNotFound(name)) if name == "carol"
        ));
        assert!(matches!(
            wallet.send("miner", "carol", 1),
            Err(WalletError::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_insufficient_funds_surfaces() {
        let wallet = setup();

        assert!(matches!(
            wallet.send("alice", "bob", 1),
            Err(WalletError::BlockchainError(BlockchainError::InsufficientFunds { .. }))
        ));
    }

    #[test]
    fn test_names_are_sorted() {
        let wallet = setup();
        assert_eq!(wallet.names(), vec!["alice", "bob", "miner"]);
    }
}
