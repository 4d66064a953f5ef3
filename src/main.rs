use std::sync::Arc;

use log::{info, warn};

use utxo_ledger::blockchain::{Account, Blockchain, MemStore, SledStore, Store, Wallet};

// Opens the sled store under `data_dir`, falling back to memory
fn open_store(data_dir: &str) -> Arc<dyn Store> {
    // Create data directory if it doesn't exist
    std::fs::create_dir_all(data_dir).unwrap_or_else(|e| {
        warn!("Failed to create data directory: {}", e);
    });

    match SledStore::open(data_dir) {
        Ok(store) => {
            info!("Opened chain store at {}", data_dir);
            Arc::new(store)
        }
        Err(err) => {
            warn!("Failed to open chain store: {}", err);
            warn!("Using in-memory store instead");
            Arc::new(MemStore::new())
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let data_dir = "data/blockchain";
    let store = open_store(data_dir);

    let miner = Account::new();
    let blockchain = Blockchain::new(miner.clone(), store.clone())?;
    blockchain.validate()?;

    let wallet = Wallet::new(blockchain.clone());
    wallet.add("miner", miner);
    wallet.add("alice", Account::new());
    wallet.add("bob", Account::new());

    blockchain.mine(5)?;
    wallet.send("miner", "alice", 2)?;
    wallet.send("miner", "bob", 2)?;
    wallet.send("alice", "bob", 1)?;

    wallet.print()?;
    blockchain.print()?;
    info!("Chain height: {}", blockchain.height()?);

    store.close()?;
    Ok(())
}
