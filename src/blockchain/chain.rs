use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use thiserror::Error;

use super::account::Account;
use super::block::Block;
use super::crypto::{Address, Hash};
use super::pow::{meets_difficulty, ProofOfWork, SimplePow};
use super::script::{p2pkh, verify_ownership};
use super::storage::{decode_block, encode_block, BlockIterator, StorageError, Store, LAST_BLOCK_KEY};
use super::transaction::{Transaction, TransactionError, TxIn, TxOut};

/// Leading zero hex characters required in every block hash
pub const DEFAULT_DIFFICULTY: u32 = 2;

/// Value minted by every coinbase transaction
pub const DEFAULT_REWARD: u64 = 5;

/// Recipient of the genesis coinbase
pub const GENESIS_ADDRESS: &str = "1NHXs8UxcgHzDNxWNTcYjKv8MGY72rnbbE";

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Invalid proof of work for block {0}")]
    InvalidProofOfWork(Hash),

    #[error("Invalid parent link: {0}")]
    InvalidParentLink(Hash),

    #[error("Unauthorized spend of output {vout} of transaction {txid}")]
    UnauthorizedSpend { txid: Hash, vout: i64 },

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Output {vout} of transaction {txid} is already spent")]
    AlreadySpent { txid: Hash, vout: i64 },

    #[error("Transaction id {0} is already in use")]
    DuplicateTransaction(Hash),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// Chain-wide constants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Mining difficulty (number of leading zeros required in hash)
    pub difficulty: u32,

    /// Mining reward
    pub reward: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            difficulty: DEFAULT_DIFFICULTY,
            reward: DEFAULT_REWARD,
        }
    }
}

type OutPoint = (Hash, usize);

/// Ids and outputs taken by earlier transactions of the block being built
#[derive(Debug, Default)]
struct BlockClaims {
    ids: HashSet<Hash>,
    outputs: HashSet<OutPoint>,
}

impl BlockClaims {
    fn record(&mut self, txid: Hash, consumed: Vec<OutPoint>) {
        self.ids.insert(txid);
        self.outputs.extend(consumed);
    }
}

/// Every transaction of a chain prefix together with the spent state of
/// each of its outputs
struct ChainView {
    transactions: Vec<Transaction>,
    index: HashMap<Hash, usize>,
    spent: HashMap<Hash, Vec<bool>>,
}

impl ChainView {
    /// Loads every block the iterator yields, down to genesis
    fn load(blocks: BlockIterator<'_>) -> Result<Self, BlockchainError> {
        let mut blocks = blocks.collect::<Result<Vec<Block>, StorageError>>()?;
        blocks.reverse();

        let mut view = ChainView {
            transactions: Vec::new(),
            index: HashMap::new(),
            spent: HashMap::new(),
        };

        // first pass: every transaction, nothing spent yet
        for tx in blocks.iter().flat_map(|b| b.transactions.iter()) {
            view.index.insert(tx.id.clone(), view.transactions.len());
            view.spent.insert(tx.id.clone(), vec![false; tx.vout.len()]);
            view.transactions.push(tx.clone());
        }

        // second pass: mark every referenced output
        for input in blocks
            .iter()
            .flat_map(|b| b.transactions.iter())
            .flat_map(|tx| tx.vin.iter())
            .filter(|input| !input.is_coinbase())
        {
            if let (Some(slots), Some(index)) = (view.spent.get_mut(&input.txid), input.output_index()) {
                if let Some(slot) = slots.get_mut(index) {
                    *slot = true;
                }
            }
        }

        Ok(view)
    }

    /// Rejects an id already used in the history or earlier in the block
    fn check_unique_id(&self, txid: &Hash, claims: &BlockClaims) -> Result<(), BlockchainError> {
        if self.index.contains_key(txid) || claims.ids.contains(txid) {
            return Err(BlockchainError::DuplicateTransaction(txid.clone()));
        }
        Ok(())
    }

    fn transaction(&self, txid: &Hash) -> Option<&Transaction> {
        self.index.get(txid).map(|&i| &self.transactions[i])
    }

    fn is_spent(&self, txid: &Hash, index: usize) -> bool {
        self.spent
            .get(txid)
            .and_then(|slots| slots.get(index))
            .copied()
            .unwrap_or(false)
    }

    /// Unspent outputs in chain order
    fn unspent(&self) -> impl Iterator<Item = (&Hash, usize, &TxOut)> + '_ {
        self.transactions.iter().flat_map(move |tx| {
            tx.vout
                .iter()
                .enumerate()
                .filter(move |(index, _)| !self.is_spent(&tx.id, *index))
                .map(move |(index, output)| (&tx.id, index, output))
        })
    }

    /// Checks a transaction against this history.
    ///
    /// `claims` holds what earlier transactions of the same block already
    /// took. Returns the outputs this transaction consumes.
    fn validate_transaction(
        &self,
        tx: &Transaction,
        claims: &BlockClaims,
    ) -> Result<Vec<OutPoint>, BlockchainError> {
        self.check_unique_id(&tx.id, claims)?;

        let mut consumed = Vec::with_capacity(tx.vin.len());
        let mut in_amount = 0u64;

        for input in &tx.vin {
            let origin = self
                .transaction(&input.txid)
                .ok_or_else(|| BlockchainError::NotFound(format!("transaction {}", input.txid)))?;
            let output = origin.output(input.vout)?;
            let index = input
                .output_index()
                .ok_or_else(|| BlockchainError::NotFound(format!("output {}", input.vout)))?;

            let outpoint = (input.txid.clone(), index);
            if self.is_spent(&input.txid, index)
                || claims.outputs.contains(&outpoint)
                || consumed.contains(&outpoint)
            {
                return Err(BlockchainError::AlreadySpent {
                    txid: input.txid.clone(),
                    vout: input.vout,
                });
            }

            if !input.can_unlock(output) {
                return Err(BlockchainError::UnauthorizedSpend {
                    txid: input.txid.clone(),
                    vout: input.vout,
                });
            }

            in_amount = in_amount
                .checked_add(output.value)
                .ok_or(TransactionError::ValueOverflow)?;
            consumed.push(outpoint);
        }

        let out_amount = tx.total_output()?;
        if out_amount > in_amount {
            return Err(BlockchainError::InsufficientFunds {
                required: out_amount,
                available: in_amount,
            });
        }

        Ok(consumed)
    }
}

/// Represents the blockchain
#[derive(Debug, Clone)]
pub struct Blockchain {
    /// Blocks keyed by hash, plus the tip under `LAST_BLOCK_KEY`
    store: Arc<dyn Store>,

    /// Nonce search strategy
    pow: Arc<dyn ProofOfWork>,

    /// Receives the coinbase of every block mined by this instance
    miner: Account,

    config: LedgerConfig,

    /// Serializes derive-then-append sequences
    append_lock: Arc<Mutex<()>>,
}

impl Blockchain {
    /// Opens the ledger over a store, mining the genesis block if the store is empty
    ///
    /// # Arguments
    ///
    /// * `miner` - The account rewarded for blocks mined through this ledger
    /// * `store` - The byte store holding the chain
    pub fn new(miner: Account, store: Arc<dyn Store>) -> Result<Self, BlockchainError> {
        Self::with_config(miner, store, LedgerConfig::default(), Arc::new(SimplePow::new()))
    }

    /// Same as `new`, with an alternate proof-of-work strategy
    pub fn with_pow(
        miner: Account,
        store: Arc<dyn Store>,
        pow: Arc<dyn ProofOfWork>,
    ) -> Result<Self, BlockchainError> {
        Self::with_config(miner, store, LedgerConfig::default(), pow)
    }

    /// Opens the ledger with explicit chain constants and proof-of-work strategy
    ///
    /// # Arguments
    ///
    /// * `miner` - The account rewarded for blocks mined through this ledger
    /// * `store` - The byte store holding the chain
    /// * `config` - Difficulty and reward applied to every block
    /// * `pow` - The nonce search used when mining
    ///
    /// # Returns
    ///
    /// The ledger, or the error that rejected its genesis block
    pub fn with_config(
        miner: Account,
        store: Arc<dyn Store>,
        config: LedgerConfig,
        pow: Arc<dyn ProofOfWork>,
    ) -> Result<Self, BlockchainError> {
        let blockchain = Blockchain {
            store,
            pow,
            miner,
            config,
            append_lock: Arc::new(Mutex::new(())),
        };

        blockchain.add_genesis_block()?;

        Ok(blockchain)
    }

    fn add_genesis_block(&self) -> Result<(), BlockchainError> {
        if self.store.has(LAST_BLOCK_KEY)? {
            debug!("Existing chain found, skipping genesis");
            return Ok(());
        }

        info!("No existing chain found in store, creating genesis block");
        let mut coinbase = Transaction::new_coinbase(
            p2pkh(&Address(GENESIS_ADDRESS.to_string())),
            self.config.reward,
        );
        // the genesis payout is the same transaction on every fresh chain
        coinbase.set_id_with_nonce(0);
        let mut block = Block::new(vec![coinbase], Hash::empty(), self.config.difficulty);
        block.nonce = self.pow.work(&block);

        self.add_block(block)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.append_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The account receiving the coinbase of locally mined blocks
    pub fn miner(&self) -> &Account {
        &self.miner
    }

    /// Chain-wide difficulty and reward
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Gets the most recently accepted block
    pub fn tip(&self) -> Result<Block, BlockchainError> {
        let bytes = self.store.get(LAST_BLOCK_KEY)?;
        Ok(decode_block(&bytes)?)
    }

    /// Gets a block by its hash
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash the block is stored under
    ///
    /// # Returns
    ///
    /// The block, or `StorageError::NotFound` if no block has that hash
    pub fn get_block(&self, hash: &Hash) -> Result<Block, BlockchainError> {
        let bytes = self.store.get(hash.as_bytes())?;
        Ok(decode_block(&bytes)?)
    }

    /// Iterates the chain from the tip back to genesis
    pub fn iter(&self) -> BlockIterator<'_> {
        BlockIterator::new(self.store.as_ref())
    }

    /// Gets every block, tip first
    pub fn blocks(&self) -> Result<Vec<Block>, BlockchainError> {
        Ok(self.iter().collect::<Result<Vec<_>, _>>()?)
    }

    /// Number of blocks in the chain, genesis included
    pub fn height(&self) -> Result<usize, BlockchainError> {
        let mut height = 0;
        for block in self.iter() {
            block?;
            height += 1;
        }
        Ok(height)
    }

    /// Validates and appends a block, making it the new tip.
    ///
    /// A rejected block leaves the chain untouched.
    ///
    /// # Arguments
    ///
    /// * `block` - A mined block whose parent is the current tip
    pub fn add_block(&self, block: Block) -> Result<(), BlockchainError> {
        let _guard = self.lock();
        self.append(block)
    }

    fn append(&self, block: Block) -> Result<(), BlockchainError> {
        let hash = block.calculate_hash();

        if let Err(err) = self.validate_block(&block).and_then(|_| self.check_extends_tip(&block)) {
            error!("Rejected block {}: {}", hash, err);
            return Err(err);
        }

        let bytes = encode_block(&block)?;
        self.store.put(hash.as_bytes(), &bytes)?;
        self.store.put(LAST_BLOCK_KEY, &bytes)?;

        info!(
            "Appended block {} with {} transactions",
            hash,
            block.transactions.len()
        );
        Ok(())
    }

    /// There is exactly one chain: a new block must sit on the current tip,
    /// and a genesis block is only accepted into an empty store
    fn check_extends_tip(&self, block: &Block) -> Result<(), BlockchainError> {
        if !self.store.has(LAST_BLOCK_KEY)? {
            return if block.is_genesis() {
                Ok(())
            } else {
                Err(BlockchainError::InvalidParentLink(block.prev_hash.clone()))
            };
        }

        if block.prev_hash != self.tip()?.calculate_hash() {
            return Err(BlockchainError::InvalidParentLink(block.prev_hash.clone()));
        }
        Ok(())
    }

    /// Validates a block against the chain preceding it
    pub fn validate_block(&self, block: &Block) -> Result<(), BlockchainError> {
        let hash = block.calculate_hash();

        // proof of work
        if block.difficulty != self.config.difficulty || !meets_difficulty(&hash, block.difficulty) {
            return Err(BlockchainError::InvalidProofOfWork(hash));
        }

        if block.is_genesis() {
            return Ok(());
        }

        // parent linkage
        let parent = match self.get_block(&block.prev_hash) {
            Ok(parent) => parent,
            Err(BlockchainError::StorageError(StorageError::NotFound(_))) => {
                return Err(BlockchainError::InvalidParentLink(block.prev_hash.clone()));
            }
            Err(err) => return Err(err),
        };
        if parent.calculate_hash() != block.prev_hash {
            return Err(BlockchainError::InvalidParentLink(block.prev_hash.clone()));
        }

        let coinbase = self.check_coinbase(block)?;

        // every other transaction spends outputs of the ancestors
        let view = ChainView::load(BlockIterator::from_hash(
            self.store.as_ref(),
            block.prev_hash.as_bytes(),
        ))?;
        let mut claims = BlockClaims::default();
        view.check_unique_id(&coinbase.id, &claims)?;
        claims.record(coinbase.id.clone(), Vec::new());

        for tx in &block.transactions[1..] {
            match view.validate_transaction(tx, &claims) {
                Ok(consumed) => claims.record(tx.id.clone(), consumed),
                Err(err) => {
                    warn!("Invalid transaction {} in block {}: {}", tx.id, hash, err);
                    tx.print();
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    fn check_coinbase<'b>(&self, block: &'b Block) -> Result<&'b Transaction, BlockchainError> {
        let coinbase = block
            .transactions
            .first()
            .ok_or_else(|| BlockchainError::InvalidBlock("block has no coinbase".to_string()))?;

        if !coinbase.is_coinbase()
            || coinbase.vout.len() != 1
            || coinbase.vout[0].value != self.config.reward
        {
            return Err(BlockchainError::InvalidBlock(format!(
                "malformed coinbase {}",
                coinbase.id
            )));
        }
        Ok(coinbase)
    }

    /// Validates a transaction against the current chain
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<(), BlockchainError> {
        let view = ChainView::load(self.iter())?;
        view.validate_transaction(tx, &BlockClaims::default()).map(|_| ())
    }

    /// Re-validates every block of the chain
    pub fn validate(&self) -> Result<(), BlockchainError> {
        for block in self.iter() {
            self.validate_block(&block?)?;
        }
        Ok(())
    }

    /// Mines a block holding a fresh coinbase and the valid subset of
    /// `transactions`, then appends it
    pub fn mine_new_block(&self, transactions: Vec<Transaction>) -> Result<Block, BlockchainError> {
        let _guard = self.lock();
        self.mine_locked(transactions)
    }

    fn mine_locked(&self, transactions: Vec<Transaction>) -> Result<Block, BlockchainError> {
        let tip_hash = self.tip()?.calculate_hash();
        let view = ChainView::load(self.iter())?;

        let coinbase = Transaction::new_coinbase(p2pkh(self.miner.address()), self.config.reward);
        let mut claims = BlockClaims::default();
        claims.record(coinbase.id.clone(), Vec::new());

        let mut txs = vec![coinbase];
        for tx in transactions {
            match view.validate_transaction(&tx, &claims) {
                Ok(consumed) => {
                    claims.record(tx.id.clone(), consumed);
                    txs.push(tx);
                }
                Err(err) => warn!("Discarding invalid transaction {}: {}", tx.id, err),
            }
        }

        let mut block = Block::new(txs, tip_hash, self.config.difficulty);
        block.nonce = self.pow.work(&block);

        self.append(block.clone())?;
        Ok(block)
    }

    /// Mines `n` empty blocks
    pub fn mine(&self, n: usize) -> Result<(), BlockchainError> {
        for _ in 0..n {
            self.mine_new_block(Vec::new())?;
        }
        Ok(())
    }

    /// Collects every unspent output the account can unlock.
    ///
    /// All eligible value is summed regardless of `amount`.
    ///
    /// # Arguments
    ///
    /// * `account` - The account whose scriptSig is tried against each output
    /// * `amount` - The amount the caller intends to spend
    ///
    /// # Returns
    ///
    /// The spendable total and one input per eligible output. The inputs
    /// carry no scriptSig; the caller fills it in before spending.
    pub fn derive_spendable(
        &self,
        account: &Account,
        amount: u64,
    ) -> Result<(u64, Vec<TxIn>), BlockchainError> {
        debug!("Deriving spendable outputs of {} (requested {})", account.address(), amount);

        let view = ChainView::load(self.iter())?;
        let script_sig = account.script_sig();

        let mut total = 0u64;
        let mut inputs = Vec::new();
        for (txid, index, output) in view.unspent() {
            if !verify_ownership(&script_sig, &output.script_pub_key) {
                continue;
            }
            total = total
                .checked_add(output.value)
                .ok_or(TransactionError::ValueOverflow)?;
            inputs.push(TxIn {
                txid: txid.clone(),
                vout: index as i64,
                script_sig: Vec::new(),
            });
        }

        Ok((total, inputs))
    }

    /// Total value the account can spend
    pub fn balance(&self, account: &Account) -> Result<u64, BlockchainError> {
        self.derive_spendable(account, 0).map(|(total, _)| total)
    }

    /// Pays `amount` to `to`, returning any change to `from`, and mines the
    /// transfer into a new block immediately
    ///
    /// # Arguments
    ///
    /// * `from` - The paying account
    /// * `to` - The recipient's address
    /// * `amount` - The value to transfer
    ///
    /// # Returns
    ///
    /// The block holding the transfer, or `InsufficientFunds` if `from`
    /// cannot cover `amount`
    pub fn send(&self, from: &Account, to: &Address, amount: u64) -> Result<Block, BlockchainError> {
        let _guard = self.lock();

        let (total, mut inputs) = self.derive_spendable(from, amount)?;
        if total < amount {
            error!(
                "{} tried to send {} but can only spend {}",
                from.address(),
                amount,
                total
            );
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: total,
            });
        }

        let script_sig = from.script_sig();
        for input in &mut inputs {
            input.script_sig = script_sig.clone();
        }

        let mut outputs = vec![TxOut {
            value: amount,
            script_pub_key: p2pkh(to),
        }];
        if total > amount {
            outputs.push(TxOut {
                value: total - amount,
                script_pub_key: p2pkh(from.address()),
            });
        }

        self.submit_locked(Transaction::new(inputs, outputs))
    }

    /// Validates a transaction against the current chain and mines it into a
    /// new block
    ///
    /// # Arguments
    ///
    /// * `tx` - A signed transaction spending unspent outputs
    ///
    /// # Returns
    ///
    /// The appended block. An invalid transaction is returned as an error and
    /// nothing is mined.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Block, BlockchainError> {
        let _guard = self.lock();
        self.submit_locked(tx)
    }

    fn submit_locked(&self, tx: Transaction) -> Result<Block, BlockchainError> {
        let view = ChainView::load(self.iter())?;
        if let Err(err) = view.validate_transaction(&tx, &BlockClaims::default()) {
            warn!("Refusing transaction {}: {}", tx.id, err);
            return Err(err);
        }

        let txid = tx.id.clone();
        let block = self.mine_locked(vec![tx])?;

        if !block.transactions.iter().any(|t| t.id == txid) {
            return Err(BlockchainError::InvalidBlock(format!(
                "transaction {} was not included",
                txid
            )));
        }
        Ok(block)
    }

    /// Locking script for paying to an address
    pub fn script_pub_key(&self, address: &Address) -> String {
        p2pkh(address)
    }

    /// Unlocking witness for outputs owned by an account
    pub fn script_sig(&self, account: &Account) -> Vec<u8> {
        account.script_sig()
    }

    /// Logs every block header, tip first
    pub fn print(&self) -> Result<(), BlockchainError> {
        for block in self.iter() {
            block?.print();
        }
        Ok(())
    }

    /// Logs every transaction, newest block first
    pub fn print_transactions(&self) -> Result<(), BlockchainError> {
        for block in self.iter() {
            for tx in &block?.transactions {
                tx.print();
            }
        }
        Ok(())
    }
}
