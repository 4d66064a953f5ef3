use std::fmt::Debug;
use std::path::Path;

use dashmap::DashMap;
use sled::Db;
use thiserror::Error;

use super::block::Block;

/// Key under which the chain tip is stored
pub const LAST_BLOCK_KEY: &[u8] = b"lastblock";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),
}

/// A byte-keyed store. All methods are safe for concurrent use; a reader
/// never observes a partially written value.
pub trait Store: Debug + Send + Sync {
    /// Stores a value, replacing any previous value under the key
    ///
    /// # Arguments
    ///
    /// * `key` - The opaque key
    /// * `value` - The bytes to store; the store keeps its own copy
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Reads the value under a key
    ///
    /// # Returns
    ///
    /// The value, or `StorageError::NotFound` if the key is absent
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError>;

    /// Checks whether a key is present
    fn has(&self, key: &[u8]) -> Result<bool, StorageError>;

    /// Removes a key; removing an absent key is not an error
    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;

    /// Flushes and releases the store
    fn close(&self) -> Result<(), StorageError>;
}

fn not_found(key: &[u8]) -> StorageError {
    StorageError::NotFound(format!("key {}", hex::encode(key)))
}

/// In-memory store; nothing is persisted
#[derive(Debug, Default)]
pub struct MemStore {
    db: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore { db: DashMap::new() }
    }

    pub fn with_capacity(size: usize) -> Self {
        MemStore {
            db: DashMap::with_capacity(size),
        }
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.db.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

impl Store for MemStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError> {
        self.db
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found(key))
    }

    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.db.contains_key(key))
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db.remove(key);
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Persistent store backed by sled
pub struct SledStore {
    db: Db,
}

impl Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Opens (or creates) a database directory
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    ///
    /// # Returns
    ///
    /// A new SledStore instance
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(SledStore { db })
    }

    /// Opens a database that is removed when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(SledStore { db })
    }
}

impl Store for SledStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError> {
        match self.db.get(key)? {
            Some(value) => Ok(value.to_vec()),
            None => Err(not_found(key)),
        }
    }

    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.db.contains_key(key)?)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db.remove(key)?;
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Serializes a block for storage
pub fn encode_block(block: &Block) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(block).map_err(|e| StorageError::SerializationError(e.to_string()))
}

/// Deserializes a stored block
///
/// # Returns
///
/// The block, or `StorageError::DeserializationError` on corrupt bytes
pub fn decode_block(bytes: &[u8]) -> Result<Block, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

/// Walks the chain from the tip back to genesis.
///
/// A store miss or a corrupt entry is yielded once as an error and ends the walk.
pub struct BlockIterator<'a> {
    store: &'a dyn Store,
    next_key: Option<Vec<u8>>,
}

impl<'a> BlockIterator<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        BlockIterator {
            store,
            next_key: Some(LAST_BLOCK_KEY.to_vec()),
        }
    }

    /// Starts the walk at a specific block instead of the tip
    pub fn from_hash(store: &'a dyn Store, hash: &[u8]) -> Self {
        BlockIterator {
            store,
            next_key: Some(hash.to_vec()),
        }
    }
}

impl Iterator for BlockIterator<'_> {
    type Item = Result<Block, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.next_key.take()?;

        let block = match self.store.get(&key).and_then(|bytes| decode_block(&bytes)) {
            Ok(block) => block,
            Err(err) => return Some(Err(err)),
        };

        if !block.is_genesis() {
            self.next_key = Some(block.prev_hash.as_bytes().to_vec());
        }

        Some(Ok(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Hash;

    fn exercise_store(store: &dyn Store) {
        assert!(!store.has(b"k").unwrap());
        assert!(matches!(store.get(b"k"), Err(StorageError::NotFound(_))));

        store.put(b"k", b"v1").unwrap();
        assert!(store.has(b"k").unwrap());
        assert_eq!(store.get(b"k").unwrap(), b"v1".to_vec());

        store.put(b"k", b"v2").unwrap();
        assert_eq!(store.get(b"k").unwrap(), b"v2".to_vec());

        store.delete(b"k").unwrap();
        assert!(!store.has(b"k").unwrap());
        store.close().unwrap();
    }

    #[test]
    fn test_mem_store() {
        let store = MemStore::new();
        exercise_store(&store);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sled_store() {
        let store = SledStore::temporary().unwrap();
        exercise_store(&store);
    }

    #[test]
    fn test_mem_store_copies_values() {
        let store = MemStore::with_capacity(4);
        let mut value = b"abc".to_vec();
        store.put(b"k", &value).unwrap();
        value[0] = b'z';

        assert_eq!(store.get(b"k").unwrap(), b"abc".to_vec());
        assert_eq!(store.keys(), vec![b"k".to_vec()]);
    }

    #[test]
    fn test_iterator_walks_tip_to_genesis() {
        let store = MemStore::new();
        let genesis = Block::new(vec![], Hash::empty(), 0);
        let genesis_hash = genesis.calculate_hash();
        let child = Block::new(vec![], genesis_hash.clone(), 0);

        store.put(genesis_hash.as_bytes(), &encode_block(&genesis).unwrap()).unwrap();
        store.put(LAST_BLOCK_KEY, &encode_block(&child).unwrap()).unwrap();

        let blocks: Vec<Block> = BlockIterator::new(&store).collect::<Result<_, _>>().unwrap();
        assert_eq!(blocks, vec![child, genesis]);
    }

    #[test]
    fn test_iterator_reports_missing_parent() {
        let store = MemStore::new();
        let orphan = Block::new(vec![], Hash::from_bytes(vec![1, 2, 3]), 0);
        store.put(LAST_BLOCK_KEY, &encode_block(&orphan).unwrap()).unwrap();

        let mut it = BlockIterator::new(&store);
        assert!(it.next().unwrap().is_ok());
        assert!(matches!(it.next(), Some(Err(StorageError::NotFound(_)))));
        assert!(it.next().is_none());
    }

    #[test]
    fn test_iterator_on_empty_store() {
        let store = MemStore::new();
        let mut it = BlockIterator::new(&store);
        assert!(matches!(it.next(), Some(Err(StorageError::NotFound(_)))));
        assert!(it.next().is_none());
    }
}
