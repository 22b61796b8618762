//! Data manager: wires the storage manager, buffer pool, B+-tree and the
//! optional radix-tree cache together and routes the public operations.
//! Reads consult the cache first and fall through to the tree; writes go
//! to the tree, which keeps the cache in step as leaves change.

use anyhow::Result;
use std::path::Path;
use tracing::{debug, info};

use crate::btree::BPlusTree;
use crate::cache::RadixTree;
use crate::config::Config;
use crate::storage::{BufferManager, StorageManager};
use crate::ABSENT;

pub struct DataManager<const P: usize> {
    buffer: BufferManager<P>,
    tree: BPlusTree<P>,
    cache: Option<RadixTree<P>>,
}

impl<const P: usize> DataManager<P> {
    pub fn new(config: &Config) -> Result<Self> {
        let storage = StorageManager::new(Path::new(&config.data_dir))?;
        let mut buffer = BufferManager::new(storage, config.buffer_pool_size);
        let tree = BPlusTree::new(&mut buffer)?;
        let cache = config.cache.then(|| RadixTree::new(config.cache_budget_bytes));
        info!(
            buffer_pool_size = config.buffer_pool_size,
            cache = config.cache,
            page_size = P,
            "data manager ready"
        );
        Ok(Self { buffer, tree, cache })
    }

    /// Insert `(key, value)`. The tree caches the leaf the pair lands on.
    pub fn insert(&mut self, key: i64, value: i64) -> Result<()> {
        self.tree.insert(&mut self.buffer, self.cache.as_mut(), key, value)
    }

    /// Remove `key`. No-op if absent.
    pub fn delete_value(&mut self, key: i64) -> Result<()> {
        if let Some(cache) = self.cache.as_mut() {
            cache.delete_reference(key);
        }
        self.tree.delete_value(&mut self.buffer, self.cache.as_mut(), key)
    }

    /// Value for `key`, or the absent sentinel. Served from the cache
    /// when it holds a valid entry, otherwise from the tree.
    pub fn get_value(&mut self, key: i64) -> Result<i64> {
        if let Some(cache) = self.cache.as_mut() {
            let value = cache.get_value(key);
            if value != ABSENT {
                return Ok(value);
            }
        }
        self.tree.get_value(&mut self.buffer, self.cache.as_mut(), key)
    }

    /// Replace the value for `key` in place. No-op if absent.
    pub fn update(&mut self, key: i64, value: i64) -> Result<()> {
        self.tree.update(&mut self.buffer, self.cache.as_mut(), key, value)
    }

    /// XOR of up to `range` consecutive values starting at `key`; the
    /// absent sentinel when `key` is missing.
    pub fn scan(&mut self, key: i64, range: usize) -> Result<i64> {
        self.tree.scan(&mut self.buffer, self.cache.as_mut(), key, range)
    }

    /// Check the structural invariants of both trees; `expected` is the
    /// number of live entries the leaf chain must visit.
    pub fn validate(&mut self, expected: usize) -> Result<bool> {
        let tree_ok = self.tree.validate(&mut self.buffer, expected)?;
        debug!(tree_ok, "b+ tree validated");
        let mut ok = tree_ok;
        if let Some(cache) = self.cache.as_ref() {
            let cache_ok = cache.validate();
            debug!(cache_ok, "radix tree validated");
            ok = ok && cache_ok;
        }
        Ok(ok)
    }

    /// Clean shutdown: flush the pool, truncate the scratch file, drop
    /// the cache.
    pub fn destroy(mut self) -> Result<()> {
        self.buffer.destroy()?;
        self.buffer.storage_mut().destroy()?;
        if let Some(cache) = self.cache.as_mut() {
            cache.destroy();
        }
        info!("data manager shut down");
        Ok(())
    }

    /// Bytes currently allocated by the cache; zero when disabled.
    pub fn cache_size(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.current_size())
    }

    /// Frames resident in the buffer pool.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Frames still pinned; zero after every public operation.
    pub fn pinned_pages(&self) -> usize {
        self.buffer.pinned_pages()
    }
}
