//! Block manager for the paged KV cache.
//!
//! The BlockManager handles allocation and deallocation of KV cache blocks,
//! similar to how an operating system manages physical memory pages.
//!
//! ## Features
//!
//! - **Free list allocation**: O(1) block allocation and deallocation
//! - **Reference counting**: Blocks are shared between forked sequences
//! - **Copy-on-write**: A write to a shared block duplicates it first
//! - **Prefix caching**: Hash-based lookup for shared prompt prefixes, with
//!   unreferenced cached blocks kept in an LRU queue until evicted
//! - **Swapping**: Whole block tables move to a host pool and back
//!
//! Every physical operation the backend must mirror (block copies, swaps) is
//! queued and handed out by [`BlockManager::take_ops`].
//!
//! ## Example
//!
//! ```
//! use nano_genai::core::block::BlockTable;
//! use nano_genai::core::block_manager::BlockManager;
//!
//! let mut manager = BlockManager::new(8, 4);
//! let mut table = BlockTable::new(4);
//!
//! for token in [1, 2, 3, 4, 5] {
//!     manager.append_token(&mut table, token).unwrap();
//! }
//! assert_eq!(table.num_blocks(), 2);
//!
//! manager.free_table(&mut table);
//! assert_eq!(manager.num_free_blocks(), 8);
//! ```

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::core::block::{compute_num_blocks, Block, BlockTable};
use crate::error::{Error, Result};

/// Physical cache operations the backend must apply before the next forward pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOps {
    /// Copy-on-write duplications as `(src, dst)` device blocks.
    pub copies: Vec<(usize, usize)>,
    /// Device to host moves as `(device, host)`.
    pub swap_out: Vec<(usize, usize)>,
    /// Host to device moves as `(host, device)`.
    pub swap_in: Vec<(usize, usize)>,
}

impl CacheOps {
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty() && self.swap_out.is_empty() && self.swap_in.is_empty()
    }
}

/// Result of probing the prefix cache for a run of block hashes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefixHit {
    /// Leading blocks found in the cache.
    pub num_blocks: usize,
    /// How many of those are currently referenced by some table.
    pub num_in_use: usize,
}

/// Manages allocation and deallocation of KV cache blocks.
///
/// The BlockManager maintains:
/// - A free list for O(1) allocation/deallocation
/// - Reference counting for shared blocks
/// - A prefix cache for hash-based block reuse
/// - A host pool for swapped-out tables
#[derive(Debug)]
pub struct BlockManager {
    /// Resident device blocks indexed by block_id (referenced or evictable).
    blocks: HashMap<usize, Block>,
    /// Free device block IDs.
    free_list: VecDeque<usize>,
    /// Unreferenced prefix-cached blocks, oldest first.
    evictable: VecDeque<usize>,
    /// Prefix hash -> block_id mapping for prefix caching.
    prefix_cache: HashMap<u64, usize>,
    /// Host blocks holding swapped-out content.
    host_blocks: HashMap<usize, Block>,
    /// Free host block IDs.
    host_free_list: VecDeque<usize>,
    /// Number of tokens per block.
    block_size: usize,
    /// Total number of device blocks.
    num_blocks: usize,
    /// Total number of host blocks.
    num_host_blocks: usize,
    /// Operations queued since the last `take_ops`.
    pending: CacheOps,
}

impl BlockManager {
    /// Create a new block manager with as many host blocks as device blocks.
    ///
    /// # Example
    ///
    /// ```
    /// use nano_genai::core::block_manager::BlockManager;
    ///
    /// let manager = BlockManager::new(1024, 16);
    /// assert_eq!(manager.num_free_blocks(), 1024);
    /// ```
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self::with_swap_space(num_blocks, block_size, num_blocks)
    }

    /// Create a new block manager with an explicit host pool size.
    pub fn with_swap_space(num_blocks: usize, block_size: usize, num_host_blocks: usize) -> Self {
        Self {
            blocks: HashMap::with_capacity(num_blocks),
            free_list: (0..num_blocks).collect(),
            evictable: VecDeque::new(),
            prefix_cache: HashMap::new(),
            host_blocks: HashMap::new(),
            host_free_list: (0..num_host_blocks).collect(),
            block_size,
            num_blocks,
            num_host_blocks,
            pending: CacheOps::default(),
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the total number of device blocks.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Get the total number of host blocks.
    pub fn num_host_blocks(&self) -> usize {
        self.num_host_blocks
    }

    /// Blocks available to `allocate`, counting evictable cached blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len() + self.evictable.len()
    }

    /// Blocks referenced by at least one table.
    pub fn num_used_blocks(&self) -> usize {
        self.blocks.len() - self.evictable.len()
    }

    /// Unreferenced blocks kept only for prefix reuse.
    pub fn num_evictable_blocks(&self) -> usize {
        self.evictable.len()
    }

    pub fn num_free_host_blocks(&self) -> usize {
        self.host_free_list.len()
    }

    /// Check if a specific number of blocks can be allocated.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.num_free_blocks() >= num_blocks
    }

    /// Allocate a single block.
    ///
    /// Takes from the free list first and evicts the oldest unreferenced
    /// prefix-cached block only when the free list is empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfCache`] if no block can be obtained.
    ///
    /// # Example
    ///
    /// ```
    /// use nano_genai::core::block_manager::BlockManager;
    ///
    /// let mut manager = BlockManager::new(2, 16);
    ///
    /// let b1 = manager.allocate().unwrap();
    /// let b2 = manager.allocate().unwrap();
    ///
    /// // Third allocation fails
    /// assert!(manager.allocate().is_err());
    /// ```
    pub fn allocate(&mut self) -> Result<usize> {
        let block_id = match self.free_list.pop_front() {
            Some(id) => id,
            None => self.evict_one().ok_or(Error::OutOfCache {
                requested: 1,
                available: 0,
            })?,
        };

        self.blocks
            .insert(block_id, Block::new(block_id, self.block_size));
        Ok(block_id)
    }

    /// Allocate multiple blocks at once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfCache`] if not enough blocks are available; nothing
    /// is allocated in that case.
    pub fn allocate_many(&mut self, num_blocks: usize) -> Result<Vec<usize>> {
        if !self.can_allocate(num_blocks) {
            return Err(Error::OutOfCache {
                requested: num_blocks,
                available: self.num_free_blocks(),
            });
        }

        let mut block_ids = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            block_ids.push(self.allocate()?);
        }
        Ok(block_ids)
    }

    fn evict_one(&mut self) -> Option<usize> {
        let block_id = self.evictable.pop_front()?;
        if let Some(block) = self.blocks.remove(&block_id) {
            if let Some(hash) = block.prefix_hash() {
                if self.prefix_cache.get(&hash) == Some(&block_id) {
                    self.prefix_cache.remove(&hash);
                }
            }
        }
        debug!(block_id, "evicted cached prefix block");
        Some(block_id)
    }

    /// Drop one reference to a block.
    ///
    /// At zero references a prefix-cached block becomes evictable; any other
    /// block goes back to the free list.
    ///
    /// # Returns
    ///
    /// `true` if the block lost its last reference.
    pub fn free(&mut self, block_id: usize) -> bool {
        let Some(block) = self.blocks.get_mut(&block_id) else {
            return false;
        };
        if block.ref_count() == 0 || block.decrement_ref() > 0 {
            return false;
        }

        let cached = block
            .prefix_hash()
            .is_some_and(|hash| self.prefix_cache.get(&hash) == Some(&block_id));
        if cached {
            self.evictable.push_back(block_id);
        } else {
            self.blocks.remove(&block_id);
            self.free_list.push_back(block_id);
        }
        true
    }

    /// Free multiple blocks.
    ///
    /// # Returns
    ///
    /// Number of blocks that lost their last reference.
    pub fn free_many(&mut self, block_ids: &[usize]) -> usize {
        block_ids.iter().filter(|&&id| self.free(id)).count()
    }

    /// Release every device block of `table` and clear it.
    ///
    /// Calling this again on the cleared table is a no-op.
    pub fn free_table(&mut self, table: &mut BlockTable) -> usize {
        let freed = self.free_many(table.get_physical_block_ids());
        table.clear();
        freed
    }

    /// Get a reference to a block.
    pub fn get_block(&self, block_id: usize) -> Option<&Block> {
        self.blocks.get(&block_id)
    }

    /// Get a reference to a host block.
    pub fn get_host_block(&self, block_id: usize) -> Option<&Block> {
        self.host_blocks.get(&block_id)
    }

    /// Increment the reference count of a block.
    ///
    /// # Returns
    ///
    /// The new reference count, or `None` if the block doesn't exist.
    pub fn increment_ref(&mut self, block_id: usize) -> Option<usize> {
        self.blocks.get_mut(&block_id).map(|block| {
            block.increment_ref();
            block.ref_count()
        })
    }

    // ========== Copy-on-Write ==========

    /// Share every block of `table` with a new table.
    pub fn fork(&mut self, table: &BlockTable) -> BlockTable {
        for &block_id in table.get_physical_block_ids() {
            self.increment_ref(block_id);
        }
        table.clone()
    }

    /// Blocks `append_token` would allocate to write `num_tokens` more tokens.
    pub fn blocks_needed(&self, table: &BlockTable, num_tokens: usize) -> usize {
        let shared = table
            .last_block_id()
            .and_then(|id| self.get_block(id))
            .is_some_and(|block| block.ref_count() > 1);
        self.write_demand(table, num_tokens, shared)
    }

    /// Device blocks needed to swap `tables` back in and then write
    /// `num_new_tokens[i]` more tokens through each of them.
    pub fn swap_in_demand(&self, tables: &[BlockTable], num_new_tokens: &[usize]) -> usize {
        let growth: usize = tables
            .iter()
            .zip(num_new_tokens)
            .map(|(table, &n)| {
                let shared = table
                    .last_block_id()
                    .and_then(|id| self.get_host_block(id))
                    .is_some_and(|block| block.ref_count() > 1);
                self.write_demand(table, n, shared)
            })
            .sum();
        Self::distinct_blocks(tables) + growth
    }

    fn write_demand(&self, table: &BlockTable, num_tokens: usize, last_shared: bool) -> usize {
        if num_tokens == 0 {
            return 0;
        }
        let current = table.num_tokens();
        let grow = compute_num_blocks(current + num_tokens, self.block_size)
            .saturating_sub(table.num_blocks());
        let cow = current % self.block_size != 0 && last_shared;
        grow + usize::from(cow)
    }

    /// Write one token into the next slot of `table`.
    ///
    /// Allocates a block when the table is full and duplicates the target
    /// block first when it is shared.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfCache`] if a needed block cannot be allocated;
    /// the table is left unchanged.
    pub fn append_token(&mut self, table: &mut BlockTable, token: u32) -> Result<()> {
        let pos = table.num_tokens();
        let logical = pos / self.block_size;
        let slot = pos % self.block_size;

        if logical >= table.num_blocks() {
            let block_id = self.allocate()?;
            table.append_block(block_id);
        } else {
            let block_id = table.get_block_id(logical)?;
            let shared = self
                .blocks
                .get(&block_id)
                .is_some_and(|block| block.ref_count() > 1);
            if shared {
                self.copy_on_write(table, logical, slot)?;
            }
        }

        let block_id = table.get_block_id(logical)?;
        let block = self
            .blocks
            .get_mut(&block_id)
            .ok_or(Error::BlockIndexOutOfBounds {
                logical_idx: logical,
                num_blocks: table.num_blocks(),
            })?;
        block.write_slot(slot, token);
        table.set_num_tokens(pos + 1);
        Ok(())
    }

    fn copy_on_write(&mut self, table: &mut BlockTable, logical: usize, slot: usize) -> Result<()> {
        let src = table.get_block_id(logical)?;
        let content = self
            .blocks
            .get(&src)
            .map(|block| block.tokens()[..slot.min(block.num_tokens())].to_vec())
            .unwrap_or_default();

        let dst = self.allocate()?;
        if let Some(block) = self.blocks.get_mut(&dst) {
            block.set_tokens(content);
        }
        self.free(src);
        table.set_block_id(logical, dst);
        self.pending.copies.push((src, dst));
        debug!(src, dst, "copy-on-write");
        Ok(())
    }

    /// Discard slots of `table` at positions `>= len`.
    ///
    /// Whole blocks past the new end are released. A kept partial block is cut
    /// in place when exclusively owned; a shared one is left alone and the next
    /// write duplicates it.
    pub fn truncate(&mut self, table: &mut BlockTable, len: usize) {
        if len >= table.num_tokens() {
            return;
        }

        let dropped = table.truncate_blocks(compute_num_blocks(len, self.block_size));
        self.free_many(&dropped);

        let slot = len % self.block_size;
        if slot != 0 {
            if let Some(block) = table.last_block_id().and_then(|id| self.blocks.get_mut(&id)) {
                if block.ref_count() == 1 {
                    if let Some(hash) = block.prefix_hash() {
                        if self.prefix_cache.get(&hash) == Some(&block.block_id()) {
                            self.prefix_cache.remove(&hash);
                        }
                        block.clear_prefix_hash();
                    }
                    block.truncate(slot);
                }
            }
        }
        table.set_num_tokens(len);
    }

    /// Token ids materialized through `table`, in position order.
    pub fn read_tokens(&self, table: &BlockTable) -> Vec<u32> {
        let mut tokens = Vec::with_capacity(table.num_tokens());
        for block_id in table.get_physical_block_ids() {
            if let Some(block) = self.blocks.get(block_id) {
                tokens.extend_from_slice(&block.tokens()[..block.num_tokens().min(self.block_size)]);
            }
        }
        tokens.truncate(table.num_tokens());
        tokens
    }

    // ========== Swapping ==========

    fn distinct_blocks(tables: &[BlockTable]) -> usize {
        tables
            .iter()
            .flat_map(|table| table.get_physical_block_ids().iter().copied())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Whether the host pool can take every block of `tables`.
    pub fn can_swap_out(&self, tables: &[BlockTable]) -> bool {
        Self::distinct_blocks(tables) <= self.host_free_list.len()
    }

    /// Whether the device pool can take back every block of `tables`.
    pub fn can_swap_in(&self, tables: &[BlockTable]) -> bool {
        Self::distinct_blocks(tables) <= self.num_free_blocks()
    }

    /// Host blocks needed to swap in `tables`, counting shared blocks once.
    pub fn num_distinct_blocks(&self, tables: &[BlockTable]) -> usize {
        Self::distinct_blocks(tables)
    }

    /// Move the device blocks of `tables` to the host pool.
    ///
    /// Blocks shared between the tables are moved once. The tables are rebound
    /// to host block ids.
    ///
    /// # Returns
    ///
    /// `(device, host)` pairs, also queued for [`take_ops`](Self::take_ops).
    pub fn swap_out(&mut self, tables: &mut [BlockTable]) -> Result<Vec<(usize, usize)>> {
        let needed = Self::distinct_blocks(tables);
        if needed > self.host_free_list.len() {
            return Err(Error::OutOfCache {
                requested: needed,
                available: self.host_free_list.len(),
            });
        }

        let mut mapping: HashMap<usize, usize> = HashMap::new();
        let mut moved = Vec::with_capacity(needed);
        for table in tables.iter_mut() {
            for logical in 0..table.num_blocks() {
                let device = table.get_block_id(logical)?;
                let host = match mapping.entry(device) {
                    Entry::Occupied(entry) => {
                        let host = *entry.get();
                        if let Some(block) = self.host_blocks.get_mut(&host) {
                            block.increment_ref();
                        }
                        host
                    }
                    Entry::Vacant(entry) => {
                        let host = self.host_free_list.pop_front().ok_or(Error::OutOfCache {
                            requested: 1,
                            available: 0,
                        })?;
                        let mut block = Block::new(host, self.block_size);
                        if let Some(src) = self.blocks.get(&device) {
                            block.set_tokens(src.tokens().to_vec());
                        }
                        self.host_blocks.insert(host, block);
                        moved.push((device, host));
                        *entry.insert(host)
                    }
                };
                self.free(device);
                table.set_block_id(logical, host);
            }
        }

        self.pending.swap_out.extend_from_slice(&moved);
        Ok(moved)
    }

    /// Move the host blocks of `tables` back to the device pool.
    ///
    /// # Returns
    ///
    /// `(host, device)` pairs, also queued for [`take_ops`](Self::take_ops).
    pub fn swap_in(&mut self, tables: &mut [BlockTable]) -> Result<Vec<(usize, usize)>> {
        let needed = Self::distinct_blocks(tables);
        if !self.can_allocate(needed) {
            return Err(Error::OutOfCache {
                requested: needed,
                available: self.num_free_blocks(),
            });
        }

        let mut mapping: HashMap<usize, usize> = HashMap::new();
        let mut moved = Vec::with_capacity(needed);
        for table in tables.iter_mut() {
            for logical in 0..table.num_blocks() {
                let host = table.get_block_id(logical)?;
                let device = match mapping.get(&host) {
                    Some(&device) => {
                        self.increment_ref(device);
                        device
                    }
                    None => {
                        let device = self.allocate()?;
                        let content = self
                            .host_blocks
                            .get(&host)
                            .map(|block| block.tokens().to_vec())
                            .unwrap_or_default();
                        if let Some(block) = self.blocks.get_mut(&device) {
                            block.set_tokens(content);
                        }
                        mapping.insert(host, device);
                        moved.push((host, device));
                        device
                    }
                };
                self.free_host(host);
                table.set_block_id(logical, device);
            }
        }

        self.pending.swap_in.extend_from_slice(&moved);
        Ok(moved)
    }

    fn free_host(&mut self, block_id: usize) -> bool {
        let Some(block) = self.host_blocks.get_mut(&block_id) else {
            return false;
        };
        if block.decrement_ref() > 0 {
            return false;
        }
        self.host_blocks.remove(&block_id);
        self.host_free_list.push_back(block_id);
        true
    }

    /// Release every host block of a swapped-out `table` and clear it.
    pub fn free_host_table(&mut self, table: &mut BlockTable) -> usize {
        let freed = table
            .get_physical_block_ids()
            .iter()
            .filter(|&&id| self.free_host(id))
            .count();
        table.clear();
        freed
    }

    /// Hand out the queued copy and swap operations.
    pub fn take_ops(&mut self) -> CacheOps {
        std::mem::take(&mut self.pending)
    }

    // ========== Prefix Caching ==========

    /// Try to get a cached block by prefix hash.
    ///
    /// If found, the block's reference count is incremented (an evictable
    /// block is revived).
    ///
    /// # Example
    ///
    /// ```
    /// use nano_genai::core::block_manager::BlockManager;
    /// use nano_genai::core::block::hash_token_block;
    ///
    /// let mut manager = BlockManager::new(10, 16);
    /// let hash = hash_token_block(&[1u32, 2, 3, 4], None);
    ///
    /// assert!(manager.get_cached_block(hash).is_none());
    ///
    /// let block_id = manager.allocate().unwrap();
    /// manager.cache_block(block_id, hash);
    ///
    /// assert_eq!(manager.get_cached_block(hash), Some(block_id));
    /// ```
    pub fn get_cached_block(&mut self, prefix_hash: u64) -> Option<usize> {
        let block_id = *self.prefix_cache.get(&prefix_hash)?;
        match self.blocks.get_mut(&block_id) {
            Some(block) => {
                if block.ref_count() == 0 {
                    self.evictable.retain(|&id| id != block_id);
                }
                block.increment_ref();
                Some(block_id)
            }
            None => {
                self.prefix_cache.remove(&prefix_hash);
                None
            }
        }
    }

    /// Register a block in the prefix cache.
    ///
    /// # Returns
    ///
    /// `false` if another block already holds this hash or the block is unknown.
    pub fn cache_block(&mut self, block_id: usize, prefix_hash: u64) -> bool {
        if self.prefix_cache.contains_key(&prefix_hash) {
            return false;
        }
        match self.blocks.get_mut(&block_id) {
            Some(block) => {
                block.set_prefix_hash(prefix_hash);
                self.prefix_cache.insert(prefix_hash, block_id);
                true
            }
            None => false,
        }
    }

    /// Allocate a block, checking the prefix cache first.
    ///
    /// # Returns
    ///
    /// A tuple of (block_id, was_cached).
    pub fn allocate_with_prefix(&mut self, prefix_hash: u64) -> Result<(usize, bool)> {
        if let Some(block_id) = self.get_cached_block(prefix_hash) {
            return Ok((block_id, true));
        }

        let block_id = self.allocate()?;
        self.cache_block(block_id, prefix_hash);
        Ok((block_id, false))
    }

    /// Count the leading `hashes` present in the cache without taking references.
    pub fn peek_prefix(&self, hashes: &[u64]) -> PrefixHit {
        let mut hit = PrefixHit::default();
        for hash in hashes {
            let Some(block) = self
                .prefix_cache
                .get(hash)
                .and_then(|id| self.blocks.get(id))
            else {
                break;
            };
            hit.num_blocks += 1;
            if block.ref_count() > 0 {
                hit.num_in_use += 1;
            }
        }
        hit
    }

    /// Check if a prefix hash is in the cache.
    pub fn is_prefix_cached(&self, prefix_hash: u64) -> bool {
        self.prefix_cache.contains_key(&prefix_hash)
    }

    /// Get the number of cached prefixes.
    pub fn num_cached_prefixes(&self) -> usize {
        self.prefix_cache.len()
    }

    /// Reset the block manager to initial state.
    ///
    /// All blocks are freed and returned to the free list.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.evictable.clear();
        self.prefix_cache.clear();
        self.free_list.clear();
        self.free_list.extend(0..self.num_blocks);
        self.host_blocks.clear();
        self.host_free_list.clear();
        self.host_free_list.extend(0..self.num_host_blocks);
        self.pending = CacheOps::default();
    }
}
