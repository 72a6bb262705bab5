//! Block abstractions for the paged KV cache.
//!
//! The KV cache is divided into fixed-size blocks, similar to how operating
//! systems manage virtual memory with pages. A sequence owns a [`BlockTable`]
//! mapping its logical positions to physical blocks; blocks may be shared
//! between sequences and are copied before the first write to a shared block.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Compute a cumulative hash for a block of tokens including its prefix chain.
///
/// Used for prefix caching to identify shared prefixes. The hash includes the
/// parent block's hash to create a chain, ensuring that blocks at the same
/// position with different prefixes have different hashes.
///
/// # Arguments
///
/// * `token_ids` - Slice of token IDs for this block
/// * `parent_hash` - Hash of the previous block in the chain (None for first block)
///
/// # Returns
///
/// Cumulative hash value that uniquely identifies this block AND all previous blocks
///
/// # Example
///
/// ```
/// use nano_genai::core::block::hash_token_block;
///
/// let tokens = [1u32, 2, 3, 4];
/// let hash1 = hash_token_block(&tokens, None);
/// let hash2 = hash_token_block(&tokens, Some(hash1));
///
/// // Same tokens but different prefix chain -> different hash
/// assert_ne!(hash1, hash2);
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();

    if let Some(ph) = parent_hash {
        ph.hash(&mut hasher);
    }

    for &token in token_ids {
        token.hash(&mut hasher);
    }

    hasher.finish()
}

/// Chained hashes of every full block in `token_ids`.
///
/// A trailing partial block is not hashed.
pub fn hash_full_blocks(token_ids: &[u32], block_size: usize) -> Vec<u64> {
    let mut parent = None;
    token_ids
        .chunks_exact(block_size)
        .map(|chunk| {
            let hash = hash_token_block(chunk, parent);
            parent = Some(hash);
            hash
        })
        .collect()
}

/// A fixed-size chunk of KV cache memory.
///
/// Each block stores KV states for `block_size` tokens. The block records the
/// token ids written to its slots, which stands in for the KV payload the
/// compute backend keeps at the same physical location.
#[derive(Debug, Clone)]
pub struct Block {
    /// Unique identifier for this physical block.
    block_id: usize,
    /// Number of tokens this block can hold.
    block_size: usize,
    /// Number of block tables referencing this block.
    ref_count: usize,
    /// Chained content hash, set once the block is registered in the prefix cache.
    prefix_hash: Option<u64>,
    /// Token ids written to the slots, in slot order.
    tokens: Vec<u32>,
}

impl Block {
    /// Create a new block with the given ID.
    ///
    /// # Arguments
    ///
    /// * `block_id` - Unique identifier for this block
    /// * `block_size` - Number of tokens this block can hold
    pub fn new(block_id: usize, block_size: usize) -> Self {
        Self {
            block_id,
            block_size,
            ref_count: 1,
            prefix_hash: None,
            tokens: Vec::with_capacity(block_size),
        }
    }

    /// Get the block ID.
    pub fn block_id(&self) -> usize {
        self.block_id
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Get the prefix hash.
    pub fn prefix_hash(&self) -> Option<u64> {
        self.prefix_hash
    }

    /// Check if every slot has been written.
    pub fn is_full(&self) -> bool {
        self.tokens.len() >= self.block_size
    }

    /// Token ids written to this block.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Number of written slots.
    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Set the prefix hash.
    pub fn set_prefix_hash(&mut self, hash: u64) {
        self.prefix_hash = Some(hash);
    }

    /// Forget the prefix hash.
    pub fn clear_prefix_hash(&mut self) {
        self.prefix_hash = None;
    }

    /// Write `token` into `slot`, dropping anything written past it.
    pub(crate) fn write_slot(&mut self, slot: usize, token: u32) {
        self.tokens.truncate(slot);
        self.tokens.push(token);
    }

    /// Keep only the first `len` slots.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.tokens.truncate(len);
    }

    /// Replace the slot contents.
    pub(crate) fn set_tokens(&mut self, tokens: Vec<u32>) {
        self.tokens = tokens;
    }

    /// Increment reference count (when sharing with another sequence).
    pub fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Decrement reference count.
    ///
    /// # Returns
    ///
    /// The new reference count after decrementing.
    pub fn decrement_ref(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}

/// Maps a sequence's logical positions to physical block IDs.
///
/// Think of this like a page table in virtual memory:
/// - Logical block index: Position in the sequence (0, 1, 2, ...)
/// - Physical block ID: Actual block in the global cache pool
///
/// Token at position `p` is stored in:
/// - Logical block: `p / block_size`
/// - Slot within block: `p % block_size`
/// - Physical block: `block_ids[p / block_size]`
///
/// The table also counts the materialized tokens, so `num_blocks()` is always
/// `ceil(num_tokens() / block_size)` once the block manager has written them.
///
/// # Example
///
/// ```
/// use nano_genai::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
/// table.append_block(3);   // Tokens 32-47
///
/// // Token 20 -> logical block 1 -> physical block 12
/// assert_eq!(table.get_block_id(1).unwrap(), 12);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTable {
    /// Physical block IDs in logical order.
    block_ids: Vec<usize>,
    /// Number of tokens per block.
    block_size: usize,
    /// Number of token slots written through this table.
    num_tokens: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
            num_tokens: 0,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get physical block ID for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockIndexOutOfBounds`] if the logical block index
    /// is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<usize> {
        self.block_ids
            .get(logical_block_idx)
            .copied()
            .ok_or(Error::BlockIndexOutOfBounds {
                logical_idx: logical_block_idx,
                num_blocks: self.block_ids.len(),
            })
    }

    /// Add a new physical block to the table.
    pub fn append_block(&mut self, block_id: usize) {
        self.block_ids.push(block_id);
    }

    /// Rebind a logical block to another physical block.
    pub(crate) fn set_block_id(&mut self, logical_block_idx: usize, block_id: usize) {
        if let Some(slot) = self.block_ids.get_mut(logical_block_idx) {
            *slot = block_id;
        }
    }

    /// Drop logical blocks past `num_blocks`, returning the removed ids.
    pub(crate) fn truncate_blocks(&mut self, num_blocks: usize) -> Vec<usize> {
        if num_blocks >= self.block_ids.len() {
            return Vec::new();
        }
        self.block_ids.split_off(num_blocks)
    }

    pub(crate) fn set_num_tokens(&mut self, num_tokens: usize) {
        self.num_tokens = num_tokens;
    }

    /// Number of blocks allocated to this sequence.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Number of materialized tokens.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Physical id of the block holding the next written slot's predecessor.
    pub fn last_block_id(&self) -> Option<usize> {
        self.block_ids.last().copied()
    }

    /// Get all physical block IDs for this sequence.
    pub fn get_physical_block_ids(&self) -> &[usize] {
        &self.block_ids
    }

    /// Get physical slot indices for the first `seq_len` tokens.
    ///
    /// Global slot = `block_id * block_size + slot_within_block`
    pub fn get_slot_mapping(&self, seq_len: usize) -> Vec<usize> {
        self.slot_mapping_range(0, seq_len)
    }

    /// Physical slot indices for positions `start..end`.
    pub fn slot_mapping_range(&self, start: usize, end: usize) -> Vec<usize> {
        (start..end)
            .filter_map(|pos| {
                self.block_ids
                    .get(pos / self.block_size)
                    .map(|&block| block * self.block_size + pos % self.block_size)
            })
            .collect()
    }

    /// Clear all blocks from the table.
    pub fn clear(&mut self) {
        self.block_ids.clear();
        self.num_tokens = 0;
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use nano_genai::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);  // 35 tokens -> 3 blocks
/// assert_eq!(compute_num_blocks(32, 16), 2);  // 32 tokens -> 2 blocks exactly
/// assert_eq!(compute_num_blocks(0, 16), 0);   // 0 tokens -> 0 blocks
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}
