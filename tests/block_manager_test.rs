//! Integration tests for BlockManager.

use nano_genai::core::block::{hash_full_blocks, hash_token_block, BlockTable};
use nano_genai::core::block_manager::BlockManager;
use nano_genai::Error;

fn filled(manager: &mut BlockManager, tokens: &[u32]) -> BlockTable {
    let mut table = BlockTable::new(manager.block_size());
    for &token in tokens {
        manager.append_token(&mut table, token).unwrap();
    }
    table
}

fn assert_accounted(manager: &BlockManager) {
    assert_eq!(
        manager.num_used_blocks() + manager.num_free_blocks(),
        manager.num_blocks()
    );
}

#[test]
fn test_allocate_and_free() {
    let mut manager = BlockManager::new(10, 16);

    let block_id = manager.allocate().unwrap();
    assert_eq!(manager.num_free_blocks(), 9);
    assert_eq!(manager.num_used_blocks(), 1);
    assert_eq!(manager.get_block(block_id).unwrap().ref_count(), 1);

    assert!(manager.free(block_id));
    assert_eq!(manager.num_free_blocks(), 10);
    assert!(manager.get_block(block_id).is_none());

    // Freeing twice is harmless
    assert!(!manager.free(block_id));
    assert_accounted(&manager);
}

#[test]
fn test_allocate_many_is_all_or_nothing() {
    let mut manager = BlockManager::new(10, 16);

    assert_eq!(manager.allocate_many(5).unwrap().len(), 5);
    assert!(matches!(
        manager.allocate_many(6),
        Err(Error::OutOfCache {
            requested: 6,
            available: 5
        })
    ));
    assert_eq!(manager.num_free_blocks(), 5);
}

#[test]
fn test_reference_counting() {
    let mut manager = BlockManager::new(10, 16);
    let block_id = manager.allocate().unwrap();

    assert_eq!(manager.increment_ref(block_id), Some(2));
    assert_eq!(manager.increment_ref(block_id), Some(3));

    assert!(!manager.free(block_id));
    assert!(!manager.free(block_id));
    assert_eq!(manager.num_used_blocks(), 1);

    assert!(manager.free(block_id));
    assert_eq!(manager.num_free_blocks(), 10);
}

#[test]
fn test_append_grows_one_block_at_a_time() {
    let mut manager = BlockManager::new(8, 4);
    let table = filled(&mut manager, &[1, 2, 3, 4, 5]);

    assert_eq!(table.num_tokens(), 5);
    assert_eq!(table.num_blocks(), 2);
    assert_eq!(manager.read_tokens(&table), vec![1, 2, 3, 4, 5]);
    assert_accounted(&manager);
}

#[test]
fn test_fork_shares_then_copies_on_write() {
    let mut manager = BlockManager::new(8, 4);
    let mut parent = filled(&mut manager, &[1, 2, 3, 4, 5, 6]);
    let mut child = manager.fork(&parent);
    manager.take_ops();

    // Both tables point at the same physical blocks
    assert_eq!(parent.get_physical_block_ids(), child.get_physical_block_ids());
    assert_eq!(manager.num_used_blocks(), 2);

    manager.append_token(&mut child, 70).unwrap();
    manager.append_token(&mut parent, 7).unwrap();

    let ops = manager.take_ops();
    assert_eq!(ops.copies.len(), 1);
    // The full first block stays shared
    assert_eq!(parent.get_block_id(0).unwrap(), child.get_block_id(0).unwrap());
    assert_ne!(parent.get_block_id(1).unwrap(), child.get_block_id(1).unwrap());

    assert_eq!(manager.read_tokens(&parent), vec![1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(manager.read_tokens(&child), vec![1, 2, 3, 4, 5, 6, 70]);
    assert_eq!(manager.num_used_blocks(), 3);

    manager.free_table(&mut parent);
    manager.free_table(&mut child);
    assert_eq!(manager.num_free_blocks(), 8);
}

#[test]
fn test_failed_append_leaves_table_unchanged() {
    let mut manager = BlockManager::new(1, 2);
    let mut table = filled(&mut manager, &[1, 2]);

    assert!(manager.append_token(&mut table, 3).is_err());
    assert_eq!(table.num_tokens(), 2);
    assert_eq!(table.num_blocks(), 1);
}

#[test]
fn test_truncate_releases_tail_blocks() {
    let mut manager = BlockManager::new(8, 4);
    let mut table = filled(&mut manager, &[1, 2, 3, 4, 5, 6]);

    manager.truncate(&mut table, 3);
    assert_eq!(table.num_tokens(), 3);
    assert_eq!(table.num_blocks(), 1);
    assert_eq!(manager.num_free_blocks(), 7);

    manager.append_token(&mut table, 9).unwrap();
    assert_eq!(manager.read_tokens(&table), vec![1, 2, 3, 9]);

    // Truncating past the end does nothing
    manager.truncate(&mut table, 10);
    assert_eq!(table.num_tokens(), 4);
}

#[test]
fn test_truncate_shared_block_copies_on_next_write() {
    let mut manager = BlockManager::new(8, 4);
    let parent = filled(&mut manager, &[1, 2, 3, 4]);
    let mut child = manager.fork(&parent);
    manager.take_ops();

    manager.truncate(&mut child, 2);
    manager.append_token(&mut child, 8).unwrap();

    assert_eq!(manager.take_ops().copies.len(), 1);
    assert_eq!(manager.read_tokens(&parent), vec![1, 2, 3, 4]);
    assert_eq!(manager.read_tokens(&child), vec![1, 2, 8]);
}

#[test]
fn test_swap_out_and_in_preserves_content() {
    let mut manager = BlockManager::with_swap_space(4, 2, 4);
    let parent = filled(&mut manager, &[1, 2, 3]);
    let child = manager.fork(&parent);
    let mut tables = vec![parent, child];

    assert!(manager.can_swap_out(&tables));
    let moved = manager.swap_out(&mut tables).unwrap();
    // Shared blocks move once
    assert_eq!(moved.len(), 2);
    assert_eq!(manager.num_free_blocks(), 4);
    assert_eq!(manager.num_free_host_blocks(), 2);

    let moved_back = manager.swap_in(&mut tables).unwrap();
    assert_eq!(moved_back.len(), 2);
    assert_eq!(manager.num_free_host_blocks(), 4);
    assert_eq!(manager.num_used_blocks(), 2);
    assert_eq!(manager.read_tokens(&tables[0]), vec![1, 2, 3]);
    assert_eq!(manager.read_tokens(&tables[1]), vec![1, 2, 3]);

    let ops = manager.take_ops();
    assert_eq!(ops.swap_out.len(), 2);
    assert_eq!(ops.swap_in.len(), 2);
}

#[test]
fn test_swap_out_needs_host_room() {
    let mut manager = BlockManager::with_swap_space(4, 2, 1);
    let table = filled(&mut manager, &[1, 2, 3]);
    let mut tables = vec![table];

    assert!(!manager.can_swap_out(&tables));
    assert!(matches!(
        manager.swap_out(&mut tables),
        Err(Error::OutOfCache { .. })
    ));
}

#[test]
fn test_free_host_table() {
    let mut manager = BlockManager::with_swap_space(4, 2, 4);
    let table = filled(&mut manager, &[1, 2, 3]);
    let mut tables = vec![table];
    manager.swap_out(&mut tables).unwrap();

    assert_eq!(manager.free_host_table(&mut tables[0]), 2);
    assert_eq!(manager.num_free_host_blocks(), 4);
    assert!(tables[0].is_empty());
}

#[test]
fn test_prefix_cache_hit() {
    let mut manager = BlockManager::new(10, 16);
    let hash = hash_token_block(&[1, 2, 3, 4], None);

    let (block_id, cached) = manager.allocate_with_prefix(hash).unwrap();
    assert!(!cached);

    let (again, cached) = manager.allocate_with_prefix(hash).unwrap();
    assert!(cached);
    assert_eq!(again, block_id);
    assert_eq!(manager.get_block(block_id).unwrap().ref_count(), 2);
    assert_eq!(manager.num_cached_prefixes(), 1);
}

#[test]
fn test_peek_prefix_counts_leading_hits() {
    let mut manager = BlockManager::new(8, 2);
    let mut table = filled(&mut manager, &[1, 2, 3, 4]);
    let hashes = hash_full_blocks(&[1, 2, 3, 4, 5, 6], 2);
    manager.cache_block(table.get_block_id(0).unwrap(), hashes[0]);
    manager.cache_block(table.get_block_id(1).unwrap(), hashes[1]);

    let hit = manager.peek_prefix(&hashes);
    assert_eq!(hit.num_blocks, 2);
    assert_eq!(hit.num_in_use, 2);

    // Unreferenced cached blocks still hit but are no longer in use
    manager.free_table(&mut table);
    let hit = manager.peek_prefix(&hashes);
    assert_eq!(hit.num_blocks, 2);
    assert_eq!(hit.num_in_use, 0);
    assert_eq!(manager.num_evictable_blocks(), 2);
    assert_accounted(&manager);
}

#[test]
fn test_reset() {
    let mut manager = BlockManager::new(4, 2);
    let _table = filled(&mut manager, &[1, 2, 3]);
    manager.reset();
    assert_eq!(manager.num_free_blocks(), 4);
    assert_eq!(manager.num_used_blocks(), 0);
    assert!(manager.take_ops().is_empty());
}
