//! Tile cache integration tests.
//!
//! Tests verify:
//! - Storage exhaustion and eviction of released tiles
//! - Strict LRU eviction order
//! - Resurrection of tasks whose tiles were evicted
//! - Invalidation leaves membership and user counts alone
//! - Invalidation reaches tasks of evicted tiles
//! - Prefetching into the unused set

use std::sync::Arc;

use quadtile::{execute, Reason, TaskState, TileCoord, BACKGROUND_DEADLINE, CURRENT_FRAME};

use super::test_utils::{
    assert_capacity_conserved, content_of, counting_producer, scheduled_producer, Call,
    RecordingScheduler,
};

// =============================================================================
// Exhaustion and Eviction
// =============================================================================

#[test]
fn test_exhausted_storage_returns_none() {
    let (producer, _) = counting_producer(2);
    let a = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    let b = producer.get_tile(1, 0, 0, CURRENT_FRAME).unwrap();
    assert_eq!(a.users(), 1);
    assert_eq!(b.users(), 1);

    assert!(producer.get_tile(1, 0, 1, CURRENT_FRAME).is_none());
    assert_eq!(producer.cache().stats().exhausted, 1);
    assert_capacity_conserved(producer.cache());
}

#[test]
fn test_released_tile_is_evicted_for_new_tile() {
    let (producer, _) = counting_producer(2);
    let a = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    let _b = producer.get_tile(1, 0, 0, CURRENT_FRAME).unwrap();
    let a_slot = a.slot().index();

    assert_eq!(producer.put_tile(&a), 0);
    assert_eq!(producer.cache().unused_count(), 1);

    let c = producer.get_tile(1, 0, 1, CURRENT_FRAME).unwrap();
    assert_eq!(c.users(), 1);
    assert_eq!(c.slot().index(), a_slot);
    assert_eq!(producer.cache().unused_count(), 0);
    assert_eq!(producer.cache().stats().evictions, 1);
    assert!(producer.find_tile(0, 0, 0, true, false).is_none());
    assert_capacity_conserved(producer.cache());
}

#[test]
fn test_evicted_tile_comes_back_as_new_tile() {
    let (producer, generator) = counting_producer(2);
    let a = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    execute(a.task().as_task().as_ref());
    let b = producer.get_tile(1, 0, 0, CURRENT_FRAME).unwrap();
    producer.put_tile(&a);
    let c = producer.get_tile(1, 0, 1, CURRENT_FRAME).unwrap();
    let old_task = a.task().id();
    drop(a);

    producer.put_tile(&b);
    let again = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    assert_ne!(again.task().id(), old_task);
    assert!(!again.is_done());

    execute(again.task().as_task().as_ref());
    assert_eq!(&again.data()[..], &content_of(TileCoord::ROOT)[..]);
    assert_eq!(generator.created(), 2);
    producer.put_tile(&c);
    producer.put_tile(&again);
    assert_capacity_conserved(producer.cache());
}

#[test]
fn test_lru_eviction_order() {
    let (producer, _) = counting_producer(3);
    let a = producer.get_tile(2, 0, 0, CURRENT_FRAME).unwrap();
    let b = producer.get_tile(2, 1, 0, CURRENT_FRAME).unwrap();
    let c = producer.get_tile(2, 2, 0, CURRENT_FRAME).unwrap();
    producer.put_tile(&a);
    producer.put_tile(&b);
    producer.put_tile(&c);

    // A gets used and released again: it is now the most recent.
    let a = producer.get_tile(2, 0, 0, CURRENT_FRAME).unwrap();
    producer.put_tile(&a);

    let evicted_in_order = [(1, 0), (2, 0), (0, 0)];
    for (k, (tx, ty)) in evicted_in_order.into_iter().enumerate() {
        assert!(producer.get_tile(3, k as u32, 7, CURRENT_FRAME).is_some());
        assert!(producer.find_tile(2, tx, ty, true, false).is_none());
    }
    assert_eq!(producer.cache().unused_count(), 0);
    assert_eq!(producer.cache().stats().evictions, 3);
}

#[test]
fn test_shared_tile_stays_used_until_last_put() {
    let (producer, _) = counting_producer(2);
    let first = producer.get_tile(1, 1, 1, CURRENT_FRAME).unwrap();
    let second = producer.get_tile(1, 1, 1, CURRENT_FRAME).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.users(), 2);

    assert_eq!(producer.put_tile(&first), 1);
    assert_eq!(producer.cache().used_count(), 1);
    assert_eq!(producer.put_tile(&second), 0);
    assert_eq!(producer.cache().used_count(), 0);
    assert_eq!(producer.cache().unused_count(), 1);

    let stats = producer.cache().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

// =============================================================================
// Resurrection
// =============================================================================

#[test]
fn test_resurrected_task_is_reused_and_rescheduled() {
    let scheduler = Arc::new(RecordingScheduler::default());
    let (producer, generator) = scheduled_producer(1, scheduler.clone());

    let tile = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    execute(tile.task().as_task().as_ref());
    let held = tile.task().clone();
    producer.put_tile(&tile);
    drop(tile);

    // Evict the root while its task is still referenced.
    let other = producer.get_tile(1, 0, 0, CURRENT_FRAME).unwrap();
    assert_eq!(producer.cache().deleted_count(), 1);
    producer.put_tile(&other);
    drop(other);

    let back = producer.get_tile(0, 0, 0, 5).unwrap();
    assert_eq!(back.task().id(), held.id());
    assert_eq!(
        back.task().as_task().state(),
        TaskState::Pending(Reason::DataNeeded)
    );
    assert_eq!(producer.cache().stats().resurrections, 1);
    assert!(scheduler
        .calls()
        .contains(&Call::Reschedule(held.id(), Reason::DataNeeded, 5)));

    // The reused task writes into its new slot.
    assert!(execute(back.task().as_task().as_ref()));
    assert_eq!(&back.data()[..], &content_of(TileCoord::ROOT)[..]);
    assert_eq!(generator.created(), 2);
}

#[test]
fn test_dropped_task_leaves_no_deleted_entry() {
    let (producer, _) = counting_producer(1);
    let tile = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    producer.put_tile(&tile);
    drop(tile);

    let _other = producer.get_tile(1, 0, 0, CURRENT_FRAME).unwrap();
    assert_eq!(producer.cache().deleted_count(), 0);
    assert_eq!(producer.cache().stats().evictions, 1);
}

// =============================================================================
// Invalidation
// =============================================================================

#[test]
fn test_invalidation_keeps_membership() {
    let (producer, _) = counting_producer(4);
    let used = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    let unused = producer.get_tile(1, 1, 0, CURRENT_FRAME).unwrap();
    execute(used.task().as_task().as_ref());
    execute(unused.task().as_task().as_ref());
    producer.put_tile(&unused);

    assert_eq!(producer.invalidate_tiles(), 2);
    assert_eq!(used.users(), 1);
    assert_eq!(producer.cache().used_count(), 1);
    assert_eq!(producer.cache().unused_count(), 1);
    for tile in [&used, &unused] {
        assert_eq!(
            tile.task().as_task().state(),
            TaskState::Pending(Reason::DataChanged)
        );
    }
    assert_eq!(producer.cache().stats().invalidations, 2);
}

#[test]
fn test_invalidation_reaches_tasks_of_evicted_tiles() {
    let (producer, _) = counting_producer(1);
    let tile = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    execute(tile.task().as_task().as_ref());
    let held = tile.task().clone();
    producer.put_tile(&tile);
    drop(tile);

    let other = producer.get_tile(1, 0, 0, CURRENT_FRAME).unwrap();
    execute(other.task().as_task().as_ref());
    assert_eq!(producer.cache().deleted_count(), 1);
    assert!(held.is_done());

    assert_eq!(producer.invalidate_tiles(), 2);
    for task in [&held, other.task()] {
        assert_eq!(
            task.as_task().state(),
            TaskState::Pending(Reason::DataChanged)
        );
    }
    assert_eq!(producer.cache().used_count(), 1);
    assert_eq!(producer.cache().deleted_count(), 1);

    // The evicted tile alone.
    execute(held.as_task().as_ref());
    assert!(producer.invalidate_tile(0, 0, 0));
    assert!(!held.is_done());
    assert_eq!(producer.cache().stats().invalidations, 3);
}

#[test]
fn test_invalidate_single_tile_through_scheduler() {
    let scheduler = Arc::new(RecordingScheduler::default());
    let (producer, _) = scheduled_producer(4, scheduler.clone());
    let tile = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    let sibling = producer.get_tile(1, 0, 0, CURRENT_FRAME).unwrap();
    execute(tile.task().as_task().as_ref());
    execute(sibling.task().as_task().as_ref());

    assert!(producer.invalidate_tile(0, 0, 0));
    assert!(!tile.is_done());
    assert!(sibling.is_done());
    assert!(scheduler.calls().contains(&Call::Reschedule(
        tile.task().id(),
        Reason::DataChanged,
        BACKGROUND_DEADLINE
    )));

    assert!(!producer.invalidate_tile(4, 0, 0));
}

// =============================================================================
// Prefetch
// =============================================================================

#[test]
fn test_prefetch_warms_unused_set() {
    let scheduler = Arc::new(RecordingScheduler::with_prefetch());
    let (producer, _) = scheduled_producer(4, scheduler.clone());

    assert!(producer.prefetch_tile(2, 0, 0));
    assert_eq!(producer.cache().used_count(), 0);
    assert_eq!(producer.cache().unused_count(), 1);
    assert!(producer.find_tile(2, 0, 0, false, false).is_none());
    assert!(producer.find_tile(2, 0, 0, true, false).is_some());

    // Already cached: no-op.
    assert!(!producer.prefetch_tile(2, 0, 0));
    assert_eq!(producer.cache().stats().prefetches, 1);

    let tasks = scheduler.take_tasks();
    assert_eq!(tasks.len(), 1);
    execute(tasks[0].as_ref());

    let tile = producer.get_tile(2, 0, 0, CURRENT_FRAME).unwrap();
    assert!(tile.is_done());
    assert_eq!(producer.cache().stats().unused_hits, 1);
}

#[test]
fn test_prefetch_refused_without_support() {
    let scheduler = Arc::new(RecordingScheduler::default());
    let (producer, _) = scheduled_producer(4, scheduler.clone());
    assert!(!producer.prefetch_tile(2, 0, 0));
    assert_eq!(producer.cache().unused_count(), 0);
    assert!(scheduler.calls().is_empty());
}
