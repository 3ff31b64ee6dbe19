//! Producer and layer integration tests.
//!
//! Tests verify:
//! - Slope tiles are derived from height tiles through task graphs
//! - An evicted slope graph comes back with its dependency edges
//! - Layer hooks fire on first use and last release
//! - Prefetch falls back to layers without a prefetching scheduler
//! - GPU coordinates resolve to resident ancestors
//! - Dropping a producer releases its cache entries

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use quadtile::{
    decode_heights, execute, CreateContext, NoiseGenerator, Reason, SlopeLayer, SlotState,
    TaskState, TileCache, TileCoord, TileLayer, TileProducer, CURRENT_FRAME,
};

use super::test_utils::{assert_capacity_conserved, counting_producer, storage};

fn terrain(size: u32, capacity: usize) -> (Arc<TileProducer>, Arc<TileProducer>) {
    let heights_cache = Arc::new(TileCache::new(storage(size, capacity), "heights"));
    let slopes_cache = Arc::new(TileCache::new(storage(size, capacity), "slopes"));
    let heights = TileProducer::builder(heights_cache, "heights")
        .generator(Arc::new(NoiseGenerator::new(5, size, 1, 8)))
        .build();
    let slopes = TileProducer::builder(slopes_cache, "slopes")
        .layer(Arc::new(SlopeLayer::new(Arc::clone(&heights), 1000.0)))
        .build();
    (heights, slopes)
}

// =============================================================================
// Slope Layer
// =============================================================================

#[test]
fn test_slope_tile_depends_on_height_tile() {
    let (heights, slopes) = terrain(10, 8);
    let tile = slopes.get_tile(1, 1, 0, CURRENT_FRAME).unwrap();
    let graph = tile.task().graph().expect("slope tiles use task graphs");
    assert_eq!(graph.graph().len(), 2);

    let source = heights.find_tile(1, 1, 0, false, false).unwrap();
    assert_eq!(source.users(), 1);
    assert!(!source.is_done());

    assert!(execute(tile.task().as_task().as_ref()));
    assert!(source.is_done());
    assert_eq!(source.users(), 0);

    let slope = decode_heights(&tile.data());
    assert_eq!(slope.len(), 100);
    assert!(slope.iter().all(|s| s.is_finite() && *s >= 0.0));
    assert!(slope.iter().any(|s| *s > 0.0));

    slopes.put_tile(&tile);
    assert_capacity_conserved(heights.cache());
    assert_capacity_conserved(slopes.cache());
}

#[test]
fn test_slope_tiles_share_height_tiles() {
    let (heights, slopes) = terrain(6, 8);
    let a = slopes.get_tile(2, 3, 3, CURRENT_FRAME).unwrap();
    let b = heights.get_tile(2, 3, 3, CURRENT_FRAME).unwrap();
    assert_eq!(b.users(), 2);
    assert_eq!(heights.cache().stats().misses, 1);

    execute(b.task().as_task().as_ref());
    // The dependency is already done: only the slope task runs.
    assert!(execute(a.task().as_task().as_ref()));
    assert_eq!(heights.put_tile(&b), 0);
    slopes.put_tile(&a);
}

#[test]
fn test_evicted_slope_graph_is_restored_on_return() {
    let heights_cache = Arc::new(TileCache::new(storage(6, 8), "heights"));
    let slopes_cache = Arc::new(TileCache::new(storage(6, 1), "slopes"));
    let heights = TileProducer::builder(heights_cache, "heights")
        .generator(Arc::new(NoiseGenerator::new(5, 6, 1, 8)))
        .build();
    let layer = Arc::new(SlopeLayer::new(Arc::clone(&heights), 1000.0));
    let slopes = TileProducer::builder(slopes_cache, "slopes")
        .layer(layer.clone())
        .build();

    let tile = slopes.get_tile(1, 0, 0, CURRENT_FRAME).unwrap();
    let held = tile.task().clone();
    let graph = Arc::clone(held.graph().expect("slope tiles use task graphs"));
    let edges = graph.graph().edges();
    assert_eq!(edges.len(), 1);
    execute(tile.task().as_task().as_ref());
    assert_eq!(layer.held_count(), 0);
    slopes.put_tile(&tile);
    drop(tile);

    // The only slope slot goes to another tile.
    let other = slopes.get_tile(1, 1, 0, CURRENT_FRAME).unwrap();
    assert!(graph.graph().is_released());
    assert!(graph.graph().edges().is_empty());
    assert_eq!(slopes.cache().deleted_count(), 1);
    slopes.put_tile(&other);
    drop(other);

    let back = slopes.get_tile(1, 0, 0, 3).unwrap();
    assert_eq!(back.task().id(), held.id());
    assert!(!graph.graph().is_released());
    assert_eq!(graph.graph().edges(), edges);
    assert_eq!(
        back.task().as_task().state(),
        TaskState::Pending(Reason::DataNeeded)
    );
    assert_eq!(layer.held_count(), 1);
    assert_eq!(slopes.cache().stats().resurrections, 1);

    assert!(execute(back.task().as_task().as_ref()));
    assert!(back.is_done());
    assert_eq!(decode_heights(&back.data()).len(), 36);
    assert_eq!(layer.held_count(), 0);
    slopes.put_tile(&back);
    assert_capacity_conserved(heights.cache());
    assert_capacity_conserved(slopes.cache());
}

// =============================================================================
// Layer Hooks
// =============================================================================

#[derive(Default)]
struct Hooks {
    used: AtomicUsize,
    unused: AtomicUsize,
    prefetched: AtomicUsize,
}

impl TileLayer for Hooks {
    fn use_tile(&self, _coord: TileCoord, _deadline: u32) {
        self.used.fetch_add(1, Ordering::SeqCst);
    }

    fn unuse_tile(&self, _coord: TileCoord) {
        self.unused.fetch_add(1, Ordering::SeqCst);
    }

    fn prefetch_tile(&self, _coord: TileCoord) -> bool {
        self.prefetched.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn do_create_tile(&self, _ctx: &CreateContext<'_>, _slot: &mut SlotState) -> bool {
        false
    }
}

#[test]
fn test_layer_hooks_on_first_and_last_user() {
    let hooks = Arc::new(Hooks::default());
    let cache = Arc::new(TileCache::new(storage(8, 4), "hooks"));
    let producer = TileProducer::builder(cache, "hooks")
        .layer(hooks.clone())
        .build();

    let a = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    let b = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    producer.put_tile(&a);
    assert_eq!(hooks.used.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.unused.load(Ordering::SeqCst), 0);

    producer.put_tile(&b);
    assert_eq!(hooks.unused.load(Ordering::SeqCst), 1);

    // Coming back from the unused set counts as a first use again.
    let c = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    assert_eq!(hooks.used.load(Ordering::SeqCst), 2);
    producer.put_tile(&c);
}

#[test]
fn test_prefetch_falls_back_to_layers() {
    let hooks = Arc::new(Hooks::default());
    let cache = Arc::new(TileCache::new(storage(8, 4), "hooks"));
    let producer = TileProducer::builder(cache, "hooks")
        .layer(hooks.clone())
        .build();

    assert!(producer.prefetch_tile(3, 1, 1));
    assert_eq!(hooks.prefetched.load(Ordering::SeqCst), 1);
    assert_eq!(producer.cache().unused_count(), 0);
}

// =============================================================================
// GPU Coordinates
// =============================================================================

#[test]
fn test_gpu_coords_follow_production() {
    let (producer, _) = counting_producer(8);
    let root = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    let child = producer.get_tile(1, 0, 1, CURRENT_FRAME).unwrap();
    execute(root.task().as_task().as_ref());

    // The child is not produced yet: sample the root's lower-left quarter.
    let coords = producer.gpu_tile_coords(1, 0, 1).unwrap();
    assert_eq!(coords.tile.id(), root.id());
    assert!((coords.scale - 0.5).abs() < 1e-6);
    assert!(coords.offset_u.abs() < 1e-6);
    assert!((coords.offset_v - 0.5).abs() < 1e-6);

    execute(child.task().as_task().as_ref());
    let coords = producer.gpu_tile_coords(1, 0, 1).unwrap();
    assert_eq!(coords.tile.id(), child.id());
    assert!((coords.scale - 1.0).abs() < 1e-6);
    assert_eq!(child.users(), 1);
}

// =============================================================================
// Producer Lifetime
// =============================================================================

#[test]
fn test_dropping_producer_purges_unused_tiles() {
    let cache = Arc::new(TileCache::new(storage(8, 4), "shared"));
    let (first, _) = super::test_utils::counting_producer_on(Arc::clone(&cache));
    let (second, _) = super::test_utils::counting_producer_on(Arc::clone(&cache));
    assert_ne!(first.id(), second.id());
    assert_eq!(cache.producer_count(), 2);

    let a = first.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    let b = second.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    assert_ne!(a.id(), b.id());
    first.put_tile(&a);
    drop(a);
    drop(first);

    assert_eq!(cache.producer_count(), 1);
    assert_eq!(cache.unused_count(), 0);
    assert_eq!(cache.used_count(), 1);
    assert_capacity_conserved(&cache);
    second.put_tile(&b);
}
