//! Scheduler and simulation integration tests.
//!
//! Tests verify:
//! - Concurrent callers and worker tasks keep the cache consistent
//! - Rescheduled tasks run again on the workers
//! - The camera walk completes inline and on workers

use std::sync::Arc;

use tokio::runtime::Handle;

use quadtile::simulation;
use quadtile::{
    ImmediateScheduler, Scheduler, SimulateConfig, TileCache, WorkerScheduler, CURRENT_FRAME,
};

use super::test_utils::{assert_capacity_conserved, counting_producer_on, storage};

// =============================================================================
// Worker Scheduler
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_with_workers() {
    let scheduler = Arc::new(WorkerScheduler::new(&Handle::current(), 3));
    let cache = Arc::new(
        TileCache::new(storage(8, 64), "concurrent").with_scheduler(scheduler.clone()),
    );
    let (producer, generator) = counting_producer_on(cache);

    let mut callers = Vec::new();
    for caller in 0..4u32 {
        let producer = Arc::clone(&producer);
        let scheduler = Arc::clone(&scheduler);
        callers.push(tokio::task::spawn_blocking(move || {
            for round in 0..50u32 {
                let (tx, ty) = ((caller + round) % 8, round % 8);
                if let Some(tile) = producer.get_tile(3, tx, ty, CURRENT_FRAME) {
                    if !tile.is_done() {
                        scheduler.schedule(tile.task().as_task());
                    }
                    producer.put_tile(&tile);
                }
            }
        }));
    }
    for caller in callers {
        caller.await.unwrap();
    }
    scheduler.wait_idle().await;

    let cache = producer.cache();
    assert_eq!(cache.used_count(), 0);
    assert_capacity_conserved(cache);
    let cached = cache.unused_tiles();
    assert!(!cached.is_empty());
    for id in &cached {
        let c = id.coord;
        assert!(producer.find_tile(c.level, c.tx, c.ty, true, true).is_some());
    }
    assert!(generator.created() >= cached.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalidated_tiles_rerun_on_workers() {
    let scheduler = Arc::new(WorkerScheduler::new(&Handle::current(), 2));
    let cache = Arc::new(TileCache::new(storage(8, 8), "rerun").with_scheduler(scheduler.clone()));
    let (producer, generator) = counting_producer_on(cache);

    let tiles: Vec<_> = (0..4)
        .filter_map(|tx| producer.get_tile(2, tx, 0, CURRENT_FRAME))
        .collect();
    for tile in &tiles {
        scheduler.schedule(tile.task().as_task());
    }
    scheduler.wait_idle().await;
    assert_eq!(generator.created(), 4);

    assert_eq!(producer.invalidate_tiles(), 4);
    scheduler.wait_idle().await;
    assert!(tiles.iter().all(|t| t.is_done()));
    assert_eq!(generator.created(), 8);

    for tile in &tiles {
        producer.put_tile(tile);
    }
    scheduler.shutdown();
    assert!(scheduler.is_shutdown());
}

#[test]
fn test_immediate_scheduler_runs_on_reschedule() {
    let scheduler = Arc::new(ImmediateScheduler::new());
    let cache = Arc::new(TileCache::new(storage(8, 4), "inline").with_scheduler(scheduler.clone()));
    let (producer, generator) = counting_producer_on(cache);

    let tile = producer.get_tile(0, 0, 0, CURRENT_FRAME).unwrap();
    scheduler.schedule(tile.task().as_task());
    assert!(tile.is_done());

    producer.invalidate_tile(0, 0, 0);
    assert!(tile.is_done());
    assert_eq!(generator.created(), 2);
    assert_eq!(scheduler.executed_count(), 2);
    assert!(!scheduler.supports_prefetch(false));
}

// =============================================================================
// Simulation
// =============================================================================

fn small_config() -> SimulateConfig {
    SimulateConfig {
        tile_size: 8,
        border: 1,
        capacity: 128,
        levels: 4,
        frames: 12,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_simulation_inline_with_slope() {
    let config = SimulateConfig {
        workers: 0,
        slope: true,
        ..small_config()
    };
    let report = simulation::run(&config).await.unwrap();

    let slopes = report.slopes.as_ref().expect("slope cache report");
    assert_eq!(report.tiles_unavailable, 0);
    assert_eq!(report.tiles_ready, report.tiles_requested);
    assert_eq!(report.heights.used, 0);
    assert_eq!(slopes.used, 0);
    assert!(slopes.stats.misses > 0);
    assert!(report.heights.stats.hits + report.heights.stats.unused_hits > 0);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["frames"], 12);
    assert!(json["heights"]["stats"]["misses"].as_u64().unwrap() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simulation_on_workers_with_prefetch() {
    let config = SimulateConfig {
        workers: 2,
        slope: true,
        prefetch: true,
        ..small_config()
    };
    let report = simulation::run(&config).await.unwrap();

    assert_eq!(report.workers, 2);
    assert_eq!(report.tiles_unavailable, 0);
    assert_eq!(report.tiles_ready, report.tiles_requested);
    assert!(report.heights.stats.prefetches > 0);
    assert_eq!(report.heights.used, 0);
}

#[tokio::test]
async fn test_simulation_under_memory_pressure() {
    let config = SimulateConfig {
        workers: 0,
        capacity: 40,
        levels: 5,
        ..small_config()
    };
    let report = simulation::run(&config).await.unwrap();

    assert!(report.heights.stats.evictions > 0);
    assert_eq!(report.heights.used, 0);
    assert_eq!(
        report.heights.unused + report.heights.free_slots,
        report.heights.capacity
    );
}
