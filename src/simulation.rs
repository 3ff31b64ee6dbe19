//! Camera-walk workload.
//!
//! A camera circles over procedural terrain while its altitude oscillates.
//! Each frame it refines the quadtree around itself, acquires the resulting
//! tiles from the height producer (and the slope producer, if enabled),
//! schedules the ones not produced yet and releases the previous frame's
//! tiles. Tiles that leave the view stay in the cache as unused tiles until
//! their slots are needed.

use std::collections::HashSet;
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, Tile, TileCache, TileCoord};
use crate::config::SimulateConfig;
use crate::error::SimulationError;
use crate::layer::SlopeLayer;
use crate::producer::{NoiseGenerator, TileProducer};
use crate::scheduler::{ImmediateScheduler, Scheduler, WorkerScheduler};
use crate::storage::TileStorage;
use crate::task::CURRENT_FRAME;

/// A tile is split when the camera is closer than this many tile widths.
pub const SPLIT_FACTOR: f64 = 1.5;

/// Radius of the camera's circular path, in root tile units.
const PATH_RADIUS: f64 = 0.3;

const MIN_ALTITUDE: f64 = 0.01;
const MAX_ALTITUDE: f64 = 0.1;

// =============================================================================
// Camera
// =============================================================================

/// Camera position, in root tile units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Camera {
    pub x: f64,
    pub y: f64,
    pub altitude: f64,
}

impl Camera {
    /// Camera position at `frame` of a walk lasting `frames` frames.
    pub fn at(frame: u32, frames: u32) -> Self {
        let t = TAU * f64::from(frame) / f64::from(frames.max(1));
        let wave = 0.5 * (1.0 + (3.0 * t).sin());
        Self {
            x: 0.5 + PATH_RADIUS * t.cos(),
            y: 0.5 + PATH_RADIUS * t.sin(),
            altitude: MIN_ALTITUDE + (MAX_ALTITUDE - MIN_ALTITUDE) * wave,
        }
    }

    /// Distance to the closest point of `coord`'s square on the ground.
    pub fn distance_to(&self, coord: TileCoord) -> f64 {
        let size = 1.0 / f64::from(TileCoord::tiles_per_side(coord.level));
        let (x0, y0) = (f64::from(coord.tx) * size, f64::from(coord.ty) * size);
        let dx = (x0 - self.x).max(self.x - (x0 + size)).max(0.0);
        let dy = (y0 - self.y).max(self.y - (y0 + size)).max(0.0);
        (dx * dx + dy * dy + self.altitude * self.altitude).sqrt()
    }

    /// Tiles of the refined quadtree around the camera, parents first.
    ///
    /// Includes every inner node: renderers fall back to them while the
    /// finer tiles are produced.
    pub fn visible_tiles(&self, levels: u32) -> Vec<TileCoord> {
        let mut visible = Vec::new();
        let mut stack = vec![TileCoord::ROOT];
        while let Some(coord) = stack.pop() {
            visible.push(coord);
            let size = 1.0 / f64::from(TileCoord::tiles_per_side(coord.level));
            if coord.level + 1 < levels && self.distance_to(coord) < SPLIT_FACTOR * size {
                stack.extend(coord.children().into_iter().rev());
            }
        }
        visible
    }
}

// =============================================================================
// Report
// =============================================================================

/// State of one cache at the end of a simulation.
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub name: String,
    pub capacity: usize,
    pub used: usize,
    pub unused: usize,
    pub free_slots: usize,
    pub stats: CacheStats,
}

impl CacheReport {
    fn new(cache: &TileCache) -> Self {
        Self {
            name: cache.name().to_string(),
            capacity: cache.storage().capacity(),
            used: cache.used_count(),
            unused: cache.unused_count(),
            free_slots: cache.storage().free_slot_count(),
            stats: cache.stats(),
        }
    }
}

/// Outcome of [`run`].
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub frames: u32,
    pub levels: u32,
    pub tile_size: u32,
    pub workers: usize,
    pub prefetch: bool,

    /// Tiles requested over all frames and producers
    pub tiles_requested: u64,

    /// Requests refused because every slot was in use
    pub tiles_unavailable: u64,

    /// Largest visible set of a single frame
    pub peak_visible: usize,

    /// Tasks handed to the scheduler
    pub tasks_scheduled: u64,

    /// Tasks the scheduler ran
    pub tasks_executed: u64,

    /// Visible tiles whose content was produced by the end of their frame
    pub tiles_ready: u64,

    pub elapsed_ms: u64,

    pub heights: CacheReport,
    pub slopes: Option<CacheReport>,
}

// =============================================================================
// Runner
// =============================================================================

enum Executor {
    Immediate(Arc<ImmediateScheduler>),
    Workers(Arc<WorkerScheduler>),
}

impl Executor {
    fn new(workers: usize) -> Self {
        if workers == 0 {
            return Self::Immediate(Arc::new(ImmediateScheduler::new()));
        }
        match Handle::try_current() {
            Ok(handle) => Self::Workers(Arc::new(WorkerScheduler::new(&handle, workers))),
            Err(_) => {
                warn!(workers, "No Tokio runtime, running tasks inline");
                Self::Immediate(Arc::new(ImmediateScheduler::new()))
            }
        }
    }

    fn scheduler(&self) -> Arc<dyn Scheduler> {
        match self {
            Self::Immediate(s) => s.clone(),
            Self::Workers(s) => s.clone(),
        }
    }

    async fn wait_idle(&self) {
        if let Self::Workers(s) = self {
            s.wait_idle().await;
        }
    }

    fn executed_count(&self) -> u64 {
        match self {
            Self::Immediate(s) => s.executed_count(),
            Self::Workers(s) => s.executed_count(),
        }
    }

    fn shutdown(&self) {
        if let Self::Workers(s) = self {
            s.shutdown();
        }
    }
}

/// Tiles held for one frame, with the producer each came from.
#[derive(Default)]
struct Frame {
    tiles: Vec<(Arc<TileProducer>, Arc<Tile>)>,
}

impl Frame {
    fn release(self) {
        for (producer, tile) in self.tiles {
            producer.put_tile(&tile);
        }
    }
}

#[derive(Default)]
struct Counters {
    requested: u64,
    unavailable: u64,
    scheduled: u64,
    ready: u64,
    peak_visible: usize,
}

/// Runs the camera walk described by `config`.
///
/// Worker tasks are spawned on the current Tokio runtime.
pub async fn run(config: &SimulateConfig) -> Result<SimulationReport, SimulationError> {
    config.validate()?;
    let started = Instant::now();

    let executor = Executor::new(config.workers);
    let scheduler = executor.scheduler();

    let heights_cache = Arc::new(
        TileCache::new(
            Arc::new(TileStorage::new(config.tile_size, config.capacity)?),
            "heights",
        )
        .with_scheduler(Arc::clone(&scheduler)),
    );
    let noise = NoiseGenerator::new(config.seed, config.tile_size, config.border, config.levels - 1);
    let heights = TileProducer::builder(Arc::clone(&heights_cache), "heights")
        .generator(Arc::new(noise))
        .build();

    let slopes = if config.slope {
        let cache = Arc::new(
            TileCache::new(
                Arc::new(TileStorage::new(config.tile_size, config.capacity)?),
                "slopes",
            )
            .with_scheduler(Arc::clone(&scheduler)),
        );
        let layer = SlopeLayer::new(Arc::clone(&heights), 1.0);
        Some(
            TileProducer::builder(cache, "slopes")
                .layer(Arc::new(layer))
                .build(),
        )
    } else {
        None
    };

    let mut producers = vec![Arc::clone(&heights)];
    producers.extend(slopes.iter().cloned());

    info!(
        frames = config.frames,
        levels = config.levels,
        capacity = config.capacity,
        producers = producers.len(),
        workers = config.workers,
        "Starting simulation"
    );

    let mut counters = Counters::default();
    let mut previous = Frame::default();
    for frame in 0..config.frames {
        let camera = Camera::at(frame, config.frames);
        let visible = camera.visible_tiles(config.levels);
        counters.peak_visible = counters.peak_visible.max(visible.len());

        let mut current = Frame::default();
        for producer in &producers {
            for coord in &visible {
                counters.requested += 1;
                match producer.get_tile(coord.level, coord.tx, coord.ty, CURRENT_FRAME) {
                    Some(tile) => {
                        if !tile.is_done() {
                            scheduler.schedule(tile.task().as_task());
                            counters.scheduled += 1;
                        }
                        current.tiles.push((Arc::clone(producer), tile));
                    }
                    None => counters.unavailable += 1,
                }
            }
        }

        executor.wait_idle().await;
        counters.ready += current.tiles.iter().filter(|(_, t)| t.is_done()).count() as u64;

        previous.release();
        previous = current;

        if config.prefetch && frame + 1 < config.frames {
            let now: HashSet<_> = visible.into_iter().collect();
            let next = Camera::at(frame + 1, config.frames).visible_tiles(config.levels);
            let mut prefetched = 0usize;
            for coord in next.into_iter().filter(|c| !now.contains(c)) {
                for producer in &producers {
                    if producer.prefetch_tile(coord.level, coord.tx, coord.ty) {
                        prefetched += 1;
                    }
                }
            }
            debug!(frame, prefetched, "Prefetch requested");
        }

        debug!(
            frame,
            visible = previous.tiles.len(),
            used = heights_cache.used_count(),
            unused = heights_cache.unused_count(),
            "Frame done"
        );
    }

    previous.release();
    executor.wait_idle().await;

    if counters.unavailable > 0 {
        warn!(
            refused = counters.unavailable,
            "Some tiles were refused; consider a larger capacity"
        );
    }

    let report = SimulationReport {
        frames: config.frames,
        levels: config.levels,
        tile_size: config.tile_size,
        workers: config.workers,
        prefetch: config.prefetch,
        tiles_requested: counters.requested,
        tiles_unavailable: counters.unavailable,
        peak_visible: counters.peak_visible,
        tasks_scheduled: counters.scheduled,
        tasks_executed: executor.executed_count(),
        tiles_ready: counters.ready,
        elapsed_ms: started.elapsed().as_millis() as u64,
        heights: CacheReport::new(&heights_cache),
        slopes: slopes.as_ref().map(|p| CacheReport::new(p.cache())),
    };
    executor.shutdown();

    info!(
        requested = report.tiles_requested,
        hit_rate = report.heights.stats.hit_rate(),
        elapsed_ms = report.elapsed_ms,
        "Simulation finished"
    );
    Ok(report)
}
