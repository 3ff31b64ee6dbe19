//! # quadtile
//!
//! A cache of quadtree tiles backed by a fixed pool of storage slots.
//!
//! Tiles are identified by the producer that creates them and their
//! `(level, tx, ty)` coordinates. Callers acquire tiles from a
//! [`TileProducer`] and release them when done; released tiles stay cached
//! until their slot is needed for another tile. Tile content is written by
//! tasks that a [`Scheduler`] runs, possibly after the tasks of the tiles
//! they depend on.
//!
//! ## Architecture
//!
//! - [`storage`] - Fixed pool of tile slots
//! - [`task`] - Tasks, deadlines and task graphs
//! - [`scheduler`] - Inline and Tokio worker schedulers
//! - [`cache`] - Tile identity, reference counts and LRU eviction
//! - [`producer`] - Tile producers and their production tasks
//! - [`layer`] - Extensions hooked into a producer's tile lifecycle
//! - [`simulation`] - Camera-walk workload used by the binary
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use quadtile::{execute, NoiseGenerator, TileCache, TileProducer, TileStorage, CURRENT_FRAME};
//!
//! let storage = Arc::new(TileStorage::new(16, 32).unwrap());
//! let cache = Arc::new(TileCache::new(storage, "heights"));
//! let producer = TileProducer::builder(cache, "heights")
//!     .generator(Arc::new(NoiseGenerator::new(7, 16, 1, 10)))
//!     .build();
//!
//! let tile = producer.get_tile(2, 1, 3, CURRENT_FRAME).unwrap();
//! execute(tile.task().as_task().as_ref());
//! assert!(tile.is_done());
//! assert_eq!(tile.data().len(), 16 * 16 * 4);
//!
//! producer.put_tile(&tile);
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod layer;
pub mod producer;
pub mod scheduler;
pub mod simulation;
pub mod storage;
pub mod task;

// Re-export commonly used types
pub use cache::{CacheStats, ProducerId, Tile, TileCache, TileCoord, TileId};
pub use config::{Cli, Command, OutputFormat, SimulateConfig, StorageBudget};
pub use error::{ConfigError, GraphError, SimulationError, StorageError};
pub use layer::{LayerBinding, SlopeLayer, TileLayer};
pub use producer::{
    decode_heights, CreateContext, CreateTileTask, CreateTileTaskGraph, GpuTileCoords,
    NoiseGenerator, TileGenerator, TileProducer, TileProducerBuilder, TileTask,
};
pub use scheduler::{ImmediateScheduler, Scheduler, WorkerScheduler};
pub use simulation::{Camera, CacheReport, SimulationReport};
pub use storage::{Slot, SlotState, TileStorage};
pub use task::{
    execute, Deadline, NodeId, Reason, Task, TaskGraph, TaskId, TaskState, TaskStatus,
    BACKGROUND_DEADLINE, CURRENT_FRAME,
};
