//! Tile producers.
//!
//! A [`TileProducer`] creates the tiles of one kind (elevation, normals,
//! slope...) for a [`TileCache`](crate::cache::TileCache) and is the entry
//! point callers use to acquire and release them.
//!
//! # Production pipeline
//!
//! Each tile's content is written by a [`CreateTileTask`]. Its phases fan out
//! to the producer's [`TileGenerator`] and then to each enabled
//! [`TileLayer`](crate::layer::TileLayer):
//!
//! 1. `start_create_tile`: acquire inputs, add dependency tasks
//! 2. `begin_create_tile`: set up the execution context
//! 3. `do_create_tile`: write the slot; the `changed` flags are OR-ed
//! 4. `end_create_tile`: restore the execution context
//! 5. `stop_create_tile`: release what `start_create_tile` acquired
//!
//! Producers whose tiles depend on other tiles wrap the task in a
//! [`CreateTileTaskGraph`] so the dependencies run first.

mod noise;
mod task;
mod tile_producer;

pub use noise::{decode_heights, NoiseGenerator};
pub(crate) use task::WeakTileTask;
pub use task::{CreateTileTask, CreateTileTaskGraph, TileTask};
pub use tile_producer::{GpuTileCoords, TileProducer, TileProducerBuilder};

use std::sync::Arc;

use tracing::warn;

use crate::cache::TileCoord;
use crate::storage::SlotState;
use crate::task::{Deadline, Task, TaskId};

/// Context handed to every production phase of one tile.
pub struct CreateContext<'a> {
    pub coord: TileCoord,
    pub deadline: Deadline,

    /// The task writing the tile, stable across the task's lifetime
    pub task: TaskId,

    graph: Option<&'a CreateTileTaskGraph>,
}

impl CreateContext<'_> {
    pub fn has_task_graph(&self) -> bool {
        self.graph.is_some()
    }

    /// Makes the tile's task run after `task`.
    ///
    /// Returns `false` if the tile is not produced by a task graph.
    pub fn add_dependency(&self, task: Arc<dyn Task>) -> bool {
        let Some(graph) = self.graph else {
            return false;
        };
        match graph.add_dependency(task) {
            Ok(_) => true,
            Err(e) => {
                warn!(tile = %self.coord, task = %self.task, error = %e, "Cannot add dependency");
                false
            }
        }
    }
}

/// A producer's own content generation.
///
/// Only [`do_create_tile`](Self::do_create_tile) is required. The phase hooks
/// run before the same hooks of the producer's layers.
pub trait TileGenerator: Send + Sync {
    /// Whether the generator can produce the tile at `coord`.
    fn has_tile(&self, _coord: TileCoord) -> bool {
        true
    }

    /// Whether tiles must be produced on the thread owning the GPU context.
    fn is_gpu(&self) -> bool {
        false
    }

    /// Width of the border around each tile, in texels.
    fn border(&self) -> u32 {
        0
    }

    fn needs_task_graph(&self) -> bool {
        false
    }

    fn start_create_tile(&self, _ctx: &CreateContext<'_>) {}

    fn begin_create_tile(&self, _ctx: &CreateContext<'_>) {}

    /// Writes the tile's content into `slot`. Returns whether it changed.
    ///
    /// Runs with the slot locked: it must not call back into the cache.
    fn do_create_tile(&self, ctx: &CreateContext<'_>, slot: &mut SlotState) -> bool;

    fn end_create_tile(&self, _ctx: &CreateContext<'_>) {}

    fn stop_create_tile(&self, _ctx: &CreateContext<'_>) {}
}
