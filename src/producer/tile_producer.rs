use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{CreateContext, CreateTileTask, CreateTileTaskGraph, TileGenerator, TileTask};
use crate::cache::{ProducerId, Tile, TileCache, TileCoord};
use crate::layer::TileLayer;
use crate::storage::{Slot, SlotState};
use crate::task::{Deadline, Task, TaskId};

// =============================================================================
// GPU Coordinates
// =============================================================================

/// Where to sample a tile's content from when the tile itself is not
/// resident: the nearest resident ancestor and the sub-rectangle of it
/// covering the requested tile.
#[derive(Debug, Clone)]
pub struct GpuTileCoords {
    /// The resident tile, possibly an ancestor of the requested one
    pub tile: Arc<Tile>,

    /// Normalized offset of the sub-rectangle inside the slot
    pub offset_u: f32,
    pub offset_v: f32,

    /// Layer of the slot in a layered storage
    pub layer: usize,

    /// Normalized size of the sub-rectangle
    pub scale: f32,
}

// =============================================================================
// Tile Producer
// =============================================================================

/// Creates tiles for one [`TileCache`] and acquires them from it.
///
/// A producer gets its id from the cache when built and gives it back when
/// dropped. Tile content comes from an optional [`TileGenerator`] followed by
/// the producer's enabled [`TileLayer`]s, in order.
pub struct TileProducer {
    id: ProducerId,
    name: String,
    cache: Arc<TileCache>,
    generator: Option<Arc<dyn TileGenerator>>,
    layers: Vec<Arc<dyn TileLayer>>,

    /// Tasks created by this producer that are still alive
    tasks: Mutex<HashMap<TaskId, Weak<CreateTileTask>>>,

    this: Weak<TileProducer>,
}

/// Builder for [`TileProducer`].
pub struct TileProducerBuilder {
    cache: Arc<TileCache>,
    name: String,
    generator: Option<Arc<dyn TileGenerator>>,
    layers: Vec<Arc<dyn TileLayer>>,
}

impl TileProducerBuilder {
    pub fn generator(mut self, generator: Arc<dyn TileGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Appends a layer. Layers run in the order they were added.
    pub fn layer(mut self, layer: Arc<dyn TileLayer>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Registers the producer with its cache and attaches its layers.
    pub fn build(self) -> Arc<TileProducer> {
        let TileProducerBuilder {
            cache,
            name,
            generator,
            layers,
        } = self;

        let producer = Arc::new_cyclic(|this: &Weak<TileProducer>| {
            let id = cache.register_producer(this.clone());
            TileProducer {
                id,
                name,
                cache,
                generator,
                layers,
                tasks: Mutex::new(HashMap::new()),
                this: this.clone(),
            }
        });
        for layer in &producer.layers {
            layer.on_attach(&producer);
        }
        debug!(
            producer = %producer.id,
            name = %producer.name,
            layers = producer.layers.len(),
            "Tile producer created"
        );
        producer
    }
}

impl TileProducer {
    pub fn builder(cache: Arc<TileCache>, name: impl Into<String>) -> TileProducerBuilder {
        TileProducerBuilder {
            cache,
            name: name.into(),
            generator: None,
            layers: Vec::new(),
        }
    }

    pub fn id(&self) -> ProducerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    pub fn layers(&self) -> &[Arc<dyn TileLayer>] {
        &self.layers
    }

    pub(crate) fn downgrade(&self) -> Weak<TileProducer> {
        self.this.clone()
    }

    /// Side of the tiles in texels, border included.
    pub fn tile_size(&self) -> u32 {
        self.cache.storage().tile_size()
    }

    pub fn border(&self) -> u32 {
        self.generator.as_ref().map_or(0, |g| g.border())
    }

    /// Whether tiles must be produced on the GPU thread.
    pub fn is_gpu(&self) -> bool {
        self.generator.as_ref().is_some_and(|g| g.is_gpu())
    }

    /// Whether this producer can produce the tile at `coord`.
    pub fn has_tile(&self, coord: TileCoord) -> bool {
        coord.is_valid() && self.generator.as_ref().map_or(true, |g| g.has_tile(coord))
    }

    /// Number of tasks created by this producer that are still alive.
    pub fn live_task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    fn enabled_layers(&self) -> impl Iterator<Item = &Arc<dyn TileLayer>> {
        self.layers.iter().filter(|layer| layer.is_enabled())
    }

    fn uses_task_graph(&self) -> bool {
        self.generator.as_ref().is_some_and(|g| g.needs_task_graph())
            || self.layers.iter().any(|layer| layer.needs_task_graph())
    }

    // -------------------------------------------------------------------------
    // Cache Access
    // -------------------------------------------------------------------------

    /// Acquires a tile. Layers are told the first time the tile gets a user.
    ///
    /// Returns `None` when the cache has no slot to spare.
    pub fn get_tile(&self, level: u32, tx: u32, ty: u32, deadline: Deadline) -> Option<Arc<Tile>> {
        let (tile, users) = self.cache.get_tile(self.id, level, tx, ty, deadline)?;
        if users == 0 {
            for layer in self.enabled_layers() {
                layer.use_tile(tile.coord(), deadline);
            }
        }
        Some(tile)
    }

    /// Releases a tile acquired with [`get_tile`](Self::get_tile) and returns
    /// the remaining user count.
    pub fn put_tile(&self, tile: &Tile) -> u32 {
        let users = self.cache.put_tile(tile);
        if users == 0 {
            for layer in self.enabled_layers() {
                layer.unuse_tile(tile.coord());
            }
        }
        users
    }

    /// Looks a tile up without acquiring it.
    ///
    /// With `done` set, tiles whose content is not produced yet are ignored.
    pub fn find_tile(
        &self,
        level: u32,
        tx: u32,
        ty: u32,
        include_cache: bool,
        done: bool,
    ) -> Option<Arc<Tile>> {
        self.cache
            .find_tile(self.id, level, tx, ty, include_cache)
            .filter(|tile| !done || tile.is_done())
    }

    pub fn invalidate_tiles(&self) -> usize {
        self.cache.invalidate_tiles(self.id)
    }

    pub fn invalidate_tile(&self, level: u32, tx: u32, ty: u32) -> bool {
        self.cache.invalidate_tile(self.id, level, tx, ty)
    }

    /// Starts producing a tile ahead of need.
    ///
    /// Without a scheduler able to prefetch this producer's kind of task, the
    /// request is handed to the layers instead.
    pub fn prefetch_tile(&self, level: u32, tx: u32, ty: u32) -> bool {
        match self.cache.scheduler() {
            Some(scheduler) if scheduler.supports_prefetch(self.is_gpu()) => {
                match self.cache.prefetch_tile(self.id, level, tx, ty) {
                    Some(task) => {
                        scheduler.schedule(task.as_task());
                        true
                    }
                    None => false,
                }
            }
            _ => {
                let coord = TileCoord::new(level, tx, ty);
                let mut prefetched = false;
                for layer in self.enabled_layers() {
                    prefetched |= layer.prefetch_tile(coord);
                }
                prefetched
            }
        }
    }

    /// Resolves the resident tile to sample for `(level, tx, ty)`.
    ///
    /// Walks up the quadtree to the first ancestor this producer has and
    /// whose content is done, accumulating the sub-rectangle covering the
    /// requested tile. Returns `None` if even the root is not resident.
    pub fn gpu_tile_coords(&self, level: u32, tx: u32, ty: u32) -> Option<GpuTileCoords> {
        let size = self.tile_size() as f32;
        let border = self.border() as f32;
        let inner = (self.tile_size() / 2 * 2) as f32 - 2.0 * border;

        let mut coord = TileCoord::new(level, tx, ty);
        let (mut dx, mut dy, mut dd, mut ds) = (0.0f32, 0.0f32, 1.0f32, inner);
        let mut step_up = |coord: TileCoord| -> Option<TileCoord> {
            let parent = coord.parent()?;
            dx += (coord.tx % 2) as f32 * dd;
            dy += (coord.ty % 2) as f32 * dd;
            dd *= 2.0;
            ds /= 2.0;
            Some(parent)
        };

        while !self.has_tile(coord) {
            coord = step_up(coord)?;
        }
        let tile = loop {
            match self.find_tile(coord.level, coord.tx, coord.ty, false, true) {
                Some(tile) => break tile,
                None => match step_up(coord) {
                    Some(parent) => coord = parent,
                    None => {
                        trace!(producer = %self.id, level, tx, ty, "No resident ancestor");
                        return None;
                    }
                },
            }
        };

        let dx = dx * inner / dd;
        let dy = dy * inner / dd;
        Some(GpuTileCoords {
            layer: tile.slot().index(),
            tile,
            offset_u: (dx + border) / size,
            offset_v: (dy + border) / size,
            scale: ds / size,
        })
    }

    // -------------------------------------------------------------------------
    // Task Creation
    // -------------------------------------------------------------------------

    /// Returns the task producing the tile at `coord` into `slot`.
    ///
    /// An `existing` task is reused as is: it now writes `slot` and its graph,
    /// if any, gets its released dependencies back. Otherwise a new task is
    /// built. Called by the cache under its lock, so no layer is invoked
    /// here; the cache starts new tasks once the lock is released.
    pub(crate) fn create_tile(
        &self,
        coord: TileCoord,
        slot: Arc<Slot>,
        deadline: Deadline,
        existing: Option<TileTask>,
    ) -> TileTask {
        if let Some(task) = existing {
            task.root().set_slot(slot);
            let restored = task.restore();
            trace!(producer = %self.id, tile = %coord, restored, "Task reused");
            return task;
        }

        let root = Arc::new(CreateTileTask::new(self, coord, slot, deadline));
        self.tasks.lock().insert(root.id(), Arc::downgrade(&root));
        if self.uses_task_graph() {
            TileTask::Graph(CreateTileTaskGraph::new(root))
        } else {
            TileTask::Single(root)
        }
    }

    pub(crate) fn forget_task(&self, id: TaskId) {
        self.tasks.lock().remove(&id);
    }

    pub(crate) fn start_create_tile(&self, ctx: &CreateContext<'_>) {
        if let Some(generator) = &self.generator {
            generator.start_create_tile(ctx);
        }
        for layer in self.enabled_layers() {
            layer.start_create_tile(ctx);
        }
    }

    pub(crate) fn begin_create_tile(&self, ctx: &CreateContext<'_>) {
        if let Some(generator) = &self.generator {
            generator.begin_create_tile(ctx);
        }
        for layer in self.enabled_layers() {
            layer.begin_create_tile(ctx);
        }
    }

    /// Writes the tile's content. Returns whether any stage changed it.
    pub(crate) fn do_create_tile(&self, ctx: &CreateContext<'_>, slot: &mut SlotState) -> bool {
        let mut changed = match &self.generator {
            Some(generator) => generator.do_create_tile(ctx, slot),
            None => false,
        };
        for layer in self.enabled_layers() {
            changed |= layer.do_create_tile(ctx, slot);
        }
        changed
    }

    pub(crate) fn end_create_tile(&self, ctx: &CreateContext<'_>) {
        if let Some(generator) = &self.generator {
            generator.end_create_tile(ctx);
        }
        for layer in self.enabled_layers() {
            layer.end_create_tile(ctx);
        }
    }

    pub(crate) fn stop_create_tile(&self, ctx: &CreateContext<'_>) {
        if let Some(generator) = &self.generator {
            generator.stop_create_tile(ctx);
        }
        for layer in self.enabled_layers() {
            layer.stop_create_tile(ctx);
        }
    }
}

impl Drop for TileProducer {
    fn drop(&mut self) {
        self.cache.unregister_producer(self.id);
    }
}

impl fmt::Debug for TileProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileProducer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cache", &self.cache.name())
            .field("layers", &self.layers.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
