use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::{CacheStats, ProducerId, Tile, TileCoord, TileId};
use crate::producer::{TileProducer, TileTask, WeakTileTask};
use crate::scheduler::Scheduler;
use crate::storage::{Slot, TileStorage};
use crate::task::{Deadline, Reason, Task, TaskId, TaskState, BACKGROUND_DEADLINE};

// =============================================================================
// Internal State
// =============================================================================

/// Task of an evicted tile, kept so a new request for the same tile can pick
/// it up again while something else still holds it.
struct DeletedTask {
    task: WeakTileTask,
    /// Id of the task writing the tile's slot
    writer: TaskId,
}

struct CacheState {
    /// Tiles with at least one user
    used: HashMap<TileId, Arc<Tile>>,

    /// Tiles without users, least recently released first
    unused: LruCache<TileId, Arc<Tile>>,

    deleted: HashMap<TileId, DeletedTask>,

    stats: CacheStats,
}

struct Registry {
    next_id: u32,
    producers: HashMap<ProducerId, Weak<TileProducer>>,
}

/// Values released under the cache lock and dropped after it.
///
/// Dropping a tile can drop its task, and a dropped task reports back to the
/// cache and to its producer's layers. Dropping the last reference to a
/// producer unregisters it from the cache.
#[derive(Default)]
struct Garbage {
    tiles: Vec<Arc<Tile>>,
    tasks: Vec<Arc<dyn Task>>,
    producers: Vec<Arc<TileProducer>>,
}

/// Work left for after the cache lock is released.
enum FollowUp {
    None,
    /// A task was just created and must acquire what it needs.
    Start(TileTask),
    /// The task of an evicted tile was reused and must run again.
    Resurrected(TileTask),
}

// =============================================================================
// Tile Cache
// =============================================================================

/// Reference-counted, LRU-evicting cache binding tiles to storage slots.
///
/// Tiles with users live in the used set. When the last user releases a
/// tile it moves to the tail of the unused set, from which the head is evicted
/// whenever a request needs a slot and the storage has none left.
///
/// # Locking
///
/// All partition state sits behind one non-reentrant lock. The cache never
/// calls the scheduler, a task or a layer while holding it; those calls, and
/// the drops of evicted tiles, happen once the lock is released.
pub struct TileCache {
    name: String,
    storage: Arc<TileStorage>,
    scheduler: Option<Arc<dyn Scheduler>>,
    registry: Mutex<Registry>,
    state: Mutex<CacheState>,
}

impl TileCache {
    /// Creates a cache over `storage`, without a scheduler.
    pub fn new(storage: Arc<TileStorage>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage,
            scheduler: None,
            registry: Mutex::new(Registry {
                next_id: 0,
                producers: HashMap::new(),
            }),
            state: Mutex::new(CacheState {
                used: HashMap::new(),
                unused: LruCache::unbounded(),
                deleted: HashMap::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Sets the scheduler used to re-run resurrected and invalidated tasks.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> &Arc<TileStorage> {
        &self.storage
    }

    pub fn scheduler(&self) -> Option<&Arc<dyn Scheduler>> {
        self.scheduler.as_ref()
    }

    // -------------------------------------------------------------------------
    // Producers
    // -------------------------------------------------------------------------

    /// Registers a producer and returns its id.
    pub(crate) fn register_producer(&self, producer: Weak<TileProducer>) -> ProducerId {
        let mut registry = self.registry.lock();
        let id = ProducerId::new(registry.next_id);
        registry.next_id += 1;
        registry.producers.insert(id, producer);
        debug!(cache = %self.name, producer = %id, "Producer registered");
        id
    }

    /// Forgets a producer and drops its cached tiles that nobody uses.
    pub(crate) fn unregister_producer(&self, id: ProducerId) {
        self.registry.lock().producers.remove(&id);

        let mut garbage = Garbage::default();
        {
            let mut state = self.state.lock();
            let stale: Vec<TileId> = state
                .unused
                .iter()
                .map(|(tile_id, _)| *tile_id)
                .filter(|tile_id| tile_id.producer_id == id)
                .collect();
            for tile_id in stale {
                if let Some(tile) = state.unused.pop(&tile_id) {
                    self.reclaim(&tile, &mut garbage);
                    garbage.tiles.push(tile);
                }
            }
            state.deleted.retain(|tile_id, _| tile_id.producer_id != id);

            let in_use = state.used.keys().filter(|t| t.producer_id == id).count();
            if in_use > 0 {
                warn!(
                    cache = %self.name,
                    producer = %id,
                    tiles = in_use,
                    "Producer unregistered while its tiles are in use"
                );
            }
        }
        debug!(cache = %self.name, producer = %id, "Producer unregistered");
        drop(garbage);
    }

    pub fn producer(&self, id: ProducerId) -> Option<Arc<TileProducer>> {
        self.registry.lock().producers.get(&id)?.upgrade()
    }

    pub fn producer_count(&self) -> usize {
        self.registry.lock().producers.len()
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// Looks a tile up without touching user counts or LRU order.
    ///
    /// Only used tiles are considered unless `include_cache` is set.
    pub fn find_tile(
        &self,
        producer_id: ProducerId,
        level: u32,
        tx: u32,
        ty: u32,
        include_cache: bool,
    ) -> Option<Arc<Tile>> {
        let id = TileId::new(producer_id, level, tx, ty);
        let state = self.state.lock();
        if let Some(tile) = state.used.get(&id) {
            return Some(Arc::clone(tile));
        }
        if include_cache {
            return state.unused.peek(&id).cloned();
        }
        None
    }

    pub fn find_tile_at(
        &self,
        producer_id: ProducerId,
        coord: TileCoord,
        include_cache: bool,
    ) -> Option<Arc<Tile>> {
        self.find_tile(producer_id, coord.level, coord.tx, coord.ty, include_cache)
    }

    /// Acquires a tile, creating it if needed.
    ///
    /// Returns the tile together with its user count before this call, or
    /// `None` when the storage is full and no unused tile can be evicted.
    pub fn get_tile(
        &self,
        producer_id: ProducerId,
        level: u32,
        tx: u32,
        ty: u32,
        deadline: Deadline,
    ) -> Option<(Arc<Tile>, u32)> {
        let id = TileId::new(producer_id, level, tx, ty);
        let mut garbage = Garbage::default();

        let acquired = {
            let mut state = self.state.lock();
            if let Some(tile) = state.used.get(&id).cloned() {
                state.stats.hits += 1;
                let users = tile.acquire();
                Some((tile, users, FollowUp::None))
            } else if let Some(tile) = state.unused.pop(&id) {
                state.stats.unused_hits += 1;
                let users = tile.acquire();
                state.used.insert(id, Arc::clone(&tile));
                Some((tile, users, FollowUp::None))
            } else {
                state.stats.misses += 1;
                self.create(&mut state, id, deadline, &mut garbage)
                    .map(|(tile, follow_up)| {
                        let users = tile.acquire();
                        state.used.insert(id, Arc::clone(&tile));
                        (tile, users, follow_up)
                    })
            }
        };
        drop(garbage);

        let (tile, users, follow_up) = acquired?;
        self.follow_up(follow_up, deadline);
        trace!(cache = %self.name, tile = %id, users = users + 1, "Tile acquired");
        Some((tile, users))
    }

    /// Creates a tile directly in the unused set, to warm the cache.
    ///
    /// Returns the tile's task, or `None` if the tile is already cached or no
    /// slot is available.
    pub fn prefetch_tile(
        &self,
        producer_id: ProducerId,
        level: u32,
        tx: u32,
        ty: u32,
    ) -> Option<TileTask> {
        let id = TileId::new(producer_id, level, tx, ty);
        let mut garbage = Garbage::default();

        let created = {
            let mut state = self.state.lock();
            if state.used.contains_key(&id) || state.unused.contains(&id) {
                None
            } else {
                self.create(&mut state, id, BACKGROUND_DEADLINE, &mut garbage)
                    .map(|(tile, follow_up)| {
                        state.stats.prefetches += 1;
                        let task = tile.task().clone();
                        state.unused.push(id, tile);
                        (task, follow_up)
                    })
            }
        };
        drop(garbage);

        let (task, follow_up) = created?;
        self.follow_up(follow_up, BACKGROUND_DEADLINE);
        trace!(cache = %self.name, tile = %id, "Tile prefetched");
        Some(task)
    }

    /// Releases one use of `tile` and returns the remaining user count.
    ///
    /// A tile whose count drops to zero moves to the tail of the unused set.
    pub fn put_tile(&self, tile: &Tile) -> u32 {
        let id = tile.id();
        let mut state = self.state.lock();
        let tracked = state
            .used
            .get(&id)
            .is_some_and(|used| std::ptr::eq(Arc::as_ptr(used), tile));
        if !tracked {
            debug_assert!(false, "tile {id} released but not in use");
            error!(cache = %self.name, tile = %id, "Released a tile that is not in use");
            return tile.users();
        }

        let users = tile.release();
        if users == 0 {
            if let Some(tile) = state.used.remove(&id) {
                state.unused.push(id, tile);
            }
            trace!(cache = %self.name, tile = %id, "Tile unused");
        }
        users
    }

    // -------------------------------------------------------------------------
    // Invalidation
    // -------------------------------------------------------------------------

    /// Marks the task of every tile of `producer_id` as needing to run again
    /// because its data changed. Returns the number of tasks affected.
    pub fn invalidate_tiles(&self, producer_id: ProducerId) -> usize {
        let tasks = {
            let mut state = self.state.lock();
            let tasks = collect_tasks(&state, |id| id.producer_id == producer_id);
            state.stats.invalidations += tasks.len() as u64;
            tasks
        };
        let count = tasks.len();
        debug!(cache = %self.name, producer = %producer_id, tasks = count, "Invalidating tiles");
        self.invalidate(tasks);
        count
    }

    /// Like [`invalidate_tiles`](Self::invalidate_tiles), for a single tile.
    pub fn invalidate_tile(&self, producer_id: ProducerId, level: u32, tx: u32, ty: u32) -> bool {
        let target = TileId::new(producer_id, level, tx, ty);
        let tasks = {
            let mut state = self.state.lock();
            let tasks = collect_tasks(&state, |id| *id == target);
            state.stats.invalidations += tasks.len() as u64;
            tasks
        };
        let found = !tasks.is_empty();
        self.invalidate(tasks);
        found
    }

    fn invalidate(&self, tasks: Vec<Arc<dyn Task>>) {
        for task in tasks {
            match &self.scheduler {
                Some(scheduler) => {
                    scheduler.reschedule(task, Reason::DataChanged, BACKGROUND_DEADLINE)
                }
                None => task.set_state(TaskState::Pending(Reason::DataChanged)),
            }
        }
    }

    /// Called when the task writing `tile`'s slot is destroyed.
    ///
    /// Removes the tile's deleted entry if it still refers to that task.
    /// A call without a matching entry is not treated as a contract violation:
    /// it returns `false` and changes nothing. This happens when the tile was
    /// evicted again with another task before this one finished dropping, when
    /// the entry was already picked up again, or when the producer was
    /// unregistered and its entries purged.
    pub fn create_tile_task_deleted(&self, tile: TileId, writer: TaskId) -> bool {
        let mut state = self.state.lock();
        match state.deleted.get(&tile) {
            Some(entry) if entry.writer == writer => {
                state.deleted.remove(&tile);
                trace!(cache = %self.name, tile = %tile, task = %writer, "Deleted task dropped");
                true
            }
            // Superseded by a later eviction, or already picked up again.
            _ => false,
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    pub fn used_count(&self) -> usize {
        self.state.lock().used.len()
    }

    pub fn unused_count(&self) -> usize {
        self.state.lock().unused.len()
    }

    /// Number of evicted tiles whose task may still be reused.
    pub fn deleted_count(&self) -> usize {
        self.state.lock().deleted.len()
    }

    /// Unused tiles, least recently released first.
    pub fn unused_tiles(&self) -> Vec<TileId> {
        // LruCache iterates most recent first.
        let mut ids: Vec<TileId> = self.state.lock().unused.iter().map(|(id, _)| *id).collect();
        ids.reverse();
        ids
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Builds a tile for `id`, evicting the least recently used tile if the
    /// storage is full. The tile is not yet inserted in either set.
    fn create(
        &self,
        state: &mut CacheState,
        id: TileId,
        deadline: Deadline,
        garbage: &mut Garbage,
    ) -> Option<(Arc<Tile>, FollowUp)> {
        let Some(producer) = self.producer(id.producer_id) else {
            debug_assert!(false, "tile {id} requested for an unregistered producer");
            error!(cache = %self.name, tile = %id, "Tile requested for an unregistered producer");
            return None;
        };
        // The caller may drop its own handle meanwhile.
        garbage.producers.push(Arc::clone(&producer));

        let Some(slot) = self.allocate_slot(state, garbage) else {
            state.stats.exhausted += 1;
            debug!(cache = %self.name, tile = %id, "Tile storage exhausted");
            return None;
        };

        let previous = state
            .deleted
            .remove(&id)
            .and_then(|entry| entry.task.upgrade());
        let resurrected = previous.is_some();
        let task = producer.create_tile(id.coord, Arc::clone(&slot), deadline, previous);
        slot.bind(id, task.writer_id());

        let follow_up = if resurrected {
            state.stats.resurrections += 1;
            debug!(cache = %self.name, tile = %id, task = %task.id(), "Reusing task of evicted tile");
            FollowUp::Resurrected(task.clone())
        } else {
            FollowUp::Start(task.clone())
        };
        Some((Arc::new(Tile::new(id, slot, task)), follow_up))
    }

    fn allocate_slot(&self, state: &mut CacheState, garbage: &mut Garbage) -> Option<Arc<Slot>> {
        if let Some(slot) = self.storage.new_slot() {
            return Some(slot);
        }
        let (evicted_id, evicted) = state.unused.pop_lru()?;
        self.reclaim(&evicted, garbage);
        state.deleted.insert(
            evicted_id,
            DeletedTask {
                task: evicted.task().downgrade(),
                writer: evicted.task().writer_id(),
            },
        );
        state.stats.evictions += 1;
        debug!(cache = %self.name, tile = %evicted_id, slot = evicted.slot().index(), "Tile evicted");
        garbage.tiles.push(evicted);
        self.storage.new_slot()
    }

    /// Returns a tile's slot to the storage and tears its task graph down.
    fn reclaim(&self, tile: &Tile, garbage: &mut Garbage) {
        tile.slot().unbind();
        self.storage.delete_slot(Arc::clone(tile.slot()));
        garbage.tasks.extend(tile.task().release());
    }

    fn follow_up(&self, follow_up: FollowUp, deadline: Deadline) {
        match follow_up {
            FollowUp::None => {}
            FollowUp::Start(task) => task.start(),
            FollowUp::Resurrected(task) => match &self.scheduler {
                Some(scheduler) => scheduler.reschedule(task.as_task(), Reason::DataNeeded, deadline),
                None => task
                    .as_task()
                    .set_state(TaskState::Pending(Reason::DataNeeded)),
            },
        }
    }
}

fn collect_tasks(state: &CacheState, matches: impl Fn(&TileId) -> bool) -> Vec<Arc<dyn Task>> {
    let mut tasks: Vec<Arc<dyn Task>> = state
        .used
        .iter()
        .chain(state.unused.iter())
        .filter(|(id, _)| matches(id))
        .map(|(_, tile)| tile.task().as_task())
        .collect();
    tasks.extend(
        state
            .deleted
            .iter()
            .filter(|(id, _)| matches(id))
            .filter_map(|(_, entry)| entry.task.upgrade())
            .map(|task| task.as_task()),
    );
    tasks
}

impl fmt::Debug for TileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TileCache")
            .field("name", &self.name)
            .field("capacity", &self.storage.capacity())
            .field("used", &state.used.len())
            .field("unused", &state.unused.len())
            .field("deleted", &state.deleted.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
