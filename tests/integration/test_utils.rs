//! Test utilities for integration tests.
//!
//! Provides a counting tile generator, a scheduler that records what it is
//! asked to do, and helpers to wire them to a cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use quadtile::{
    CreateContext, Deadline, Reason, Scheduler, SlotState, Task, TaskId, TaskState, TileCache,
    TileCoord, TileGenerator, TileProducer, TileStorage,
};

// =============================================================================
// Counting Generator
// =============================================================================

/// Writes each tile's coordinates into its slot and counts the calls.
#[derive(Default)]
pub struct CountingGenerator {
    pub created: AtomicUsize,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub border: u32,
}

impl CountingGenerator {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Content written for the tile at `coord`.
pub fn content_of(coord: TileCoord) -> Vec<u8> {
    format!("{coord}").into_bytes()
}

impl TileGenerator for CountingGenerator {
    fn border(&self) -> u32 {
        self.border
    }

    fn start_create_tile(&self, _ctx: &CreateContext<'_>) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn do_create_tile(&self, ctx: &CreateContext<'_>, slot: &mut SlotState) -> bool {
        self.created.fetch_add(1, Ordering::SeqCst);
        slot.set_data(content_of(ctx.coord));
        true
    }

    fn stop_create_tile(&self, _ctx: &CreateContext<'_>) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Recording Scheduler
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Schedule(TaskId),
    Reschedule(TaskId, Reason, Deadline),
}

/// Scheduler that marks rescheduled tasks pending but never runs anything.
#[derive(Default)]
pub struct RecordingScheduler {
    pub prefetch: bool,
    calls: Mutex<Vec<Call>>,
    tasks: Mutex<Vec<Arc<dyn Task>>>,
}

impl RecordingScheduler {
    pub fn with_prefetch() -> Self {
        Self {
            prefetch: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Tasks received so far, in order.
    pub fn take_tasks(&self) -> Vec<Arc<dyn Task>> {
        std::mem::take(&mut *self.tasks.lock())
    }
}

impl Scheduler for RecordingScheduler {
    fn supports_prefetch(&self, gpu_tasks: bool) -> bool {
        self.prefetch && !gpu_tasks
    }

    fn schedule(&self, task: Arc<dyn Task>) {
        self.calls.lock().push(Call::Schedule(task.id()));
        self.tasks.lock().push(task);
    }

    fn reschedule(&self, task: Arc<dyn Task>, reason: Reason, deadline: Deadline) {
        task.set_state(TaskState::Pending(reason));
        self.calls
            .lock()
            .push(Call::Reschedule(task.id(), reason, deadline));
        self.tasks.lock().push(task);
    }
}

// =============================================================================
// Setup Helpers
// =============================================================================

pub fn storage(tile_size: u32, capacity: usize) -> Arc<TileStorage> {
    Arc::new(TileStorage::new(tile_size, capacity).unwrap())
}

/// A producer with a [`CountingGenerator`] over a fresh cache without scheduler.
pub fn counting_producer(capacity: usize) -> (Arc<TileProducer>, Arc<CountingGenerator>) {
    let cache = Arc::new(TileCache::new(storage(8, capacity), "test"));
    counting_producer_on(cache)
}

pub fn counting_producer_on(cache: Arc<TileCache>) -> (Arc<TileProducer>, Arc<CountingGenerator>) {
    let generator = Arc::new(CountingGenerator::default());
    let producer = TileProducer::builder(cache, "counting")
        .generator(generator.clone())
        .build();
    (producer, generator)
}

/// A producer whose cache reports to a [`RecordingScheduler`].
pub fn scheduled_producer(
    capacity: usize,
    scheduler: Arc<RecordingScheduler>,
) -> (Arc<TileProducer>, Arc<CountingGenerator>) {
    let cache = Arc::new(TileCache::new(storage(8, capacity), "scheduled").with_scheduler(scheduler));
    counting_producer_on(cache)
}

/// Asserts the storage accounts for every slot.
pub fn assert_capacity_conserved(cache: &TileCache) {
    let storage = cache.storage();
    assert_eq!(
        storage.free_slot_count() + storage.allocated_slot_count(),
        storage.capacity()
    );
    assert_eq!(
        storage.allocated_slot_count(),
        cache.used_count() + cache.unused_count()
    );
}
