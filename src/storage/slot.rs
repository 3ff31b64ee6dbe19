use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::cache::TileId;
use crate::task::TaskId;

/// A reusable unit of tile storage.
///
/// Slots are identified only by their position in the storage pool. The
/// mutable part of a slot (which tile it holds, which task may write it, and
/// the payload) sits behind the slot's own lock, independent of the cache
/// lock.
#[derive(Debug)]
pub struct Slot {
    storage_id: u64,
    index: usize,
    free: AtomicBool,
    state: Mutex<SlotState>,
}

/// Lock-protected contents of a [`Slot`].
#[derive(Debug, Default)]
pub struct SlotState {
    /// Tile currently occupying the slot
    pub id: Option<TileId>,

    /// Task allowed to write the slot's content
    pub producer_task: Option<TaskId>,

    data: Bytes,
}

impl SlotState {
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn set_data(&mut self, data: impl Into<Bytes>) {
        self.data = data.into();
    }

    /// Whether `task` is the current writer of this slot.
    pub fn is_owned_by(&self, task: TaskId) -> bool {
        self.producer_task == Some(task)
    }
}

impl Slot {
    pub(super) fn new(storage_id: u64, index: usize) -> Self {
        Self {
            storage_id,
            index,
            free: AtomicBool::new(true),
            state: Mutex::new(SlotState::default()),
        }
    }

    /// Position of the slot in its storage pool.
    ///
    /// For layered texture storage this is the layer index.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(super) fn storage_id(&self) -> u64 {
        self.storage_id
    }

    /// Acquires the slot's exclusive lock.
    pub fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, SlotState>> {
        self.state.try_lock()
    }

    /// Tags the slot with the tile it now holds and the task producing it.
    pub fn bind(&self, id: TileId, task: TaskId) {
        let mut state = self.state.lock();
        state.id = Some(id);
        state.producer_task = Some(task);
    }

    /// Clears the slot's tile and writer tags. The payload is left in place.
    pub fn unbind(&self) {
        let mut state = self.state.lock();
        state.id = None;
        state.producer_task = None;
    }

    pub fn tile_id(&self) -> Option<TileId> {
        self.state.lock().id
    }

    pub fn producer_task(&self) -> Option<TaskId> {
        self.state.lock().producer_task
    }

    pub fn data(&self) -> Bytes {
        self.state.lock().data.clone()
    }

    pub(super) fn is_free(&self) -> bool {
        self.free.load(Ordering::Acquire)
    }

    /// Flips the free flag, returning the previous value.
    pub(super) fn set_free(&self, free: bool) -> bool {
        self.free.swap(free, Ordering::AcqRel)
    }
}
