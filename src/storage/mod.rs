//! Fixed-capacity tile storage.
//!
//! A [`TileStorage`] owns a pool of [`Slot`]s created up front. It hands
//! slots out and takes them back, and knows nothing about which tile a slot
//! holds: identity bookkeeping belongs to the
//! [`TileCache`](crate::cache::TileCache).
//!
//! # Invariant
//!
//! `free_slot_count() + allocated_slot_count() == capacity()` at all times.
//!
//! # Example
//!
//! ```
//! use quadtile::storage::TileStorage;
//!
//! let storage = TileStorage::new(256, 4).unwrap();
//! let slot = storage.new_slot().unwrap();
//! assert_eq!(storage.free_slot_count(), 3);
//!
//! storage.delete_slot(slot);
//! assert_eq!(storage.free_slot_count(), 4);
//! ```

mod slot;

pub use slot::{Slot, SlotState};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::error::StorageError;

static STORAGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A fixed pool of tile slots.
#[derive(Debug)]
pub struct TileStorage {
    id: u64,

    /// Side of a tile, in texels
    tile_size: u32,

    capacity: usize,

    /// Free slots; popped from the back
    free: Mutex<Vec<Arc<Slot>>>,
}

impl TileStorage {
    /// Creates a storage pool holding `capacity` slots of `tile_size` texels
    /// per side.
    pub fn new(tile_size: u32, capacity: usize) -> Result<Self, StorageError> {
        if capacity == 0 {
            return Err(StorageError::ZeroCapacity);
        }
        if tile_size == 0 {
            return Err(StorageError::ZeroTileSize);
        }

        let id = STORAGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        // Reversed so that slot 0 is handed out first.
        let free = (0..capacity)
            .rev()
            .map(|index| Arc::new(Slot::new(id, index)))
            .collect();

        Ok(Self {
            id,
            tile_size,
            capacity,
            free: Mutex::new(free),
        })
    }

    /// Takes a free slot out of the pool, or returns `None` if all slots are
    /// allocated.
    pub fn new_slot(&self) -> Option<Arc<Slot>> {
        let slot = self.free.lock().pop()?;
        slot.set_free(false);
        Some(slot)
    }

    /// Returns a slot to the pool.
    ///
    /// The slot must come from this storage and must currently be allocated.
    pub fn delete_slot(&self, slot: Arc<Slot>) {
        if slot.storage_id() != self.id {
            debug_assert!(false, "slot {} returned to a foreign storage", slot.index());
            error!(slot = slot.index(), "Slot returned to a storage that does not own it");
            return;
        }
        if slot.set_free(true) {
            debug_assert!(false, "slot {} released twice", slot.index());
            error!(slot = slot.index(), "Slot released twice");
            return;
        }
        self.free.lock().push(slot);
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slot_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn allocated_slot_count(&self) -> usize {
        self.capacity - self.free_slot_count()
    }

    /// Whether `slot` belongs to this storage and is in the free pool.
    pub fn is_free(&self, slot: &Slot) -> bool {
        slot.storage_id() == self.id && slot.is_free()
    }
}

// =============================================================================
// Tests
// =============================================================================
