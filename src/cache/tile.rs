use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::producer::TileTask;
use crate::storage::Slot;

// =============================================================================
// Identity
// =============================================================================

/// Identifier of a producer within one [`TileCache`](super::TileCache).
///
/// Assigned sequentially at registration and never reused by the same cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProducerId(u32);

impl ProducerId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Quadtree coordinates of a tile.
///
/// Level 0 is the root. A tile at level `l` has `tx, ty < 2^l`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TileCoord {
    pub level: u32,
    pub tx: u32,
    pub ty: u32,
}

impl TileCoord {
    pub const ROOT: TileCoord = TileCoord {
        level: 0,
        tx: 0,
        ty: 0,
    };

    pub fn new(level: u32, tx: u32, ty: u32) -> Self {
        Self { level, tx, ty }
    }

    /// Number of tiles along one axis at `level`.
    pub fn tiles_per_side(level: u32) -> u32 {
        1u32.checked_shl(level).unwrap_or(u32::MAX)
    }

    /// Whether the coordinates lie inside the quadtree.
    pub fn is_valid(self) -> bool {
        let side = Self::tiles_per_side(self.level);
        self.tx < side && self.ty < side
    }

    pub fn parent(self) -> Option<TileCoord> {
        if self.level == 0 {
            return None;
        }
        Some(TileCoord::new(self.level - 1, self.tx / 2, self.ty / 2))
    }

    /// The four children, in row-major order.
    pub fn children(self) -> [TileCoord; 4] {
        let (level, x, y) = (self.level + 1, self.tx * 2, self.ty * 2);
        [
            TileCoord::new(level, x, y),
            TileCoord::new(level, x + 1, y),
            TileCoord::new(level, x, y + 1),
            TileCoord::new(level, x + 1, y + 1),
        ]
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.level, self.tx, self.ty)
    }
}

/// Cache key of a tile: the producer plus quadtree coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    pub producer_id: ProducerId,
    pub coord: TileCoord,
}

impl TileId {
    pub fn new(producer_id: ProducerId, level: u32, tx: u32, ty: u32) -> Self {
        Self {
            producer_id,
            coord: TileCoord::new(level, tx, ty),
        }
    }

    pub fn from_coord(producer_id: ProducerId, coord: TileCoord) -> Self {
        Self { producer_id, coord }
    }

    pub fn level(&self) -> u32 {
        self.coord.level
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer_id, self.coord)
    }
}

// =============================================================================
// Tile
// =============================================================================

/// A cached tile: its identity, the slot holding its content and the task
/// producing that content.
///
/// The user count is only modified by the cache, under its lock.
pub struct Tile {
    id: TileId,
    slot: Arc<Slot>,
    task: TileTask,
    users: AtomicU32,
}

impl Tile {
    pub(crate) fn new(id: TileId, slot: Arc<Slot>, task: TileTask) -> Self {
        Self {
            id,
            slot,
            task,
            users: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> TileId {
        self.id
    }

    pub fn coord(&self) -> TileCoord {
        self.id.coord
    }

    pub fn producer_id(&self) -> ProducerId {
        self.id.producer_id
    }

    pub fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }

    /// The task producing this tile's content.
    pub fn task(&self) -> &TileTask {
        &self.task
    }

    pub fn users(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }

    /// Whether the tile's content has been produced and is valid.
    pub fn is_done(&self) -> bool {
        self.task.is_done()
    }

    /// Snapshot of the slot's payload.
    pub fn data(&self) -> Bytes {
        self.slot.data()
    }

    /// Increments the user count, returning the previous value.
    pub(super) fn acquire(&self) -> u32 {
        self.users.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the user count, returning the new value.
    pub(super) fn release(&self) -> u32 {
        let previous = self
            .users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("id", &self.id)
            .field("slot", &self.slot.index())
            .field("task", &self.task.id())
            .field("users", &self.users())
            .finish()
    }
}
