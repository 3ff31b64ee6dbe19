//! Tile cache.
//!
//! The [`TileCache`] maps tile identities to [`Tile`]s bound to slots of a
//! shared [`TileStorage`](crate::storage::TileStorage).
//!
//! # Partitions
//!
//! ```text
//!            get_tile                       put_tile (last user)
//!   absent ──────────▶ used (users > 0) ◀──────────────────────▶ unused (LRU)
//!     ▲                                        get_tile                │
//!     │                                                                │ evict
//!     └──────────── deleted (task only, while still referenced) ◀──────┘
//! ```
//!
//! A tile id is in at most one of the used and unused sets. Evicting a tile
//! returns its slot to the storage, but its task is remembered weakly. If the
//! tile is requested again while that task is still alive elsewhere, the task
//! is reused and marked as needing to run again.
//!
//! # Components
//!
//! - [`TileCache`]: the partitions, eviction and invalidation
//! - [`Tile`]: a tile record with its slot, task and user count
//! - [`TileId`], [`TileCoord`], [`ProducerId`]: tile identity
//! - [`CacheStats`]: request counters

mod stats;
mod tile;
mod tile_cache;

pub use stats::CacheStats;
pub use tile::{ProducerId, Tile, TileCoord, TileId};
pub use tile_cache::TileCache;
