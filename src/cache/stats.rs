use serde::Serialize;

/// Counters describing how a [`TileCache`](super::TileCache) served requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Requests served by a tile that was already in use
    pub hits: u64,

    /// Requests served by a cached tile nobody was using
    pub unused_hits: u64,

    /// Requests that needed a slot
    pub misses: u64,

    /// Unused tiles evicted to free a slot
    pub evictions: u64,

    /// Misses served by the task of a previously evicted tile
    pub resurrections: u64,

    /// Requests refused because no slot could be freed
    pub exhausted: u64,

    /// Tiles created by prefetching
    pub prefetches: u64,

    /// Tasks marked pending by invalidation
    pub invalidations: u64,
}

impl CacheStats {
    pub fn requests(&self) -> u64 {
        self.hits + self.unused_hits + self.misses
    }

    /// Fraction of requests that did not need a new slot.
    pub fn hit_rate(&self) -> f64 {
        let requests = self.requests();
        if requests == 0 {
            return 0.0;
        }
        (self.hits + self.unused_hits) as f64 / requests as f64
    }
}
