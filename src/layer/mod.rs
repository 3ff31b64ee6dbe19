//! Tile layers.
//!
//! A [`TileLayer`] adds behavior to a [`TileProducer`] at fixed points of its
//! tiles' lifecycle: when a tile gains its first user or loses its last one,
//! when it is prefetched, and at each phase of its production. Layers run in
//! the order they were added to the producer, and only while enabled.

mod slope;

pub use slope::SlopeLayer;

use std::sync::{Arc, OnceLock};

use tracing::warn;

use crate::cache::{ProducerId, TileCache, TileCoord};
use crate::producer::{CreateContext, TileProducer};
use crate::storage::SlotState;
use crate::task::Deadline;

/// Extension point of a [`TileProducer`].
pub trait TileLayer: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether the layer adds dependencies to tile tasks, which then have to
    /// be built as task graphs.
    fn needs_task_graph(&self) -> bool {
        false
    }

    /// Called once when the owning producer is built.
    fn on_attach(&self, _producer: &TileProducer) {}

    /// A tile of the producer got its first user.
    fn use_tile(&self, _coord: TileCoord, _deadline: Deadline) {}

    /// A tile of the producer lost its last user.
    fn unuse_tile(&self, _coord: TileCoord) {}

    /// Prefetch request the producer could not serve itself. Returns whether
    /// the layer started anything.
    fn prefetch_tile(&self, _coord: TileCoord) -> bool {
        false
    }

    fn start_create_tile(&self, _ctx: &CreateContext<'_>) {}

    fn begin_create_tile(&self, _ctx: &CreateContext<'_>) {}

    /// Writes into the tile's slot. Returns whether the content changed.
    ///
    /// Runs with the slot locked: it must not call back into the cache.
    fn do_create_tile(&self, ctx: &CreateContext<'_>, slot: &mut SlotState) -> bool;

    fn end_create_tile(&self, _ctx: &CreateContext<'_>) {}

    fn stop_create_tile(&self, _ctx: &CreateContext<'_>) {}
}

// =============================================================================
// Layer Binding
// =============================================================================

struct Binding {
    cache: Arc<TileCache>,
    producer_id: ProducerId,
}

/// The producer a layer was attached to.
///
/// Layers keep one of these and fill it in from
/// [`TileLayer::on_attach`]. A layer belongs to a single producer.
#[derive(Default)]
pub struct LayerBinding {
    inner: OnceLock<Binding>,
}

impl LayerBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `producer`. Returns `false` if the layer was already attached.
    pub fn attach(&self, producer: &TileProducer) -> bool {
        let binding = Binding {
            cache: Arc::clone(producer.cache()),
            producer_id: producer.id(),
        };
        if self.inner.set(binding).is_err() {
            warn!(producer = %producer.id(), "Layer is already attached to another producer");
            return false;
        }
        true
    }

    pub fn is_attached(&self) -> bool {
        self.inner.get().is_some()
    }

    pub fn cache(&self) -> Option<&Arc<TileCache>> {
        self.inner.get().map(|b| &b.cache)
    }

    pub fn producer_id(&self) -> Option<ProducerId> {
        self.inner.get().map(|b| b.producer_id)
    }
}

impl std::fmt::Debug for LayerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerBinding")
            .field("producer_id", &self.producer_id())
            .finish()
    }
}
