use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{LayerBinding, TileLayer};
use crate::cache::{Tile, TileCoord};
use crate::producer::{decode_heights, CreateContext, TileProducer};
use crate::storage::SlotState;
use crate::task::TaskId;

/// Derives slope tiles from the height tiles of another producer.
///
/// Each slope tile reads the height tile at the same coordinates. The height
/// tile is acquired when the slope task starts and its task becomes a
/// dependency of the slope task, so heights are always produced first.
pub struct SlopeLayer {
    source: Arc<TileProducer>,

    /// Width of the root tile in world units
    root_extent: f32,

    binding: LayerBinding,
    enabled: AtomicBool,

    /// Height tiles held by each slope task between start and stop
    inputs: Mutex<HashMap<TaskId, Arc<Tile>>>,
}

impl SlopeLayer {
    pub fn new(source: Arc<TileProducer>, root_extent: f32) -> Self {
        Self {
            source,
            root_extent,
            binding: LayerBinding::new(),
            enabled: AtomicBool::new(true),
            inputs: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &Arc<TileProducer> {
        &self.source
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Number of height tiles currently held.
    pub fn held_count(&self) -> usize {
        self.inputs.lock().len()
    }

    /// Distance between two texels of a tile at `level`, in world units.
    fn texel_spacing(&self, level: u32) -> f32 {
        let inner = self
            .source
            .tile_size()
            .saturating_sub(2 * self.source.border())
            .max(1);
        self.root_extent / (inner as f32 * TileCoord::tiles_per_side(level) as f32)
    }
}

impl TileLayer for SlopeLayer {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn needs_task_graph(&self) -> bool {
        true
    }

    fn on_attach(&self, producer: &TileProducer) {
        self.binding.attach(producer);
        if producer.tile_size() != self.source.tile_size() {
            warn!(
                producer = %producer.id(),
                tile_size = producer.tile_size(),
                source_tile_size = self.source.tile_size(),
                "Slope tiles and height tiles differ in size"
            );
        }
    }

    fn prefetch_tile(&self, coord: TileCoord) -> bool {
        self.source.prefetch_tile(coord.level, coord.tx, coord.ty)
    }

    fn start_create_tile(&self, ctx: &CreateContext<'_>) {
        let c = ctx.coord;
        let Some(heights) = self.source.get_tile(c.level, c.tx, c.ty, ctx.deadline) else {
            warn!(tile = %c, source = %self.source.id(), "No slot for height tile");
            return;
        };
        ctx.add_dependency(heights.task().as_task());
        let previous = self.inputs.lock().insert(ctx.task, heights);
        if let Some(previous) = previous {
            self.source.put_tile(&previous);
        }
    }

    fn do_create_tile(&self, ctx: &CreateContext<'_>, slot: &mut SlotState) -> bool {
        let Some(heights) = self.inputs.lock().get(&ctx.task).cloned() else {
            return false;
        };
        let size = self.source.tile_size() as usize;
        let z = decode_heights(&heights.data());
        if z.len() != size * size {
            debug!(
                tile = %ctx.coord,
                producer = ?self.binding.producer_id(),
                "Height tile not produced, skipping slope"
            );
            return false;
        }

        let spacing = self.texel_spacing(ctx.coord.level);
        let at = |i: usize, j: usize| z[j * size + i];
        let mut buf = BytesMut::with_capacity(size * size * 4);
        for j in 0..size {
            for i in 0..size {
                let (i0, i1) = (i.saturating_sub(1), (i + 1).min(size - 1));
                let (j0, j1) = (j.saturating_sub(1), (j + 1).min(size - 1));
                let dzdx = (at(i1, j) - at(i0, j)) / ((i1 - i0).max(1) as f32 * spacing);
                let dzdy = (at(i, j1) - at(i, j0)) / ((j1 - j0).max(1) as f32 * spacing);
                buf.put_f32_le((dzdx * dzdx + dzdy * dzdy).sqrt());
            }
        }
        slot.set_data(buf.freeze());
        true
    }

    fn stop_create_tile(&self, ctx: &CreateContext<'_>) {
        let heights = self.inputs.lock().remove(&ctx.task);
        if let Some(heights) = heights {
            self.source.put_tile(&heights);
        }
    }
}

impl Drop for SlopeLayer {
    fn drop(&mut self) {
        let held: Vec<_> = self.inputs.get_mut().drain().map(|(_, tile)| tile).collect();
        for tile in held {
            self.source.put_tile(&tile);
        }
    }
}

impl std::fmt::Debug for SlopeLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlopeLayer")
            .field("source", &self.source.id())
            .field("binding", &self.binding)
            .field("held", &self.held_count())
            .finish()
    }
}
