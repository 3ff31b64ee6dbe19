//! Procedural height tiles.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, BytesMut};

use super::{CreateContext, TileGenerator};
use crate::cache::TileCoord;
use crate::storage::SlotState;

/// Lattice cells across the root tile for the first octave.
const BASE_FREQUENCY: f64 = 4.0;

/// Default number of octaves summed per sample.
pub const DEFAULT_OCTAVES: u32 = 6;

/// Default peak height.
pub const DEFAULT_AMPLITUDE: f32 = 1000.0;

/// Fractal value-noise height generator.
///
/// Tiles hold `tile_size²` little-endian `f32` heights in row-major order.
/// Heights are a function of the texel's position on the whole quadtree, so
/// the border texels of a tile repeat the edge texels of its neighbors.
#[derive(Debug)]
pub struct NoiseGenerator {
    seed: u32,
    tile_size: u32,
    border: u32,
    max_level: u32,
    octaves: u32,
    amplitude: f32,
    produced: AtomicU64,
}

impl NoiseGenerator {
    pub fn new(seed: u32, tile_size: u32, border: u32, max_level: u32) -> Self {
        Self {
            seed,
            tile_size,
            border,
            max_level,
            octaves: DEFAULT_OCTAVES,
            amplitude: DEFAULT_AMPLITUDE,
            produced: AtomicU64::new(0),
        }
    }

    pub fn with_octaves(mut self, octaves: u32) -> Self {
        self.octaves = octaves.max(1);
        self
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude;
        self
    }

    /// Number of tiles written so far.
    pub fn produced_count(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    fn inner_size(&self) -> u32 {
        self.tile_size.saturating_sub(2 * self.border).max(1)
    }

    /// Position of a texel, in root tile units.
    pub fn texel_position(&self, coord: TileCoord, i: u32, j: u32) -> (f64, f64) {
        let inner = self.inner_size() as f64;
        let extent = inner * TileCoord::tiles_per_side(coord.level) as f64;
        let border = self.border as f64;
        let x = (coord.tx as f64 * inner + i as f64 - border) / extent;
        let y = (coord.ty as f64 * inner + j as f64 - border) / extent;
        (x, y)
    }

    /// Height at a position in root tile units.
    pub fn height_at(&self, x: f64, y: f64) -> f32 {
        let mut total = 0.0f32;
        let mut norm = 0.0f32;
        let mut frequency = BASE_FREQUENCY;
        let mut weight = 1.0f32;
        for octave in 0..self.octaves {
            total += weight * self.value_noise(x * frequency, y * frequency, octave);
            norm += weight;
            frequency *= 2.0;
            weight *= 0.5;
        }
        self.amplitude * total / norm
    }

    fn value_noise(&self, x: f64, y: f64, octave: u32) -> f32 {
        let (x0, y0) = (x.floor(), y.floor());
        let sx = smoothstep((x - x0) as f32);
        let sy = smoothstep((y - y0) as f32);
        let (ix, iy) = (x0 as i64, y0 as i64);

        let a = self.lattice(ix, iy, octave);
        let b = self.lattice(ix + 1, iy, octave);
        let c = self.lattice(ix, iy + 1, octave);
        let d = self.lattice(ix + 1, iy + 1, octave);
        lerp(lerp(a, b, sx), lerp(c, d, sx), sy)
    }

    /// Pseudo-random value in `[0, 1)` at a lattice point.
    fn lattice(&self, x: i64, y: i64, octave: u32) -> f32 {
        let mut h = (x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (y as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
            ^ (((self.seed as u64) << 32) | octave as u64);
        h ^= h >> 33;
        h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
        h ^= h >> 33;
        h = h.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
        h ^= h >> 33;
        (h >> 40) as f32 / (1u64 << 24) as f32
    }
}

fn smoothstep(t: f32) -> f32 {
    t * t * (3.0 - 2.0 * t)
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

impl TileGenerator for NoiseGenerator {
    fn has_tile(&self, coord: TileCoord) -> bool {
        coord.level <= self.max_level
    }

    fn border(&self) -> u32 {
        self.border
    }

    fn do_create_tile(&self, ctx: &CreateContext<'_>, slot: &mut SlotState) -> bool {
        let size = self.tile_size;
        let mut buf = BytesMut::with_capacity((size * size) as usize * 4);
        for j in 0..size {
            for i in 0..size {
                let (x, y) = self.texel_position(ctx.coord, i, j);
                buf.put_f32_le(self.height_at(x, y));
            }
        }
        slot.set_data(buf.freeze());
        self.produced.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// Decodes a tile written by [`NoiseGenerator`] or another `f32` producer.
pub fn decode_heights(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
