//! Command-line configuration.
//!
//! Every option can be given as a flag or through an environment variable
//! with the `QUADTILE_` prefix:
//!
//! - `QUADTILE_TILE_SIZE` - Tile side in texels, border included (default: 64)
//! - `QUADTILE_BORDER` - Border width in texels (default: 2)
//! - `QUADTILE_CAPACITY` - Slots per tile cache (default: 512)
//! - `QUADTILE_LEVELS` - Quadtree depth (default: 8)
//! - `QUADTILE_FRAMES` - Frames to simulate (default: 120)
//! - `QUADTILE_SEED` - Terrain seed (default: 42)
//! - `QUADTILE_WORKERS` - Worker tasks, 0 runs tasks inline (default: 4)
//! - `QUADTILE_SLOPE` - Also produce slope tiles (default: false)
//! - `QUADTILE_PREFETCH` - Prefetch the next frame's tiles (default: false)
//! - `QUADTILE_FORMAT` - Output format, `text` or `json` (default: text)

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use crate::error::ConfigError;

// =============================================================================
// Default Values
// =============================================================================

pub const DEFAULT_TILE_SIZE: u32 = 64;

pub const DEFAULT_BORDER: u32 = 2;

pub const DEFAULT_CAPACITY: usize = 512;

pub const DEFAULT_LEVELS: u32 = 8;

pub const DEFAULT_FRAMES: u32 = 120;

pub const DEFAULT_SEED: u32 = 42;

pub const DEFAULT_WORKERS: usize = 4;

pub const MIN_TILE_SIZE: u32 = 4;

pub const MAX_TILE_SIZE: u32 = 1024;

/// Deepest supported quadtree. Tile coordinates stay within `u32`.
pub const MAX_LEVELS: u32 = 24;

/// Each texel holds one little-endian `f32`.
pub const BYTES_PER_TEXEL: u64 = 4;

// =============================================================================
// CLI Arguments
// =============================================================================

/// quadtile - A quadtree tile cache driven by a terrain camera walk.
#[derive(Parser, Debug, Clone)]
#[command(name = "quadtile")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Walk a camera over procedural terrain and report cache behavior.
    Simulate(SimulateConfig),

    /// Validate a configuration and print its storage budget.
    Check(SimulateConfig),
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable summary
    #[default]
    Text,

    /// JSON document
    Json,
}

/// Options shared by `simulate` and `check`.
#[derive(Args, Debug, Clone)]
pub struct SimulateConfig {
    // =========================================================================
    // Storage Configuration
    // =========================================================================
    /// Tile side in texels, border included.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "QUADTILE_TILE_SIZE")]
    pub tile_size: u32,

    /// Border around each tile, in texels.
    #[arg(long, default_value_t = DEFAULT_BORDER, env = "QUADTILE_BORDER")]
    pub border: u32,

    /// Number of slots in each tile cache.
    #[arg(long, default_value_t = DEFAULT_CAPACITY, env = "QUADTILE_CAPACITY")]
    pub capacity: usize,

    // =========================================================================
    // Workload Configuration
    // =========================================================================
    /// Number of quadtree levels the camera can refine to.
    #[arg(long, default_value_t = DEFAULT_LEVELS, env = "QUADTILE_LEVELS")]
    pub levels: u32,

    /// Number of frames to simulate.
    #[arg(long, default_value_t = DEFAULT_FRAMES, env = "QUADTILE_FRAMES")]
    pub frames: u32,

    /// Seed of the procedural terrain.
    #[arg(long, default_value_t = DEFAULT_SEED, env = "QUADTILE_SEED")]
    pub seed: u32,

    /// Number of worker tasks. With 0, tasks run on the calling thread.
    #[arg(short, long, default_value_t = DEFAULT_WORKERS, env = "QUADTILE_WORKERS")]
    pub workers: usize,

    /// Also produce slope tiles derived from the height tiles.
    #[arg(long, default_value_t = false, env = "QUADTILE_SLOPE")]
    pub slope: bool,

    /// Prefetch the tiles the camera will need next frame.
    #[arg(long, default_value_t = false, env = "QUADTILE_PREFETCH")]
    pub prefetch: bool,

    // =========================================================================
    // Output Configuration
    // =========================================================================
    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, env = "QUADTILE_FORMAT")]
    pub format: OutputFormat,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            border: DEFAULT_BORDER,
            capacity: DEFAULT_CAPACITY,
            levels: DEFAULT_LEVELS,
            frames: DEFAULT_FRAMES,
            seed: DEFAULT_SEED,
            workers: DEFAULT_WORKERS,
            slope: false,
            prefetch: false,
            format: OutputFormat::Text,
            verbose: false,
        }
    }
}

impl SimulateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if !(MIN_TILE_SIZE..=MAX_TILE_SIZE).contains(&self.tile_size) {
            return Err(ConfigError::TileSize {
                min: MIN_TILE_SIZE,
                max: MAX_TILE_SIZE,
                actual: self.tile_size,
            });
        }
        if 2 * self.border >= self.tile_size {
            return Err(ConfigError::Border {
                border: self.border,
                tile_size: self.tile_size,
            });
        }
        if self.levels == 0 || self.levels > MAX_LEVELS {
            return Err(ConfigError::Levels {
                max: MAX_LEVELS,
                actual: self.levels,
            });
        }
        if self.frames == 0 {
            return Err(ConfigError::ZeroFrames);
        }
        Ok(())
    }

    /// Number of tile caches the simulation builds.
    pub fn cache_count(&self) -> usize {
        if self.slope {
            2
        } else {
            1
        }
    }

    pub fn bytes_per_slot(&self) -> u64 {
        u64::from(self.tile_size) * u64::from(self.tile_size) * BYTES_PER_TEXEL
    }

    pub fn storage_budget(&self) -> StorageBudget {
        let bytes_per_cache = self.bytes_per_slot() * self.capacity as u64;
        StorageBudget {
            caches: self.cache_count(),
            slots_per_cache: self.capacity,
            bytes_per_slot: self.bytes_per_slot(),
            total_bytes: bytes_per_cache * self.cache_count() as u64,
        }
    }
}

/// Memory needed by the tile storage of a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageBudget {
    pub caches: usize,
    pub slots_per_cache: usize,
    pub bytes_per_slot: u64,
    pub total_bytes: u64,
}

// =============================================================================
// Tests
// =============================================================================
