use thiserror::Error;

/// Errors raised when building a tile storage pool
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// A storage pool must hold at least one slot
    #[error("Storage capacity must be greater than 0")]
    ZeroCapacity,

    /// Tiles must have a non-empty side
    #[error("Tile size must be greater than 0")]
    ZeroTileSize,
}

/// Errors related to task graph construction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Node id does not refer to a live task in this graph
    #[error("Unknown task graph node: {0}")]
    UnknownNode(usize),

    /// A task cannot depend on itself
    #[error("Task graph node {0} cannot depend on itself")]
    SelfDependency(usize),

    /// The graph has no result node to attach dependencies to
    #[error("Task graph has no result node")]
    NoResult,

    /// Adding the edge would make the graph cyclic
    #[error("Dependency {src} -> {dst} would create a cycle")]
    Cycle { src: usize, dst: usize },
}

/// Errors raised while validating CLI configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Storage must hold at least one tile
    #[error("capacity must be greater than 0")]
    ZeroCapacity,

    /// Tile size out of the supported range
    #[error("tile_size must be between {min} and {max}, got {actual}")]
    TileSize { min: u32, max: u32, actual: u32 },

    /// Quadtree depth out of the supported range
    #[error("levels must be between 1 and {max}, got {actual}")]
    Levels { max: u32, actual: u32 },

    /// The simulation needs at least one frame
    #[error("frames must be greater than 0")]
    ZeroFrames,

    /// Border must leave some interior texels
    #[error("border {border} is too large for tile_size {tile_size}")]
    Border { border: u32, tile_size: u32 },
}

/// Errors that prevent a simulation from running
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulationError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Storage pool could not be built
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
