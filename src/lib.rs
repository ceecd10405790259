#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rustdoc::invalid_rust_codeblocks)]

//! # Voxel LOD Streaming
//!
//! The CPU-side core of a streaming voxel terrain renderer: it decides which
//! regions of an unbounded height-field world are drawn at which level of
//! detail, generates and meshes them on a worker pool, and keeps the GPU
//! buffers a multi-draw-indirect renderer reads from up to date.
//!
//! ## Key Modules
//!
//! * `config` - JSON configuration of every subsystem
//! * `core` - Generic containers: generational arenas and object pools
//! * `engine_state` - The streaming context and its subsystems
//! * `error` - Error types
//!
//! ## Architecture
//!
//! The crate is split between:
//! * A main thread that owns the octree, the allocators and the GPU backend
//! * Worker threads that generate terrain and mesh it into a shared staging ring
//! * A [`GpuBackend`](engine_state::buffer_state::GpuBackend) seam the
//!   embedding renderer implements (a `wgpu` and a headless backend ship here)
//!
//! ## Usage
//!
//! ```no_run
//! use cgmath::Point3;
//! use voxel_lod_streaming::engine_state::buffer_state::headless::HeadlessBackend;
//! use voxel_lod_streaming::{StreamingConfig, TerrainStreamer};
//!
//! voxel_lod_streaming::init_logging();
//! let config = StreamingConfig::from_json_str(r#"{ "octree": { "max_depth": 3 } }"#)?;
//! let mut streamer = TerrainStreamer::new(config, HeadlessBackend::new())?;
//! streamer.update(Point3::new(0.0, 64.0, 0.0))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Performance Considerations
//!
//! * Greedy binary meshing over 64-bit column masks
//! * One copy submission per frame for every upload, free and resize
//! * Object pools for chunk grids, mesher scratch and height maps
//! * Height maps shared between neighbouring chunks and LOD levels

use log::info;

pub mod config;
pub mod core;
pub mod engine_state;
pub mod error;

pub use config::StreamingConfig;
pub use engine_state::{StreamingStats, TerrainStreamer};
pub use error::StreamingError;

/// Installs the stdout logger, configured from `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let mut log_builder = env_logger::Builder::new();
    let installed = log_builder
        .target(env_logger::Target::Stdout)
        .parse_env("RUST_LOG")
        .try_init()
        .is_ok();
    if installed {
        info!("Logger initialized");
    }
}
