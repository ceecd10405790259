//! # Streaming Configuration
//!
//! JSON-backed configuration for the streaming context. Every section carries
//! `#[serde(default)]`, so a file only needs to name the values it changes:
//!
//! ```json
//! { "octree": { "max_depth": 3 }, "terrain": { "height": { "kind": "flat", "height": 10 } } }
//! ```
//!
//! Values are checked by [`StreamingConfig::validate`] before the streamer is
//! built; the loaders call it for you.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine_state::voxels::chunk::CS;
use crate::error::ConfigError;

/// Deepest octree supported. Node sizes are computed as `CS << (max_depth - depth)`
/// in 32-bit space.
pub const MAX_SUPPORTED_DEPTH: u8 = 20;

/// Top-level configuration for a [`TerrainStreamer`](crate::TerrainStreamer).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// LOD octree layout.
    pub octree: OctreeConfig,
    /// Worker pool sizing and admission control.
    pub workers: WorkerConfig,
    /// GPU-side capacities.
    pub gpu: GpuConfig,
    /// Terrain source and height-map caching.
    pub terrain: TerrainConfig,
}

/// Layout of the LOD octree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OctreeConfig {
    /// Depth of the leaf level. The root covers `CS << max_depth` voxels per axis.
    pub max_depth: u8,
    /// A node splits while the camera is closer than `factor * node_size` to its centre.
    pub lod_distance_factor: f32,
    /// Minimum corner of the root node. `None` centres the root on x/z and puts
    /// one leaf chunk below y = 0.
    pub origin: Option<[i32; 3]>,
}

impl Default for OctreeConfig {
    fn default() -> Self {
        Self {
            max_depth: 4,
            lod_distance_factor: 1.5,
            origin: None,
        }
    }
}

impl OctreeConfig {
    /// Edge length of the root node in voxels.
    pub fn root_size(&self) -> i32 {
        (CS as i32) << self.max_depth
    }

    /// Minimum corner of the root node in world voxels.
    pub fn root_origin(&self) -> [i32; 3] {
        self.origin.unwrap_or_else(|| {
            let half = self.root_size() / 2;
            [-half, -(CS as i32), -half]
        })
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker threads. Zero uses the available parallelism.
    pub threads: usize,
    /// Hard admission limit on dispatched, not yet drained tasks.
    pub max_tasks_in_flight: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            max_tasks_in_flight: 32,
        }
    }
}

impl WorkerConfig {
    /// Thread count with the zero default resolved.
    pub fn resolved_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// GPU-side capacities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Size of the shared staging ring in bytes.
    pub staging_ring_bytes: usize,
    /// Initial capacity of the quad buffer, in quads.
    pub initial_quad_capacity: u32,
    /// Initial number of draw slots in the metadata and indirect buffers.
    pub initial_draw_capacity: u32,
    /// Frames the renderer may still be reading a retired buffer from.
    pub frames_in_flight: u32,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            staging_ring_bytes: 16 * 1024 * 1024,
            initial_quad_capacity: 1 << 20,
            initial_draw_capacity: 256,
            frames_in_flight: 2,
        }
    }
}

/// Where column heights come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeightSource {
    /// Fractal Perlin noise.
    Noise {
        /// Noise seed.
        seed: u32,
        /// Height of the zero noise level.
        base_height: i32,
        /// Peak deviation from `base_height`.
        amplitude: f64,
        /// Base frequency in cycles per voxel.
        frequency: f64,
        /// Number of fractal octaves.
        octaves: usize,
    },
    /// Every column has the same height.
    Flat {
        /// Surface height. Voxels with `y < height` are solid.
        height: i32,
    },
}

impl Default for HeightSource {
    fn default() -> Self {
        HeightSource::Noise {
            seed: 1337,
            base_height: 16,
            amplitude: 48.0,
            frequency: 1.0 / 512.0,
            octaves: 5,
        }
    }
}

/// Terrain source and height-map cache policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// Column height source.
    pub height: HeightSource,
    /// Inactivity after which a cached height map is evicted.
    pub height_map_ttl_ms: u64,
    /// Upper bound on cached height maps regardless of age.
    pub height_map_cache_entries: usize,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            height: HeightSource::default(),
            height_map_ttl_ms: 1000,
            height_map_cache_entries: 4096,
        }
    }
}

impl StreamingConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: StreamingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Rejects values the streamer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.octree.max_depth > MAX_SUPPORTED_DEPTH {
            return invalid("octree.max_depth exceeds 20");
        }
        if !(self.octree.lod_distance_factor > 0.0) {
            return invalid("octree.lod_distance_factor must be positive");
        }
        if self.workers.max_tasks_in_flight == 0 {
            return invalid("workers.max_tasks_in_flight must be at least 1");
        }
        if self.gpu.staging_ring_bytes == 0 {
            return invalid("gpu.staging_ring_bytes must be non-zero");
        }
        if self.gpu.initial_quad_capacity == 0 || self.gpu.initial_draw_capacity == 0 {
            return invalid("gpu initial capacities must be non-zero");
        }
        if self.terrain.height_map_ttl_ms == 0 {
            return invalid("terrain.height_map_ttl_ms must be non-zero");
        }
        if self.terrain.height_map_cache_entries == 0 {
            return invalid("terrain.height_map_cache_entries must be non-zero");
        }
        if let HeightSource::Noise { octaves, .. } = self.terrain.height {
            if octaves == 0 {
                return invalid("terrain.height.octaves must be at least 1");
            }
        }
        Ok(())
    }
}
