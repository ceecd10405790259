//! # Height Map Cache
//!
//! Column heights are sampled once per `(x, z, lod)` footprint and shared by
//! every chunk stacked on that footprint. Entries are kept in an LRU map behind
//! a mutex that is held only for lookups and inserts; sampling happens outside
//! it, so two workers missing the same key may both sample and the second
//! insert is dropped in favour of the first.
//!
//! Entries untouched for the configured TTL are evicted by
//! [`HeightMapCache::evict_expired`]. The sample buffers come from an object
//! pool and return to it once the last chunk task holding one finishes.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use lru::LruCache;
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use parking_lot::Mutex;
use web_time::Instant;

use crate::config::{HeightSource, TerrainConfig};
use crate::core::{ObjectPool, PoolMode, Pooled};
use crate::engine_state::voxels::chunk::{PCS, PCS2};
use crate::error::PoolError;

/// Source of terrain column heights in world voxels.
pub trait HeightField: Send + Sync {
    /// Surface height at a world column. Voxels with `y < height` are solid.
    fn height(&self, x: i32, z: i32) -> i32;
}

/// Fractal Perlin terrain.
pub struct NoiseHeightField {
    noise: Fbm<Perlin>,
    base_height: i32,
    amplitude: f64,
}

impl NoiseHeightField {
    /// Builds the fractal noise source.
    pub fn new(seed: u32, base_height: i32, amplitude: f64, frequency: f64, octaves: usize) -> Self {
        let noise = Fbm::<Perlin>::new(seed)
            .set_octaves(octaves)
            .set_frequency(frequency);
        Self {
            noise,
            base_height,
            amplitude,
        }
    }
}

impl HeightField for NoiseHeightField {
    fn height(&self, x: i32, z: i32) -> i32 {
        let sample = self.noise.get([x as f64, z as f64]);
        self.base_height + (sample * self.amplitude).round() as i32
    }
}

/// Every column has the same height.
pub struct FlatHeightField {
    /// Surface height.
    pub height: i32,
}

impl HeightField for FlatHeightField {
    fn height(&self, _x: i32, _z: i32) -> i32 {
        self.height
    }
}

/// Builds the height field a config names.
pub fn height_field_from_config(source: &HeightSource) -> Box<dyn HeightField> {
    match *source {
        HeightSource::Noise {
            seed,
            base_height,
            amplitude,
            frequency,
            octaves,
        } => Box::new(NoiseHeightField::new(
            seed,
            base_height,
            amplitude,
            frequency,
            octaves,
        )),
        HeightSource::Flat { height } => Box::new(FlatHeightField { height }),
    }
}

/// Heights of the `PCS × PCS` padded columns of one chunk footprint.
pub struct HeightMapData {
    /// Heights indexed `x + z * PCS`, in world voxels.
    pub heights: Box<[i32]>,
}

impl Default for HeightMapData {
    fn default() -> Self {
        Self {
            heights: vec![0; PCS2].into_boxed_slice(),
        }
    }
}

impl HeightMapData {
    /// Height of a padded column.
    #[inline]
    pub fn get(&self, x: usize, z: usize) -> i32 {
        self.heights[x + z * PCS]
    }
}

/// Cache key: footprint minimum corner and LOD scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeightKey {
    /// World x of logical column 0.
    pub x: i32,
    /// World z of logical column 0.
    pub z: i32,
    /// World voxels per chunk voxel.
    pub scale: u32,
}

/// A shared, pooled height map.
pub type SharedHeightMap = Arc<Pooled<HeightMapData>>;

struct CachedHeightMap {
    data: SharedHeightMap,
    last_access: Instant,
}

/// Thread-safe TTL cache of height maps.
pub struct HeightMapCache {
    field: Box<dyn HeightField>,
    entries: Mutex<LruCache<HeightKey, CachedHeightMap>>,
    pool: Arc<ObjectPool<HeightMapData>>,
    ttl: Duration,
}

impl HeightMapCache {
    /// Creates a cache over `field` whose sample buffers are built on demand.
    pub fn new(field: Box<dyn HeightField>, ttl: Duration, max_entries: NonZeroUsize) -> Self {
        Self::with_pool_mode(field, ttl, max_entries, PoolMode::Growable)
    }

    /// Creates a cache whose sample buffers come from a pool of the given mode.
    pub fn with_pool_mode(
        field: Box<dyn HeightField>,
        ttl: Duration,
        max_entries: NonZeroUsize,
        mode: PoolMode,
    ) -> Self {
        Self {
            field,
            entries: Mutex::new(LruCache::new(max_entries)),
            pool: ObjectPool::new(mode, HeightMapData::default),
            ttl,
        }
    }

    /// Creates the cache a terrain config describes.
    pub fn from_config(config: &TerrainConfig) -> Self {
        let max_entries = NonZeroUsize::new(config.height_map_cache_entries).unwrap_or(NonZeroUsize::MIN);
        Self::new(
            height_field_from_config(&config.height),
            Duration::from_millis(config.height_map_ttl_ms),
            max_entries,
        )
    }

    /// Returns the height map for `key`, sampling it on a miss.
    ///
    /// Fails only when a miss finds a fixed sample pool exhausted.
    pub fn get_or_generate(&self, key: HeightKey) -> Result<SharedHeightMap, PoolError> {
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&key) {
                entry.last_access = Instant::now();
                return Ok(Arc::clone(&entry.data));
            }
        }

        let data = Arc::new(self.sample(key)?);

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            entry.last_access = Instant::now();
            return Ok(Arc::clone(&entry.data));
        }
        entries.put(
            key,
            CachedHeightMap {
                data: Arc::clone(&data),
                last_access: Instant::now(),
            },
        );
        Ok(data)
    }

    /// Drops entries idle for at least the TTL as of `now`.
    ///
    /// # Returns
    /// The number of evicted entries.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let mut evicted = 0;
        while let Some((_, entry)) = entries.peek_lru() {
            if now.saturating_duration_since(entry.last_access) < self.ttl {
                break;
            }
            entries.pop_lru();
            evicted += 1;
        }
        if evicted > 0 {
            debug!("Evicted {evicted} height maps, {} cached", entries.len());
        }
        evicted
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The backing sample pool.
    pub fn pool(&self) -> &Arc<ObjectPool<HeightMapData>> {
        &self.pool
    }

    /// The height source.
    pub fn field(&self) -> &dyn HeightField {
        self.field.as_ref()
    }

    fn sample(&self, key: HeightKey) -> Result<Pooled<HeightMapData>, PoolError> {
        let mut data = self.pool.acquire()?;
        let scale = key.scale as i32;
        for z in 0..PCS {
            let world_z = key.z + (z as i32 - 1) * scale;
            for x in 0..PCS {
                let world_x = key.x + (x as i32 - 1) * scale;
                data.heights[x + z * PCS] = self.field.height(world_x, world_z);
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ramp;

    impl HeightField for Ramp {
        fn height(&self, x: i32, z: i32) -> i32 {
            x + 2 * z
        }
    }

    fn cache(ttl_ms: u64) -> HeightMapCache {
        HeightMapCache::new(
            Box::new(Ramp),
            Duration::from_millis(ttl_ms),
            NonZeroUsize::new(16).unwrap(),
        )
    }

    #[test]
    fn samples_include_halo_at_lod_scale() {
        let cache = cache(1000);
        let map = cache.get_or_generate(HeightKey { x: 10, z: 20, scale: 2 }).unwrap();
        // Padded column 0 is one LOD cell before the footprint.
        assert_eq!(map.get(0, 0), 8 + 2 * 18);
        assert_eq!(map.get(1, 1), 10 + 2 * 20);
        assert_eq!(map.get(3, 1), 14 + 2 * 20);
    }

    #[test]
    fn hits_share_the_same_samples() {
        let cache = cache(1000);
        let key = HeightKey { x: 0, z: 0, scale: 1 };
        let a = cache.get_or_generate(key).unwrap();
        let b = cache.get_or_generate(key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.pool().created(), 1);
    }

    #[test]
    fn expired_entries_return_to_pool() {
        let cache = cache(1);
        let key = HeightKey { x: 0, z: 0, scale: 1 };
        drop(cache.get_or_generate(key).unwrap());
        assert_eq!(cache.pool().checked_out(), 1);

        assert_eq!(cache.evict_expired(Instant::now() + Duration::from_millis(5)), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.pool().checked_out(), 0);

        drop(cache.get_or_generate(key).unwrap());
        assert_eq!(cache.pool().created(), 1);
    }

    #[test]
    fn fresh_entries_survive_eviction() {
        let cache = cache(60_000);
        drop(cache.get_or_generate(HeightKey { x: 0, z: 0, scale: 1 }).unwrap());
        assert_eq!(cache.evict_expired(Instant::now()), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn fixed_pool_misses_fail_until_an_entry_is_evicted() {
        let cache = HeightMapCache::with_pool_mode(
            Box::new(Ramp),
            Duration::from_millis(1),
            NonZeroUsize::new(16).unwrap(),
            PoolMode::Fixed(1),
        );
        let first = HeightKey { x: 0, z: 0, scale: 1 };
        let second = HeightKey { x: 62, z: 0, scale: 1 };
        drop(cache.get_or_generate(first).unwrap());

        assert!(matches!(
            cache.get_or_generate(second),
            Err(PoolError::Exhausted { capacity: 1 })
        ));
        // Hits need no buffer.
        assert!(cache.get_or_generate(first).is_ok());

        cache.evict_expired(Instant::now() + Duration::from_millis(5));
        assert_eq!(cache.get_or_generate(second).unwrap().get(1, 1), 62);
    }

    #[test]
    fn flat_field_from_config() {
        let field = height_field_from_config(&HeightSource::Flat { height: 10 });
        assert_eq!(field.height(-500, 9000), 10);
    }
}
