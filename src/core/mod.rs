//! # Core Module
//!
//! Generic containers shared by the streaming subsystems.
//!
//! ## Key Components
//! - `SlotArena` / `Handle`: dense storage addressed by generational handles.
//!   Stale handles (from results of tasks whose target was freed) fail lookups.
//! - `ObjectPool` / `Pooled`: fixed or growable pools of scratch objects with a
//!   lock-free free list and an RAII checkout guard.
//!
//! ## Usage
//! ```rust
//! use voxel_lod_streaming::core::{ObjectPool, PoolMode, SlotArena};
//!
//! let mut arena = SlotArena::new();
//! let handle = arena.insert(42u32);
//! assert_eq!(arena.get(handle), Some(&42));
//!
//! let pool = ObjectPool::new(PoolMode::Fixed(1), || vec![0u8; 64]);
//! let scratch = pool.acquire().unwrap();
//! assert_eq!(scratch.len(), 64);
//! ```

pub mod arena;
pub mod pool;

pub use arena::{Handle, SlotArena};
pub use pool::{ObjectPool, PoolMode, Pooled};
