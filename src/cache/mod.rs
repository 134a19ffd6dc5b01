//! Client-side object cache
//!
//! Every entity class has its own identity map ([`ClassCache`]). The
//! [`Registry`] holds all of them together with the process-wide
//! [`CacheLevel`] and TTL table, and the [`PersistentStore`] carries them
//! across runs at level `Persistent`.
//!
//! # Levels
//!
//! | Level | Lookups | Field changes | On exit |
//! |-------|---------|---------------|---------|
//! | None | always fresh | written at once | nothing |
//! | Changes | always fresh | kept until `update()` | nothing |
//! | Objects | one instance per key | kept until `update()` | nothing |
//! | Persistent | one instance per key | kept until `update()` | saved to disk |

pub mod class_cache;
pub mod expiration;
pub mod policy;
pub mod registry;
pub mod store;

pub use class_cache::ClassCache;
pub use expiration::{
    Expiration, ExpirationPolicy, SweepReport, DEFAULT_EXPIRATION, IMMUTABLE_EXPIRATION,
};
pub use policy::{CacheLevel, CACHE_LEVEL_ENV};
pub use registry::{ClassStats, Registry, RestoreReport};
pub use store::{LockInfo, PersistentStore, Snapshot, StoreMode, SNAPSHOT_VERSION};
