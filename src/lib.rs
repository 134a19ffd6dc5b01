//! Nitrate - client-side object cache for the Nitrate test case management API
//!
//! Remote entities are handed out as lazily fetched [`Entity`] proxies kept
//! in a per-class identity map. Field changes are tracked locally and written
//! back on `update()`, optionally coalesced into multicalls. At the
//! `Persistent` cache level the identity map survives across runs in a
//! gzip-compressed cache file guarded by a lock file.

pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod entity;
pub mod error;
pub mod rpc;
pub mod session;

pub use cache::{CacheLevel, Expiration};
pub use entity::{Entity, EntityClass, IdentityKey};
pub use error::{NitrateError, NitrateResult};
pub use rpc::{Remote, RemoteFault};
pub use session::Nitrate;
