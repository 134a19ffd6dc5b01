//! Cache levels selecting how much the client keeps locally

use crate::error::NitrateError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Environment variable overriding the configured cache level
pub const CACHE_LEVEL_ENV: &str = "NITRATE_CACHE";

/// Process-wide caching level
///
/// | Level | Reads cached | Writes deferred | Saved to disk |
/// |-------|--------------|-----------------|---------------|
/// | 0 `None` | no | no | no |
/// | 1 `Changes` | no | yes | no |
/// | 2 `Objects` | yes | yes | no |
/// | 3 `Persistent` | yes | yes | yes |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CacheLevel {
    None,
    Changes,
    #[default]
    Objects,
    Persistent,
}

impl CacheLevel {
    /// Whether looked-up objects are kept in the identity map
    pub fn caches_reads(&self) -> bool {
        *self >= Self::Objects
    }

    /// Whether field changes wait for an explicit `update()`
    pub fn defers_writes(&self) -> bool {
        *self >= Self::Changes
    }

    pub fn is_persistent(&self) -> bool {
        *self == Self::Persistent
    }

    /// Read the level from `NITRATE_CACHE`, if set
    pub fn from_env() -> Option<Result<Self, NitrateError>> {
        std::env::var(CACHE_LEVEL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.parse())
    }
}

impl TryFrom<u8> for CacheLevel {
    type Error = NitrateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Changes),
            2 => Ok(Self::Objects),
            3 => Ok(Self::Persistent),
            other => Err(NitrateError::InvalidCacheLevel(other.to_string())),
        }
    }
}

impl From<CacheLevel> for u8 {
    fn from(level: CacheLevel) -> Self {
        match level {
            CacheLevel::None => 0,
            CacheLevel::Changes => 1,
            CacheLevel::Objects => 2,
            CacheLevel::Persistent => 3,
        }
    }
}

impl FromStr for CacheLevel {
    type Err = NitrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Self::try_from(n);
        }
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "changes" => Ok(Self::Changes),
            "objects" => Ok(Self::Objects),
            "persistent" => Ok(Self::Persistent),
            _ => Err(NitrateError::InvalidCacheLevel(s.to_string())),
        }
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Changes => "changes",
            Self::Objects => "objects",
            Self::Persistent => "persistent",
        };
        write!(f, "{}", name)
    }
}
