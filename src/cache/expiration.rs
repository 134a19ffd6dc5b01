//! Per-class time-to-live and the expiration sweeper
//!
//! An entry is evicted when it was never fetched, when it has unsaved local
//! changes, or when it is older than its class TTL. Dirty entries are reset
//! rather than flushed, so their edits are lost; callers that care must
//! `update()` before sweeping.

use crate::cache::class_cache::ClassCache;
use crate::entity::{ClassKind, EntityClass};
use crate::error::NitrateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Global default TTL
pub const DEFAULT_EXPIRATION: Expiration = Expiration::After(Duration::from_secs(60 * 60));

/// Default TTL for immutable reference data
pub const IMMUTABLE_EXPIRATION: Expiration =
    Expiration::After(Duration::from_secs(30 * 24 * 60 * 60));

/// How long a cached entry stays valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawExpiration", into = "RawExpiration")]
pub enum Expiration {
    /// Entries are stale as soon as they are fetched
    NeverCache,
    /// Entries never go stale by age
    NeverExpire,
    /// Entries go stale after the given duration
    After(Duration),
}

impl Expiration {
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::NeverCache
        } else {
            Self::After(Duration::from_secs(secs))
        }
    }

    /// Whether an entry fetched at `fetched_at` is stale at `now`
    pub fn is_expired(&self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Self::NeverCache => true,
            Self::NeverExpire => false,
            Self::After(ttl) => chrono::Duration::from_std(*ttl)
                .map(|ttl| now - fetched_at > ttl)
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for Expiration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeverCache => write!(f, "never-cache"),
            Self::NeverExpire => write!(f, "never-expire"),
            Self::After(ttl) => write!(f, "{}s", ttl.as_secs()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawExpiration {
    Seconds(u64),
    Keyword(String),
}

impl TryFrom<RawExpiration> for Expiration {
    type Error = NitrateError;

    fn try_from(raw: RawExpiration) -> Result<Self, Self::Error> {
        match raw {
            RawExpiration::Seconds(secs) => Ok(Self::from_secs(secs)),
            RawExpiration::Keyword(word) => word.parse(),
        }
    }
}

impl FromStr for Expiration {
    type Err = NitrateError;

    /// Seconds, `never-cache` or `never-expire`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "never-cache" => Ok(Self::NeverCache),
            "never-expire" => Ok(Self::NeverExpire),
            other => other
                .parse::<u64>()
                .map(Self::from_secs)
                .map_err(|_| NitrateError::InvalidExpiration(s.to_string())),
        }
    }
}

impl From<Expiration> for RawExpiration {
    fn from(expiration: Expiration) -> Self {
        match expiration {
            Expiration::NeverCache => Self::Keyword("never-cache".to_string()),
            Expiration::NeverExpire => Self::Keyword("never-expire".to_string()),
            Expiration::After(ttl) => Self::Seconds(ttl.as_secs()),
        }
    }
}

/// Resolved TTL table
///
/// Lookup order: per-class override, class default, global default.
#[derive(Debug, Clone)]
pub struct ExpirationPolicy {
    default: Expiration,
    immutable: Expiration,
    overrides: HashMap<EntityClass, Expiration>,
}

impl ExpirationPolicy {
    pub fn new(default: Expiration, immutable: Expiration) -> Self {
        Self {
            default,
            immutable,
            overrides: HashMap::new(),
        }
    }

    /// Build from config, where overrides are keyed by class name
    pub fn from_table(
        default: Expiration,
        immutable: Expiration,
        classes: &BTreeMap<String, Expiration>,
    ) -> Self {
        let mut policy = Self::new(default, immutable);
        for (name, expiration) in classes {
            match EntityClass::from_name(name) {
                Some(class) => policy.set(class, *expiration),
                None => warn!("Ignoring expiration for unknown class '{}'", name),
            }
        }
        policy
    }

    pub fn set(&mut self, class: EntityClass, expiration: Expiration) {
        self.overrides.insert(class, expiration);
    }

    /// TTL for entries of `class`
    pub fn for_class(&self, class: EntityClass) -> Expiration {
        if let Some(expiration) = self.overrides.get(&class) {
            return *expiration;
        }
        match class.kind() {
            ClassKind::Immutable => self.immutable,
            ClassKind::Mutable | ClassKind::Container => self.default,
        }
    }
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRATION, IMMUTABLE_EXPIRATION)
    }
}

/// What a sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Distinct entries looked at
    pub examined: usize,
    /// Evicted because they were never fetched
    pub unfetched: usize,
    /// Evicted because they outlived their TTL
    pub expired: usize,
    /// Evicted because they had unsaved changes
    pub dirty: usize,
}

impl SweepReport {
    pub fn evicted(&self) -> usize {
        self.unfetched + self.expired + self.dirty
    }

    pub fn kept(&self) -> usize {
        self.examined - self.evicted()
    }

    pub fn merge(&mut self, other: SweepReport) {
        self.examined += other.examined;
        self.unfetched += other.unfetched;
        self.expired += other.expired;
        self.dirty += other.dirty;
    }
}

/// Sweep one class cache
pub fn sweep(cache: &mut ClassCache, ttl: Expiration, now: DateTime<Utc>) -> SweepReport {
    let mut report = SweepReport::default();

    for handle in cache.instances() {
        report.examined += 1;

        let (fetched_at, dirty, key) = {
            let state = handle.borrow();
            (state.fetched_at, state.dirty, state.key())
        };

        if dirty {
            warn!("Dropping unsaved changes of {} from the cache", key);
            handle.borrow_mut().reset();
            report.dirty += 1;
        } else if let Some(fetched_at) = fetched_at {
            if !ttl.is_expired(fetched_at, now) {
                continue;
            }
            report.expired += 1;
        } else {
            report.unfetched += 1;
        }

        cache.remove_instance(&handle);
    }

    if report.evicted() > 0 {
        debug!(
            "Swept {}: kept {}, evicted {} (unfetched {}, expired {}, dirty {})",
            cache.class(),
            report.kept(),
            report.evicted(),
            report.unfetched,
            report.expired,
            report.dirty
        );
    }
    report
}
