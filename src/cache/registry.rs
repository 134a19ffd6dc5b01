//! One class cache per entity class, plus the level and TTL table they obey

use crate::cache::class_cache::ClassCache;
use crate::cache::expiration::{self, Expiration, ExpirationPolicy, SweepReport};
use crate::cache::policy::CacheLevel;
use crate::cache::store::{ClassSection, Snapshot, SNAPSHOT_VERSION};
use crate::entity::proxy::{EntityState, Handle};
use crate::entity::{Discriminator, EntityClass, IdentityKey};
use crate::error::NitrateResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Entry counts for one class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassStats {
    pub class: EntityClass,
    pub entries: usize,
    pub fetched: usize,
    pub dirty: usize,
}

/// Counts from restoring a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    /// Entries already live in memory, kept over the persisted copy
    pub skipped: usize,
    /// Container members found among restored entries
    pub resident_members: usize,
    pub sweep: SweepReport,
}

#[derive(Debug)]
pub struct Registry {
    level: CacheLevel,
    caches: BTreeMap<EntityClass, ClassCache>,
    expirations: ExpirationPolicy,
}

impl Registry {
    pub fn new(level: CacheLevel, expirations: ExpirationPolicy) -> Self {
        let caches = EntityClass::all()
            .iter()
            .map(|class| (*class, ClassCache::new(*class)))
            .collect();
        Self {
            level,
            caches,
            expirations,
        }
    }

    pub fn level(&self) -> CacheLevel {
        self.level
    }

    /// Change the level; dropping below `Objects` empties every cache
    pub fn set_level(&mut self, level: CacheLevel) {
        if level == self.level {
            return;
        }
        debug!("Cache level {} -> {}", self.level, level);
        self.level = level;
        if !level.caches_reads() {
            self.clear(None);
        }
    }

    pub fn expirations(&self) -> &ExpirationPolicy {
        &self.expirations
    }

    pub fn set_expiration(&mut self, class: EntityClass, expiration: Expiration) {
        self.expirations.set(class, expiration);
    }

    pub fn cache(&self, class: EntityClass) -> Option<&ClassCache> {
        self.caches.get(&class)
    }

    fn cache_mut(&mut self, class: EntityClass) -> &mut ClassCache {
        self.caches
            .entry(class)
            .or_insert_with(|| ClassCache::new(class))
    }

    pub(crate) fn get(&self, key: &IdentityKey) -> Option<Handle> {
        self.caches.get(&key.class)?.get(&key.discriminator)
    }

    /// Look up `key`, building the proxy with `loader` on a miss
    pub(crate) fn get_or_create<F>(
        &mut self,
        key: &IdentityKey,
        now: DateTime<Utc>,
        loader: F,
    ) -> NitrateResult<Handle>
    where
        F: FnOnce() -> NitrateResult<Handle>,
    {
        let store = self.level.caches_reads();
        let ttl = self.expirations.for_class(key.class);
        self.cache_mut(key.class)
            .get_or_create(&key.discriminator, store, ttl, now, loader)
    }

    /// Register every key `handle` is now known by; returns the canonical
    /// instance
    pub(crate) fn register(&mut self, handle: &Handle) -> Handle {
        if !self.level.caches_reads() {
            return handle.clone();
        }

        let (class, id, natural) = {
            let state = handle.borrow();
            let natural = state.natural.clone().or_else(|| state.natural_from_fields());
            (state.class, state.id, natural)
        };
        let cache = self.cache_mut(class);

        let canonical = match id {
            Some(id) => cache.register_id(id, handle),
            None => handle.clone(),
        };
        if let Some(parts) = natural {
            cache.insert(Discriminator::Natural(parts), canonical.clone());
        }
        canonical
    }

    pub(crate) fn evict(&mut self, key: &IdentityKey) -> bool {
        let evicted = self.cache_mut(key.class).evict(&key.discriminator).is_some();
        if evicted {
            debug!("Evicted {}", key);
        }
        evicted
    }

    /// Empty the given classes, or all of them; returns entries removed
    pub fn clear(&mut self, classes: Option<&[EntityClass]>) -> usize {
        let removed: usize = match classes {
            Some(classes) => classes.iter().map(|c| self.cache_mut(*c).clear()).sum(),
            None => self.caches.values_mut().map(ClassCache::clear).sum(),
        };
        debug!("Cleared {} cached entries", removed);
        removed
    }

    /// Sweep every class with its TTL
    pub fn sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for (class, cache) in self.caches.iter_mut() {
            let ttl = self.expirations.for_class(*class);
            report.merge(expiration::sweep(cache, ttl, now));
        }
        report
    }

    /// Cached instances with unsaved changes, scalars before containers
    pub(crate) fn dirty(&self) -> Vec<Handle> {
        EntityClass::all()
            .iter()
            .filter_map(|class| self.caches.get(class))
            .flat_map(ClassCache::dirty)
            .collect()
    }

    pub fn stats(&self) -> Vec<ClassStats> {
        EntityClass::all()
            .iter()
            .filter_map(|class| self.caches.get(class))
            .map(|cache| {
                let instances = cache.instances();
                ClassStats {
                    class: cache.class(),
                    entries: instances.len(),
                    fetched: instances.iter().filter(|h| h.borrow().is_fetched()).count(),
                    dirty: instances.iter().filter(|h| h.borrow().dirty).count(),
                }
            })
            .collect()
    }

    /// Sweep, then capture every fetched, clean, id-keyed entry
    pub fn snapshot(&mut self, now: DateTime<Utc>) -> Snapshot {
        self.sweep(now);

        let mut classes = BTreeMap::new();
        for (class, cache) in &self.caches {
            let entries: BTreeMap<i64, _> = cache
                .by_id()
                .into_iter()
                .filter_map(|(id, handle)| handle.borrow().to_dump().map(|dump| (id, dump)))
                .collect();
            if !entries.is_empty() {
                classes.insert(class.name().to_string(), ClassSection { entries });
            }
        }

        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: now,
            classes,
        }
    }

    /// Load a snapshot into the caches, then sweep
    ///
    /// Scalar classes are restored before containers. Entries already live in
    /// memory win over their persisted copies.
    pub fn restore(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) -> RestoreReport {
        let mut report = RestoreReport::default();

        for name in snapshot.classes.keys() {
            if EntityClass::from_name(name).is_none() {
                warn!("Skipping unknown class '{}' in cache file", name);
            }
        }

        for class in EntityClass::all() {
            let Some(section) = snapshot.classes.get(class.name()) else {
                continue;
            };
            for (id, dump) in &section.entries {
                let key = IdentityKey::id(*class, *id);
                if self.get(&key).is_some() {
                    report.skipped += 1;
                    continue;
                }
                let handle = EntityState::from_dump(*class, *id, dump).into_handle();
                self.cache_mut(*class).insert(Discriminator::Id(*id), handle.clone());
                self.register(&handle);
                report.restored += 1;
            }
        }

        report.sweep = self.sweep(now);
        report.resident_members = self.wake_containers();

        debug!(
            "Restored {} entries ({} skipped, {} expired on load)",
            report.restored,
            report.skipped,
            report.sweep.evicted()
        );
        report
    }

    /// Count container members that resolve to cached entries
    fn wake_containers(&self) -> usize {
        let mut resident = 0;
        for class in EntityClass::all() {
            let Some(relation) = class.relation() else {
                continue;
            };
            let Some(cache) = self.caches.get(class) else {
                continue;
            };
            for (_, handle) in cache.by_id() {
                let state = handle.borrow();
                let Some(container) = state.container.as_ref() else {
                    continue;
                };
                resident += container
                    .members
                    .iter()
                    .filter(|id| self.get(&IdentityKey::id(relation.element, **id)).is_some())
                    .count();
            }
        }
        resident
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(CacheLevel::default(), ExpirationPolicy::default())
    }
}
