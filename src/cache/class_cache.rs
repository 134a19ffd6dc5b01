//! Identity map for one entity class
//!
//! Maps every known discriminator (numeric id and natural key) to the single
//! live proxy for that entity. One instance may be reachable under several
//! keys; eviction removes all of them.

use crate::cache::expiration::Expiration;
use crate::entity::proxy::Handle;
use crate::entity::{Discriminator, EntityClass};
use crate::error::NitrateResult;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ClassCache {
    class: EntityClass,
    entries: HashMap<Discriminator, Handle>,
}

impl ClassCache {
    pub fn new(class: EntityClass) -> Self {
        Self {
            class,
            entries: HashMap::new(),
        }
    }

    pub fn class(&self) -> EntityClass {
        self.class
    }

    pub(crate) fn get(&self, discriminator: &Discriminator) -> Option<Handle> {
        self.entries.get(discriminator).cloned()
    }

    /// Return the cached proxy for `discriminator`, or build one with `loader`
    ///
    /// An expired hit is reset in place and returned, so the instance stays
    /// unique and refetches on next access. A dirty hit is returned as-is
    /// even past its TTL rather than replaced by a fresh load, so its unsaved
    /// changes survive. `loader` errors propagate and
    /// nothing is stored. With `store` false the cache is bypassed entirely.
    pub(crate) fn get_or_create<F>(
        &mut self,
        discriminator: &Discriminator,
        store: bool,
        ttl: Expiration,
        now: DateTime<Utc>,
        loader: F,
    ) -> NitrateResult<Handle>
    where
        F: FnOnce() -> NitrateResult<Handle>,
    {
        if store {
            if let Some(handle) = self.entries.get(discriminator) {
                let expired = {
                    let state = handle.borrow();
                    !state.dirty
                        && state
                            .fetched_at
                            .is_some_and(|fetched_at| ttl.is_expired(fetched_at, now))
                };
                if expired {
                    debug!("{}{} expired, refetching on access", self.class, discriminator);
                    handle.borrow_mut().reset();
                } else {
                    debug!("Cache hit for {}{}", self.class, discriminator);
                }
                return Ok(handle.clone());
            }
        }

        let handle = loader()?;
        if store {
            debug!("Cache miss for {}{}", self.class, discriminator);
            self.entries.insert(discriminator.clone(), handle.clone());
        }
        Ok(handle)
    }

    pub(crate) fn insert(&mut self, discriminator: Discriminator, handle: Handle) {
        self.entries.insert(discriminator, handle);
    }

    /// Make `handle` reachable under its id and return the canonical instance
    ///
    /// A vacant id slot simply points at `handle`. When the slot is held by
    /// another instance, that instance is canonical: it adopts the freshly
    /// fetched state if it never had any.
    pub(crate) fn register_id(&mut self, id: i64, handle: &Handle) -> Handle {
        let alias = Discriminator::Id(id);
        let Some(existing) = self.entries.get(&alias).cloned() else {
            self.entries.insert(alias, handle.clone());
            return handle.clone();
        };

        if Rc::ptr_eq(&existing, handle) {
            return existing;
        }

        let needs_state = {
            let state = existing.borrow();
            state.fetched_at.is_none() && !state.dirty
        };
        if needs_state {
            existing.borrow_mut().adopt(&handle.borrow());
        }
        debug!("{}{} already cached, converging on it", self.class, alias);
        existing
    }

    /// Remove the entry for `discriminator` and every alias of it
    pub(crate) fn evict(&mut self, discriminator: &Discriminator) -> Option<Handle> {
        let handle = self.entries.get(discriminator).cloned()?;
        self.discard(&handle);
        Some(handle)
    }

    /// Remove every key pointing at `handle`
    pub(crate) fn remove_instance(&mut self, handle: &Handle) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, h| !Rc::ptr_eq(h, handle));
        before - self.entries.len()
    }

    /// Remove everything; returns the number of distinct instances removed
    pub(crate) fn clear(&mut self) -> usize {
        let instances = self.instances();
        for handle in &instances {
            self.reset_if_dirty(handle);
        }
        self.entries.clear();
        instances.len()
    }

    /// Distinct cached instances
    pub(crate) fn instances(&self) -> Vec<Handle> {
        let mut seen: Vec<Handle> = Vec::with_capacity(self.entries.len());
        for handle in self.entries.values() {
            if !seen.iter().any(|h| Rc::ptr_eq(h, handle)) {
                seen.push(handle.clone());
            }
        }
        seen
    }

    /// Instances keyed by numeric id, in id order
    pub(crate) fn by_id(&self) -> Vec<(i64, Handle)> {
        let mut entries: Vec<(i64, Handle)> = self
            .entries
            .iter()
            .filter_map(|(d, h)| d.as_id().map(|id| (id, h.clone())))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Instances with unsaved changes
    pub(crate) fn dirty(&self) -> Vec<Handle> {
        self.instances()
            .into_iter()
            .filter(|h| h.borrow().dirty)
            .collect()
    }

    /// Number of distinct instances
    pub fn len(&self) -> usize {
        self.instances().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn discard(&mut self, handle: &Handle) {
        self.reset_if_dirty(handle);
        self.remove_instance(handle);
    }

    fn reset_if_dirty(&self, handle: &Handle) {
        if handle.borrow().dirty {
            warn!(
                "Evicting {} with unsaved changes; the changes are dropped",
                handle.borrow().key()
            );
            handle.borrow_mut().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::proxy::EntityState;
    use crate::error::NitrateError;
    use crate::entity::IdentityKey;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn loader(id: i64) -> impl FnOnce() -> NitrateResult<Handle> {
        move || Ok(EntityState::by_id(EntityClass::Product, id).into_handle())
    }

    fn fetched(handle: &Handle, name: &str, at: DateTime<Utc>) {
        let id = handle.borrow().id.unwrap_or(1);
        handle
            .borrow_mut()
            .apply_record(json!({ "id": id, "name": name }).as_object().unwrap(), at);
    }

    #[test]
    fn returns_same_instance_when_storing() {
        let mut cache = ClassCache::new(EntityClass::Product);
        let key = Discriminator::Id(7);
        let ttl = Expiration::NeverExpire;

        let a = cache.get_or_create(&key, true, ttl, now(), loader(7)).unwrap();
        let b = cache.get_or_create(&key, true, ttl, now(), loader(7)).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn dirty_hit_outlives_its_ttl() {
        let mut cache = ClassCache::new(EntityClass::Product);
        let key = Discriminator::Id(7);
        let ttl = Expiration::from_secs(60);
        let start = now();

        let handle = cache.get_or_create(&key, true, ttl, start, loader(7)).unwrap();
        fetched(&handle, "Fedora", start);
        handle.borrow_mut().set_field("name", json!("Rawhide"));

        let later = start + chrono::Duration::seconds(120);
        let hit = cache.get_or_create(&key, true, ttl, later, loader(7)).unwrap();
        assert!(Rc::ptr_eq(&hit, &handle));
        assert!(hit.borrow().dirty);
        assert_eq!(hit.borrow().fields["name"], json!("Rawhide"));
    }

    #[test]
    fn bypasses_cache_when_not_storing() {
        let mut cache = ClassCache::new(EntityClass::Product);
        let key = Discriminator::Id(7);
        let ttl = Expiration::NeverExpire;

        let a = cache.get_or_create(&key, false, ttl, now(), loader(7)).unwrap();
        let b = cache.get_or_create(&key, false, ttl, now(), loader(7)).unwrap();
        assert!(!Rc::ptr_eq(&a, &b));
        assert!(cache.is_empty());
    }

    #[test]
    fn loader_failure_stores_nothing() {
        let mut cache = ClassCache::new(EntityClass::Product);
        let key = Discriminator::Id(-1);
        let result = cache.get_or_create(&key, true, Expiration::NeverExpire, now(), || {
            Err(NitrateError::NotFound(IdentityKey::id(EntityClass::Product, -1)))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_hit_is_reset_in_place() {
        let mut cache = ClassCache::new(EntityClass::Product);
        let key = Discriminator::Id(7);
        let ttl = Expiration::from_secs(60);
        let start = now();

        let a = cache.get_or_create(&key, true, ttl, start, loader(7)).unwrap();
        fetched(&a, "Fedora", start);

        let later = start + chrono::Duration::seconds(120);
        let b = cache.get_or_create(&key, true, ttl, later, loader(7)).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert!(b.borrow().fetched_at.is_none());
    }

    #[test]
    fn natural_alias_converges_on_existing_id_entry() {
        let mut cache = ClassCache::new(EntityClass::Product);
        let by_id = cache
            .get_or_create(&Discriminator::Id(1), true, Expiration::NeverExpire, now(), loader(1))
            .unwrap();

        let natural = Discriminator::Natural(vec!["Fedora".to_string()]);
        let by_name = EntityState::by_natural(EntityClass::Product, vec!["Fedora".to_string()])
            .into_handle();
        cache.insert(natural.clone(), by_name.clone());
        fetched(&by_name, "Fedora", now());

        let canonical = cache.register_id(1, &by_name);
        assert!(Rc::ptr_eq(&canonical, &by_id));
        assert_eq!(by_id.borrow().fields["name"], json!("Fedora"));

        cache.insert(natural.clone(), canonical.clone());
        assert!(Rc::ptr_eq(&cache.get(&natural).unwrap(), &by_id));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evict_removes_all_aliases_and_resets_dirty() {
        let mut cache = ClassCache::new(EntityClass::TestPlan);
        let handle = EntityState::by_id(EntityClass::TestPlan, 3).into_handle();
        cache.insert(Discriminator::Id(3), handle.clone());
        cache.insert(Discriminator::Natural(vec!["x".into()]), handle.clone());
        fetched(&handle, "plan", now());
        handle.borrow_mut().set_field("name", json!("renamed"));

        assert!(cache.evict(&Discriminator::Id(3)).is_some());
        assert!(cache.is_empty());
        assert!(!handle.borrow().dirty);
        assert!(cache.evict(&Discriminator::Id(3)).is_none());
    }

    #[test]
    fn by_id_lists_in_order() {
        let mut cache = ClassCache::new(EntityClass::Product);
        for id in [3, 1, 2] {
            cache.insert(
                Discriminator::Id(id),
                EntityState::by_id(EntityClass::Product, id).into_handle(),
            );
        }
        let ids: Vec<i64> = cache.by_id().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(cache.clear(), 3);
    }
}
