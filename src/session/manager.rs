//! Process handle owning the registry, the batch queue and the cache file

use crate::cache::{
    CacheLevel, ClassStats, Expiration, PersistentStore, Registry, RestoreReport, StoreMode,
    SweepReport,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::entity::proxy::{Embedded, EntityState, Handle};
use crate::entity::{Discriminator, Entity, EntityClass, IdentityKey};
use crate::error::{NitrateError, NitrateResult};
use crate::rpc::batch::{self, BatchQueue, BatchResult};
use crate::rpc::{Remote, RemoteCall, RemoteFault};
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

/// Something waiting in the batch queue
#[derive(Debug)]
pub(crate) enum Pending {
    Entity(Handle),
    Call(RemoteCall),
}

/// State shared between [`Nitrate`] and every [`Entity`] it hands out
pub(crate) struct Shared {
    remote: Box<dyn Remote>,
    registry: RefCell<Registry>,
    batch: RefCell<BatchQueue<Pending>>,
    store: RefCell<Option<PersistentStore>>,
    /// Modified proxies below `Objects`, where the registry keeps nothing
    untracked: RefCell<Vec<Weak<RefCell<EntityState>>>>,
    cache_file: PathBuf,
    clock: Box<dyn Clock>,
    max_calls: usize,
    closed: Cell<bool>,
}

impl Shared {
    pub fn level(&self) -> CacheLevel {
        self.registry.borrow().level()
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    fn ensure_open(&self) -> NitrateResult<()> {
        if self.closed.get() {
            return Err(NitrateError::SessionClosed);
        }
        Ok(())
    }

    fn entity(self: &Rc<Self>, handle: Handle) -> Entity {
        Entity::new(handle, Rc::downgrade(self))
    }

    /// Proxy for `key`, from the cache when the level allows
    ///
    /// While reads are cached, a natural key missing from the cache is
    /// resolved right away so the proxy handed out is the one held under
    /// its id.
    pub fn lookup(self: &Rc<Self>, key: IdentityKey) -> NitrateResult<Entity> {
        self.ensure_open()?;
        validate_key(&key)?;

        let now = self.now();
        let mut handle = self.registry.borrow_mut().get_or_create(&key, now, || {
            Ok(EntityState::for_key(&key).into_handle())
        })?;

        let unresolved = {
            let state = handle.borrow();
            state.id.is_none() && !state.is_fetched()
        };
        if unresolved && self.level().caches_reads() {
            handle = self.fetch(&handle)?;
        }
        Ok(self.entity(handle))
    }

    /// Remember a modified proxy the registry does not hold
    pub fn track(&self, handle: &Handle) {
        if self.level().caches_reads() {
            return;
        }
        let mut untracked = self.untracked.borrow_mut();
        untracked.retain(|weak| weak.strong_count() > 0);
        if !untracked.iter().any(|weak| weak.as_ptr() == Rc::as_ptr(handle)) {
            untracked.push(Rc::downgrade(handle));
        }
    }

    /// Populate `handle` with one remote call; returns the canonical instance
    pub fn fetch(self: &Rc<Self>, handle: &Handle) -> NitrateResult<Handle> {
        self.ensure_open()?;
        let (call, key) = {
            let state = handle.borrow();
            (state.fetch_call()?, state.key())
        };

        debug!("Fetching {} via {}", key, call.method);
        let value = match self.remote.call(&call.method, &call.params) {
            Ok(value) => value,
            Err(fault) => return Err(self.fault_for(&key, fault)),
        };

        let now = self.now();
        let embedded = if handle.borrow().class.is_container() {
            let (ids, embedded) = member_records(handle.borrow().class, &value);
            handle.borrow_mut().set_members(ids, now);
            embedded
        } else {
            let Some(record) = single_record(&value) else {
                self.registry.borrow_mut().evict(&key);
                return Err(NitrateError::NotFound(key));
            };
            handle.borrow_mut().apply_record(record, now)
        };

        let canonical = self.registry.borrow_mut().register(handle);
        self.preload(embedded);
        Ok(canonical)
    }

    /// Seed the cache with records that arrived inside another response
    fn preload(&self, mut queue: Vec<Embedded>) {
        if !self.level().caches_reads() {
            return;
        }
        let now = self.now();

        while let Some(Embedded { class, record }) = queue.pop() {
            let Some(id) = record.get("id").and_then(Value::as_i64) else {
                continue;
            };
            let key = IdentityKey::id(class, id);
            let created = self.registry.borrow_mut().get_or_create(&key, now, || {
                Ok(EntityState::by_id(class, id).into_handle())
            });
            let Ok(handle) = created else {
                continue;
            };

            let untouched = {
                let state = handle.borrow();
                !state.is_fetched() && !state.dirty
            };
            if untouched {
                let nested = handle.borrow_mut().apply_embedded(&record, now);
                self.registry.borrow_mut().register(&handle);
                queue.extend(nested);
            }
        }
    }

    /// Send pending changes of `handle`, or queue them while batching
    pub fn write(self: &Rc<Self>, handle: &Handle) -> NitrateResult<()> {
        self.ensure_open()?;
        {
            let mut queue = self.batch.borrow_mut();
            if queue.is_collecting() {
                let queued = queue
                    .items()
                    .iter()
                    .any(|p| matches!(p, Pending::Entity(h) if Rc::ptr_eq(h, handle)));
                if !queued {
                    debug!("Queued {} for the batch", handle.borrow().key());
                    queue.push(Pending::Entity(handle.clone()));
                }
                return Ok(());
            }
        }

        let (pending, key) = {
            let state = handle.borrow();
            (state.pending_write()?, state.key())
        };
        for call in &pending.calls {
            debug!("Writing {} via {}", key, call.method);
            self.remote
                .call(&call.method, &call.params)
                .map_err(|fault| self.fault_for(&key, fault))?;
        }
        handle.borrow_mut().commit(&pending);
        Ok(())
    }

    fn fault_for(&self, key: &IdentityKey, fault: RemoteFault) -> NitrateError {
        if fault.is_not_found() {
            let fetched = self
                .registry
                .borrow()
                .get(key)
                .is_some_and(|h| h.borrow().is_fetched());
            if !fetched {
                self.registry.borrow_mut().evict(key);
            }
            NitrateError::NotFound(key.clone())
        } else {
            NitrateError::Remote(fault)
        }
    }

    fn end_batch(&self) -> NitrateResult<Vec<BatchResult>> {
        let items = self.batch.borrow_mut().finish()?;

        let mut calls = Vec::new();
        let mut writes = Vec::new();
        for item in items {
            match item {
                Pending::Call(call) => calls.push(call),
                Pending::Entity(handle) => {
                    let pending = match handle.borrow().pending_write() {
                        Ok(pending) => pending,
                        Err(e) => {
                            warn!("Skipping queued write of {}: {}", handle.borrow().key(), e);
                            continue;
                        }
                    };
                    let start = calls.len();
                    calls.extend(pending.calls.iter().cloned());
                    writes.push((handle, pending, start..calls.len()));
                }
            }
        }

        if calls.is_empty() {
            debug!("Batch ended with nothing to send");
            return Ok(Vec::new());
        }

        let results = batch::flush(self.remote.as_ref(), &calls, self.max_calls);
        for (handle, pending, range) in writes {
            if results[range].iter().all(BatchResult::is_ok) {
                handle.borrow_mut().commit(&pending);
            } else {
                warn!("Batched write of {} failed; it stays modified", handle.borrow().key());
            }
        }

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        info!("Batch sent {} calls, {} failed", results.len(), failed);
        Ok(results)
    }

    /// Write every entity with unsaved changes, cached or untracked
    fn flush(self: &Rc<Self>) -> NitrateResult<usize> {
        let mut dirty = self.registry.borrow().dirty();
        let untracked: Vec<Handle> = self
            .untracked
            .borrow_mut()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for handle in untracked {
            if handle.borrow().dirty && !dirty.iter().any(|h| Rc::ptr_eq(h, &handle)) {
                dirty.push(handle);
            }
        }

        let mut first_error = None;
        let mut written = 0;
        for handle in dirty {
            match self.write(&handle) {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!("Failed to write {}: {}", handle.borrow().key(), e);
                    self.track(&handle);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    fn save(&self) -> NitrateResult<bool> {
        let snapshot = self.registry.borrow_mut().snapshot(self.now());
        match self.store.borrow().as_ref() {
            Some(store) => store.save(&snapshot),
            None => Ok(false),
        }
    }

    fn load(&self) -> NitrateResult<RestoreReport> {
        let loaded = match self.store.borrow().as_ref() {
            Some(store) => store.load(),
            None => return Ok(RestoreReport::default()),
        };

        match loaded {
            Ok(Some(snapshot)) => {
                let report = self.registry.borrow_mut().restore(&snapshot, self.now());
                info!(
                    "Loaded {} cached entries, {} expired",
                    report.restored, report.sweep.expired
                );
                Ok(report)
            }
            Ok(None) => Ok(RestoreReport::default()),
            Err(e @ NitrateError::StoreCorrupt { .. }) => {
                self.abandon_store(&e);
                Ok(RestoreReport::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop using an unreadable cache file for the rest of the run
    fn abandon_store(&self, cause: &NitrateError) {
        warn!("{}; continuing without the persistent cache", cause);
        if let Some(store) = self.store.borrow_mut().take() {
            if store.is_owner() {
                if let Err(e) = store.discard() {
                    warn!("Failed to remove corrupt cache file: {}", e);
                }
            }
        }
        self.registry.borrow_mut().set_level(CacheLevel::Objects);
    }

    fn open_store(&self) -> NitrateResult<()> {
        if self.store.borrow().is_some() {
            return Ok(());
        }
        let store = PersistentStore::open(&self.cache_file)?;
        info!(
            "Opened cache {} ({:?})",
            store.path().display(),
            store.mode()
        );
        *self.store.borrow_mut() = Some(store);
        Ok(())
    }

    fn shutdown(self: &Rc<Self>) -> NitrateResult<()> {
        if self.closed.get() {
            return Ok(());
        }
        let mut first_error = None;

        if self.batch.borrow().is_collecting() {
            if let Err(e) = self.end_batch() {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.flush() {
            first_error.get_or_insert(e);
        }
        if self.level().is_persistent() {
            if let Err(e) = self.save() {
                warn!("Failed to save cache: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(mut store) = self.store.borrow_mut().take() {
            store.release();
        }
        self.closed.set(true);
        debug!("Nitrate session closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn validate_key(key: &IdentityKey) -> NitrateResult<()> {
    match &key.discriminator {
        Discriminator::Id(id) if *id <= 0 => Err(NitrateError::NotFound(key.clone())),
        Discriminator::Id(_) => Ok(()),
        Discriminator::Natural(parts) => {
            let names = key.class.natural_key();
            if names.is_empty() {
                return Err(NitrateError::NoNaturalKey(key.class));
            }
            if names.len() != parts.len() {
                return Err(NitrateError::NaturalKeyArity {
                    class: key.class,
                    expected: names.len(),
                    got: parts.len(),
                });
            }
            Ok(())
        }
    }
}

/// The record in a `get` or `filter` response
fn single_record(value: &Value) -> Option<&Map<String, Value>> {
    match value {
        Value::Object(record) => Some(record),
        Value::Array(items) => items.first().and_then(Value::as_object),
        _ => None,
    }
}

/// Member ids of a container response, plus any full member records
fn member_records(container: EntityClass, value: &Value) -> (Vec<i64>, Vec<Embedded>) {
    let Some(element) = container.relation().map(|r| r.element) else {
        return (Vec::new(), Vec::new());
    };
    let mut ids = Vec::new();
    let mut embedded = Vec::new();
    for item in value.as_array().into_iter().flatten() {
        match item {
            Value::Number(n) => ids.extend(n.as_i64()),
            Value::Object(record) => {
                if let Some(id) = record.get("id").and_then(Value::as_i64) {
                    ids.push(id);
                    embedded.push(Embedded {
                        class: element,
                        record: record.clone(),
                    });
                }
            }
            _ => {}
        }
    }
    (ids, embedded)
}

/// Client-side object cache for one process
///
/// Owns one identity map per entity class. Entities handed out hold a weak
/// reference back here; once the `Nitrate` is dropped or closed they fail
/// with [`NitrateError::SessionClosed`]. Dropping flushes pending changes and
/// at level `Persistent` saves the cache file, logging failures. Use
/// [`Nitrate::close`] to see them.
///
/// ```
/// use nitrate::{config::Config, entity::EntityClass, rpc::MemoryRemote, Nitrate};
/// use serde_json::json;
///
/// let remote = MemoryRemote::new();
/// remote.insert(EntityClass::TestPlan, 7, json!({ "name": "Smoke" }));
///
/// let nitrate = Nitrate::new(&Config::default(), remote)?;
/// let plan = nitrate.get(EntityClass::TestPlan, 7)?;
/// assert_eq!(plan.get("name")?, json!("Smoke"));
/// # Ok::<(), nitrate::NitrateError>(())
/// ```
pub struct Nitrate {
    shared: Rc<Shared>,
}

impl Nitrate {
    pub fn new(config: &Config, remote: impl Remote + 'static) -> NitrateResult<Self> {
        Self::with_clock(config, remote, SystemClock)
    }

    /// Like [`Nitrate::new`] with a custom time source
    pub fn with_clock(
        config: &Config,
        remote: impl Remote + 'static,
        clock: impl Clock + 'static,
    ) -> NitrateResult<Self> {
        remote.set_timeout(config.rpc.timeout());
        let level = config.cache.level;
        let shared = Rc::new(Shared {
            remote: Box::new(remote),
            registry: RefCell::new(Registry::new(level, config.expiration.policy())),
            batch: RefCell::new(BatchQueue::new()),
            store: RefCell::new(None),
            untracked: RefCell::new(Vec::new()),
            cache_file: config.cache.file_path(),
            clock: Box::new(clock),
            max_calls: config.batch.max_calls.max(1),
            closed: Cell::new(false),
        });
        debug!("Nitrate session at cache level {}", level);

        if level.is_persistent() {
            shared.open_store()?;
            shared.load()?;
        }
        Ok(Self { shared })
    }

    /// Entity with numeric id `id`; fetched on first field access
    pub fn get(&self, class: EntityClass, id: i64) -> NitrateResult<Entity> {
        self.shared.lookup(IdentityKey::id(class, id))
    }

    /// Entity by natural key, e.g. a tag by name or a build by name and product id
    pub fn get_by_key<S: AsRef<str>>(&self, class: EntityClass, parts: &[S]) -> NitrateResult<Entity> {
        self.shared.lookup(IdentityKey::natural(class, parts))
    }

    pub fn lookup(&self, key: IdentityKey) -> NitrateResult<Entity> {
        self.shared.lookup(key)
    }

    /// Entity with `id`, fetched now
    pub fn fetch(&self, class: EntityClass, id: i64) -> NitrateResult<Entity> {
        let entity = self.get(class, id)?;
        entity.load()?;
        Ok(entity)
    }

    pub fn level(&self) -> CacheLevel {
        self.shared.level()
    }

    /// Switch cache level for the rest of the run
    ///
    /// Entering `Persistent` opens and loads the cache file; leaving it saves
    /// and releases the file.
    pub fn set_level(&self, level: CacheLevel) -> NitrateResult<()> {
        let current = self.level();
        if current.is_persistent() && !level.is_persistent() {
            self.shared.save()?;
            if let Some(mut store) = self.shared.store.borrow_mut().take() {
                store.release();
            }
        }
        self.shared.registry.borrow_mut().set_level(level);
        if level.is_persistent() && !current.is_persistent() {
            self.shared.open_store()?;
            self.shared.load()?;
        }
        Ok(())
    }

    pub fn set_expiration(&self, class: EntityClass, expiration: Expiration) {
        self.shared
            .registry
            .borrow_mut()
            .set_expiration(class, expiration);
    }

    /// Start collecting writes into a multicall
    pub fn begin_batch(&self) -> NitrateResult<()> {
        self.shared.ensure_open()?;
        self.shared.batch.borrow_mut().begin()?;
        debug!("Batch started");
        Ok(())
    }

    pub fn in_batch(&self) -> bool {
        self.shared.batch.borrow().is_collecting()
    }

    /// Queue a raw call into the current batch
    pub fn queue_call(&self, method: impl Into<String>, params: Vec<Value>) -> NitrateResult<()> {
        let mut queue = self.shared.batch.borrow_mut();
        if !queue.is_collecting() {
            return Err(NitrateError::NoBatch);
        }
        queue.push(Pending::Call(RemoteCall::new(method, params)));
        Ok(())
    }

    /// Send everything queued, one result per call in queue order
    pub fn end_batch(&self) -> NitrateResult<Vec<BatchResult>> {
        self.shared.end_batch()
    }

    /// Run `f` inside a batch; the batch is sent even when `f` fails
    pub fn batch<T, F>(&self, f: F) -> NitrateResult<(T, Vec<BatchResult>)>
    where
        F: FnOnce(&Nitrate) -> NitrateResult<T>,
    {
        self.begin_batch()?;
        let outcome = f(self);
        let results = self.end_batch();
        let value = outcome?;
        Ok((value, results?))
    }

    /// Write every cached entity with unsaved changes
    pub fn flush(&self) -> NitrateResult<usize> {
        self.shared.flush()
    }

    /// Empty the given classes, or every class
    pub fn clear(&self, classes: Option<&[EntityClass]>) -> usize {
        self.shared.registry.borrow_mut().clear(classes)
    }

    pub fn evict(&self, key: &IdentityKey) -> bool {
        self.shared.registry.borrow_mut().evict(key)
    }

    /// Drop unfetched, modified and expired entries
    pub fn sweep(&self) -> SweepReport {
        let now = self.shared.now();
        self.shared.registry.borrow_mut().sweep(now)
    }

    pub fn stats(&self) -> Vec<ClassStats> {
        self.shared.registry.borrow().stats()
    }

    /// Mode of the cache file, when one is open
    pub fn store_mode(&self) -> Option<StoreMode> {
        self.shared.store.borrow().as_ref().map(PersistentStore::mode)
    }

    /// Write the cache file now; false when it is not ours to write
    pub fn save(&self) -> NitrateResult<bool> {
        self.shared.save()
    }

    /// Merge the cache file into memory
    pub fn load(&self) -> NitrateResult<RestoreReport> {
        self.shared.load()
    }

    /// Write a snapshot to `path`, ignoring the configured file and its lock
    pub fn save_to(&self, path: &Path) -> NitrateResult<()> {
        let snapshot = self.shared.registry.borrow_mut().snapshot(self.shared.now());
        PersistentStore::write_snapshot(path, &snapshot)
    }

    /// Merge a snapshot from `path` into memory
    pub fn load_from(&self, path: &Path) -> NitrateResult<RestoreReport> {
        match PersistentStore::peek(path)? {
            Some(snapshot) => Ok(self
                .shared
                .registry
                .borrow_mut()
                .restore(&snapshot, self.shared.now())),
            None => Ok(RestoreReport::default()),
        }
    }

    /// Flush, save and release the cache file
    pub fn close(self) -> NitrateResult<()> {
        self.shared.shutdown()
    }
}

impl Drop for Nitrate {
    fn drop(&mut self) {
        if let Err(e) = self.shared.shutdown() {
            warn!("Error while closing Nitrate session: {}", e);
        }
    }
}
