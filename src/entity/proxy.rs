//! Lazily populated proxies for remote entities
//!
//! An [`Entity`] is a cheap handle onto shared proxy state. The state starts
//! out knowing only its key; the first field access fetches the whole entity
//! in one call. Writes are recorded locally and sent by `update()`, or right
//! away when the cache level is `None`.

use crate::entity::class::natural_part;
use crate::entity::container::{ContainerSnapshot, ContainerState};
use crate::entity::enums::CodedEnum;
use crate::entity::{Discriminator, EntityClass, IdentityKey};
use crate::error::{NitrateError, NitrateResult};
use crate::rpc::RemoteCall;
use crate::session::manager::Shared;
use crate::cache::store::EntryDump;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

pub(crate) type Handle = Rc<RefCell<EntityState>>;

/// A record embedded in another entity's response
#[derive(Debug, Clone)]
pub(crate) struct Embedded {
    pub class: EntityClass,
    pub record: Map<String, Value>,
}

/// Calls that write an entity's pending changes, and what they cover
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingWrite {
    pub calls: Vec<RemoteCall>,
    fields: BTreeSet<&'static str>,
    added: BTreeSet<i64>,
    removed: BTreeSet<i64>,
}

/// Proxy state shared by every handle onto one entity
#[derive(Debug, Clone)]
pub(crate) struct EntityState {
    pub class: EntityClass,
    /// Resolved id; `None` until known
    pub id: Option<i64>,
    pub natural: Option<Vec<String>>,
    /// Absent fields are unresolved; `Value::Null` is an empty field
    pub fields: BTreeMap<&'static str, Value>,
    pub changed: BTreeSet<&'static str>,
    pub container: Option<ContainerState>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub dirty: bool,
}

impl EntityState {
    fn empty(class: EntityClass) -> Self {
        Self {
            class,
            id: None,
            natural: None,
            fields: BTreeMap::new(),
            changed: BTreeSet::new(),
            container: None,
            fetched_at: None,
            dirty: false,
        }
    }

    pub fn by_id(class: EntityClass, id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::empty(class)
        }
    }

    pub fn by_natural(class: EntityClass, parts: Vec<String>) -> Self {
        Self {
            natural: Some(parts),
            ..Self::empty(class)
        }
    }

    pub fn for_key(key: &IdentityKey) -> Self {
        match &key.discriminator {
            Discriminator::Id(id) => Self::by_id(key.class, *id),
            Discriminator::Natural(parts) => Self::by_natural(key.class, parts.clone()),
        }
    }

    pub fn into_handle(self) -> Handle {
        Rc::new(RefCell::new(self))
    }

    /// Id key when resolved, natural key otherwise
    pub fn key(&self) -> IdentityKey {
        match (self.id, &self.natural) {
            (Some(id), _) => IdentityKey::id(self.class, id),
            (None, Some(parts)) => IdentityKey::natural(self.class, parts),
            (None, None) => IdentityKey::natural::<&str>(self.class, &[]),
        }
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched_at.is_some()
    }

    /// Natural key derived from the populated fields
    pub fn natural_from_fields(&self) -> Option<Vec<String>> {
        let names = self.class.natural_key();
        if names.is_empty() {
            return None;
        }
        names
            .iter()
            .map(|name| self.fields.get(name).and_then(natural_part))
            .collect()
    }

    /// The call that populates this entity
    pub fn fetch_call(&self) -> NitrateResult<RemoteCall> {
        if let Some(relation) = self.class.relation() {
            let owner = self.id.ok_or_else(|| {
                NitrateError::Internal(format!("container {} has no owner id", self.class))
            })?;
            return Ok(RemoteCall::new(
                self.class.method(&format!("get_{}", relation.name)),
                vec![Value::from(owner)],
            ));
        }

        if let Some(id) = self.id {
            return Ok(RemoteCall::new(self.class.method("get"), vec![Value::from(id)]));
        }

        let parts = self.natural.as_deref().unwrap_or_default();
        let names = self.class.natural_key();
        if names.is_empty() {
            return Err(NitrateError::NoNaturalKey(self.class));
        }
        if names.len() != parts.len() {
            return Err(NitrateError::NaturalKeyArity {
                class: self.class,
                expected: names.len(),
                got: parts.len(),
            });
        }
        let query: Map<String, Value> = names
            .iter()
            .zip(parts)
            .map(|(name, part)| (name.to_string(), self.class.natural_param(name, part)))
            .collect();
        Ok(RemoteCall::new(self.class.method("filter"), vec![Value::Object(query)]))
    }

    /// Copy known fields out of `record`; returns embedded records and
    /// whether every field was present
    fn apply_fields(&mut self, record: &Map<String, Value>) -> (Vec<Embedded>, bool) {
        if let Some(id) = record.get("id").and_then(Value::as_i64) {
            self.id = Some(id);
        }

        let mut embedded = Vec::new();
        let mut complete = true;
        for name in self.class.fields() {
            let Some(value) = record.get(*name) else {
                complete = false;
                continue;
            };
            if self.changed.contains(name) {
                continue;
            }
            let value = match (self.class.reference(name), value) {
                (Some(target), Value::Object(inner)) => match inner.get("id") {
                    Some(id) => {
                        embedded.push(Embedded {
                            class: target,
                            record: inner.clone(),
                        });
                        id.clone()
                    }
                    None => value.clone(),
                },
                _ => value.clone(),
            };
            self.fields.insert(*name, value);
        }
        (embedded, complete)
    }

    /// Populate from a full fetch
    pub fn apply_record(&mut self, record: &Map<String, Value>, at: DateTime<Utc>) -> Vec<Embedded> {
        let (embedded, _) = self.apply_fields(record);
        self.fetched_at = Some(at);
        embedded
    }

    /// Populate from a record embedded in another response
    ///
    /// Only counts as fetched when the record carried every field.
    pub fn apply_embedded(&mut self, record: &Map<String, Value>, at: DateTime<Utc>) -> Vec<Embedded> {
        let (embedded, complete) = self.apply_fields(record);
        if complete {
            self.fetched_at = Some(at);
        }
        embedded
    }

    pub fn set_members(&mut self, members: Vec<i64>, at: DateTime<Utc>) {
        self.container = Some(ContainerState::from_members(members));
        self.fetched_at = Some(at);
        self.dirty = false;
    }

    /// Record a field change; returns whether the value differed
    pub fn set_field(&mut self, name: &'static str, value: Value) -> bool {
        if self.fields.get(name) == Some(&value) {
            return false;
        }
        self.fields.insert(name, value);
        self.changed.insert(name);
        self.dirty = true;
        true
    }

    pub fn add_member(&mut self, id: i64) -> bool {
        let changed = self.container.get_or_insert_with(Default::default).add(id);
        self.refresh_dirty();
        changed
    }

    pub fn remove_member(&mut self, id: i64) -> bool {
        let changed = self.container.get_or_insert_with(Default::default).remove(id);
        self.refresh_dirty();
        changed
    }

    fn refresh_dirty(&mut self) {
        self.dirty = !self.changed.is_empty()
            || self.container.as_ref().is_some_and(ContainerState::has_pending);
    }

    /// Calls needed to write local changes
    pub fn pending_write(&self) -> NitrateResult<PendingWrite> {
        let mut pending = PendingWrite::default();
        if !self.dirty {
            return Ok(pending);
        }
        let id = self
            .id
            .ok_or_else(|| NitrateError::Internal(format!("{} has no id to write", self.key())))?;

        if let (Some(relation), Some(container)) = (self.class.relation(), &self.container) {
            let ids = |set: &BTreeSet<i64>| Value::from(set.iter().copied().collect::<Vec<_>>());
            if !container.added.is_empty() {
                pending.calls.push(RemoteCall::new(
                    self.class.method(&format!("add_{}", relation.name)),
                    vec![Value::from(id), ids(&container.added)],
                ));
                pending.added = container.added.clone();
            }
            if !container.removed.is_empty() {
                pending.calls.push(RemoteCall::new(
                    self.class.method(&format!("remove_{}", relation.name)),
                    vec![Value::from(id), ids(&container.removed)],
                ));
                pending.removed = container.removed.clone();
            }
        } else if !self.changed.is_empty() {
            let changes: Map<String, Value> = self
                .changed
                .iter()
                .map(|name| {
                    let value = self.fields.get(name).cloned().unwrap_or(Value::Null);
                    (name.to_string(), value)
                })
                .collect();
            pending.calls.push(RemoteCall::new(
                self.class.method("update"),
                vec![Value::from(id), Value::Object(changes)],
            ));
            pending.fields = self.changed.clone();
        }
        Ok(pending)
    }

    /// Mark what `pending` covered as written
    pub fn commit(&mut self, pending: &PendingWrite) {
        self.changed.retain(|name| !pending.fields.contains(name));
        if let Some(container) = self.container.as_mut() {
            container.commit(&pending.added, &pending.removed);
        }
        self.refresh_dirty();
    }

    /// Back to the uninitialized state, keeping the key
    pub fn reset(&mut self) {
        self.fields.clear();
        self.changed.clear();
        self.container = None;
        self.fetched_at = None;
        self.dirty = false;
    }

    /// Take over the fetched state of another proxy for the same entity
    pub fn adopt(&mut self, other: &EntityState) {
        if self.id.is_none() {
            self.id = other.id;
        }
        self.fields = other.fields.clone();
        self.container = other.container.clone();
        self.fetched_at = other.fetched_at;
        self.changed.clear();
        self.refresh_dirty();
    }

    /// On-disk form; `None` for entries that must not be persisted
    pub fn to_dump(&self) -> Option<EntryDump> {
        let fetched_at = self.fetched_at?;
        if self.dirty {
            return None;
        }
        let fields = self
            .fields
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        Some(EntryDump {
            fetched_at,
            fields,
            members: self.container.as_ref().map(ContainerState::to_snapshot),
        })
    }

    pub fn from_dump(class: EntityClass, id: i64, dump: &EntryDump) -> Self {
        let mut state = Self::by_id(class, id);
        for (name, value) in &dump.fields {
            if let Some(name) = class.field(name) {
                state.fields.insert(name, value.clone());
            }
        }
        if class.is_container() {
            let snapshot = dump.members.clone().unwrap_or_else(ContainerSnapshot::default);
            state.container = Some(ContainerState::from_snapshot(&snapshot));
        }
        state.fetched_at = Some(dump.fetched_at);
        state
    }
}

/// Handle onto one remote entity
///
/// Clones share the same proxy state. Field reads fetch on first use; field
/// writes are kept until [`Entity::update`] unless the cache level writes
/// through. Dropping the last handle onto a modified entity the cache does
/// not hold writes it back, logging failures.
#[derive(Clone)]
pub struct Entity {
    state: Handle,
    session: Weak<Shared>,
}

impl Entity {
    pub(crate) fn new(state: Handle, session: Weak<Shared>) -> Self {
        Self { state, session }
    }

    fn session(&self) -> NitrateResult<Rc<Shared>> {
        self.session.upgrade().ok_or(NitrateError::SessionClosed)
    }

    pub fn class(&self) -> EntityClass {
        self.state.borrow().class
    }

    /// Current key: the id once known, the natural key before that
    pub fn key(&self) -> IdentityKey {
        self.state.borrow().key()
    }

    /// Id if already resolved, without fetching
    pub fn id(&self) -> Option<i64> {
        self.state.borrow().id
    }

    /// Id, fetching first when the entity was created from a natural key
    pub fn resolve_id(&self) -> NitrateResult<i64> {
        if let Some(id) = self.id() {
            return Ok(id);
        }
        self.load()?;
        self.id()
            .ok_or_else(|| NitrateError::Internal(format!("{} fetched without an id", self.key())))
    }

    pub fn is_fetched(&self) -> bool {
        self.state.borrow().is_fetched()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.borrow().dirty
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.state.borrow().fetched_at
    }

    /// Whether both handles share the same proxy state
    pub fn same_instance(&self, other: &Entity) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    /// Fetch now unless already fetched
    pub fn load(&self) -> NitrateResult<()> {
        if self.is_fetched() {
            return Ok(());
        }
        self.session()?.fetch(&self.state)?;
        Ok(())
    }

    /// Read one field
    pub fn get(&self, field: &str) -> NitrateResult<Value> {
        let name = self.field_name(field)?;
        if let Some(value) = self.state.borrow().fields.get(name) {
            return Ok(value.clone());
        }
        self.load()?;
        Ok(self.state.borrow().fields.get(name).cloned().unwrap_or(Value::Null))
    }

    /// Read a text field; `None` for null
    pub fn get_str(&self, field: &str) -> NitrateResult<Option<String>> {
        match self.get(field)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    /// Read an enum-like field such as a status or priority
    pub fn get_coded<E: CodedEnum>(&self, field: &str) -> NitrateResult<E> {
        E::from_value(&self.get(field)?)
    }

    /// Follow a reference field to the entity it names
    pub fn reference(&self, field: &str) -> NitrateResult<Option<Entity>> {
        let name = self.field_name(field)?;
        let class = self.class();
        let target = class
            .reference(name)
            .ok_or_else(|| NitrateError::usage(format!("{}.{} is not a reference", class, name)))?;

        match self.get(name)? {
            Value::Null => Ok(None),
            Value::Number(n) => match n.as_i64() {
                Some(id) => self.session()?.lookup(IdentityKey::id(target, id)).map(Some),
                None => Err(NitrateError::usage(format!("{}.{} holds {}", class, name, n))),
            },
            other => Err(NitrateError::usage(format!("{}.{} holds {}", class, name, other))),
        }
    }

    /// Change one field
    pub fn set(&self, field: &str, value: impl Into<Value>) -> NitrateResult<()> {
        let name = self.field_name(field)?;
        let class = self.class();
        if !class.is_writable() {
            return Err(NitrateError::ReadOnly(class));
        }
        let session = self.session()?;
        if !self.state.borrow().fields.contains_key(name) {
            self.load_for_write()?;
        }

        let changed = self.state.borrow_mut().set_field(name, value.into());
        if !changed {
            return Ok(());
        }
        debug!("Modified {}.{}", self.key(), name);
        session.track(&self.state);
        if !session.level().defers_writes() {
            session.write(&self.state)?;
        }
        Ok(())
    }

    /// Write local changes back; no-op when nothing changed
    pub fn update(&self) -> NitrateResult<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        self.session()?.write(&self.state)
    }

    /// Throw away local state and fetch again
    pub fn refresh(&self) -> NitrateResult<()> {
        if self.is_dirty() {
            warn!("Refreshing {} discards its unsaved changes", self.key());
        }
        self.state.borrow_mut().reset();
        self.session()?.fetch(&self.state)?;
        Ok(())
    }

    /// Container of class `container` owned by this entity
    pub fn related(&self, container: EntityClass) -> NitrateResult<Entity> {
        let class = self.class();
        match container.relation() {
            Some(relation) if relation.owner == class => {
                let id = self.resolve_id()?;
                self.session()?.lookup(IdentityKey::id(container, id))
            }
            Some(_) => Err(NitrateError::usage(format!(
                "{} is not owned by {}",
                container, class
            ))),
            None => Err(NitrateError::NotContainer(container)),
        }
    }

    /// Members of a container
    pub fn members(&self) -> NitrateResult<Vec<Entity>> {
        let element = self.element_class()?;
        self.load()?;
        let ids: Vec<i64> = self
            .state
            .borrow()
            .container
            .as_ref()
            .map(|c| c.members.iter().copied().collect())
            .unwrap_or_default();
        let session = self.session()?;
        ids.into_iter()
            .map(|id| session.lookup(IdentityKey::id(element, id)))
            .collect()
    }

    /// Number of members in a container
    pub fn member_count(&self) -> NitrateResult<usize> {
        self.element_class()?;
        self.load()?;
        Ok(self
            .state
            .borrow()
            .container
            .as_ref()
            .map_or(0, |c| c.members.len()))
    }

    pub fn contains(&self, member: &Entity) -> NitrateResult<bool> {
        let id = self.member_id(member)?;
        self.load()?;
        Ok(self
            .state
            .borrow()
            .container
            .as_ref()
            .is_some_and(|c| c.members.contains(&id)))
    }

    /// Add a member to a container
    pub fn add(&self, member: &Entity) -> NitrateResult<()> {
        self.change_membership(member, true)
    }

    /// Remove a member from a container
    pub fn remove(&self, member: &Entity) -> NitrateResult<()> {
        self.change_membership(member, false)
    }

    /// Flush and release this handle
    pub fn dispose(self) -> NitrateResult<()> {
        self.update()
    }

    /// Wrap in a guard that flushes when dropped
    pub fn guard(self) -> EntityGuard {
        EntityGuard {
            entity: self,
            flush: true,
        }
    }

    fn change_membership(&self, member: &Entity, add: bool) -> NitrateResult<()> {
        let class = self.class();
        let id = self.member_id(member)?;
        if !class.is_writable() {
            return Err(NitrateError::ReadOnly(class));
        }
        let session = self.session()?;
        self.load_for_write()?;

        let changed = if add {
            self.state.borrow_mut().add_member(id)
        } else {
            self.state.borrow_mut().remove_member(id)
        };
        if !changed {
            return Ok(());
        }
        session.track(&self.state);
        if !session.level().defers_writes() {
            session.write(&self.state)?;
        }
        Ok(())
    }

    fn load_for_write(&self) -> NitrateResult<()> {
        self.load().map_err(|source| NitrateError::NotLoaded {
            key: self.key(),
            source: Box::new(source),
        })
    }

    fn element_class(&self) -> NitrateResult<EntityClass> {
        let class = self.class();
        class
            .relation()
            .map(|r| r.element)
            .ok_or(NitrateError::NotContainer(class))
    }

    fn member_id(&self, member: &Entity) -> NitrateResult<i64> {
        let element = self.element_class()?;
        if member.class() != element {
            return Err(NitrateError::usage(format!(
                "{} holds {} objects, not {}",
                self.class(),
                element,
                member.class()
            )));
        }
        member.resolve_id()
    }

    fn field_name(&self, field: &str) -> NitrateResult<&'static str> {
        let class = self.class();
        class.field(field).ok_or_else(|| NitrateError::InvalidField {
            class,
            field: field.to_string(),
        })
    }
}

impl Drop for Entity {
    fn drop(&mut self) {
        if Rc::strong_count(&self.state) > 1 || !self.state.borrow().dirty {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if let Err(e) = session.write(&self.state) {
            warn!("Failed to save {} on release: {}", self.key(), e);
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.same_instance(other) || self.key() == other.key()
    }
}

impl Eq for Entity {}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Entity")
            .field("key", &state.key())
            .field("fetched", &state.is_fetched())
            .field("dirty", &state.dirty)
            .finish()
    }
}

/// Entity handle that flushes pending changes when dropped
///
/// Flush failures are logged, not raised. Use [`Entity::dispose`] to see
/// the error.
pub struct EntityGuard {
    entity: Entity,
    flush: bool,
}

impl EntityGuard {
    /// Release the handle without flushing now
    pub fn into_inner(mut self) -> Entity {
        self.flush = false;
        self.entity.clone()
    }
}

impl Deref for EntityGuard {
    type Target = Entity;

    fn deref(&self) -> &Entity {
        &self.entity
    }
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        if !self.flush {
            return;
        }
        if let Err(e) = self.entity.update() {
            warn!("Failed to save {} on release: {}", self.entity.key(), e);
        }
    }
}
