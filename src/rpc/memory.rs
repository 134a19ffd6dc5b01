//! In-process remote backed by plain tables
//!
//! Understands the generic method shapes the cache issues:
//!
//! | Method | Params | Result |
//! |--------|--------|--------|
//! | `<ns>.get` | `[id]` | record |
//! | `<ns>.filter` | `[{field: value}]` | list of records |
//! | `<ns>.update` | `[id, {field: value}]` | updated record |
//! | `<ns>.get_<rel>` | `[owner]` | list of member records |
//! | `<ns>.add_<rel>` / `<ns>.remove_<rel>` | `[owner, [ids]]` | `null` |
//!
//! Every call is logged so callers can count round trips.

use crate::entity::EntityClass;
use crate::rpc::{Remote, RemoteCall, RemoteFault};
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// A call seen by [`MemoryRemote`]
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedCall {
    pub call: RemoteCall,
    /// Whether the call arrived inside a multicall
    pub batched: bool,
}

/// Remote implementation holding records in memory
#[derive(Debug, Default)]
pub struct MemoryRemote {
    tables: RefCell<HashMap<String, BTreeMap<i64, Map<String, Value>>>>,
    relations: RefCell<HashMap<(String, String), BTreeMap<i64, BTreeSet<i64>>>>,
    faults: RefCell<HashMap<String, RemoteFault>>,
    fail_batches: Cell<bool>,
    log: RefCell<Vec<LoggedCall>>,
    batches: Cell<usize>,
    timeout: Cell<Option<Duration>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record; `record` must be a JSON object
    pub fn insert(&self, class: EntityClass, id: i64, record: Value) {
        let fields = match record {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.tables
            .borrow_mut()
            .entry(class.namespace().to_string())
            .or_default()
            .insert(id, fields);
    }

    /// Current server-side copy of a record, with its `id`
    pub fn record(&self, class: EntityClass, id: i64) -> Option<Value> {
        self.lookup(class.namespace(), id)
    }

    /// Put `members` into a container relation owned by `owner`
    pub fn relate(&self, container: EntityClass, owner: i64, members: &[i64]) {
        let Some(relation) = container.relation() else {
            return;
        };
        self.relations
            .borrow_mut()
            .entry((relation.owner.namespace().to_string(), relation.name.to_string()))
            .or_default()
            .entry(owner)
            .or_default()
            .extend(members.iter().copied());
    }

    /// Member ids of a container relation
    pub fn members(&self, container: EntityClass, owner: i64) -> Vec<i64> {
        let Some(relation) = container.relation() else {
            return Vec::new();
        };
        self.relations
            .borrow()
            .get(&(relation.owner.namespace().to_string(), relation.name.to_string()))
            .and_then(|t| t.get(&owner))
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Make every call to `method` fail with `fault`
    pub fn fail(&self, method: &str, fault: RemoteFault) {
        self.faults.borrow_mut().insert(method.to_string(), fault);
    }

    /// Make every multicall fail as a whole
    pub fn fail_batches(&self, fail: bool) {
        self.fail_batches.set(fail);
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<LoggedCall> {
        self.log.borrow().clone()
    }

    /// Number of calls to `method`, batched or not
    pub fn count(&self, method: &str) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|c| c.call.method == method)
            .count()
    }

    /// Number of calls to `method` made outside any multicall
    pub fn direct_count(&self, method: &str) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|c| !c.batched && c.call.method == method)
            .count()
    }

    /// Total number of calls received
    pub fn call_count(&self) -> usize {
        self.log.borrow().len()
    }

    /// Number of multicalls received
    pub fn batch_count(&self) -> usize {
        self.batches.get()
    }

    /// Forget logged calls and multicall count
    pub fn reset_log(&self) {
        self.log.borrow_mut().clear();
        self.batches.set(0);
    }

    /// Timeout most recently configured through [`Remote::set_timeout`]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.get()
    }

    fn lookup(&self, ns: &str, id: i64) -> Option<Value> {
        self.tables
            .borrow()
            .get(ns)
            .and_then(|t| t.get(&id))
            .map(|fields| with_id(id, fields))
    }

    fn dispatch(&self, method: &str, params: &[Value]) -> Result<Value, RemoteFault> {
        if let Some(fault) = self.faults.borrow().get(method) {
            return Err(fault.clone());
        }

        let (ns, verb) = method.rsplit_once('.').ok_or_else(|| unknown(method))?;

        match verb {
            "get" => {
                let id = int_param(params, 0)?;
                self.lookup(ns, id)
                    .ok_or_else(|| RemoteFault::not_found(format!("{} {} does not exist", ns, id)))
            }
            "filter" => {
                let query = object_param(params, 0)?;
                let tables = self.tables.borrow();
                let matches = tables
                    .get(ns)
                    .map(|table| {
                        table
                            .iter()
                            .filter(|(id, fields)| {
                                query.iter().all(|(k, v)| match k.as_str() {
                                    "id" => v.as_i64() == Some(**id),
                                    _ => fields.get(k) == Some(v),
                                })
                            })
                            .map(|(id, fields)| with_id(*id, fields))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Value::Array(matches))
            }
            "update" => {
                let id = int_param(params, 0)?;
                let changes = object_param(params, 1)?;
                {
                    let mut tables = self.tables.borrow_mut();
                    let record = tables
                        .get_mut(ns)
                        .and_then(|t| t.get_mut(&id))
                        .ok_or_else(|| {
                            RemoteFault::not_found(format!("{} {} does not exist", ns, id))
                        })?;
                    for (k, v) in changes {
                        record.insert(k.clone(), v.clone());
                    }
                }
                self.lookup(ns, id).ok_or_else(|| unknown(method))
            }
            _ => self.dispatch_relation(ns, verb, method, params),
        }
    }

    fn dispatch_relation(
        &self,
        ns: &str,
        verb: &str,
        method: &str,
        params: &[Value],
    ) -> Result<Value, RemoteFault> {
        let (action, relation) = verb.split_once('_').ok_or_else(|| unknown(method))?;
        let owner = int_param(params, 0)?;
        let key = (ns.to_string(), relation.to_string());

        match action {
            "get" => {
                let element_ns = element_namespace(ns, relation).ok_or_else(|| unknown(method))?;
                let relations = self.relations.borrow();
                let records = relations
                    .get(&key)
                    .and_then(|t| t.get(&owner))
                    .into_iter()
                    .flatten()
                    .filter_map(|id| self.lookup(element_ns, *id))
                    .collect();
                Ok(Value::Array(records))
            }
            "add" | "remove" => {
                let ids: Vec<i64> = params
                    .get(1)
                    .and_then(Value::as_array)
                    .ok_or_else(|| invalid("expected a list of ids"))?
                    .iter()
                    .filter_map(Value::as_i64)
                    .collect();
                if element_namespace(ns, relation).is_none() {
                    return Err(unknown(method));
                }
                let mut relations = self.relations.borrow_mut();
                let members = relations.entry(key).or_default().entry(owner).or_default();
                for id in ids {
                    if action == "add" {
                        members.insert(id);
                    } else {
                        members.remove(&id);
                    }
                }
                Ok(Value::Null)
            }
            _ => Err(unknown(method)),
        }
    }
}

impl Remote for MemoryRemote {
    fn call(&self, method: &str, params: &[Value]) -> Result<Value, RemoteFault> {
        self.log.borrow_mut().push(LoggedCall {
            call: RemoteCall::new(method, params.to_vec()),
            batched: false,
        });
        self.dispatch(method, params)
    }

    fn batch_call(&self, calls: &[RemoteCall]) -> Result<Vec<Result<Value, RemoteFault>>, RemoteFault> {
        self.batches.set(self.batches.get() + 1);
        if self.fail_batches.get() {
            return Err(RemoteFault::new(RemoteFault::TRANSPORT, "multicall rejected"));
        }

        Ok(calls
            .iter()
            .map(|c| {
                self.log.borrow_mut().push(LoggedCall {
                    call: c.clone(),
                    batched: true,
                });
                self.dispatch(&c.method, &c.params)
            })
            .collect())
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        self.timeout.set(timeout);
    }
}

/// Namespace of the members of relation `name` owned by namespace `ns`
fn element_namespace(ns: &str, name: &str) -> Option<&'static str> {
    EntityClass::all()
        .iter()
        .filter_map(|c| c.relation())
        .find(|r| r.owner.namespace() == ns && r.name == name)
        .map(|r| r.element.namespace())
}

fn with_id(id: i64, fields: &Map<String, Value>) -> Value {
    let mut record = fields.clone();
    record.insert("id".to_string(), Value::from(id));
    Value::Object(record)
}

fn int_param(params: &[Value], index: usize) -> Result<i64, RemoteFault> {
    params
        .get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid(format!("parameter {} must be an integer", index)))
}

fn object_param(params: &[Value], index: usize) -> Result<&Map<String, Value>, RemoteFault> {
    params
        .get(index)
        .and_then(Value::as_object)
        .ok_or_else(|| invalid(format!("parameter {} must be a struct", index)))
}

fn invalid(message: impl Into<String>) -> RemoteFault {
    RemoteFault::new(RemoteFault::INVALID_PARAMS, message)
}

fn unknown(method: &str) -> RemoteFault {
    RemoteFault::new(RemoteFault::UNKNOWN_METHOD, format!("unknown method {}", method))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn remote() -> MemoryRemote {
        let remote = MemoryRemote::new();
        remote.insert(EntityClass::Product, 1, json!({ "name": "Fedora", "description": "" }));
        remote.insert(EntityClass::Tag, 10, json!({ "name": "smoke" }));
        remote.insert(EntityClass::Tag, 11, json!({ "name": "slow" }));
        remote.insert(EntityClass::TestCase, 5, json!({ "summary": "boot" }));
        remote.relate(EntityClass::CaseTags, 5, &[10]);
        remote
    }

    #[test]
    fn get_and_filter() {
        let remote = remote();
        let record = remote.call("Product.get", &[json!(1)]).unwrap();
        assert_eq!(record["name"], "Fedora");
        assert_eq!(record["id"], 1);

        let found = remote
            .call("Product.filter", &[json!({ "name": "Fedora" })])
            .unwrap();
        assert_eq!(found.as_array().unwrap().len(), 1);

        let fault = remote.call("Product.get", &[json!(2)]).unwrap_err();
        assert!(fault.is_not_found());
    }

    #[test]
    fn update_merges_fields() {
        let remote = remote();
        remote
            .call("TestCase.update", &[json!(5), json!({ "summary": "reboot" })])
            .unwrap();
        assert_eq!(remote.record(EntityClass::TestCase, 5).unwrap()["summary"], "reboot");
    }

    #[test]
    fn relations() {
        let remote = remote();
        remote
            .call("TestCase.add_tags", &[json!(5), json!([11])])
            .unwrap();
        assert_eq!(remote.members(EntityClass::CaseTags, 5), vec![10, 11]);

        let tags = remote.call("TestCase.get_tags", &[json!(5)]).unwrap();
        assert_eq!(tags.as_array().unwrap().len(), 2);

        remote
            .call("TestCase.remove_tags", &[json!(5), json!([10])])
            .unwrap();
        assert_eq!(remote.members(EntityClass::CaseTags, 5), vec![11]);
    }

    #[test]
    fn logs_direct_and_batched_calls() {
        let remote = remote();
        remote.call("Product.get", &[json!(1)]).unwrap();
        remote
            .batch_call(&[
                RemoteCall::new("Product.get", vec![json!(1)]),
                RemoteCall::new("Tag.get", vec![json!(99)]),
            ])
            .unwrap();

        assert_eq!(remote.count("Product.get"), 2);
        assert_eq!(remote.direct_count("Product.get"), 1);
        assert_eq!(remote.batch_count(), 1);
        assert_eq!(remote.call_count(), 3);
    }

    #[test]
    fn injected_faults() {
        let remote = remote();
        remote.fail("Tag.get", RemoteFault::new(500, "boom"));
        assert_eq!(remote.call("Tag.get", &[json!(10)]).unwrap_err().code, 500);

        remote.fail_batches(true);
        assert!(remote.batch_call(&[]).is_err());
    }
}
