//! Static per-class tables: RPC namespace, fields, natural keys, references
//!
//! Every remote entity class the cache knows about is listed here. Field
//! access on a proxy dispatches through these tables instead of generated
//! accessors, so an unknown field name is rejected before any remote call.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Remote entity classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityClass {
    Build,
    Product,
    Version,
    Component,
    Category,
    PlanType,
    Tag,
    User,
    TestPlan,
    TestRun,
    TestCase,
    CaseRun,
    /// Tags attached to a test case
    CaseTags,
    /// Tags attached to a test plan
    PlanTags,
    /// Tags attached to a test run
    RunTags,
    /// Test cases linked to a test plan
    PlanCases,
    /// Case runs belonging to a test run
    RunCaseRuns,
}

/// How a class behaves in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    /// Reference data that never changes once created
    Immutable,
    /// Entities whose fields can be edited and written back
    Mutable,
    /// A set relationship owned by another entity
    Container,
}

/// The relationship a container class represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    /// Class of the entity owning the set
    pub owner: EntityClass,
    /// Class of the members
    pub element: EntityClass,
    /// Relation name used in RPC method names (`get_<name>`, `add_<name>`)
    pub name: &'static str,
    /// Whether members can be added and removed
    pub mutable: bool,
}

impl EntityClass {
    /// All classes, scalar classes first
    pub fn all() -> &'static [Self] {
        &[
            Self::Build,
            Self::Product,
            Self::Version,
            Self::Component,
            Self::Category,
            Self::PlanType,
            Self::Tag,
            Self::User,
            Self::TestPlan,
            Self::TestRun,
            Self::TestCase,
            Self::CaseRun,
            Self::CaseTags,
            Self::PlanTags,
            Self::RunTags,
            Self::PlanCases,
            Self::RunCaseRuns,
        ]
    }

    /// Class name as used in config files and the persisted cache
    pub fn name(&self) -> &'static str {
        match self {
            Self::Build => "Build",
            Self::Product => "Product",
            Self::Version => "Version",
            Self::Component => "Component",
            Self::Category => "Category",
            Self::PlanType => "PlanType",
            Self::Tag => "Tag",
            Self::User => "User",
            Self::TestPlan => "TestPlan",
            Self::TestRun => "TestRun",
            Self::TestCase => "TestCase",
            Self::CaseRun => "CaseRun",
            Self::CaseTags => "CaseTags",
            Self::PlanTags => "PlanTags",
            Self::RunTags => "RunTags",
            Self::PlanCases => "PlanCases",
            Self::RunCaseRuns => "RunCaseRuns",
        }
    }

    /// Parse a class name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|c| c.name() == name)
    }

    pub fn kind(&self) -> ClassKind {
        match self {
            Self::Build
            | Self::Product
            | Self::Version
            | Self::Component
            | Self::Category
            | Self::PlanType
            | Self::Tag
            | Self::User => ClassKind::Immutable,
            Self::TestPlan | Self::TestRun | Self::TestCase | Self::CaseRun => ClassKind::Mutable,
            Self::CaseTags | Self::PlanTags | Self::RunTags | Self::PlanCases | Self::RunCaseRuns => {
                ClassKind::Container
            }
        }
    }

    pub fn is_container(&self) -> bool {
        self.kind() == ClassKind::Container
    }

    /// Whether local changes can be written back
    pub fn is_writable(&self) -> bool {
        match self.kind() {
            ClassKind::Immutable => false,
            ClassKind::Mutable => true,
            ClassKind::Container => self.relation().is_some_and(|r| r.mutable),
        }
    }

    /// RPC namespace; containers use the namespace of their owner
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::CaseRun => "TestCaseRun",
            _ => match self.relation() {
                Some(relation) => relation.owner.namespace(),
                None => self.name(),
            },
        }
    }

    /// Full RPC method name for a verb in this class's namespace
    pub fn method(&self, verb: &str) -> String {
        format!("{}.{}", self.namespace(), verb)
    }

    /// Field names, excluding `id`
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Self::Build => &["name", "product", "description", "is_active"],
            Self::Product => &["name", "description"],
            Self::Version => &["value", "product"],
            Self::Component | Self::Category => &["name", "product", "description"],
            Self::PlanType => &["name", "description"],
            Self::Tag => &["name"],
            Self::User => &["username", "first_name", "last_name", "email"],
            Self::TestPlan => &[
                "name", "product", "version", "type", "status", "author", "owner", "parent", "text",
            ],
            Self::TestRun => &[
                "summary", "plan", "build", "manager", "tester", "status", "notes", "started",
                "finished",
            ],
            Self::TestCase => &[
                "summary",
                "script",
                "arguments",
                "status",
                "priority",
                "category",
                "author",
                "tester",
                "automated",
                "notes",
                "created",
            ],
            Self::CaseRun => &["case", "run", "build", "status", "assignee", "notes"],
            Self::CaseTags | Self::PlanTags | Self::RunTags | Self::PlanCases | Self::RunCaseRuns => {
                &[]
            }
        }
    }

    /// Resolve a field name to its static spelling
    pub fn field(&self, name: &str) -> Option<&'static str> {
        self.fields().iter().copied().find(|f| *f == name)
    }

    /// Fields forming the natural key, empty when lookups need an id
    pub fn natural_key(&self) -> &'static [&'static str] {
        match self {
            Self::Build | Self::Component | Self::Category => &["name", "product"],
            Self::Version => &["value", "product"],
            Self::Product | Self::PlanType | Self::Tag => &["name"],
            Self::User => &["username"],
            _ => &[],
        }
    }

    /// Class a reference field points at
    pub fn reference(&self, field: &str) -> Option<EntityClass> {
        let target = match (self, field) {
            (Self::Build | Self::Version | Self::Component | Self::Category, "product") => {
                Self::Product
            }
            (Self::TestPlan, "product") => Self::Product,
            (Self::TestPlan, "version") => Self::Version,
            (Self::TestPlan, "type") => Self::PlanType,
            (Self::TestPlan, "author" | "owner") => Self::User,
            (Self::TestPlan, "parent") => Self::TestPlan,
            (Self::TestRun, "plan") => Self::TestPlan,
            (Self::TestRun, "build") => Self::Build,
            (Self::TestRun, "manager" | "tester") => Self::User,
            (Self::TestCase, "category") => Self::Category,
            (Self::TestCase, "author" | "tester") => Self::User,
            (Self::CaseRun, "case") => Self::TestCase,
            (Self::CaseRun, "run") => Self::TestRun,
            (Self::CaseRun, "build") => Self::Build,
            (Self::CaseRun, "assignee") => Self::User,
            _ => return None,
        };
        Some(target)
    }

    /// Relationship description for container classes
    pub fn relation(&self) -> Option<Relation> {
        let (owner, element, name, mutable) = match self {
            Self::CaseTags => (Self::TestCase, Self::Tag, "tags", true),
            Self::PlanTags => (Self::TestPlan, Self::Tag, "tags", true),
            Self::RunTags => (Self::TestRun, Self::Tag, "tags", true),
            Self::PlanCases => (Self::TestPlan, Self::TestCase, "cases", true),
            Self::RunCaseRuns => (Self::TestRun, Self::CaseRun, "case_runs", false),
            _ => return None,
        };
        Some(Relation {
            owner,
            element,
            name,
            mutable,
        })
    }

    /// Convert one natural-key part into the value sent in a filter query
    ///
    /// Reference fields hold numeric ids, everything else is matched as text.
    pub(crate) fn natural_param(&self, field: &str, part: &str) -> Value {
        if self.reference(field).is_some() {
            if let Ok(id) = part.parse::<i64>() {
                return Value::from(id);
            }
        }
        Value::from(part)
    }
}

/// Render a field value as a natural-key part
pub(crate) fn natural_part(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
