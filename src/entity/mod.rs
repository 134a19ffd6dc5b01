//! Remote entities: keys, class tables and lazily fetched proxies

pub mod class;
pub mod container;
pub mod enums;
pub mod key;
pub mod proxy;

pub use class::{ClassKind, EntityClass, Relation};
pub use container::ContainerSnapshot;
pub use enums::{CaseRunStatus, CaseStatus, CodedEnum, PlanStatus, Priority, RunStatus};
pub use key::{Discriminator, IdentityKey};
pub use proxy::{Entity, EntityGuard};
