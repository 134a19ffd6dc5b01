//! Identity keys for remote entities

use crate::entity::EntityClass;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The part of an identity key that tells entities of one class apart
///
/// A natural key is what a caller knows before the remote id is resolved,
/// e.g. a product name, or a build name plus its product id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Discriminator {
    /// Resolved numeric id
    Id(i64),
    /// Natural key parts, in the class's natural-key field order
    Natural(Vec<String>),
}

impl Discriminator {
    /// The numeric id, if resolved
    pub fn as_id(&self) -> Option<i64> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Natural(_) => None,
        }
    }
}

impl fmt::Display for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{}", id),
            Self::Natural(parts) => write!(f, "({})", parts.join(", ")),
        }
    }
}

/// Unique reference to one remote entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub class: EntityClass,
    pub discriminator: Discriminator,
}

impl IdentityKey {
    pub fn new(class: EntityClass, discriminator: Discriminator) -> Self {
        Self {
            class,
            discriminator,
        }
    }

    /// Key for a resolved numeric id
    pub fn id(class: EntityClass, id: i64) -> Self {
        Self::new(class, Discriminator::Id(id))
    }

    /// Key for a natural key given as string parts
    pub fn natural<S: AsRef<str>>(class: EntityClass, parts: &[S]) -> Self {
        Self::new(
            class,
            Discriminator::Natural(parts.iter().map(|p| p.as_ref().to_string()).collect()),
        )
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.class, self.discriminator)
    }
}
