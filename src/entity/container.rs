//! Set-relationship entities such as the tags on a test case
//!
//! A container holds member ids only. Members themselves live in their own
//! class cache and are resolved through the session when asked for, which is
//! what lets a container be written to disk without any live references.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Persisted form of a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub members: Vec<i64>,
}

/// Membership plus changes not yet written back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ContainerState {
    pub members: BTreeSet<i64>,
    pub added: BTreeSet<i64>,
    pub removed: BTreeSet<i64>,
}

impl ContainerState {
    pub fn from_members(members: impl IntoIterator<Item = i64>) -> Self {
        Self {
            members: members.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Returns whether membership changed
    pub fn add(&mut self, id: i64) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        if !self.removed.remove(&id) {
            self.added.insert(id);
        }
        true
    }

    /// Returns whether membership changed
    pub fn remove(&mut self, id: i64) -> bool {
        if !self.members.remove(&id) {
            return false;
        }
        if !self.added.remove(&id) {
            self.removed.insert(id);
        }
        true
    }

    pub fn has_pending(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Forget pending changes that were written
    pub fn commit(&mut self, added: &BTreeSet<i64>, removed: &BTreeSet<i64>) {
        self.added.retain(|id| !added.contains(id));
        self.removed.retain(|id| !removed.contains(id));
    }

    /// Detach from any pending work for writing to disk
    pub fn to_snapshot(&self) -> ContainerSnapshot {
        ContainerSnapshot {
            members: self.members.iter().copied().collect(),
        }
    }

    pub fn from_snapshot(snapshot: &ContainerSnapshot) -> Self {
        Self::from_members(snapshot.members.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_remove_cancels_out() {
        let mut state = ContainerState::from_members([1, 2]);
        assert!(state.add(3));
        assert!(!state.add(3));
        assert!(state.remove(3));
        assert!(!state.has_pending());
        assert_eq!(state.members, BTreeSet::from([1, 2]));
    }

    #[test]
    fn remove_then_add_cancels_out() {
        let mut state = ContainerState::from_members([1, 2]);
        assert!(state.remove(1));
        assert!(state.has_pending());
        assert!(state.add(1));
        assert!(!state.has_pending());
    }

    #[test]
    fn commit_clears_written_changes_only() {
        let mut state = ContainerState::from_members([1]);
        state.add(2);
        let written = state.added.clone();
        state.add(3);
        state.commit(&written, &BTreeSet::new());

        assert_eq!(state.added, BTreeSet::from([3]));
        assert!(state.has_pending());
    }

    #[test]
    fn snapshot_drops_pending_changes() {
        let mut state = ContainerState::from_members([4, 1]);
        state.add(9);
        let snapshot = state.to_snapshot();
        assert_eq!(snapshot.members, vec![1, 4, 9]);

        let restored = ContainerState::from_snapshot(&snapshot);
        assert!(!restored.has_pending());
        assert_eq!(restored.members.len(), 3);
    }
}
