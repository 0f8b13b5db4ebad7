//! Blocking relation between devices

use std::collections::{BTreeMap, BTreeSet};

/// Device name -> names of devices whose BOP bits block it.
///
/// A device without an entry is blocked by every other device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockingRelation {
    blocked_by: BTreeMap<String, BTreeSet<String>>,
}

impl BlockingRelation {
    pub fn from_config(map: &BTreeMap<String, Vec<String>>) -> Self {
        Self {
            blocked_by: map
                .iter()
                .map(|(device, blockers)| (device.clone(), blockers.iter().cloned().collect()))
                .collect(),
        }
    }

    /// True if `other`'s BOP bits apply to `device`
    pub fn blocks(&self, device: &str, other: &str) -> bool {
        if device == other {
            return false;
        }
        self.blocked_by
            .get(device)
            .map_or(true, |blockers| blockers.contains(other))
    }

    /// Explicit blockers, `None` when every device blocks
    pub fn blockers_of(&self, device: &str) -> Option<&BTreeSet<String>> {
        self.blocked_by.get(device)
    }
}
