use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// OU -> parent profile mapping. `ou_ref_id` is unique tenant-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OuAssignment {
    pub ou_ref_id: i32,
    pub parent_profile_id: Uuid,
    pub trellis_enabled: bool,
}

/// Minimal set of writes turning `existing` OU mappings into `desired`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OuAssignmentDiff {
    pub to_delete: BTreeSet<i32>,
    pub to_insert: BTreeSet<i32>,
}

impl OuAssignmentDiff {
    pub fn between<E, D>(existing: E, desired: D) -> Self
    where
        E: IntoIterator<Item = i32>,
        D: IntoIterator<Item = i32>,
    {
        let existing: BTreeSet<i32> = existing.into_iter().collect();
        let desired: BTreeSet<i32> = desired.into_iter().collect();
        Self {
            to_delete: existing.difference(&desired).copied().collect(),
            to_insert: desired.difference(&existing).copied().collect(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.to_delete.is_empty() && self.to_insert.is_empty()
    }
}
