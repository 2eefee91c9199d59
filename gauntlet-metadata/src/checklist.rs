// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

/// The append-only pass/fail ledger attached to a test or monitor instance.
///
/// Each check name is recorded at most once: the first validation wins and
/// later validations of the same name are ignored. Entries are kept in the
/// order they were validated.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Checklist {
    entries: Vec<ChecklistEntry>,
}

/// A single recorded check.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChecklistEntry {
    /// The check name.
    pub name: String,

    /// Whether the check passed.
    pub passed: bool,
}

impl Checklist {
    /// Creates an empty checklist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `name` with the given outcome.
    ///
    /// Returns false, and leaves the ledger unchanged, if `name` was already
    /// recorded.
    pub fn validate(&mut self, name: impl Into<String>, passed: bool) -> bool {
        let name = name.into();
        if self.get(&name).is_some() {
            return false;
        }
        self.entries.push(ChecklistEntry { name, passed });
        true
    }

    /// Returns the recorded outcome for `name`, if any.
    pub fn get(&self, name: &str) -> Option<bool> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.passed)
    }

    /// Iterates over the recorded entries in validation order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &ChecklistEntry> + '_ {
        self.entries.iter()
    }

    /// Returns the number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of checks recorded as passed.
    pub fn passed_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.passed).count()
    }

    /// Computes the success percentage against a checklist universe of
    /// `universe_len` names.
    ///
    /// An empty universe yields 0.
    pub fn success_percentage(&self, universe_len: usize) -> f64 {
        success_percentage(self.passed_count(), universe_len)
    }
}

impl FromIterator<(String, bool)> for Checklist {
    fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
        let mut checklist = Self::new();
        for (name, passed) in iter {
            checklist.validate(name, passed);
        }
        checklist
    }
}

/// Computes `100 * passed / universe`, clamped to `[0, 100]`.
pub fn success_percentage(passed: usize, universe: usize) -> f64 {
    if universe == 0 {
        return 0.0;
    }
    (100.0 * passed as f64 / universe as f64).clamp(0.0, 100.0)
}
