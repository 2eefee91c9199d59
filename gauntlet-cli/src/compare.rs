// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Comparing two testruns.
//!
//! A test in the new run is matched to the test of the old run with the same
//! class, the same arguments and the same attached monitors. Tests are then
//! classified by how their result percentage changed.

use gauntlet_metadata::ArgumentValues;
use gauntlet_store::{MonitorMatch, Store, StoreError, TestFilter, TestId, TestRunId};
use std::collections::BTreeSet;
use tracing::debug;

/// How a test changed between two runs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Change {
    /// Only present in the new run.
    New { new: f64 },

    /// Only present in the old run.
    Removed { old: f64 },

    /// The percentage went down.
    Regressed { old: f64, new: f64 },

    /// The percentage went up.
    Improved { old: f64, new: f64 },

    /// The percentage is the same.
    Unchanged { percentage: f64 },
}

/// One row of a comparison.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ComparedTest {
    pub(crate) class: String,
    pub(crate) arguments: ArgumentValues,
    pub(crate) old: Option<TestId>,
    pub(crate) new: Option<TestId>,
    pub(crate) change: Change,
}

/// The result of comparing two testruns.
#[derive(Clone, Debug, Default)]
pub(crate) struct Comparison {
    pub(crate) tests: Vec<ComparedTest>,
}

impl Comparison {
    pub(crate) fn count(&self, pred: impl Fn(&Change) -> bool) -> usize {
        self.tests.iter().filter(|test| pred(&test.change)).count()
    }

    /// Returns true if no test regressed or disappeared.
    pub(crate) fn is_clean(&self) -> bool {
        self.count(|change| matches!(change, Change::Regressed { .. } | Change::Removed { .. }))
            == 0
    }
}

/// Compares testrun `new` against testrun `old`, both in `store`.
///
/// Scenarios are left out: their children are compared individually.
pub(crate) fn compare(store: &Store, old: TestRunId, new: TestRunId) -> Result<Comparison, StoreError> {
    let filter = TestFilter {
        only_failed: false,
        exclude_scenarios: true,
    };
    let mut matched_old = BTreeSet::new();
    let mut comparison = Comparison::default();

    for new_id in store.list_tests(new, filter)? {
        let Some(new_test) = store.test_info(new_id)? else {
            continue;
        };
        let monitors = monitor_matches(store, new_id)?;
        let candidates = store.find_tests_by_arguments(
            &new_test.class,
            &new_test.arguments,
            Some(old),
            Some(&monitors),
        )?;
        // Several old tests may match if a run repeated a tuple; take the first
        // one not matched yet.
        let old_id = candidates
            .into_iter()
            .find(|candidate| !matched_old.contains(candidate));

        let change = match old_id {
            Some(old_id) => {
                matched_old.insert(old_id);
                let old_percentage = store
                    .test_info(old_id)?
                    .map_or(0.0, |test| test.result_percentage);
                classify(old_percentage, new_test.result_percentage)
            }
            None => Change::New {
                new: new_test.result_percentage,
            },
        };
        debug!(class = %new_test.class, ?old_id, %new_id, ?change, "compared test");
        comparison.tests.push(ComparedTest {
            class: new_test.class,
            arguments: new_test.arguments,
            old: old_id,
            new: Some(new_id),
            change,
        });
    }

    for old_id in store.list_tests(old, filter)? {
        if matched_old.contains(&old_id) {
            continue;
        }
        let Some(old_test) = store.test_info(old_id)? else {
            continue;
        };
        comparison.tests.push(ComparedTest {
            class: old_test.class,
            arguments: old_test.arguments,
            old: Some(old_id),
            new: None,
            change: Change::Removed {
                old: old_test.result_percentage,
            },
        });
    }

    Ok(comparison)
}

fn classify(old: f64, new: f64) -> Change {
    if new < old {
        Change::Regressed { old, new }
    } else if new > old {
        Change::Improved { old, new }
    } else {
        Change::Unchanged { percentage: new }
    }
}

fn monitor_matches(store: &Store, test: TestId) -> Result<Vec<MonitorMatch>, StoreError> {
    let mut matches = Vec::new();
    for monitor in store.monitors_for_test(test)? {
        if let Some(info) = store.monitor_info(monitor)? {
            matches.push(MonitorMatch {
                class: info.class,
                arguments: info.arguments,
            });
        }
    }
    Ok(matches)
}
