// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{Checklist, SCENARIO_SCHEMA, Schema, TestUuid, Value};
use camino::Utf8PathBuf;
use std::collections::BTreeMap;

/// Argument values, keyed by argument name.
pub type ArgumentValues = BTreeMap<String, Value>;

/// A finished test instance, ready to be persisted.
///
/// Scenarios carry their finished children in `subtests`, in the order the
/// children were started.
#[derive(Clone, Debug)]
pub struct TestRecord {
    /// The instance UUID.
    pub uuid: TestUuid,

    /// The schema of the test kind.
    pub schema: &'static Schema,

    /// The resolved argument values the instance ran with.
    pub arguments: ArgumentValues,

    /// The checks validated by the instance.
    pub checklist: Checklist,

    /// Extra information reported by the instance.
    pub extra_info: BTreeMap<String, Value>,

    /// Artifacts produced by the instance.
    pub output_files: BTreeMap<String, Utf8PathBuf>,

    /// The success percentage, in `[0, 100]`.
    pub result_percentage: f64,

    /// Monitors that were attached to the instance.
    pub monitors: Vec<MonitorRecord>,

    /// Child tests, for scenarios.
    pub subtests: Vec<TestRecord>,
}

impl TestRecord {
    /// Returns true if every declared check passed.
    pub fn is_success(&self) -> bool {
        self.result_percentage >= 100.0
    }

    /// Returns true if the test kind is a scenario, whether or not it ran
    /// any children.
    pub fn is_scenario(&self) -> bool {
        self.schema.is_a(&SCENARIO_SCHEMA)
    }

    /// Counts this record and all of its descendants.
    pub fn tree_len(&self) -> usize {
        1 + self.subtests.iter().map(TestRecord::tree_len).sum::<usize>()
    }
}

/// A finished monitor instance.
#[derive(Clone, Debug)]
pub struct MonitorRecord {
    /// The schema of the monitor kind.
    pub schema: &'static Schema,

    /// The resolved argument values the monitor ran with.
    pub arguments: ArgumentValues,

    /// The checks validated by the monitor.
    pub checklist: Checklist,

    /// Extra information reported by the monitor.
    pub extra_info: BTreeMap<String, Value>,

    /// Artifacts produced by the monitor.
    pub output_files: BTreeMap<String, Utf8PathBuf>,

    /// The success percentage, in `[0, 100]`.
    pub result_percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BASE_TEST_SCHEMA, SchemaKind};
    use test_case::test_case;

    static NIGHTLY: Schema = Schema::new(SchemaKind::Test, "nightly", "Nightly scenario")
        .with_base(&SCENARIO_SCHEMA);

    fn record(schema: &'static Schema, subtests: Vec<TestRecord>) -> TestRecord {
        TestRecord {
            uuid: TestUuid::new_v4(),
            schema,
            arguments: ArgumentValues::new(),
            checklist: Checklist::new(),
            extra_info: BTreeMap::new(),
            output_files: BTreeMap::new(),
            result_percentage: 0.0,
            monitors: Vec::new(),
            subtests,
        }
    }

    #[test_case(&SCENARIO_SCHEMA, 0, true; "empty scenario")]
    #[test_case(&SCENARIO_SCHEMA, 2, true; "scenario with children")]
    #[test_case(&NIGHTLY, 0, true; "derived scenario")]
    #[test_case(&BASE_TEST_SCHEMA, 0, false; "plain test")]
    fn is_scenario(schema: &'static Schema, children: usize, expected: bool) {
        let subtests = (0..children)
            .map(|_| record(&BASE_TEST_SCHEMA, Vec::new()))
            .collect();
        let record = record(schema, subtests);
        assert_eq!(record.is_scenario(), expected);
        assert_eq!(record.tree_len(), children + 1);
    }
}
