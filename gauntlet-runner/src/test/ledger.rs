// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use gauntlet_metadata::{
    ArgumentValues, Checklist, DictKind, MonitorRecord, ResolvedSchema, Schema, TestRecord,
    TestUuid, Value,
};
use std::collections::BTreeMap;
use tracing::warn;

/// The results accumulated by one test or monitor instance.
///
/// Names are checked against the instance's resolved schema: undeclared names
/// are logged and dropped, since they could not be interned on persistence.
#[derive(Debug)]
pub(crate) struct ResultLedger {
    resolved: ResolvedSchema,
    arguments: ArgumentValues,
    checklist: Checklist,
    extra_info: BTreeMap<String, Value>,
    output_files: BTreeMap<String, Utf8PathBuf>,
}

impl ResultLedger {
    pub(crate) fn new(schema: &'static Schema, arguments: ArgumentValues) -> Self {
        Self {
            resolved: schema.resolve(),
            arguments,
            checklist: Checklist::new(),
            extra_info: BTreeMap::new(),
            output_files: BTreeMap::new(),
        }
    }

    pub(crate) fn schema(&self) -> &'static Schema {
        self.resolved.schema()
    }

    pub(crate) fn resolved(&self) -> &ResolvedSchema {
        &self.resolved
    }

    pub(crate) fn arguments(&self) -> &ArgumentValues {
        &self.arguments
    }

    fn is_declared(&self, dict: DictKind, name: &str) -> bool {
        if self.resolved.dict(dict).contains_key(name) {
            return true;
        }
        warn!(
            class = self.resolved.name(),
            %dict,
            name,
            "ignoring undeclared name",
        );
        false
    }

    /// Records a check. Returns false if the name is undeclared or was
    /// already recorded, in which case the first outcome is kept.
    pub(crate) fn validate(&mut self, name: &str, passed: bool) -> bool {
        self.is_declared(DictKind::Checklist, name) && self.checklist.validate(name, passed)
    }

    pub(crate) fn is_validated(&self, name: &str) -> bool {
        self.checklist.get(name).is_some()
    }

    pub(crate) fn extra_info(&mut self, key: &str, value: Value) {
        if self.is_declared(DictKind::ExtraInfo, key) {
            self.extra_info.insert(key.to_owned(), value);
        }
    }

    pub(crate) fn output_file(&mut self, key: &str, path: Utf8PathBuf) {
        if self.is_declared(DictKind::OutputFiles, key) {
            self.output_files.insert(key.to_owned(), path);
        }
    }

    /// `100 * passed / universe`, where the universe is the full resolved
    /// checklist.
    pub(crate) fn percentage(&self) -> f64 {
        self.checklist
            .success_percentage(self.resolved.checklist().len())
    }

    pub(crate) fn into_test_record(
        self,
        uuid: TestUuid,
        result_percentage: f64,
        monitors: Vec<MonitorRecord>,
        subtests: Vec<TestRecord>,
    ) -> TestRecord {
        TestRecord {
            uuid,
            schema: self.resolved.schema(),
            arguments: self.arguments,
            checklist: self.checklist,
            extra_info: self.extra_info,
            output_files: self.output_files,
            result_percentage,
            monitors,
            subtests,
        }
    }

    pub(crate) fn into_monitor_record(self) -> MonitorRecord {
        let result_percentage = self.percentage();
        MonitorRecord {
            schema: self.resolved.schema(),
            arguments: self.arguments,
            checklist: self.checklist,
            extra_info: self.extra_info,
            output_files: self.output_files,
            result_percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_metadata::{BASE_TEST_SCHEMA, SchemaKind, field};
    use pretty_assertions::assert_eq;

    static PAIR: Schema = Schema::new(SchemaKind::Test, "pair", "Two checks")
        .with_checklist(&[field("a", "A"), field("b", "B")])
        .with_extra_info(&[field("note", "A note")]);

    #[test]
    fn half_of_declared_checks() {
        let mut ledger = ResultLedger::new(&PAIR, ArgumentValues::new());
        assert!(ledger.validate("a", true));
        assert_eq!(ledger.percentage(), 50.0);

        let record = ledger.into_test_record(TestUuid::new_v4(), 50.0, Vec::new(), Vec::new());
        assert_eq!(record.checklist.get("a"), Some(true));
        assert_eq!(record.checklist.get("b"), None);
    }

    #[test]
    fn undeclared_names_are_dropped() {
        let mut ledger = ResultLedger::new(&PAIR, ArgumentValues::new());
        assert!(!ledger.validate("c", true));
        ledger.extra_info("nope", Value::from(1));
        ledger.extra_info("note", Value::from("hi"));
        ledger.output_file("log", "/tmp/log".into());

        let record = ledger.into_test_record(TestUuid::new_v4(), 0.0, Vec::new(), Vec::new());
        assert!(record.checklist.is_empty());
        assert_eq!(
            record.extra_info.into_iter().collect::<Vec<_>>(),
            vec![("note".to_owned(), Value::from("hi"))]
        );
        assert!(record.output_files.is_empty());
    }

    #[test]
    fn base_checks_count_towards_universe() {
        let mut ledger = ResultLedger::new(&BASE_TEST_SCHEMA, ArgumentValues::new());
        ledger.validate("test-started", true);
        assert!(!ledger.validate("test-started", false));
        assert!(ledger.is_validated("test-started"));
        assert_eq!(ledger.percentage(), 50.0);
    }
}
