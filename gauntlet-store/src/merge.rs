// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Copying a testrun between two stores.

use crate::{
    ClassId, Store, StoreError, TestFilter, TestId, TestRunId,
    store::{InstanceValues, insert_monitor_row, insert_subtest_links, insert_test_row},
};
use gauntlet_metadata::SchemaKind;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

/// Class ids in the source store mapped to `(destination id, class name)`.
type ClassMap = HashMap<ClassId, (ClassId, String)>;

impl Store {
    /// Copies testrun `testrun` of `source` into this store, returning the id
    /// of the new testrun.
    ///
    /// Classes are matched by name: classes (and dictionary names) missing
    /// from this store are registered, ancestors first, before any test row is
    /// copied. Row ids are never carried over.
    ///
    /// The copy is not atomic. If a step fails, the rows written so far stay
    /// in place and the error is returned.
    #[instrument(level = "info", skip_all, fields(%testrun))]
    pub fn merge_testrun(
        &mut self,
        source: &Store,
        testrun: TestRunId,
    ) -> Result<TestRunId, StoreError> {
        // Client identity, testrun row and environment.
        let run_info = source.testrun_info(testrun)?;
        let environment = source.testrun_environment(testrun)?;
        let merged = self.start_testrun_at(
            &run_info.client,
            &environment,
            run_info.start_time,
            run_info.stop_time,
        )?;

        // Class-info subtrees and the class correspondence tables.
        let test_classes = self.merge_classes(source, SchemaKind::Test, testrun)?;
        let monitor_classes = self.merge_classes(source, SchemaKind::Monitor, testrun)?;

        // Test and monitor rows.
        let mut test_ids: HashMap<TestId, TestId> = HashMap::new();
        for old in source.list_tests(testrun, TestFilter::default())? {
            let Some(test) = source.test_info(old)? else {
                continue;
            };
            let (class, class_name) = translate(&test_classes, source, SchemaKind::Test, old.0)?;
            let new = insert_test_row(
                &self.conn,
                &self.classes,
                merged,
                class,
                class_name,
                test.result_percentage,
                &InstanceValues {
                    arguments: &test.arguments,
                    checklist: &test.checklist,
                    extra_info: &test.extra_info,
                    output_files: &test.output_files,
                },
            )?;
            test_ids.insert(old, new);

            for monitor_id in source.monitors_for_test(old)? {
                let Some(monitor) = source.monitor_info(monitor_id)? else {
                    continue;
                };
                let (class, class_name) =
                    translate(&monitor_classes, source, SchemaKind::Monitor, monitor_id.0)?;
                insert_monitor_row(
                    &self.conn,
                    &self.classes,
                    new,
                    class,
                    class_name,
                    monitor.result_percentage,
                    &InstanceValues {
                        arguments: &monitor.arguments,
                        checklist: &monitor.checklist,
                        extra_info: &monitor.extra_info,
                        output_files: &monitor.output_files,
                    },
                )?;
            }
        }

        // Scenario links, in source order, through the old -> new test mapping.
        for (old_scenario, old_child) in subtest_links(source, testrun)? {
            if let (Some(&scenario), Some(&child)) =
                (test_ids.get(&old_scenario), test_ids.get(&old_child))
            {
                insert_subtest_links(&self.conn, scenario, &[child])?;
            }
        }

        info!(from = %testrun, to = %merged, tests = test_ids.len(), "merged testrun");
        Ok(merged)
    }

    /// Ensures every class of `kind` used by `testrun` exists here, and maps
    /// the source ids to ours.
    fn merge_classes(
        &mut self,
        source: &Store,
        kind: SchemaKind,
        testrun: TestRunId,
    ) -> Result<ClassMap, StoreError> {
        let sql = match kind {
            SchemaKind::Test => {
                "SELECT DISTINCT c.id, c.type FROM test t \
                 JOIN testclassinfo c ON c.id = t.type WHERE t.testrunid = ?1"
            }
            SchemaKind::Monitor => {
                "SELECT DISTINCT c.id, c.type FROM monitor m \
                 JOIN test t ON t.id = m.testid \
                 JOIN monitorclassinfo c ON c.id = m.type WHERE t.testrunid = ?1"
            }
        };
        let mut stmt = source.conn.prepare(sql)?;
        let used: Vec<(ClassId, String)> = stmt
            .query_map([testrun], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        let mut map = ClassMap::new();
        for (source_id, name) in used {
            let chain = source.class_chain(kind, &name)?;
            let id = self.classes.ensure_chain(&self.conn, kind, &chain)?;
            debug!(%kind, class = %name, from = %source_id, to = %id, "mapped class");
            map.insert(source_id, (id, name));
        }
        Ok(map)
    }
}

/// Returns the `(scenario, child)` links of `testrun`'s tests, in the order
/// they were written.
fn subtest_links(source: &Store, testrun: TestRunId) -> Result<Vec<(TestId, TestId)>, StoreError> {
    let mut stmt = source.conn.prepare(
        "SELECT subtests.scenarioid, subtests.testid FROM subtests \
         JOIN test ON test.id = subtests.scenarioid \
         WHERE test.testrunid = ?1 ORDER BY subtests.id",
    )?;
    let links = stmt
        .query_map([testrun], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;
    Ok(links)
}

fn translate<'a>(
    map: &'a ClassMap,
    source: &Store,
    kind: SchemaKind,
    instance: i64,
) -> Result<(ClassId, &'a str), StoreError> {
    let sql = match kind {
        SchemaKind::Test => "SELECT type FROM test WHERE id = ?1",
        SchemaKind::Monitor => "SELECT type FROM monitor WHERE id = ?1",
    };
    let source_class: ClassId = source
        .conn
        .query_row(sql, [instance], |row| row.get(0))?;
    map.get(&source_class)
        .map(|(id, name)| (*id, name.as_str()))
        .ok_or_else(|| StoreError::UnknownClass {
            kind,
            name: source_class.to_string(),
        })
}
