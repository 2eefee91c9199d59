// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The read side of the store, as consumed by reporting tools.

use crate::{
    ClientInfo, Environment, MonitorId, Store, StoreError, TestId, TestRunId,
    schema::{self, Tables},
    values,
};
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use gauntlet_metadata::{
    ArgumentValues, Checklist, ClassInfo, DictKind, SchemaKind, Value,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeMap, HashMap};

/// Metadata about one testrun.
#[derive(Clone, Debug, PartialEq)]
pub struct TestRunInfo {
    /// The testrun id.
    pub id: TestRunId,

    /// Who produced the testrun.
    pub client: ClientInfo,

    /// When the testrun started.
    pub start_time: DateTime<Utc>,

    /// When the testrun finished, if it did.
    pub stop_time: Option<DateTime<Utc>>,
}

/// Full information about a stored test.
#[derive(Clone, Debug, PartialEq)]
pub struct TestInfo {
    /// The test id.
    pub id: TestId,

    /// The testrun the test belongs to.
    pub testrun: TestRunId,

    /// The test class name.
    pub class: String,

    /// Argument values.
    pub arguments: ArgumentValues,

    /// Recorded checks, in validation order.
    pub checklist: Checklist,

    /// Extra information.
    pub extra_info: BTreeMap<String, Value>,

    /// Produced artifacts.
    pub output_files: BTreeMap<String, Utf8PathBuf>,

    /// The stored result percentage.
    pub result_percentage: f64,
}

/// Full information about a stored monitor.
#[derive(Clone, Debug, PartialEq)]
pub struct MonitorInfo {
    /// The monitor id.
    pub id: MonitorId,

    /// The test the monitor was attached to.
    pub test: TestId,

    /// The monitor class name.
    pub class: String,

    /// Argument values.
    pub arguments: ArgumentValues,

    /// Recorded checks, in validation order.
    pub checklist: Checklist,

    /// Extra information.
    pub extra_info: BTreeMap<String, Value>,

    /// Produced artifacts.
    pub output_files: BTreeMap<String, Utf8PathBuf>,

    /// The stored result percentage.
    pub result_percentage: f64,
}

/// Filters for [`Store::list_tests`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TestFilter {
    /// Only list tests whose result percentage is below 100.
    pub only_failed: bool,

    /// Leave out tests that have subtests.
    pub exclude_scenarios: bool,
}

/// A monitor that a matching test must have had attached, for
/// [`Store::find_tests_by_arguments`].
#[derive(Clone, Debug)]
pub struct MonitorMatch {
    /// The monitor class name.
    pub class: String,

    /// The monitor's argument values.
    pub arguments: ArgumentValues,
}

struct InstanceRow {
    id: i64,
    owner: i64,
    class: String,
    result_percentage: f64,
}

impl Store {
    /// Returns the schema revision of the underlying database.
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        Ok(schema::schema_version(&self.conn)?.unwrap_or(0))
    }

    /// Lists testruns, oldest first.
    pub fn list_testruns(&self) -> Result<Vec<TestRunId>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT id FROM testrun ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }

    /// Returns metadata about a testrun.
    pub fn testrun_info(&self, testrun: TestRunId) -> Result<TestRunInfo, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT c.software, c.name, c.user, t.starttime, t.stoptime \
                 FROM testrun t JOIN client c ON c.id = t.clientid WHERE t.id = ?1",
                [testrun],
                |row| {
                    Ok((
                        ClientInfo {
                            software: row.get(0)?,
                            host: row.get(1)?,
                            user: row.get(2)?,
                        },
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ))
                },
            )
            .optional()?;
        let (client, start, stop) = row.ok_or(StoreError::MissingTestRun(testrun))?;
        Ok(TestRunInfo {
            id: testrun,
            client,
            start_time: from_timestamp(start),
            stop_time: stop.map(from_timestamp),
        })
    }

    /// Returns the client that produced a testrun.
    pub fn client_info(&self, testrun: TestRunId) -> Result<ClientInfo, StoreError> {
        Ok(self.testrun_info(testrun)?.client)
    }

    /// Returns the environment snapshot captured for a testrun.
    pub fn testrun_environment(&self, testrun: TestRunId) -> Result<Environment, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, intvalue, txtvalue, blobvalue FROM testrun_environment_dict \
             WHERE containerid = ?1 ORDER BY id",
        )?;
        let environment = stmt
            .query_map([testrun], |row| Ok((row.get(0)?, values::from_row(row, 1)?)))?
            .collect::<Result<_, _>>()?;
        Ok(environment)
    }

    /// Lists the tests of a testrun in insertion order.
    pub fn list_tests(
        &self,
        testrun: TestRunId,
        filter: TestFilter,
    ) -> Result<Vec<TestId>, StoreError> {
        let mut sql = "SELECT id FROM test WHERE testrunid = ?1".to_owned();
        if filter.only_failed {
            sql.push_str(" AND IFNULL(resultpercentage, 0) < 100");
        }
        if filter.exclude_scenarios {
            sql.push_str(" AND id NOT IN (SELECT scenarioid FROM subtests)");
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([testrun], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }

    /// Returns everything stored about a test.
    pub fn test_info(&self, test: TestId) -> Result<Option<TestInfo>, StoreError> {
        let Some(row) = instance_row(&self.conn, Tables::TEST, test.0)? else {
            return Ok(None);
        };
        Ok(Some(TestInfo {
            id: test,
            testrun: TestRunId(row.owner),
            arguments: read_values(&self.conn, Tables::TEST, DictKind::Arguments, row.id)?,
            checklist: read_checklist(&self.conn, Tables::TEST, row.id)?,
            extra_info: read_values(&self.conn, Tables::TEST, DictKind::ExtraInfo, row.id)?,
            output_files: read_output_files(&self.conn, Tables::TEST, row.id)?,
            class: row.class,
            result_percentage: row.result_percentage,
        }))
    }

    /// Lists the monitors attached to a test.
    pub fn monitors_for_test(&self, test: TestId) -> Result<Vec<MonitorId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM monitor WHERE testid = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map([test], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }

    /// Returns everything stored about a monitor.
    pub fn monitor_info(&self, monitor: MonitorId) -> Result<Option<MonitorInfo>, StoreError> {
        let Some(row) = instance_row(&self.conn, Tables::MONITOR, monitor.0)? else {
            return Ok(None);
        };
        Ok(Some(MonitorInfo {
            id: monitor,
            test: TestId(row.owner),
            arguments: read_values(&self.conn, Tables::MONITOR, DictKind::Arguments, row.id)?,
            checklist: read_checklist(&self.conn, Tables::MONITOR, row.id)?,
            extra_info: read_values(&self.conn, Tables::MONITOR, DictKind::ExtraInfo, row.id)?,
            output_files: read_output_files(&self.conn, Tables::MONITOR, row.id)?,
            class: row.class,
            result_percentage: row.result_percentage,
        }))
    }

    /// Lists the direct subtests of a scenario, in the order they ran.
    pub fn subtests(&self, scenario: TestId) -> Result<Vec<TestId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT testid FROM subtests WHERE scenarioid = ?1 ORDER BY testid")?;
        let ids = stmt
            .query_map([scenario], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }

    /// Returns the scenario a test ran under, if any.
    pub fn parent_scenario(&self, test: TestId) -> Result<Option<TestId>, StoreError> {
        let parent = self
            .conn
            .query_row(
                "SELECT scenarioid FROM subtests WHERE testid = ?1",
                [test],
                |row| row.get(0),
            )
            .optional()?;
        Ok(parent)
    }

    /// Lists every registered class of `kind`, ancestors before descendants.
    pub fn class_infos(&self, kind: SchemaKind) -> Result<Vec<ClassInfo>, StoreError> {
        let tables = Tables::for_kind(kind);
        let mut infos: Vec<(i64, ClassInfo)> = Vec::new();
        {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT id, type, parent, description FROM {} ORDER BY id",
                tables.class()
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get(0)?,
                    ClassInfo {
                        kind,
                        name: row.get(1)?,
                        parent: row.get(2)?,
                        description: row.get(3)?,
                        arguments: Default::default(),
                        checklist: Default::default(),
                        extra_info: Default::default(),
                        output_files: Default::default(),
                    },
                ))
            })?;
            for row in rows {
                infos.push(row?);
            }
        }

        let index: HashMap<i64, usize> = infos
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (*id, i))
            .collect();
        for dict in DictKind::ALL {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT containerid, name, txtvalue FROM {} ORDER BY id",
                tables.class_dict(dict)
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (class, name, description) = row?;
                if let Some(&i) = index.get(&class) {
                    infos[i].1.dict_mut(dict).insert(name, description);
                }
            }
        }
        Ok(infos.into_iter().map(|(_, info)| info).collect())
    }

    /// Returns the class named `name` and its ancestors, root first.
    pub fn class_chain(&self, kind: SchemaKind, name: &str) -> Result<Vec<ClassInfo>, StoreError> {
        let mut all: HashMap<String, ClassInfo> = self
            .class_infos(kind)?
            .into_iter()
            .map(|info| (info.name.clone(), info))
            .collect();

        let mut chain = Vec::new();
        let mut cursor = Some(name.to_owned());
        while let Some(current) = cursor {
            let info = all.remove(&current).ok_or_else(|| StoreError::UnknownClass {
                kind,
                name: current.clone(),
            })?;
            cursor = info.parent.clone();
            chain.push(info);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Finds the tests of class `class` whose arguments equal `arguments`.
    ///
    /// This is how "the same logical test" is correlated across testruns. The
    /// search can be scoped to one testrun, and can additionally require that
    /// every entry of `monitors` matches a monitor attached to the test.
    pub fn find_tests_by_arguments(
        &self,
        class: &str,
        arguments: &ArgumentValues,
        testrun: Option<TestRunId>,
        monitors: Option<&[MonitorMatch]>,
    ) -> Result<Vec<TestId>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT t.id FROM test t JOIN testclassinfo c ON c.id = t.type \
             WHERE c.type = ?1 AND (?2 IS NULL OR t.testrunid = ?2) ORDER BY t.id",
        )?;
        let candidates: Vec<i64> = stmt
            .query_map(params![class, testrun], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let mut found = Vec::new();
        for candidate in candidates {
            let stored = read_values(&self.conn, Tables::TEST, DictKind::Arguments, candidate)?;
            if &stored != arguments {
                continue;
            }
            if let Some(monitors) = monitors
                && !self.monitors_match(TestId(candidate), monitors)?
            {
                continue;
            }
            found.push(TestId(candidate));
        }
        Ok(found)
    }

    fn monitors_match(&self, test: TestId, wanted: &[MonitorMatch]) -> Result<bool, StoreError> {
        let mut attached = Vec::new();
        for monitor in self.monitors_for_test(test)? {
            if let Some(row) = instance_row(&self.conn, Tables::MONITOR, monitor.0)? {
                let arguments =
                    read_values(&self.conn, Tables::MONITOR, DictKind::Arguments, row.id)?;
                attached.push((row.class, arguments));
            }
        }
        Ok(wanted.iter().all(|want| {
            attached
                .iter()
                .any(|(class, arguments)| *class == want.class && *arguments == want.arguments)
        }))
    }
}

fn from_timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn instance_row(
    conn: &Connection,
    tables: Tables,
    id: i64,
) -> Result<Option<InstanceRow>, StoreError> {
    let owner = match tables.kind {
        SchemaKind::Test => "testrunid",
        SchemaKind::Monitor => "testid",
    };
    let row = conn
        .query_row(
            &format!(
                "SELECT i.id, i.{owner}, c.type, IFNULL(i.resultpercentage, 0) \
                 FROM {instance} i JOIN {class} c ON c.id = i.type WHERE i.id = ?1",
                instance = tables.instance(),
                class = tables.class(),
            ),
            [id],
            |row| {
                Ok(InstanceRow {
                    id: row.get(0)?,
                    owner: row.get(1)?,
                    class: row.get(2)?,
                    result_percentage: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Reads a typed dictionary, translating interned ids back to names.
fn read_values(
    conn: &Connection,
    tables: Tables,
    dict: DictKind,
    container: i64,
) -> Result<BTreeMap<String, Value>, StoreError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT n.name, v.intvalue, v.txtvalue, v.blobvalue \
         FROM {values} v JOIN {names} n ON n.id = v.name \
         WHERE v.containerid = ?1 ORDER BY v.id",
        values = tables.instance_dict(dict),
        names = tables.class_dict(dict),
    ))?;
    let values = stmt
        .query_map([container], |row| Ok((row.get(0)?, values::from_row(row, 1)?)))?
        .collect::<Result<_, _>>()?;
    Ok(values)
}

fn read_checklist(conn: &Connection, tables: Tables, container: i64) -> Result<Checklist, StoreError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT n.name, v.intvalue FROM {values} v JOIN {names} n ON n.id = v.name \
         WHERE v.containerid = ?1 ORDER BY v.id",
        values = tables.instance_dict(DictKind::Checklist),
        names = tables.class_dict(DictKind::Checklist),
    ))?;
    let checklist = stmt
        .query_map([container], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0))
        })?
        .collect::<Result<_, _>>()?;
    Ok(checklist)
}

fn read_output_files(
    conn: &Connection,
    tables: Tables,
    container: i64,
) -> Result<BTreeMap<String, Utf8PathBuf>, StoreError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT n.name, v.txtvalue FROM {values} v JOIN {names} n ON n.id = v.name \
         WHERE v.containerid = ?1 ORDER BY v.id",
        values = tables.instance_dict(DictKind::OutputFiles),
        names = tables.class_dict(DictKind::OutputFiles),
    ))?;
    let files = stmt
        .query_map([container], |row| {
            Ok((row.get(0)?, Utf8PathBuf::from(row.get::<_, String>(1)?)))
        })?
        .collect::<Result<_, _>>()?;
    Ok(files)
}
