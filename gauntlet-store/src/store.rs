// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ClassId, ClientId, MonitorId, StoreError, TestId, TestRunId,
    classes::ClassCache,
    schema::{self, Tables},
    values,
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use gauntlet_metadata::{
    ArgumentValues, Checklist, DictKind, MonitorRecord, SchemaKind, TestRecord, Value,
};
use rusqlite::{Connection, Transaction, params};
use std::{collections::BTreeMap, fmt};
use tracing::{debug, instrument};

/// A captured environment snapshot, stored verbatim with each testrun.
pub type Environment = BTreeMap<String, Value>;

/// The identity of the program and machine that produced a testrun.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ClientInfo {
    /// The software that ran the tests, for example `gauntlet 0.3.0`.
    pub software: String,

    /// The host name of the machine.
    pub host: String,

    /// The user that ran the tests.
    pub user: String,
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.user, self.host, self.software)
    }
}

/// A synchronous result store backed by an SQLite connection.
///
/// A `Store` must only be driven from one thread at a time. To keep writes
/// off the thread executing tests, wrap it in a
/// [`DeferredStore`](crate::DeferredStore).
#[derive(Debug)]
pub struct Store {
    pub(crate) conn: Connection,
    path: Option<Utf8PathBuf>,
    pub(crate) classes: ClassCache,
}

impl Store {
    /// Opens (creating if needed) the database at `path`, migrating older
    /// revisions in place.
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|error| StoreError::Open {
            path: path.to_owned(),
            error,
        })?;
        Self::from_connection(conn, Some(path.to_owned()))
    }

    /// Opens a fresh in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, None)
    }

    fn from_connection(mut conn: Connection, path: Option<Utf8PathBuf>) -> Result<Self, StoreError> {
        schema::prepare(&mut conn)?;
        Ok(Self {
            conn,
            path,
            classes: ClassCache::default(),
        })
    }

    /// The path this store was opened from, or `None` for in-memory stores.
    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// Starts a new testrun, recording the client identity and environment.
    #[instrument(level = "debug", skip(self, environment))]
    pub fn start_testrun(
        &mut self,
        client: &ClientInfo,
        environment: &Environment,
    ) -> Result<TestRunId, StoreError> {
        self.start_testrun_at(client, environment, Utc::now(), None)
    }

    pub(crate) fn start_testrun_at(
        &mut self,
        client: &ClientInfo,
        environment: &Environment,
        start: DateTime<Utc>,
        stop: Option<DateTime<Utc>>,
    ) -> Result<TestRunId, StoreError> {
        self.with_transaction(|tx, _| {
            let client = client_id(tx, client)?;
            tx.execute(
                "INSERT INTO testrun (clientid, starttime, stoptime) VALUES (?1, ?2, ?3)",
                params![client, start.timestamp(), stop.map(|t| t.timestamp())],
            )?;
            let testrun = TestRunId(tx.last_insert_rowid());

            let mut stmt = tx.prepare_cached(
                "INSERT INTO testrun_environment_dict \
                 (containerid, name, intvalue, txtvalue, blobvalue) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (name, value) in environment {
                let (i, t, b) = values::to_columns(value);
                stmt.execute(params![testrun, name, i, t, b])?;
            }
            debug!(%testrun, "started testrun");
            Ok(testrun)
        })
    }

    /// Records the stop time of a testrun.
    #[instrument(level = "debug", skip(self))]
    pub fn stop_testrun(&mut self, testrun: TestRunId) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE testrun SET stoptime = ?1 WHERE id = ?2",
            params![Utc::now().timestamp(), testrun],
        )?;
        if updated == 0 {
            return Err(StoreError::MissingTestRun(testrun));
        }
        Ok(())
    }

    /// Writes a finished test, its monitors and (for scenarios) its subtests.
    ///
    /// Subtests are written before their scenario, and the scenario's subtest
    /// links are inserted after it. The whole tree is written in a single
    /// transaction.
    #[instrument(level = "debug", skip_all, fields(%testrun, class = record.schema.name()))]
    pub fn insert_test(
        &mut self,
        testrun: TestRunId,
        record: &TestRecord,
    ) -> Result<TestId, StoreError> {
        self.with_transaction(|tx, classes| write_test(tx, classes, testrun, record))
    }

    /// Runs `f` in a transaction, clearing the class cache if it fails.
    pub(crate) fn with_transaction<T>(
        &mut self,
        f: impl FnOnce(&Transaction<'_>, &mut ClassCache) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let tx = self.conn.transaction()?;
        match f(&tx, &mut self.classes) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(error) => {
                // Dropping the transaction rolls it back.
                drop(tx);
                self.classes.clear();
                Err(error)
            }
        }
    }
}

/// Looks up a client identity, inserting it if absent.
pub(crate) fn client_id(conn: &Connection, client: &ClientInfo) -> Result<ClientId, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM client WHERE software = ?1 AND name = ?2 AND user = ?3",
    )?;
    let ids = stmt
        .query_map(params![client.software, client.host, client.user], |row| {
            row.get::<_, ClientId>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    match ids.as_slice() {
        [] => {
            conn.execute(
                "INSERT INTO client (software, name, user) VALUES (?1, ?2, ?3)",
                params![client.software, client.host, client.user],
            )?;
            Ok(ClientId(conn.last_insert_rowid()))
        }
        [id] => Ok(*id),
        _ => Err(StoreError::AmbiguousClient {
            client: client.clone(),
            count: ids.len(),
        }),
    }
}

/// The four value dictionaries of a test or monitor instance.
pub(crate) struct InstanceValues<'a> {
    pub(crate) arguments: &'a ArgumentValues,
    pub(crate) checklist: &'a Checklist,
    pub(crate) extra_info: &'a BTreeMap<String, Value>,
    pub(crate) output_files: &'a BTreeMap<String, Utf8PathBuf>,
}

impl<'a> InstanceValues<'a> {
    fn from_test(record: &'a TestRecord) -> Self {
        Self {
            arguments: &record.arguments,
            checklist: &record.checklist,
            extra_info: &record.extra_info,
            output_files: &record.output_files,
        }
    }

    fn from_monitor(record: &'a MonitorRecord) -> Self {
        Self {
            arguments: &record.arguments,
            checklist: &record.checklist,
            extra_info: &record.extra_info,
            output_files: &record.output_files,
        }
    }
}

fn write_test(
    tx: &Connection,
    classes: &mut ClassCache,
    testrun: TestRunId,
    record: &TestRecord,
) -> Result<TestId, StoreError> {
    let children = record
        .subtests
        .iter()
        .map(|child| write_test(tx, classes, testrun, child))
        .collect::<Result<Vec<_>, _>>()?;

    let class = classes.ensure_schema(tx, record.schema)?;
    let test = insert_test_row(
        tx,
        classes,
        testrun,
        class,
        record.schema.name(),
        record.result_percentage,
        &InstanceValues::from_test(record),
    )?;

    for monitor in &record.monitors {
        let class = classes.ensure_schema(tx, monitor.schema)?;
        insert_monitor_row(
            tx,
            classes,
            test,
            class,
            monitor.schema.name(),
            monitor.result_percentage,
            &InstanceValues::from_monitor(monitor),
        )?;
    }

    insert_subtest_links(tx, test, &children)?;
    Ok(test)
}

pub(crate) fn insert_subtest_links(
    tx: &Connection,
    scenario: TestId,
    children: &[TestId],
) -> Result<(), StoreError> {
    if children.is_empty() {
        return Ok(());
    }
    let mut stmt = tx.prepare_cached("INSERT INTO subtests (testid, scenarioid) VALUES (?1, ?2)")?;
    for child in children {
        stmt.execute(params![child, scenario])?;
    }
    Ok(())
}

pub(crate) fn insert_test_row(
    tx: &Connection,
    classes: &ClassCache,
    testrun: TestRunId,
    class: ClassId,
    class_name: &str,
    result_percentage: f64,
    values: &InstanceValues<'_>,
) -> Result<TestId, StoreError> {
    tx.execute(
        "INSERT INTO test (testrunid, type, resultpercentage) VALUES (?1, ?2, ?3)",
        params![testrun, class, result_percentage],
    )?;
    let test = TestId(tx.last_insert_rowid());
    write_values(tx, classes, Tables::TEST, test.0, class_name, values)?;
    Ok(test)
}

pub(crate) fn insert_monitor_row(
    tx: &Connection,
    classes: &ClassCache,
    test: TestId,
    class: ClassId,
    class_name: &str,
    result_percentage: f64,
    values: &InstanceValues<'_>,
) -> Result<MonitorId, StoreError> {
    tx.execute(
        "INSERT INTO monitor (testid, type, resultpercentage) VALUES (?1, ?2, ?3)",
        params![test, class, result_percentage],
    )?;
    let monitor = MonitorId(tx.last_insert_rowid());
    write_values(tx, classes, Tables::MONITOR, monitor.0, class_name, values)?;
    Ok(monitor)
}

/// Writes the four dictionaries of one instance, translating names through
/// the class-info interning tables.
fn write_values(
    tx: &Connection,
    classes: &ClassCache,
    tables: Tables,
    container: i64,
    class: &str,
    values: &InstanceValues<'_>,
) -> Result<(), StoreError> {
    let kind: SchemaKind = tables.kind;
    let name_id = |dict, name: &str| classes.require_name(kind, class, dict, name);

    let mut stmt = tx.prepare_cached(&format!(
        "INSERT INTO {} (containerid, name, intvalue, txtvalue, blobvalue) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        tables.instance_dict(DictKind::Arguments)
    ))?;
    for (name, value) in values.arguments {
        let (i, t, b) = values::to_columns(value);
        stmt.execute(params![container, name_id(DictKind::Arguments, name)?, i, t, b])?;
    }

    let mut stmt = tx.prepare_cached(&format!(
        "INSERT INTO {} (containerid, name, intvalue) VALUES (?1, ?2, ?3)",
        tables.instance_dict(DictKind::Checklist)
    ))?;
    for entry in values.checklist.iter() {
        stmt.execute(params![
            container,
            name_id(DictKind::Checklist, &entry.name)?,
            entry.passed,
        ])?;
    }

    let mut stmt = tx.prepare_cached(&format!(
        "INSERT INTO {} (containerid, name, intvalue, txtvalue, blobvalue) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        tables.instance_dict(DictKind::ExtraInfo)
    ))?;
    for (name, value) in values.extra_info {
        let (i, t, b) = values::to_columns(value);
        stmt.execute(params![container, name_id(DictKind::ExtraInfo, name)?, i, t, b])?;
    }

    let mut stmt = tx.prepare_cached(&format!(
        "INSERT INTO {} (containerid, name, txtvalue) VALUES (?1, ?2, ?3)",
        tables.instance_dict(DictKind::OutputFiles)
    ))?;
    for (name, path) in values.output_files {
        stmt.execute(params![
            container,
            name_id(DictKind::OutputFiles, name)?,
            path.as_str()
        ])?;
    }
    Ok(())
}
