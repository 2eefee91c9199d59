// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Table layout and in-place migrations.
//!
//! Instance dictionaries never store names directly. Each name is interned
//! once per class-info row in a `*classinfo_*_dict` table, and instance rows
//! reference that row id. Values are type-tagged by which of the `intvalue`,
//! `txtvalue` and `blobvalue` columns is non-null.

use crate::StoreError;
use chrono::Utc;
use gauntlet_metadata::{DictKind, SchemaKind, success_percentage};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// The schema revision written by this version of gauntlet.
pub const SCHEMA_VERSION: i64 = 3;

/// Full layout at the current revision, used for fresh databases.
const SCHEMA_SQL: &str = r#"
CREATE TABLE version (
    version INTEGER NOT NULL,
    modificationtime INTEGER NOT NULL
);

CREATE TABLE client (
    id INTEGER PRIMARY KEY,
    software TEXT NOT NULL,
    name TEXT NOT NULL,
    user TEXT NOT NULL
);

CREATE TABLE testrun (
    id INTEGER PRIMARY KEY,
    clientid INTEGER NOT NULL REFERENCES client(id),
    starttime INTEGER NOT NULL,
    stoptime INTEGER
);

CREATE TABLE testrun_environment_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES testrun(id),
    name TEXT NOT NULL,
    intvalue INTEGER,
    txtvalue TEXT,
    blobvalue BLOB
);

CREATE TABLE testclassinfo (
    id INTEGER PRIMARY KEY,
    type TEXT NOT NULL UNIQUE,
    parent TEXT,
    description TEXT NOT NULL
);
CREATE TABLE testclassinfo_arguments_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES testclassinfo(id),
    name TEXT NOT NULL,
    txtvalue TEXT NOT NULL
);
CREATE TABLE testclassinfo_checklist_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES testclassinfo(id),
    name TEXT NOT NULL,
    txtvalue TEXT NOT NULL
);
CREATE TABLE testclassinfo_extrainfo_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES testclassinfo(id),
    name TEXT NOT NULL,
    txtvalue TEXT NOT NULL
);
CREATE TABLE testclassinfo_outputfiles_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES testclassinfo(id),
    name TEXT NOT NULL,
    txtvalue TEXT NOT NULL
);

CREATE TABLE monitorclassinfo (
    id INTEGER PRIMARY KEY,
    type TEXT NOT NULL UNIQUE,
    parent TEXT,
    description TEXT NOT NULL
);
CREATE TABLE monitorclassinfo_arguments_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES monitorclassinfo(id),
    name TEXT NOT NULL,
    txtvalue TEXT NOT NULL
);
CREATE TABLE monitorclassinfo_checklist_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES monitorclassinfo(id),
    name TEXT NOT NULL,
    txtvalue TEXT NOT NULL
);
CREATE TABLE monitorclassinfo_extrainfo_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES monitorclassinfo(id),
    name TEXT NOT NULL,
    txtvalue TEXT NOT NULL
);
CREATE TABLE monitorclassinfo_outputfiles_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES monitorclassinfo(id),
    name TEXT NOT NULL,
    txtvalue TEXT NOT NULL
);

CREATE TABLE test (
    id INTEGER PRIMARY KEY,
    testrunid INTEGER NOT NULL REFERENCES testrun(id),
    type INTEGER NOT NULL REFERENCES testclassinfo(id),
    resultpercentage REAL
);
CREATE TABLE test_arguments_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES test(id),
    name INTEGER NOT NULL REFERENCES testclassinfo_arguments_dict(id),
    intvalue INTEGER,
    txtvalue TEXT,
    blobvalue BLOB
);
CREATE TABLE test_checklist_list (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES test(id),
    name INTEGER NOT NULL REFERENCES testclassinfo_checklist_dict(id),
    intvalue INTEGER NOT NULL
);
CREATE TABLE test_extrainfo_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES test(id),
    name INTEGER NOT NULL REFERENCES testclassinfo_extrainfo_dict(id),
    intvalue INTEGER,
    txtvalue TEXT,
    blobvalue BLOB
);
CREATE TABLE test_outputfiles_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES test(id),
    name INTEGER NOT NULL REFERENCES testclassinfo_outputfiles_dict(id),
    txtvalue TEXT NOT NULL
);

CREATE TABLE subtests (
    id INTEGER PRIMARY KEY,
    testid INTEGER NOT NULL REFERENCES test(id),
    scenarioid INTEGER NOT NULL REFERENCES test(id)
);

CREATE TABLE monitor (
    id INTEGER PRIMARY KEY,
    testid INTEGER NOT NULL REFERENCES test(id),
    type INTEGER NOT NULL REFERENCES monitorclassinfo(id),
    resultpercentage REAL
);
CREATE TABLE monitor_arguments_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES monitor(id),
    name INTEGER NOT NULL REFERENCES monitorclassinfo_arguments_dict(id),
    intvalue INTEGER,
    txtvalue TEXT,
    blobvalue BLOB
);
CREATE TABLE monitor_checklist_list (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES monitor(id),
    name INTEGER NOT NULL REFERENCES monitorclassinfo_checklist_dict(id),
    intvalue INTEGER NOT NULL
);
CREATE TABLE monitor_extrainfo_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES monitor(id),
    name INTEGER NOT NULL REFERENCES monitorclassinfo_extrainfo_dict(id),
    intvalue INTEGER,
    txtvalue TEXT,
    blobvalue BLOB
);
CREATE TABLE monitor_outputfiles_dict (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES monitor(id),
    name INTEGER NOT NULL REFERENCES monitorclassinfo_outputfiles_dict(id),
    txtvalue TEXT NOT NULL
);

CREATE INDEX test_testrunid ON test(testrunid);
CREATE INDEX monitor_testid ON monitor(testid);
CREATE INDEX subtests_scenarioid ON subtests(scenarioid);
"#;

/// Revision 1 stored checklists as unordered dictionaries.
const MIGRATE_1_TO_2_SQL: &str = r#"
CREATE TABLE test_checklist_list (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES test(id),
    name INTEGER NOT NULL REFERENCES testclassinfo_checklist_dict(id),
    intvalue INTEGER NOT NULL
);
INSERT INTO test_checklist_list (containerid, name, intvalue)
    SELECT containerid, name, intvalue FROM test_checklist_dict ORDER BY id;
DROP TABLE test_checklist_dict;

CREATE TABLE monitor_checklist_list (
    id INTEGER PRIMARY KEY,
    containerid INTEGER NOT NULL REFERENCES monitor(id),
    name INTEGER NOT NULL REFERENCES monitorclassinfo_checklist_dict(id),
    intvalue INTEGER NOT NULL
);
INSERT INTO monitor_checklist_list (containerid, name, intvalue)
    SELECT containerid, name, intvalue FROM monitor_checklist_dict ORDER BY id;
DROP TABLE monitor_checklist_dict;
"#;

const MIGRATE_2_TO_3_SQL: &str = r#"
ALTER TABLE test ADD COLUMN resultpercentage REAL;
ALTER TABLE monitor ADD COLUMN resultpercentage REAL;
"#;

/// The table-name fragments used for one kind of class.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Tables {
    pub(crate) kind: SchemaKind,
}

impl Tables {
    pub(crate) const TEST: Self = Self {
        kind: SchemaKind::Test,
    };
    pub(crate) const MONITOR: Self = Self {
        kind: SchemaKind::Monitor,
    };

    pub(crate) fn for_kind(kind: SchemaKind) -> Self {
        Self { kind }
    }

    /// `test` or `monitor`.
    pub(crate) fn instance(self) -> &'static str {
        match self.kind {
            SchemaKind::Test => "test",
            SchemaKind::Monitor => "monitor",
        }
    }

    pub(crate) fn class(self) -> &'static str {
        match self.kind {
            SchemaKind::Test => "testclassinfo",
            SchemaKind::Monitor => "monitorclassinfo",
        }
    }

    pub(crate) fn class_dict(self, dict: DictKind) -> String {
        format!("{}_{}_dict", self.class(), dict_fragment(dict))
    }

    pub(crate) fn instance_dict(self, dict: DictKind) -> String {
        match dict {
            DictKind::Checklist => format!("{}_checklist_list", self.instance()),
            other => format!("{}_{}_dict", self.instance(), dict_fragment(other)),
        }
    }
}

fn dict_fragment(dict: DictKind) -> &'static str {
    match dict {
        DictKind::Arguments => "arguments",
        DictKind::Checklist => "checklist",
        DictKind::ExtraInfo => "extrainfo",
        DictKind::OutputFiles => "outputfiles",
    }
}

/// Returns the schema revision recorded in the database, or `None` for a
/// database that has never been initialized.
pub fn schema_version(conn: &Connection) -> Result<Option<i64>, StoreError> {
    let has_table: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'version'",
        [],
        |row| row.get(0),
    )?;
    if has_table == 0 {
        return Ok(None);
    }
    let version = conn
        .query_row(
            "SELECT version FROM version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version)
}

/// Brings the database to [`SCHEMA_VERSION`], creating it if empty.
pub(crate) fn prepare(conn: &mut Connection) -> Result<(), StoreError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    let Some(mut current) = schema_version(conn)? else {
        debug!(version = SCHEMA_VERSION, "initializing empty result store");
        let tx = conn.transaction()?;
        tx.execute_batch(SCHEMA_SQL)?;
        write_version(&tx, SCHEMA_VERSION)?;
        tx.commit()?;
        return Ok(());
    };

    if current > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    while current < SCHEMA_VERSION {
        let next = current + 1;
        info!(from = current, to = next, "migrating result store");
        migrate_step(conn, next).map_err(|error| StoreError::Migration {
            from: current,
            to: next,
            error,
        })?;
        current = next;
    }
    Ok(())
}

fn migrate_step(conn: &mut Connection, to: i64) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    match to {
        2 => tx.execute_batch(MIGRATE_1_TO_2_SQL)?,
        3 => {
            tx.execute_batch(MIGRATE_2_TO_3_SQL)?;
            backfill_percentages(&tx, Tables::TEST)?;
            backfill_percentages(&tx, Tables::MONITOR)?;
        }
        _ => {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
                Some(format!("no migration step produces revision {to}")),
            ));
        }
    }
    write_version(&tx, to)?;
    tx.commit()
}

fn write_version(tx: &Transaction<'_>, version: i64) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM version", [])?;
    tx.execute(
        "INSERT INTO version (version, modificationtime) VALUES (?1, ?2)",
        params![version, Utc::now().timestamp()],
    )?;
    Ok(())
}

/// Computes the result percentage of every stored instance from its checklist
/// and the full checklist union of its class chain.
fn backfill_percentages(tx: &Transaction<'_>, tables: Tables) -> rusqlite::Result<()> {
    // class id -> (class name, parent name)
    let mut classes: HashMap<i64, (String, Option<String>)> = HashMap::new();
    {
        let mut stmt = tx.prepare(&format!("SELECT id, type, parent FROM {}", tables.class()))?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, (row.get(1)?, row.get(2)?))))?;
        for row in rows {
            let (id, entry) = row?;
            classes.insert(id, entry);
        }
    }
    let ids_by_name: HashMap<&str, i64> = classes
        .iter()
        .map(|(id, (name, _))| (name.as_str(), *id))
        .collect();

    let mut own_checks: HashMap<i64, Vec<String>> = HashMap::new();
    {
        let mut stmt = tx.prepare(&format!(
            "SELECT containerid, name FROM {}",
            tables.class_dict(DictKind::Checklist)
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get(1)?)))?;
        for row in rows {
            let (class, name) = row?;
            own_checks.entry(class).or_default().push(name);
        }
    }

    let mut universe: HashMap<i64, usize> = HashMap::new();
    for &class in classes.keys() {
        let mut names = BTreeSet::new();
        let mut cursor = Some(class);
        while let Some(id) = cursor {
            names.extend(own_checks.get(&id).into_iter().flatten().cloned());
            cursor = classes
                .get(&id)
                .and_then(|(_, parent)| parent.as_deref())
                .and_then(|parent| ids_by_name.get(parent).copied());
        }
        universe.insert(class, names.len());
    }

    let mut instances: Vec<(i64, i64, usize)> = Vec::new();
    {
        let mut stmt = tx.prepare(&format!(
            "SELECT i.id, i.type, \
                    (SELECT COUNT(*) FROM {list} c WHERE c.containerid = i.id AND c.intvalue != 0) \
             FROM {instance} i",
            list = tables.instance_dict(DictKind::Checklist),
            instance = tables.instance(),
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        for row in rows {
            instances.push(row?);
        }
    }

    let mut update = tx.prepare(&format!(
        "UPDATE {} SET resultpercentage = ?1 WHERE id = ?2",
        tables.instance()
    ))?;
    for (id, class, passed) in instances {
        let total = universe.get(&class).copied().unwrap_or(0);
        update.execute(params![success_percentage(passed, total), id])?;
    }
    Ok(())
}
