// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the result store.

use crate::{ClientInfo, TestRunId};
use camino::Utf8PathBuf;
use gauntlet_metadata::{DictKind, SchemaKind};
use thiserror::Error;

/// An error that occurred while reading from or writing to a result store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// An error occurred while opening the database file.
    #[error("failed to open result store at `{path}`")]
    Open {
        /// The path of the database.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: rusqlite::Error,
    },

    /// An SQLite statement failed.
    #[error("result store query failed")]
    Sqlite(#[from] rusqlite::Error),

    /// The database was written by a newer version of gauntlet.
    #[error(
        "result store is at schema revision {found}, but this version of gauntlet \
         only understands revisions up to {supported}"
    )]
    SchemaTooNew {
        /// The revision found in the `version` table.
        found: i64,

        /// The highest revision this build understands.
        supported: i64,
    },

    /// Migrating the database to the current revision failed.
    #[error("failed to migrate result store from revision {from} to {to}")]
    Migration {
        /// The revision being migrated from.
        from: i64,

        /// The revision being migrated to.
        to: i64,

        /// The underlying error.
        #[source]
        error: rusqlite::Error,
    },

    /// More than one client row matched the same identity.
    #[error("{count} client rows match {client}; the result store is inconsistent")]
    AmbiguousClient {
        /// The identity that was looked up.
        client: ClientInfo,

        /// How many rows matched.
        count: usize,
    },

    /// A class was referenced that has no class-info row.
    #[error("unknown {kind} class `{name}`")]
    UnknownClass {
        /// Whether this was a test or a monitor class.
        kind: SchemaKind,

        /// The class name.
        name: String,
    },

    /// A record used a name that its class does not declare.
    #[error("`{name}` is not a declared {dict} field of {kind} class `{class}`")]
    UnknownName {
        /// Whether this was a test or a monitor class.
        kind: SchemaKind,

        /// The class the record belongs to.
        class: String,

        /// The dictionary the name was looked up in.
        dict: DictKind,

        /// The undeclared name.
        name: String,
    },

    /// The requested testrun does not exist.
    #[error("testrun {0} does not exist")]
    MissingTestRun(TestRunId),

    /// The background writer thread could not be spawned.
    #[error("failed to spawn deferred writer thread")]
    SpawnWriter(#[source] std::io::Error),

    /// The background writer thread exited before the request completed.
    #[error("deferred writer thread is gone")]
    WriterGone,
}
