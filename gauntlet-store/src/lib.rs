// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Relational storage for gauntlet results.
//!
//! A [`Store`] persists clients, testruns, finished tests and their monitors
//! into an SQLite database. Every test or monitor class is registered once as
//! a class-info row (ancestors first), and the names of its four dictionaries
//! are interned against that row so instance records only carry small integer
//! keys.
//!
//! Writes happen either synchronously through [`Store`], or through a
//! [`DeferredStore`], which moves the connection onto a dedicated writer
//! thread and queues writes in FIFO order. Both implement [`ResultSink`].
//!
//! The read side ([`Store::list_testruns`], [`Store::test_info`],
//! [`Store::find_tests_by_arguments`], ...) is what reporting tools consume,
//! and [`Store::merge_testrun`] copies a whole testrun between databases.

mod classes;
mod deferred;
mod errors;
mod ids;
mod merge;
mod query;
mod schema;
mod sink;
mod store;
mod values;

pub use deferred::DeferredStore;
pub use errors::*;
pub use ids::*;
pub use query::*;
pub use schema::{SCHEMA_VERSION, schema_version};
pub use sink::ResultSink;
pub use store::*;
