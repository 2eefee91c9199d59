// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Shared data model for gauntlet.
//!
//! This crate describes *what* a test run produces, independently of how tests
//! are executed ([`gauntlet-runner`]) or persisted ([`gauntlet-store`]):
//!
//! * [`Value`]: the type-tagged values used for arguments and extra info.
//! * [`Schema`]: the statically-declared shape of a test or monitor kind, with an
//!   explicit link to its base schema.
//! * [`Checklist`]: the append-only pass/fail ledger of a single instance.
//! * [`TestRecord`] and [`MonitorRecord`]: finished instances, ready to be
//!   stored.
//!
//! [`gauntlet-runner`]: https://docs.rs/gauntlet-runner
//! [`gauntlet-store`]: https://docs.rs/gauntlet-store

mod checklist;
mod errors;
mod record;
mod schema;
mod uuid;
mod value;

pub use checklist::*;
pub use errors::*;
pub use record::*;
pub use schema::*;
pub use uuid::*;
pub use value::*;
