// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The batch scheduler.
//!
//! A [`TestRun`] sweeps each queued [`Batch`] over its argument space, running
//! up to a fixed number of instances at once and handing every finished record
//! to a [`ResultSink`](gauntlet_store::ResultSink). Progress is reported
//! through [`RunEvent`]s.

mod dispatcher;
mod events;
mod imp;
mod internal_events;

pub use events::*;
pub use imp::*;
