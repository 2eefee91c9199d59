// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for gauntlet, a harness for running parameterized
//! integration tests against a media stack.
//!
//! The flow of a run is:
//!
//! 1. Create a [`HarnessContext`](context::HarnessContext), shared by every run
//!    in the process.
//! 2. Describe each sweep as a [`Batch`](runner::Batch): a
//!    [`TestClass`](test::TestClass), the [`Arguments`](arguments::Arguments)
//!    to expand it over and the [`MonitorSpec`](monitor::MonitorSpec)s to
//!    attach.
//! 3. Build a [`TestRun`](runner::TestRun) and execute it against a
//!    [`ResultSink`](gauntlet_store::ResultSink).
//!
//! Remote tests, whose bodies run in a worker subprocess, are described in
//! [`ipc`]. The worker bridge uses Unix sockets and process groups, so this
//! crate only supports Unix platforms.

pub mod arguments;
pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod ipc;
pub mod monitor;
pub mod runner;
pub mod scenario;
pub mod signal;
pub mod test;
mod time;
