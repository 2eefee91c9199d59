// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running test bodies in worker subprocesses.
//!
//! A remote test is split in two halves. The proxy half ([`RemoteTestClass`])
//! lives in the coordinator and drives the test's lifecycle; the worker half
//! ([`run_worker`]) lives in a subprocess and hosts the real test instance. The
//! two talk over a private [`Bus`] owned by the
//! [`HarnessContext`](crate::context::HarnessContext).

mod bus;
mod protocol;
mod proxy;
mod unix;
mod worker;

pub use bus::Bus;
pub use protocol::{BUS_ADDRESS_ENV, TEST_ARGUMENTS_ENV, TEST_UUID_ENV};
pub use proxy::{PROXY_TEST_SCHEMA, RemoteTestClass};
pub use worker::{WorkerRegistry, run_worker};
