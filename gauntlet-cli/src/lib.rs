// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line tools for gauntlet result stores.
//!
//! The `gauntlet` binary lists the testruns recorded in a store, prints their
//! results, compares two testruns to find regressions, and merges testruns
//! from one store into another.

#![warn(missing_docs)]

mod compare;
mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
pub use output::OutputContext;
