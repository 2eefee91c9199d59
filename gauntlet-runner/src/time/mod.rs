// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod deadline;
mod stopwatch;

pub(crate) use deadline::*;
pub(crate) use stopwatch::*;
