// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Internal events used between the runner components.
//!
//! These events often mirror those in [`super::events`], but are used within
//! the runner. They are transformed into public events by the dispatcher.

use crate::{signal::ShutdownEvent, test::driver::DriverOutput};
use gauntlet_metadata::{ArgumentValues, TestUuid};
use std::time::Duration;

/// An event sent from the executor to the dispatcher.
#[derive(Debug)]
pub(super) enum ExecutorEvent {
    BatchStarted {
        index: usize,
        class: &'static str,
        test_count: usize,
    },
    Started {
        uuid: TestUuid,
        batch: usize,
        class: &'static str,
        arguments: ArgumentValues,
    },
    Running {
        uuid: TestUuid,
        setup_duration: Duration,
    },
    Finished {
        batch: usize,
        output: DriverOutput,
    },
    Panicked {
        uuid: TestUuid,
        batch: usize,
        message: String,
    },
    BatchFinished {
        index: usize,
    },
}

#[derive(Debug)]
pub(super) enum InternalEvent {
    Executor(ExecutorEvent),
    Signal(ShutdownEvent),
    Abort,
}
