// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events emitted while a [`TestRun`](super::TestRun) executes.

use crate::signal::ShutdownEvent;
use chrono::{DateTime, FixedOffset};
use gauntlet_metadata::{ArgumentValues, TestRecord, TestUuid};
use gauntlet_store::TestRunId;
use std::{fmt, time::Duration};

/// An event that occurred during a test run.
#[derive(Clone, Debug)]
pub struct RunEvent<'a> {
    /// The time at which the event was generated, including the offset from UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The amount of time elapsed since the start of the test run.
    pub elapsed: Duration,

    /// The kind of event this is.
    pub kind: RunEventKind<'a>,
}

/// The kind of [`RunEvent`].
#[derive(Clone, Debug)]
pub enum RunEventKind<'a> {
    /// The run started and was registered with the result sink.
    RunStarted {
        /// The id the sink assigned to the run.
        testrun: TestRunId,

        /// The number of batches queued.
        batch_count: usize,
    },

    /// The scheduler moved on to a new batch.
    BatchStarted {
        /// The index of the batch.
        index: usize,

        /// The test class of the batch.
        class: &'static str,

        /// The number of argument tuples in the batch.
        test_count: usize,
    },

    /// A test instance was started.
    TestStarted {
        /// The instance UUID.
        uuid: TestUuid,

        /// The batch the instance belongs to.
        batch: usize,

        /// The test class.
        class: &'static str,

        /// The instance's arguments.
        arguments: &'a ArgumentValues,

        /// The number of instances running, including this one.
        running: usize,
    },

    /// A test instance finished setting up and its body started.
    TestRunning {
        /// The instance UUID.
        uuid: TestUuid,

        /// How long setup took.
        setup_duration: Duration,
    },

    /// A test instance finished and its record was handed to the result sink.
    TestFinished {
        /// The batch the instance belongs to.
        batch: usize,

        /// The finished record.
        record: &'a TestRecord,

        /// Whether the sink accepted the record.
        persisted: bool,

        /// The number of instances still running.
        running: usize,
    },

    /// The task driving a test instance panicked. No record exists for it.
    TestPanicked {
        /// The instance UUID.
        uuid: TestUuid,

        /// The batch the instance belongs to.
        batch: usize,

        /// A description of the panic.
        message: &'a str,

        /// The number of instances still running.
        running: usize,
    },

    /// Every instance of a batch finished.
    BatchFinished {
        /// The index of the batch.
        index: usize,
    },

    /// The run is being aborted. Running instances are stopping.
    RunBeginCancel {
        /// Why the run is being aborted.
        reason: CancelReason,

        /// The number of instances still running.
        running: usize,
    },

    /// The run finished normally and its stop time was recorded.
    RunFinished {
        /// The id of the run.
        testrun: TestRunId,

        /// Statistics for the run.
        stats: RunStats,
    },

    /// The run was aborted. Its stop time was recorded.
    RunAborted {
        /// The id of the run.
        testrun: TestRunId,

        /// Why the run was aborted.
        reason: CancelReason,

        /// Statistics for the run.
        stats: RunStats,
    },
}

/// Why a run was aborted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelReason {
    /// A shutdown signal was received.
    Signal(ShutdownEvent),

    /// [`AbortHandle::abort`](super::AbortHandle::abort) was called.
    Abort,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(event) => write!(f, "received {event}"),
            Self::Abort => write!(f, "abort requested"),
        }
    }
}

/// Statistics for a test run.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The number of batches queued when the run started.
    pub initial_batch_count: usize,

    /// The number of batches that were started.
    pub batches_started: usize,

    /// The number of test instances started.
    pub started: usize,

    /// The number of test instances that finished, including panicked ones.
    pub finished: usize,

    /// The number of instances that finished at 100%.
    pub passed: usize,

    /// The number of instances that finished below 100%, or panicked.
    pub failed: usize,

    /// The number of instances whose driver panicked.
    pub panicked: usize,

    /// The number of records the result sink rejected.
    pub persist_failures: usize,

    /// The largest number of instances that were running at once.
    pub peak_running: usize,

    /// Whether the run was aborted.
    pub aborted: bool,
}

impl RunStats {
    /// Returns true if every started instance passed and was persisted, and
    /// the run was not aborted.
    pub fn is_success(&self) -> bool {
        !self.aborted && self.failed == 0 && self.persist_failures == 0
    }
}
