// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Monitors: instrumentation attached around a test.
//!
//! A monitor is set up before its test and may adjust the test's
//! [`TestEnvironment`]: set environment variables, redirect the worker's
//! output, wrap the worker command line or stretch the timeouts. It is torn
//! down after the test, in reverse attachment order, and keeps its own
//! checklist and extra info.
//!
//! A [`MonitorClass`] lists the [`Capabilities`] it requires; it is silently
//! skipped for tests that lack any of them.

use crate::{
    errors::MonitorError,
    test::{Capabilities, ResultLedger, TestEnvironment},
};
use camino::Utf8PathBuf;
use gauntlet_metadata::{ArgumentValues, MonitorRecord, Schema, TestUuid, Value};
use std::{fmt, sync::Arc};

/// A registered monitor kind.
pub trait MonitorClass: Send + Sync + fmt::Debug {
    /// The static schema of this kind.
    fn schema(&self) -> &'static Schema;

    /// The capabilities a test must have for this monitor to attach.
    fn required_capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    /// Creates a monitor instance.
    fn instantiate(&self, arguments: &ArgumentValues) -> Result<Box<dyn Monitor>, MonitorError>;
}

/// One monitor instance, attached to one test.
pub trait Monitor: Send {
    /// Called before the test is set up.
    ///
    /// An error stops the test before it starts.
    fn set_up(
        &mut self,
        cx: &mut MonitorContext,
        environment: &mut TestEnvironment,
    ) -> Result<(), MonitorError>;

    /// Called after the test has been torn down.
    fn tear_down(&mut self, cx: &mut MonitorContext) {
        let _ = cx;
    }
}

/// A monitor class together with the arguments to instantiate it with.
#[derive(Clone, Debug)]
pub struct MonitorSpec {
    class: Arc<dyn MonitorClass>,
    arguments: ArgumentValues,
}

impl MonitorSpec {
    /// Creates a new spec.
    pub fn new(class: Arc<dyn MonitorClass>, arguments: ArgumentValues) -> Self {
        Self { class, arguments }
    }

    /// The monitor class.
    pub fn class(&self) -> &Arc<dyn MonitorClass> {
        &self.class
    }

    /// The arguments passed to the monitor.
    pub fn arguments(&self) -> &ArgumentValues {
        &self.arguments
    }

    /// Instantiates the monitor and runs its setup.
    pub(crate) fn attach(
        &self,
        test_uuid: TestUuid,
        environment: &mut TestEnvironment,
    ) -> Result<AttachedMonitor, MonitorError> {
        let mut monitor = self.class.instantiate(&self.arguments)?;
        let mut cx = MonitorContext {
            test_uuid,
            ledger: ResultLedger::new(self.class.schema(), self.arguments.clone()),
        };
        monitor.set_up(&mut cx, environment)?;
        Ok(AttachedMonitor { monitor, cx })
    }
}

/// A monitor that has been set up and is waiting for its test to finish.
pub(crate) struct AttachedMonitor {
    monitor: Box<dyn Monitor>,
    cx: MonitorContext,
}

impl AttachedMonitor {
    pub(crate) fn name(&self) -> &'static str {
        self.cx.ledger.schema().name()
    }

    pub(crate) fn tear_down(mut self) -> MonitorRecord {
        self.monitor.tear_down(&mut self.cx);
        self.cx.ledger.into_monitor_record()
    }
}

impl fmt::Debug for AttachedMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedMonitor")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// The handle a monitor uses to report its results.
#[derive(Debug)]
pub struct MonitorContext {
    test_uuid: TestUuid,
    ledger: ResultLedger,
}

impl MonitorContext {
    /// The UUID of the monitored test.
    pub fn test_uuid(&self) -> TestUuid {
        self.test_uuid
    }

    /// The monitor's resolved arguments.
    pub fn arguments(&self) -> &ArgumentValues {
        self.ledger.arguments()
    }

    /// Records a check. The first outcome recorded for a name is kept.
    pub fn validate_step(&mut self, name: &str, passed: bool) {
        self.ledger.validate(name, passed);
    }

    /// Records an extra-info value.
    pub fn extra_info(&mut self, key: &str, value: impl Into<Value>) {
        self.ledger.extra_info(key, value.into());
    }

    /// Records an artifact produced by the monitor.
    pub fn output_file(&mut self, key: &str, path: impl Into<Utf8PathBuf>) {
        self.ledger.output_file(key, path.into());
    }
}
