// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller for a test run.
//!
//! The dispatcher receives events from the executor and from the outside world
//! (signals and abort requests), keeps track of running instances, hands
//! finished records to the result sink and sends events to the callback.

use super::{
    AbortHandle,
    events::{CancelReason, RunEvent, RunEventKind, RunStats},
    internal_events::{ExecutorEvent, InternalEvent},
};
use crate::{
    errors::{DisplayErrorChain, TestRunExecuteError},
    signal::SignalHandler,
    time::{StopwatchStart, stopwatch},
};
use chrono::Local;
use debug_ignore::DebugIgnore;
use gauntlet_metadata::TestUuid;
use gauntlet_store::{ResultSink, TestRunId};
use std::collections::BTreeMap;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc::UnboundedReceiver,
};
use tracing::{debug, info, warn};

/// Context for the dispatcher.
#[derive_where::derive_where(Debug)]
pub(super) struct DispatcherContext<'s, F> {
    callback: DebugIgnore<F>,
    sink: DebugIgnore<&'s mut dyn ResultSink>,
    testrun: TestRunId,
    stopwatch: StopwatchStart,
    run_stats: RunStats,
    running_tests: BTreeMap<TestUuid, &'static str>,
    cancel_state: Option<CancelReason>,
    abort: AbortHandle,
}

impl<'s, F> DispatcherContext<'s, F>
where
    F: FnMut(RunEvent<'_>),
{
    pub(super) fn new(
        callback: F,
        sink: &'s mut dyn ResultSink,
        testrun: TestRunId,
        initial_batch_count: usize,
        abort: AbortHandle,
    ) -> Self {
        Self {
            callback: DebugIgnore(callback),
            sink: DebugIgnore(sink),
            testrun,
            stopwatch: stopwatch(),
            run_stats: RunStats {
                initial_batch_count,
                ..RunStats::default()
            },
            running_tests: BTreeMap::new(),
            cancel_state: None,
            abort,
        }
    }

    /// Runs the dispatcher to completion, until `executor_rx` is closed.
    pub(super) async fn run(
        &mut self,
        mut executor_rx: UnboundedReceiver<ExecutorEvent>,
        signal_handler: &mut SignalHandler,
        mut abort_rx: broadcast::Receiver<()>,
    ) {
        let mut signals_done = false;
        let mut abort_done = false;

        loop {
            let internal_event = tokio::select! {
                internal_event = executor_rx.recv() => {
                    match internal_event {
                        Some(event) => InternalEvent::Executor(event),
                        None => {
                            // All batches have been completed.
                            break;
                        }
                    }
                },
                internal_event = signal_handler.recv(), if !signals_done => {
                    match internal_event {
                        Some(event) => InternalEvent::Signal(event),
                        None => {
                            signals_done = true;
                            continue;
                        }
                    }
                },
                res = abort_rx.recv(), if !abort_done => {
                    match res {
                        Ok(()) | Err(RecvError::Lagged(_)) => InternalEvent::Abort,
                        Err(RecvError::Closed) => {
                            abort_done = true;
                            continue;
                        }
                    }
                },
            };

            self.handle_event(internal_event);
        }
    }

    pub(super) fn run_started(&mut self) {
        self.basic_callback(RunEventKind::RunStarted {
            testrun: self.testrun,
            batch_count: self.run_stats.initial_batch_count,
        });
    }

    /// Records the run's stop time and sends the terminal event.
    ///
    /// The terminal event is sent even if the stop time could not be recorded.
    pub(super) fn run_finished(&mut self) -> Result<RunStats, TestRunExecuteError> {
        // An abort that raced with the last test finishing still counts.
        if self.cancel_state.is_none() && self.abort.is_aborted() {
            self.cancel_state = Some(CancelReason::Abort);
        }
        self.run_stats.aborted = self.cancel_state.is_some();

        let stop_result = self.sink.stop_testrun(self.testrun);
        if let Err(error) = &stop_result {
            warn!(testrun = %self.testrun, error = %DisplayErrorChain(error), "failed to record testrun stop");
        }

        let stats = self.run_stats;
        let kind = match self.cancel_state {
            Some(reason) => RunEventKind::RunAborted {
                testrun: self.testrun,
                reason,
                stats,
            },
            None => RunEventKind::RunFinished {
                testrun: self.testrun,
                stats,
            },
        };
        self.basic_callback(kind);

        stop_result.map_err(TestRunExecuteError::Stop)?;
        Ok(stats)
    }

    fn handle_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Executor(ExecutorEvent::BatchStarted {
                index,
                class,
                test_count,
            }) => {
                self.run_stats.batches_started += 1;
                debug!(batch = index, class, test_count, "batch started");
                self.basic_callback(RunEventKind::BatchStarted {
                    index,
                    class,
                    test_count,
                });
            }
            InternalEvent::Executor(ExecutorEvent::Started {
                uuid,
                batch,
                class,
                arguments,
            }) => {
                self.running_tests.insert(uuid, class);
                self.run_stats.started += 1;
                let running = self.running();
                self.run_stats.peak_running = self.run_stats.peak_running.max(running);
                self.basic_callback(RunEventKind::TestStarted {
                    uuid,
                    batch,
                    class,
                    arguments: &arguments,
                    running,
                });
            }
            InternalEvent::Executor(ExecutorEvent::Running {
                uuid,
                setup_duration,
            }) => {
                self.basic_callback(RunEventKind::TestRunning {
                    uuid,
                    setup_duration,
                });
            }
            InternalEvent::Executor(ExecutorEvent::Finished { batch, output }) => {
                let record = &output.record;
                self.running_tests.remove(&record.uuid);
                self.run_stats.finished += 1;
                if record.is_success() {
                    self.run_stats.passed += 1;
                } else {
                    self.run_stats.failed += 1;
                }

                let persisted = match self.sink.insert_test(self.testrun, record) {
                    Ok(()) => true,
                    Err(error) => {
                        warn!(
                            test_uuid = %record.uuid,
                            class = record.schema.name(),
                            error = %DisplayErrorChain(&error),
                            "failed to persist test record",
                        );
                        self.run_stats.persist_failures += 1;
                        false
                    }
                };

                let running = self.running();
                self.basic_callback(RunEventKind::TestFinished {
                    batch,
                    record,
                    persisted,
                    running,
                });
                // The UUIDs of the tree are released here, now that the record
                // has been handed over.
                drop(output);
            }
            InternalEvent::Executor(ExecutorEvent::Panicked {
                uuid,
                batch,
                message,
            }) => {
                let class = self.running_tests.remove(&uuid).unwrap_or("(unknown)");
                warn!(test_uuid = %uuid, batch, class, message, "test driver panicked");
                self.run_stats.finished += 1;
                self.run_stats.failed += 1;
                self.run_stats.panicked += 1;
                let running = self.running();
                self.basic_callback(RunEventKind::TestPanicked {
                    uuid,
                    batch,
                    message: &message,
                    running,
                });
            }
            InternalEvent::Executor(ExecutorEvent::BatchFinished { index }) => {
                debug!(batch = index, "batch finished");
                self.basic_callback(RunEventKind::BatchFinished { index });
            }
            InternalEvent::Signal(event) => {
                self.begin_cancel(CancelReason::Signal(event));
            }
            InternalEvent::Abort => {
                self.begin_cancel(CancelReason::Abort);
            }
        }
    }

    fn begin_cancel(&mut self, reason: CancelReason) {
        if let Some(existing) = self.cancel_state {
            debug!(%existing, ignored = %reason, "run is already being cancelled");
            return;
        }
        info!(%reason, running = self.running(), "aborting test run");
        self.cancel_state = Some(reason);
        // Idempotent: the executor stops scheduling, and running instances are
        // told to stop.
        self.abort.abort();
        self.basic_callback(RunEventKind::RunBeginCancel {
            reason,
            running: self.running(),
        });
    }

    fn running(&self) -> usize {
        self.running_tests.len()
    }

    fn basic_callback(&mut self, kind: RunEventKind<'_>) {
        let snapshot = self.stopwatch.snapshot();
        let event = RunEvent {
            timestamp: Local::now().fixed_offset(),
            elapsed: snapshot.duration,
            kind,
        };
        (self.callback)(event)
    }
}
