// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    dispatcher::DispatcherContext,
    events::{RunEvent, RunStats},
    internal_events::ExecutorEvent,
};
use crate::{
    arguments::{ArgumentSpace, Arguments},
    config::{MaxConcurrency, RunnerConfig},
    context::HarnessContext,
    errors::{BatchError, TestRunBuildError, TestRunExecuteError},
    monitor::MonitorSpec,
    signal::{SignalHandler, SignalHandlerKind},
    test::{
        DriverOptions, TestClass,
        driver::{TestSpec, run_test},
    },
};
use future_queue::{FutureQueueContext, StreamExt};
use futures::prelude::*;
use gauntlet_metadata::{ArgumentValues, DictKind, Schema, SchemaKind, UndeclaredFieldError};
use gauntlet_store::{ClientInfo, Environment, ResultSink};
use std::{
    fmt,
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    runtime::Runtime,
    sync::{
        broadcast,
        mpsc::{UnboundedSender, unbounded_channel},
        oneshot,
    },
};
use tracing::{debug, instrument};

/// One unit of scheduling work: a test class, the arguments to sweep it over
/// and the monitors to attach to every instance.
#[derive(Clone, Debug)]
pub struct Batch {
    class: Arc<dyn TestClass>,
    arguments: Arguments,
    monitors: Vec<MonitorSpec>,
}

impl Batch {
    /// Creates a batch without monitors.
    pub fn new(class: Arc<dyn TestClass>, arguments: Arguments) -> Self {
        Self {
            class,
            arguments,
            monitors: Vec::new(),
        }
    }

    /// Attaches a monitor to every instance of the batch.
    pub fn with_monitor(mut self, monitor: MonitorSpec) -> Self {
        self.monitors.push(monitor);
        self
    }

    fn prepare(self, harness: &HarnessContext) -> Result<PreparedBatch, BatchError> {
        let schema = self.class.schema();
        check_kind(schema, SchemaKind::Test)?;
        for monitor in &self.monitors {
            let monitor_schema = monitor.class().schema();
            check_kind(monitor_schema, SchemaKind::Monitor)?;
            check_declared(monitor_schema, monitor.arguments().keys().map(String::as_str))?;
        }

        let space = self
            .arguments
            .expand(harness.generators())
            .map_err(|error| BatchError::Arguments {
                class: schema.name(),
                error,
            })?;
        check_declared(schema, space.keys())?;

        Ok(PreparedBatch {
            class: self.class,
            space: Arc::new(space),
            monitors: self.monitors.into(),
        })
    }
}

fn check_kind(schema: &'static Schema, expected: SchemaKind) -> Result<(), BatchError> {
    if schema.kind() == expected {
        Ok(())
    } else {
        Err(BatchError::WrongSchemaKind {
            name: schema.name(),
            expected,
            found: schema.kind(),
        })
    }
}

fn check_declared<'k>(
    schema: &'static Schema,
    keys: impl IntoIterator<Item = &'k str>,
) -> Result<(), BatchError> {
    let resolved = schema.resolve();
    for key in keys {
        if !resolved.arguments().contains_key(key) {
            return Err(BatchError::UndeclaredArgument(UndeclaredFieldError {
                class: schema.name().to_owned(),
                dict: DictKind::Arguments,
                name: key.to_owned(),
            }));
        }
    }
    Ok(())
}

/// A batch whose argument space has been expanded and checked.
struct PreparedBatch {
    class: Arc<dyn TestClass>,
    space: Arc<ArgumentSpace>,
    monitors: Arc<[MonitorSpec]>,
}

impl fmt::Debug for PreparedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedBatch")
            .field("class", &self.class.schema().name())
            .field("len", &self.space.len())
            .field("monitors", &self.monitors.len())
            .finish()
    }
}

/// Test run builder.
#[derive(Debug, Default)]
pub struct TestRunBuilder {
    batches: Vec<Batch>,
    max_concurrency: Option<MaxConcurrency>,
    test_timeout: Option<Duration>,
    setup_timeout: Option<Duration>,
}

impl TestRunBuilder {
    /// Queues a batch. Batches run in the order they were added.
    pub fn add_batch(&mut self, batch: Batch) -> &mut Self {
        self.batches.push(batch);
        self
    }

    /// Sets the number of instances to run at once, overriding the config.
    pub fn set_max_concurrency(&mut self, max_concurrency: MaxConcurrency) -> &mut Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Sets the default test timeout, overriding the config.
    pub fn set_test_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.test_timeout = Some(timeout);
        self
    }

    /// Sets the default setup timeout, overriding the config.
    pub fn set_setup_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.setup_timeout = Some(timeout);
        self
    }

    /// Creates a new test run.
    ///
    /// Every batch's argument space is expanded here, so generator failures
    /// and undeclared arguments are reported before anything runs.
    pub fn build(
        self,
        harness: &Arc<HarnessContext>,
        config: &RunnerConfig,
        signal_handler: SignalHandlerKind,
    ) -> Result<TestRun, TestRunBuildError> {
        let batches = self
            .batches
            .into_iter()
            .enumerate()
            .map(|(index, batch)| {
                batch
                    .prepare(harness)
                    .map_err(|error| TestRunBuildError::Batch { index, error })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let max_concurrency = self
            .max_concurrency
            .unwrap_or_else(|| config.run().max_concurrency())
            .compute();
        let options = Arc::new(DriverOptions {
            harness: Some(harness.clone()),
            uuids: harness.uuids().clone(),
            test_timeout: self
                .test_timeout
                .unwrap_or_else(|| config.run().test_timeout()),
            setup_timeout: self
                .setup_timeout
                .unwrap_or_else(|| config.run().setup_timeout()),
            worker: *config.worker(),
        });

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("gauntlet-runner-worker")
            .build()
            .map_err(TestRunBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // signal_handler.build() must be called from within the guard.
        let signal_handler = signal_handler.build()?;

        Ok(TestRun {
            inner: TestRunInner {
                batches,
                max_concurrency,
                options,
                abort: AbortHandle::new(),
                runtime,
            },
            signal_handler,
        })
    }
}

/// A batch of test instances ready to execute.
///
/// Created using [`TestRunBuilder::build`].
#[derive(Debug)]
pub struct TestRun {
    inner: TestRunInner,
    signal_handler: SignalHandler,
}

impl TestRun {
    /// Returns a handle that aborts the run from anywhere, including the
    /// event callback.
    pub fn abort_handle(&self) -> AbortHandle {
        self.inner.abort.clone()
    }

    /// The number of instances that may run at once.
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Executes every batch, handing finished records to `sink`.
    ///
    /// The run is registered with `sink` before the first instance starts, and
    /// its stop time is recorded before the terminal
    /// [`RunFinished`](super::RunEventKind::RunFinished) or
    /// [`RunAborted`](super::RunEventKind::RunAborted) event is sent.
    pub fn execute<F>(
        mut self,
        sink: &mut dyn ResultSink,
        client: &ClientInfo,
        environment: &Environment,
        callback: F,
    ) -> Result<RunStats, TestRunExecuteError>
    where
        F: FnMut(RunEvent<'_>),
    {
        let res = self
            .inner
            .execute(&mut self.signal_handler, sink, client, environment, callback);

        // Instances that ignored their stop request must not keep the process
        // alive.
        self.inner.runtime.shutdown_background();

        res
    }
}

#[derive(Debug)]
struct TestRunInner {
    batches: Vec<PreparedBatch>,
    max_concurrency: usize,
    options: Arc<DriverOptions>,
    abort: AbortHandle,
    runtime: Runtime,
}

impl TestRunInner {
    #[instrument(level = "debug", skip_all, fields(batches = self.batches.len()))]
    fn execute<F>(
        &self,
        signal_handler: &mut SignalHandler,
        sink: &mut dyn ResultSink,
        client: &ClientInfo,
        environment: &Environment,
        callback: F,
    ) -> Result<RunStats, TestRunExecuteError>
    where
        F: FnMut(RunEvent<'_>),
    {
        let testrun = sink
            .start_testrun(client, environment)
            .map_err(TestRunExecuteError::Start)?;
        debug!(%testrun, max_concurrency = self.max_concurrency, "test run started");

        let mut dispatcher_cx =
            DispatcherContext::new(callback, sink, testrun, self.batches.len(), self.abort.clone());
        dispatcher_cx.run_started();

        let (executor_tx, executor_rx) = unbounded_channel();
        // Subscribe before anything runs so that no abort is missed.
        let abort_rx = self.abort.subscribe();

        self.runtime.block_on(async {
            let dispatcher_fut = dispatcher_cx.run(executor_rx, signal_handler, abort_rx);
            let executor_fut = self.run_batches(executor_tx);
            future::join(dispatcher_fut, executor_fut).await;
        });

        dispatcher_cx.run_finished()
    }

    /// Runs every batch in order. The executor channel closes when this
    /// returns.
    async fn run_batches(&self, executor_tx: UnboundedSender<ExecutorEvent>) {
        for (index, batch) in self.batches.iter().enumerate() {
            if self.abort.is_aborted() {
                debug!(batch = index, "run aborted, skipping remaining batches");
                break;
            }
            let class = batch.class.schema().name();
            let _ = executor_tx.send(ExecutorEvent::BatchStarted {
                index,
                class,
                test_count: batch.space.len(),
            });

            // Arguments are pulled lazily: future_queue only asks for the next
            // tuple once an instance slot is free, so an abort stops the sweep
            // at the next pull.
            let abort = &self.abort;
            let executor_tx = &executor_tx;
            let instances = batch
                .space
                .iter()
                .take_while(|_| !abort.is_aborted())
                .map(|arguments| {
                    (1, move |_cx: FutureQueueContext| {
                        self.run_instance(index, batch, arguments, executor_tx)
                    })
                });
            stream::iter(instances)
                .future_queue(self.max_concurrency)
                .collect::<()>()
                .await;

            let _ = executor_tx.send(ExecutorEvent::BatchFinished { index });
        }
    }

    async fn run_instance(
        &self,
        batch_index: usize,
        batch: &PreparedBatch,
        arguments: ArgumentValues,
        executor_tx: &UnboundedSender<ExecutorEvent>,
    ) {
        let abort_rx = self.abort.subscribe();
        if self.abort.is_aborted() {
            return;
        }

        let guard = self.options.uuids.allocate();
        let uuid = guard.uuid();
        let class = batch.class.schema().name();
        let spec = TestSpec {
            class: batch.class.clone(),
            arguments: arguments.clone(),
            monitors: batch.monitors.clone(),
        };
        let _ = executor_tx.send(ExecutorEvent::Started {
            uuid,
            batch: batch_index,
            class,
            arguments,
        });

        let (start_tx, mut start_rx) = oneshot::channel();
        let options = self.options.clone();
        let mut handle = pin!(tokio::spawn(async move {
            let mut output = run_test(uuid, &spec, options, Some(abort_rx), Some(start_tx)).await;
            output.guards.push(guard);
            output
        }));

        let mut start_done = false;
        let result = loop {
            tokio::select! {
                biased;

                res = &mut start_rx, if !start_done => {
                    start_done = true;
                    if let Ok(setup_duration) = res {
                        let _ = executor_tx.send(ExecutorEvent::Running { uuid, setup_duration });
                    }
                }
                result = &mut handle => break result,
            }
        };

        let event = match result {
            Ok(output) => ExecutorEvent::Finished {
                batch: batch_index,
                output,
            },
            Err(error) => ExecutorEvent::Panicked {
                uuid,
                batch: batch_index,
                message: error.to_string(),
            },
        };
        let _ = executor_tx.send(event);
    }
}

/// Aborts a [`TestRun`].
///
/// Aborting stops scheduling new instances and asks every running instance
/// to stop. Calling [`abort`](Self::abort) more than once, or after the run
/// finished, has no further effect.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
    sender: broadcast::Sender<()>,
}

impl AbortHandle {
    pub(super) fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            sender,
        }
    }

    /// Aborts the run.
    pub fn abort(&self) {
        // The flag is set before sending, so a receiver created after the send
        // sees the flag instead.
        if !self.aborted.swap(true, Ordering::AcqRel) {
            debug!("abort requested");
        }
        let _ = self.sender.send(());
    }

    /// Returns true if the run was aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(super) fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }
}
