// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drives a single test instance from instantiation to its finished record.
//!
//! The driver owns the instance's ledger. Test code, bridge tasks and child
//! scenarios only ever talk to it through [`TestMessage`]s, so all state
//! changes happen on this one task in the order they were sent.

use super::{
    Capabilities, DriverOptions, ResultLedger, SetupMode, TestClass, TestContext,
    TestEnvironment, TestKind, TestMessage,
};
use crate::{
    context::UuidGuard,
    errors::{DisplayErrorChain, TestError},
    monitor::{AttachedMonitor, MonitorSpec},
    time::{DeadlineSleep, StopwatchStart, stopwatch},
};
use futures::future::BoxFuture;
use gauntlet_metadata::{ArgumentValues, TestRecord, TestUuid, Value};
use std::{pin::pin, sync::Arc, time::Duration};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc::UnboundedReceiver,
    oneshot,
};
use tracing::{debug, instrument, warn};

/// What to run: a test class, one argument tuple and the monitors to attach.
#[derive(Clone, Debug)]
pub(crate) struct TestSpec {
    pub(crate) class: Arc<dyn TestClass>,
    pub(crate) arguments: ArgumentValues,
    pub(crate) monitors: Arc<[MonitorSpec]>,
}

/// A finished instance.
#[derive(Debug)]
pub(crate) struct DriverOutput {
    pub(crate) record: TestRecord,

    /// The UUIDs of the instance's descendants, held until the record is
    /// persisted.
    pub(crate) guards: Vec<UuidGuard>,
}

/// Why a test is stopping.
#[derive(Clone, Debug, Eq, PartialEq)]
enum StopCause {
    Requested,
    BodyReturned,
    Failed(String),
    SetupTimeout,
    Timeout,
    Aborted,
}

impl StopCause {
    fn error_message(&self) -> Option<String> {
        match self {
            Self::Requested | Self::BodyReturned => None,
            Self::Failed(message) => Some(message.clone()),
            Self::SetupTimeout => Some("setup timed out".to_owned()),
            Self::Timeout => Some("test timed out".to_owned()),
            Self::Aborted => Some("test run aborted".to_owned()),
        }
    }
}

struct DriverState {
    ledger: ResultLedger,
    messages: UnboundedReceiver<TestMessage>,
    stop: Option<StopCause>,
    ready: bool,
    pending_extension: Duration,
    subtests: Vec<TestRecord>,
    guards: Vec<UuidGuard>,
}

impl DriverState {
    /// Applies a message. Returns a timeout extension to apply to the running
    /// deadline, if any.
    fn handle(&mut self, message: TestMessage) -> Option<Duration> {
        match message {
            TestMessage::Validate { name, passed } => {
                if !self.ledger.validate(&name, passed) {
                    debug!(name = %name, passed, "check not recorded");
                }
            }
            TestMessage::ExtraInfo { key, value } => self.ledger.extra_info(&key, value),
            TestMessage::OutputFile { key, path } => self.ledger.output_file(&key, path),
            TestMessage::Ready => self.ready = true,
            TestMessage::Stop { error } => {
                self.request_stop(error.map_or(StopCause::Requested, StopCause::Failed));
            }
            TestMessage::ExtendTimeout(by) => return Some(by),
            TestMessage::Subtest { record, mut guards } => {
                self.subtests.push(record);
                self.guards.append(&mut guards);
            }
        }
        None
    }

    fn request_stop(&mut self, cause: StopCause) {
        match &self.stop {
            Some(existing) => {
                debug!(?existing, ignored = ?cause, "test is already stopping");
            }
            None => {
                debug!(?cause, "stopping test");
                self.stop = Some(cause);
            }
        }
    }

    fn drain(&mut self) {
        while let Ok(message) = self.messages.try_recv() {
            self.handle(message);
        }
    }
}

/// Runs one test instance to completion.
///
/// `abort` stops the test early when it fires; a closed channel is ignored.
/// `on_start` is sent the setup duration once the body starts.
#[instrument(
    level = "debug",
    skip_all,
    fields(test_uuid = %uuid, class = spec.class.schema().name()),
)]
pub(crate) async fn run_test(
    uuid: TestUuid,
    spec: &TestSpec,
    options: Arc<DriverOptions>,
    mut abort: Option<broadcast::Receiver<()>>,
    on_start: Option<oneshot::Sender<Duration>>,
) -> DriverOutput {
    let class = &spec.class;
    let schema = class.schema();
    let capabilities = class.capabilities();
    let stopwatch = stopwatch();

    let mut environment = TestEnvironment::default();
    let (monitors, monitor_failure) = attach_monitors(uuid, &spec.monitors, capabilities, &mut environment);

    let test_timeout = environment.scale(class.timeout().unwrap_or(options.test_timeout));
    let setup_timeout = environment.scale(class.setup_timeout().unwrap_or(options.setup_timeout));

    let (cx, messages) = TestContext::new(
        uuid,
        schema,
        spec.arguments.clone(),
        environment,
        options,
    );
    let mut state = DriverState {
        ledger: ResultLedger::new(schema, spec.arguments.clone()),
        messages,
        stop: None,
        ready: false,
        pending_extension: Duration::ZERO,
        subtests: Vec::new(),
        guards: Vec::new(),
    };
    if let Some(message) = monitor_failure {
        state.request_stop(StopCause::Failed(message));
    }

    let mut kind = match state.stop {
        Some(_) => None,
        None => match class.instantiate(&spec.arguments) {
            Ok(kind) => Some(kind),
            Err(error) => {
                state.request_stop(StopCause::Failed(format!(
                    "failed to instantiate test: {}",
                    DisplayErrorChain(&error),
                )));
                None
            }
        },
    };

    if let Some(kind) = &mut kind {
        run_phases(
            kind.as_mut(),
            &cx,
            &mut state,
            &mut abort,
            &stopwatch,
            setup_timeout,
            test_timeout,
            capabilities,
            on_start,
        )
        .await;
        debug!("tearing down");
        kind.tear_down(&cx).await;
    }
    state.drain();

    let cause = state.stop.clone().unwrap_or(StopCause::Requested);
    if let Some(message) = cause.error_message() {
        state.ledger.extra_info("error-message", Value::Text(message));
    }
    state.ledger.extra_info(
        "test-total-duration",
        Value::Int(stopwatch.snapshot().millis()),
    );

    // Monitors come off in reverse order of attachment.
    let monitors: Vec<_> = monitors
        .into_iter()
        .rev()
        .map(AttachedMonitor::tear_down)
        .collect();

    let DriverState {
        ledger,
        subtests,
        guards,
        ..
    } = state;
    let result_percentage = if capabilities.contains(Capabilities::SCENARIO) {
        scenario_percentage(&subtests)
    } else {
        ledger.percentage()
    };
    debug!(result_percentage, ?cause, "test finished");

    DriverOutput {
        record: ledger.into_test_record(uuid, result_percentage, monitors, subtests),
        guards,
    }
}

/// The mean percentage of a scenario's children, or 0 without children.
pub(crate) fn scenario_percentage(subtests: &[TestRecord]) -> f64 {
    if subtests.is_empty() {
        return 0.0;
    }
    let total: f64 = subtests.iter().map(|record| record.result_percentage).sum();
    total / subtests.len() as f64
}

fn attach_monitors(
    uuid: TestUuid,
    specs: &[MonitorSpec],
    capabilities: Capabilities,
    environment: &mut TestEnvironment,
) -> (Vec<AttachedMonitor>, Option<String>) {
    let mut attached = Vec::with_capacity(specs.len());
    for spec in specs {
        let required = spec.class().required_capabilities();
        if !capabilities.contains(required) {
            debug!(
                monitor = spec.class().schema().name(),
                ?required,
                "skipping monitor that does not apply to this test",
            );
            continue;
        }
        match spec.attach(uuid, environment) {
            Ok(monitor) => attached.push(monitor),
            Err(error) => {
                warn!(
                    test_uuid = %uuid,
                    "monitor setup failed: {}",
                    DisplayErrorChain(&error),
                );
                return (attached, Some(error.to_string()));
            }
        }
    }
    (attached, None)
}

#[expect(clippy::too_many_arguments)]
async fn run_phases(
    kind: &mut dyn TestKind,
    cx: &TestContext,
    state: &mut DriverState,
    abort: &mut Option<broadcast::Receiver<()>>,
    stopwatch: &StopwatchStart,
    setup_timeout: Duration,
    test_timeout: Duration,
    capabilities: Capabilities,
    on_start: Option<oneshot::Sender<Duration>>,
) {
    let mut deadline = pin!(DeadlineSleep::disarmed());

    // Setup, and for asynchronous setups, waiting for ready. Only an
    // asynchronous setup is bounded by the setup timeout.
    {
        let mut setup = kind.set_up(cx);
        let mut setup_done = false;
        loop {
            if state.stop.is_some() || (setup_done && state.ready) {
                break;
            }
            tokio::select! {
                result = &mut setup, if !setup_done => match result {
                    Ok(SetupMode::Sync) => {
                        setup_done = true;
                        state.ready = true;
                    }
                    Ok(SetupMode::Async) => {
                        debug!(?setup_timeout, "waiting for asynchronous setup");
                        setup_done = true;
                        deadline.as_mut().arm(setup_timeout);
                    }
                    Err(error) => state.request_stop(StopCause::Failed(format!(
                        "setup failed: {}",
                        DisplayErrorChain(&error),
                    ))),
                },
                Some(message) = state.messages.recv() => {
                    if let Some(by) = state.handle(message) {
                        state.pending_extension += by;
                    }
                }
                () = &mut deadline => state.request_stop(StopCause::SetupTimeout),
                () = aborted(abort) => state.request_stop(StopCause::Aborted),
            }
        }
    }
    if state.stop.is_some() {
        return;
    }

    // Start.
    deadline.as_mut().disarm();
    let setup_duration = stopwatch.snapshot();
    state
        .ledger
        .extra_info("test-setup-duration", Value::Int(setup_duration.millis()));
    if let Some(on_start) = on_start {
        let _ = on_start.send(setup_duration.duration);
    }
    state.ledger.validate("test-started", true);
    deadline.as_mut().arm(test_timeout);
    deadline
        .as_mut()
        .extend(std::mem::take(&mut state.pending_extension));
    debug!(?test_timeout, "test started");

    let is_async = kind.is_async();
    let mut body: Option<BoxFuture<'_, Result<(), TestError>>> = Some(kind.test(cx));
    while state.stop.is_none() {
        tokio::select! {
            result = poll_body(&mut body) => match result {
                Ok(()) if is_async => debug!("asynchronous body returned, waiting for stop"),
                Ok(()) => state.request_stop(StopCause::BodyReturned),
                Err(error) => state.request_stop(StopCause::Failed(DisplayErrorChain(&error).to_string())),
            },
            Some(message) = state.messages.recv() => {
                if let Some(by) = state.handle(message) {
                    deadline.as_mut().extend(by);
                }
            }
            () = &mut deadline => state.request_stop(StopCause::Timeout),
            () = aborted(abort) => state.request_stop(StopCause::Aborted),
        }
    }

    // Stop. A deadline that is still armed did not fire.
    if deadline.is_armed() {
        state.ledger.validate("no-timeout", true);
    }
    deadline.as_mut().disarm();
    cx.stop_children();

    if capabilities.contains(Capabilities::SCENARIO) {
        // Children are told to stop, and report back through messages.
        if let Some(body) = body.take() {
            if let Err(error) = body.await {
                debug!("scenario body failed while stopping: {}", DisplayErrorChain(&error));
            }
        }
    }
    drop(body);
}

/// Polls the body if it is still running; never completes otherwise.
async fn poll_body(body: &mut Option<BoxFuture<'_, Result<(), TestError>>>) -> Result<(), TestError> {
    match body {
        Some(future) => {
            let result = future.await;
            *body = None;
            result
        }
        None => std::future::pending().await,
    }
}

/// Completes when the abort channel fires; a closed or missing channel never
/// completes.
pub(crate) async fn aborted(abort: &mut Option<broadcast::Receiver<()>>) {
    let Some(receiver) = abort else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => return,
            Err(RecvError::Closed) => {
                *abort = None;
                return std::future::pending().await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;
    use crate::{config::WorkerSettings, context::UuidAllocator};
    use futures::FutureExt;
    use gauntlet_metadata::{BASE_TEST_SCHEMA, Schema, SchemaKind, field};
    use std::sync::Mutex;

    pub(crate) static FIXTURE_SCHEMA: Schema =
        Schema::new(SchemaKind::Test, "fixture", "A scripted test")
            .with_base(&BASE_TEST_SCHEMA)
            .with_arguments(&[field("n", "An index")])
            .with_checklist(&[field("body-ran", "The body ran")])
            .with_extra_info(&[field("teardowns", "Teardown count")]);

    /// How a [`FixtureClass`] instance behaves.
    #[derive(Clone, Debug, Default)]
    pub(crate) struct Script {
        pub(crate) fail_instantiate: bool,
        pub(crate) fail_setup: bool,
        pub(crate) async_setup: bool,
        /// How long `set_up` takes before returning.
        pub(crate) setup_sleep: Option<Duration>,
        /// Call `ready` from a spawned task after this long.
        pub(crate) ready_after: Option<Duration>,
        /// Keep running after the body returns.
        pub(crate) is_async: bool,
        /// How long the body sleeps before returning.
        pub(crate) body_sleep: Option<Duration>,
        /// Extend the deadline by this much from within the body.
        pub(crate) extend_by: Option<Duration>,
        /// Call `stop` this many times from the body.
        pub(crate) stop_calls: usize,
        pub(crate) timeout: Option<Duration>,
    }

    #[derive(Debug, Default)]
    pub(crate) struct FixtureClass {
        pub(crate) script: Script,
        pub(crate) capabilities: Capabilities,
        pub(crate) teardowns: Arc<Mutex<usize>>,
    }

    impl TestClass for FixtureClass {
        fn schema(&self) -> &'static Schema {
            &FIXTURE_SCHEMA
        }

        fn capabilities(&self) -> Capabilities {
            self.capabilities
        }

        fn timeout(&self) -> Option<Duration> {
            self.script.timeout
        }

        fn instantiate(&self, _: &ArgumentValues) -> Result<Box<dyn TestKind>, TestError> {
            if self.script.fail_instantiate {
                return Err(TestError::msg("no such element"));
            }
            Ok(Box::new(FixtureTest {
                script: self.script.clone(),
                teardowns: self.teardowns.clone(),
            }))
        }
    }

    struct FixtureTest {
        script: Script,
        teardowns: Arc<Mutex<usize>>,
    }

    impl TestKind for FixtureTest {
        fn set_up<'a>(
            &'a mut self,
            cx: &'a TestContext,
        ) -> BoxFuture<'a, Result<SetupMode, TestError>> {
            async move {
                if self.script.fail_setup {
                    return Err(TestError::msg("pipeline refused to preroll"));
                }
                if let Some(sleep) = self.script.setup_sleep {
                    tokio::time::sleep(sleep).await;
                }
                if !self.script.async_setup {
                    return Ok(SetupMode::Sync);
                }
                if let Some(after) = self.script.ready_after {
                    let cx = cx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        cx.ready();
                    });
                }
                Ok(SetupMode::Async)
            }
            .boxed()
        }

        fn test<'a>(&'a mut self, cx: &'a TestContext) -> BoxFuture<'a, Result<(), TestError>> {
            async move {
                cx.validate_step("body-ran", true);
                if let Some(by) = self.script.extend_by {
                    cx.extend_timeout(by);
                }
                if let Some(sleep) = self.script.body_sleep {
                    tokio::time::sleep(sleep).await;
                }
                for _ in 0..self.script.stop_calls {
                    cx.stop();
                }
                Ok(())
            }
            .boxed()
        }

        fn tear_down<'a>(&'a mut self, cx: &'a TestContext) -> BoxFuture<'a, ()> {
            async move {
                let mut teardowns = self.teardowns.lock().unwrap();
                *teardowns += 1;
                cx.extra_info("teardowns", *teardowns as i64);
            }
            .boxed()
        }

        fn is_async(&self) -> bool {
            self.script.is_async
        }
    }

    pub(crate) fn options() -> Arc<DriverOptions> {
        Arc::new(DriverOptions {
            harness: None,
            uuids: UuidAllocator::new(),
            test_timeout: Duration::from_secs(15),
            setup_timeout: Duration::from_secs(10),
            worker: WorkerSettings::default(),
        })
    }

    pub(crate) fn spec(class: FixtureClass) -> TestSpec {
        TestSpec {
            class: Arc::new(class),
            arguments: ArgumentValues::new(),
            monitors: Arc::new([]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test_helpers::*, *};
    use crate::monitor::test_helpers::EnvMonitorClass;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    async fn run(spec: &TestSpec) -> TestRecord {
        run_test(TestUuid::new_v4(), spec, options(), None, None)
            .await
            .record
    }

    #[tokio::test(start_paused = true)]
    async fn sync_test_passes() {
        let record = run(&spec(FixtureClass::default())).await;
        assert_eq!(record.checklist.get("test-started"), Some(true));
        assert_eq!(record.checklist.get("no-timeout"), Some(true));
        assert_eq!(record.checklist.get("body-ran"), Some(true));
        assert_eq!(record.result_percentage, 100.0);
        assert!(record.extra_info.contains_key("test-setup-duration"));
        assert!(record.extra_info.contains_key("test-total-duration"));
        assert!(!record.extra_info.contains_key("error-message"));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_stop_tears_down_once() {
        let class = FixtureClass {
            script: Script {
                is_async: true,
                stop_calls: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        let teardowns = class.teardowns.clone();
        let record = run(&spec(class)).await;
        assert_eq!(*teardowns.lock().unwrap(), 1);
        assert_eq!(record.extra_info["teardowns"], Value::Int(1));
        assert_eq!(record.result_percentage, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_no_timeout_unvalidated() {
        let class = FixtureClass {
            script: Script {
                is_async: true,
                timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            },
            ..Default::default()
        };
        let record = run(&spec(class)).await;
        assert_eq!(record.checklist.get("no-timeout"), None);
        assert_eq!(
            record.extra_info["error-message"],
            Value::from("test timed out")
        );
        // test-started and body-ran out of three checks.
        assert!((record.result_percentage - 200.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn extended_deadline_is_honored() {
        let class = FixtureClass {
            script: Script {
                timeout: Some(Duration::from_secs(5)),
                extend_by: Some(Duration::from_secs(10)),
                body_sleep: Some(Duration::from_secs(8)),
                ..Default::default()
            },
            ..Default::default()
        };
        let record = run(&spec(class)).await;
        assert_eq!(record.checklist.get("no-timeout"), Some(true));
        assert_eq!(record.result_percentage, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn setup_failure_stops_before_start() {
        let class = FixtureClass {
            script: Script {
                fail_setup: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let teardowns = class.teardowns.clone();
        let record = run(&spec(class)).await;
        assert_eq!(record.checklist.get("test-started"), None);
        assert_eq!(record.result_percentage, 0.0);
        assert_eq!(
            record.extra_info["error-message"],
            Value::from("setup failed: pipeline refused to preroll")
        );
        assert_eq!(*teardowns.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn instantiate_failure_is_recorded() {
        let class = FixtureClass {
            script: Script {
                fail_instantiate: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let teardowns = class.teardowns.clone();
        let record = run(&spec(class)).await;
        assert!(record.checklist.is_empty());
        assert_eq!(
            record.extra_info["error-message"],
            Value::from("failed to instantiate test: no such element")
        );
        assert_eq!(*teardowns.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn async_setup_waits_for_ready() {
        let class = FixtureClass {
            script: Script {
                async_setup: true,
                ready_after: Some(Duration::from_secs(2)),
                ..Default::default()
            },
            ..Default::default()
        };
        let (tx, rx) = oneshot::channel();
        let output = run_test(TestUuid::new_v4(), &spec(class), options(), None, Some(tx)).await;
        assert!(rx.await.unwrap() < Duration::from_secs(1), "setup duration uses the wall clock");
        assert_eq!(output.record.result_percentage, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn async_setup_times_out() {
        let class = FixtureClass {
            script: Script {
                async_setup: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let record = run(&spec(class)).await;
        assert_eq!(record.checklist.get("test-started"), None);
        assert_eq!(
            record.extra_info["error-message"],
            Value::from("setup timed out")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sync_setup_is_not_timed_out() {
        let class = FixtureClass {
            script: Script {
                setup_sleep: Some(Duration::from_secs(12)),
                ..Default::default()
            },
            ..Default::default()
        };
        let record = run(&spec(class)).await;
        assert_eq!(record.checklist.get("test-started"), Some(true));
        assert!(!record.extra_info.contains_key("error-message"));
        assert_eq!(record.result_percentage, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn setup_timeout_starts_when_setup_returns() {
        // 8s of synchronous work, then 8s waiting for ready: each phase fits
        // the 10s setup timeout only if the timer starts at the second one.
        let class = FixtureClass {
            script: Script {
                async_setup: true,
                setup_sleep: Some(Duration::from_secs(8)),
                ready_after: Some(Duration::from_secs(8)),
                ..Default::default()
            },
            ..Default::default()
        };
        let record = run(&spec(class)).await;
        assert_eq!(record.checklist.get("test-started"), Some(true));
        assert_eq!(record.result_percentage, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeouts_run_to_completion() {
        let options = Arc::new(DriverOptions {
            test_timeout: Duration::from_secs(u64::MAX),
            setup_timeout: Duration::MAX,
            ..Arc::try_unwrap(options()).unwrap()
        });
        let spec = TestSpec {
            monitors: vec![MonitorSpec::new(
                Arc::new(EnvMonitorClass {
                    multiplier: Some(1000.0),
                    ..Default::default()
                }),
                ArgumentValues::new(),
            )]
            .into(),
            ..spec(FixtureClass::default())
        };
        let record = run_test(TestUuid::new_v4(), &spec, options, None, None)
            .await
            .record;
        assert_eq!(record.checklist.get("no-timeout"), Some(true));
        assert_eq!(record.result_percentage, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_running_test() {
        let class = FixtureClass {
            script: Script {
                is_async: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let (abort_tx, abort_rx) = broadcast::channel(1);
        let spec = spec(class);
        let handle = tokio::spawn(async move {
            run_test(TestUuid::new_v4(), &spec, options(), Some(abort_rx), None).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        abort_tx.send(()).unwrap();
        let record = handle.await.unwrap().record;
        assert_eq!(
            record.extra_info["error-message"],
            Value::from("test run aborted")
        );
        assert_eq!(record.checklist.get("no-timeout"), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn monitors_apply_by_capability() {
        let torn_down = Arc::new(Mutex::new(Vec::new()));
        let monitor = |tag: &str, required| {
            MonitorSpec::new(
                Arc::new(EnvMonitorClass {
                    required,
                    multiplier: Some(3.0),
                    torn_down: torn_down.clone(),
                    ..Default::default()
                }),
                [("tag".to_owned(), Value::from(tag))].into_iter().collect(),
            )
        };
        let spec = TestSpec {
            monitors: vec![
                monitor("first", Capabilities::empty()),
                monitor("subprocess-only", Capabilities::SUBPROCESS),
                monitor("second", Capabilities::empty()),
            ]
            .into(),
            ..spec(FixtureClass {
                script: Script {
                    timeout: Some(Duration::from_secs(5)),
                    body_sleep: Some(Duration::from_secs(30)),
                    ..Default::default()
                },
                ..Default::default()
            })
        };
        let record = run(&spec).await;

        // Two multipliers of 3 stretch the timeout to 45s.
        assert_eq!(record.checklist.get("no-timeout"), Some(true));
        assert_eq!(record.monitors.len(), 2);
        assert_eq!(*torn_down.lock().unwrap(), vec!["second", "first"]);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_failure_stops_test() {
        let spec = TestSpec {
            monitors: vec![MonitorSpec::new(
                Arc::new(EnvMonitorClass {
                    fail: true,
                    ..Default::default()
                }),
                ArgumentValues::new(),
            )]
            .into(),
            ..spec(FixtureClass::default())
        };
        let record = run(&spec).await;
        assert_eq!(record.checklist.get("test-started"), None);
        assert!(record.monitors.is_empty());
        assert_eq!(
            record.extra_info["error-message"],
            Value::from("monitor `env` failed: refusing to attach")
        );
    }
}
