// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test kinds and the per-test state machine.
//!
//! A test kind is declared with two traits. A [`TestClass`] is registered once
//! and carries the static [`Schema`], the kind's [`Capabilities`] and its
//! timeouts; [`TestClass::instantiate`] creates a [`TestKind`] for one argument
//! tuple. The runner then drives each instance through
//! `set up → (wait for ready) → run → stop → tear down`, see
//! [`TestKind`] for the details of each phase.
//!
//! Test code reports results through its [`TestContext`]. On the coordinator
//! the context feeds the instance's ledger directly; inside a worker process
//! the same calls are turned into bus signals and replayed by the proxy.

pub(crate) mod driver;
mod ledger;

pub(crate) use ledger::ResultLedger;

use crate::{
    config::WorkerSettings,
    context::{HarnessContext, UuidAllocator, UuidGuard},
    errors::TestError,
};
use bitflags::bitflags;
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::{self, BoxFuture, FutureExt};
use gauntlet_metadata::{ArgumentTypeError, ArgumentValues, Schema, TestRecord, TestUuid, Value};
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};
use tokio::sync::{
    broadcast,
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};

bitflags! {
    /// What a test kind is built on.
    ///
    /// Monitors declare the capabilities they require, and are only attached to
    /// tests that have all of them.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct Capabilities: u32 {
        /// The test body runs in a worker subprocess.
        const SUBPROCESS = 1 << 0;

        /// The test runs child tests.
        const SCENARIO = 1 << 1;
    }
}

/// Whether a test is ready to start as soon as setup returns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetupMode {
    /// The test starts right away.
    Sync,

    /// The test starts once it calls [`TestContext::ready`], which it must do
    /// before the setup timeout elapses.
    Async,
}

/// A registered test kind.
pub trait TestClass: Send + Sync + fmt::Debug {
    /// The static schema of this kind.
    fn schema(&self) -> &'static Schema;

    /// The capabilities of this kind.
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    /// Overrides the run timeout for this kind.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Overrides the asynchronous setup timeout for this kind.
    fn setup_timeout(&self) -> Option<Duration> {
        None
    }

    /// Creates an instance for one argument tuple.
    ///
    /// A failure here is recorded against the instance, which then stops
    /// without starting.
    fn instantiate(&self, arguments: &ArgumentValues) -> Result<Box<dyn TestKind>, TestError>;
}

/// One test instance.
///
/// * [`set_up`](Self::set_up) prepares the test. An error stops the test
///   before it starts.
/// * [`test`](Self::test) is the body. For a synchronous kind, the test stops
///   as soon as the body returns. An [asynchronous](Self::is_async) kind keeps
///   running until it calls [`TestContext::stop`] or times out.
/// * [`tear_down`](Self::tear_down) runs exactly once, however the test
///   stopped.
pub trait TestKind: Send {
    /// Prepares the test.
    fn set_up<'a>(&'a mut self, cx: &'a TestContext) -> BoxFuture<'a, Result<SetupMode, TestError>> {
        let _ = cx;
        future::ready(Ok(SetupMode::Sync)).boxed()
    }

    /// Runs the test body.
    fn test<'a>(&'a mut self, cx: &'a TestContext) -> BoxFuture<'a, Result<(), TestError>>;

    /// Cleans up after the test.
    fn tear_down<'a>(&'a mut self, cx: &'a TestContext) -> BoxFuture<'a, ()> {
        let _ = cx;
        future::ready(()).boxed()
    }

    /// Returns true if the test keeps running after its body returns.
    fn is_async(&self) -> bool {
        false
    }
}

/// The environment a test is run in, as adjusted by monitors.
#[derive(Clone, Debug)]
pub struct TestEnvironment {
    vars: BTreeMap<String, String>,
    stdout: Option<Utf8PathBuf>,
    stderr: Option<Utf8PathBuf>,
    wrapper: Vec<String>,
    timeout_multiplier: f64,
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self {
            vars: BTreeMap::new(),
            stdout: None,
            stderr: None,
            wrapper: Vec::new(),
            timeout_multiplier: 1.0,
        }
    }
}

impl TestEnvironment {
    /// Sets an environment variable for worker processes.
    pub fn set_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// The environment variables set so far.
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Redirects the worker's standard output to `path`.
    pub fn redirect_stdout(&mut self, path: impl Into<Utf8PathBuf>) {
        self.stdout = Some(path.into());
    }

    /// Redirects the worker's standard error to `path`.
    pub fn redirect_stderr(&mut self, path: impl Into<Utf8PathBuf>) {
        self.stderr = Some(path.into());
    }

    /// Where the worker's standard output goes, if redirected.
    pub fn stdout(&self) -> Option<&Utf8Path> {
        self.stdout.as_deref()
    }

    /// Where the worker's standard error goes, if redirected.
    pub fn stderr(&self) -> Option<&Utf8Path> {
        self.stderr.as_deref()
    }

    /// Prepends a wrapper command to the worker command line.
    ///
    /// Wrappers added later run outermost.
    pub fn prepend_wrapper<I, S>(&mut self, command: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut wrapper: Vec<String> = command.into_iter().map(Into::into).collect();
        wrapper.append(&mut self.wrapper);
        self.wrapper = wrapper;
    }

    /// The wrapper command line, outermost first.
    pub fn wrapper(&self) -> &[String] {
        &self.wrapper
    }

    /// Multiplies the test's timeouts by `factor`.
    pub fn multiply_timeouts(&mut self, factor: f64) {
        if factor.is_finite() && factor > 0.0 {
            self.timeout_multiplier *= factor;
        }
    }

    /// The accumulated timeout multiplier.
    pub fn timeout_multiplier(&self) -> f64 {
        self.timeout_multiplier
    }

    /// Applies the multiplier, saturating at [`Duration::MAX`].
    pub(crate) fn scale(&self, timeout: Duration) -> Duration {
        Duration::try_from_secs_f64(timeout.as_secs_f64() * self.timeout_multiplier)
            .unwrap_or(Duration::MAX)
    }
}

/// Options shared by every test a run drives.
#[derive(Debug)]
pub(crate) struct DriverOptions {
    pub(crate) harness: Option<Arc<HarnessContext>>,
    pub(crate) uuids: UuidAllocator,
    pub(crate) test_timeout: Duration,
    pub(crate) setup_timeout: Duration,
    pub(crate) worker: WorkerSettings,
}

/// A message from test code to the instance driving it.
#[derive(Debug)]
pub(crate) enum TestMessage {
    Validate { name: String, passed: bool },
    ExtraInfo { key: String, value: Value },
    OutputFile { key: String, path: Utf8PathBuf },
    Ready,
    Stop { error: Option<String> },
    ExtendTimeout(Duration),
    Subtest { record: TestRecord, guards: Vec<UuidGuard> },
}

/// The handle test code uses to report results and drive its lifecycle.
///
/// Cheap to clone; clones can be moved into spawned tasks.
#[derive(Clone)]
pub struct TestContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    uuid: TestUuid,
    schema: &'static Schema,
    arguments: ArgumentValues,
    environment: TestEnvironment,
    options: Arc<DriverOptions>,
    messages: UnboundedSender<TestMessage>,
    stop_children: broadcast::Sender<()>,
}

impl TestContext {
    pub(crate) fn new(
        uuid: TestUuid,
        schema: &'static Schema,
        arguments: ArgumentValues,
        environment: TestEnvironment,
        options: Arc<DriverOptions>,
    ) -> (Self, UnboundedReceiver<TestMessage>) {
        let (messages, receiver) = unbounded_channel();
        let (stop_children, _) = broadcast::channel(1);
        let cx = Self {
            inner: Arc::new(ContextInner {
                uuid,
                schema,
                arguments,
                environment,
                options,
                messages,
                stop_children,
            }),
        };
        (cx, receiver)
    }

    /// Creates a context for a test instance hosted by a worker process.
    ///
    /// The messages sent through it are forwarded to the proxy.
    pub(crate) fn detached(
        uuid: TestUuid,
        schema: &'static Schema,
        arguments: ArgumentValues,
        worker: WorkerSettings,
    ) -> (Self, UnboundedReceiver<TestMessage>) {
        let options = Arc::new(DriverOptions {
            harness: None,
            uuids: UuidAllocator::new(),
            test_timeout: Duration::MAX,
            setup_timeout: Duration::MAX,
            worker,
        });
        Self::new(uuid, schema, arguments, TestEnvironment::default(), options)
    }

    /// The instance UUID.
    pub fn uuid(&self) -> TestUuid {
        self.inner.uuid
    }

    /// The schema of the test kind.
    pub fn schema(&self) -> &'static Schema {
        self.inner.schema
    }

    /// The resolved arguments of this instance.
    pub fn arguments(&self) -> &ArgumentValues {
        &self.inner.arguments
    }

    /// Looks up an argument.
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.inner.arguments.get(name)
    }

    /// Looks up an integer argument.
    pub fn int_argument(&self, name: &str) -> Result<i64, TestError> {
        let value = self.require(name)?;
        value.as_int().ok_or_else(|| type_error(name, "int", value))
    }

    /// Looks up a text argument.
    pub fn text_argument(&self, name: &str) -> Result<&str, TestError> {
        let value = self.require(name)?;
        value.as_text().ok_or_else(|| type_error(name, "text", value))
    }

    fn require(&self, name: &str) -> Result<&Value, TestError> {
        self.argument(name)
            .ok_or_else(|| TestError::MissingArgument(name.to_owned()))
    }

    /// The environment prepared by the instance's monitors.
    pub fn environment(&self) -> &TestEnvironment {
        &self.inner.environment
    }

    /// The shared harness, when running on the coordinator.
    pub fn harness(&self) -> Option<&Arc<HarnessContext>> {
        self.inner.options.harness.as_ref()
    }

    /// Worker process settings.
    pub fn worker_settings(&self) -> WorkerSettings {
        self.inner.options.worker
    }

    /// Records a check. The first outcome recorded for a name is kept.
    pub fn validate_step(&self, name: impl Into<String>, passed: bool) {
        self.send(TestMessage::Validate {
            name: name.into(),
            passed,
        });
    }

    /// Records an extra-info value.
    pub fn extra_info(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.send(TestMessage::ExtraInfo {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Records an artifact produced by the test.
    pub fn output_file(&self, key: impl Into<String>, path: impl Into<Utf8PathBuf>) {
        self.send(TestMessage::OutputFile {
            key: key.into(),
            path: path.into(),
        });
    }

    /// Signals that an asynchronous setup has completed.
    pub fn ready(&self) {
        self.send(TestMessage::Ready);
    }

    /// Asks for the test to stop. Stopping an already-stopping test does
    /// nothing.
    pub fn stop(&self) {
        self.send(TestMessage::Stop { error: None });
    }

    /// Asks for the test to stop, recording `message` as its error message.
    pub fn stop_with_error(&self, message: impl Into<String>) {
        self.send(TestMessage::Stop {
            error: Some(message.into()),
        });
    }

    /// Pushes the pending deadline back by `by`.
    pub fn extend_timeout(&self, by: Duration) {
        self.send(TestMessage::ExtendTimeout(by));
    }

    pub(crate) fn add_subtest(&self, record: TestRecord, guards: Vec<UuidGuard>) {
        self.send(TestMessage::Subtest { record, guards });
    }

    pub(crate) fn options(&self) -> &Arc<DriverOptions> {
        &self.inner.options
    }

    /// A receiver that fires when this test stops; used by child tests.
    pub(crate) fn subscribe_stop(&self) -> broadcast::Receiver<()> {
        self.inner.stop_children.subscribe()
    }

    pub(crate) fn stop_children(&self) {
        // No receivers means no children are running.
        let _ = self.inner.stop_children.send(());
    }

    fn send(&self, message: TestMessage) {
        // Messages sent after the driver finished are dropped.
        let _ = self.inner.messages.send(message);
    }
}

fn type_error(name: &str, expected: &'static str, found: &Value) -> TestError {
    ArgumentTypeError {
        name: name.to_owned(),
        expected,
        found: found.clone(),
    }
    .into()
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("uuid", &self.inner.uuid)
            .field("schema", &self.inner.schema.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_metadata::BASE_TEST_SCHEMA;
    use pretty_assertions::assert_eq;

    #[test]
    fn scale_saturates() {
        let mut environment = TestEnvironment::default();
        environment.multiply_timeouts(4.0);
        assert_eq!(
            environment.scale(Duration::from_secs(5)),
            Duration::from_secs(20)
        );
        assert_eq!(environment.scale(Duration::MAX), Duration::MAX);
    }

    #[test]
    fn wrappers_nest_outward() {
        let mut environment = TestEnvironment::default();
        environment.prepend_wrapper(["strace", "-f"]);
        environment.prepend_wrapper(["valgrind"]);
        assert_eq!(environment.wrapper(), ["valgrind", "strace", "-f"]);
    }

    #[test]
    fn timeout_multipliers_compound() {
        let mut environment = TestEnvironment::default();
        environment.multiply_timeouts(2.0);
        environment.multiply_timeouts(1.5);
        environment.multiply_timeouts(-1.0);
        assert_eq!(environment.timeout_multiplier(), 3.0);
        assert_eq!(
            environment.scale(Duration::from_secs(10)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn typed_arguments() {
        let arguments = [
            ("n".to_owned(), Value::from(3)),
            ("uri".to_owned(), Value::from("file:///a.ogg")),
        ]
        .into_iter()
        .collect();
        let (cx, _rx) = TestContext::detached(
            TestUuid::new_v4(),
            &BASE_TEST_SCHEMA,
            arguments,
            WorkerSettings::default(),
        );
        assert_eq!(cx.int_argument("n").unwrap(), 3);
        assert_eq!(cx.text_argument("uri").unwrap(), "file:///a.ogg");
        assert!(matches!(
            cx.text_argument("n"),
            Err(TestError::ArgumentType(_))
        ));
        assert!(matches!(
            cx.int_argument("missing"),
            Err(TestError::MissingArgument(name)) if name == "missing"
        ));
    }

    #[test]
    fn messages_arrive_in_order() {
        let (cx, mut rx) = TestContext::detached(
            TestUuid::new_v4(),
            &BASE_TEST_SCHEMA,
            ArgumentValues::new(),
            WorkerSettings::default(),
        );
        cx.validate_step("a", true);
        cx.extra_info("k", 1);
        cx.stop();

        assert!(matches!(rx.try_recv(), Ok(TestMessage::Validate { name, passed: true }) if name == "a"));
        assert!(matches!(rx.try_recv(), Ok(TestMessage::ExtraInfo { key, .. }) if key == "k"));
        assert!(matches!(rx.try_recv(), Ok(TestMessage::Stop { error: None })));
    }
}
