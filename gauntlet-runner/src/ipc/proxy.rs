// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The coordinator half of a remote test.
//!
//! A [`RemoteTestClass`] runs its test body in a worker subprocess. The proxy
//! spawns the worker, waits for it to attach to the private bus, asks it to
//! create the real test instance and set it up, and from then on replays the
//! worker's signals into the local [`TestContext`]. The bus conversation is
//! owned by a bridge task; the [`TestKind`] methods only send it commands.

use super::{
    bus::{BusEvent, BusWatch, WorkerLink},
    protocol::{
        BUS_ADDRESS_ENV, ProxyMessage, RemoteCall, TEST_ARGUMENTS_ENV, TEST_UUID_ENV,
        WorkerMessage,
    },
    unix,
};
use crate::{
    config::WorkerSettings,
    errors::TestError,
    test::{Capabilities, SetupMode, TestClass, TestContext, TestKind},
};
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::{BoxFuture, FutureExt};
use gauntlet_metadata::{ArgumentValues, BASE_TEST_SCHEMA, Schema, SchemaKind, field};
use std::{
    collections::HashMap,
    fs::File,
    io,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{
    process::{Child, Command},
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, warn};

/// The base schema of every remote test.
pub static PROXY_TEST_SCHEMA: Schema = Schema::new(
    SchemaKind::Test,
    "remote-test",
    "A test whose body runs in a worker subprocess",
)
.with_base(&BASE_TEST_SCHEMA)
.with_checklist(&[
    field("dbus-process-spawned", "The worker process was spawned"),
    field("dbus-process-connected", "The worker attached to the bus"),
    field("remote-instance-created", "The worker created the test instance"),
    field("subprocess-exited-normally", "The worker exited with code 0"),
])
.with_extra_info(&[field("subprocess-return-code", "The worker's exit code")]);

/// A test kind whose body runs in a worker subprocess.
///
/// The worker is started as `program args...` (behind any wrappers monitors
/// prepend) and looks up the test it hosts by module and class name.
#[derive(Clone, Debug)]
pub struct RemoteTestClass {
    schema: &'static Schema,
    program: Utf8PathBuf,
    args: Vec<String>,
    source_location: Option<String>,
    module: String,
    class: String,
    timeout: Option<Duration>,
    setup_timeout: Option<Duration>,
}

impl RemoteTestClass {
    /// Creates a remote test class.
    ///
    /// `schema` must derive from [`PROXY_TEST_SCHEMA`]; instances of a class
    /// with any other schema fail to instantiate.
    pub fn new(
        schema: &'static Schema,
        program: impl Into<Utf8PathBuf>,
        module: impl Into<String>,
        class: impl Into<String>,
    ) -> Self {
        Self {
            schema,
            program: program.into(),
            args: Vec::new(),
            source_location: None,
            module: module.into(),
            class: class.into(),
            timeout: None,
            setup_timeout: None,
        }
    }

    /// Passes extra arguments to the worker program.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Tells the worker where to load the test class from.
    pub fn with_source_location(mut self, location: impl Into<String>) -> Self {
        self.source_location = Some(location.into());
        self
    }

    /// Overrides the run timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the setup timeout, which covers spawning the worker and
    /// waiting for it to become ready.
    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = Some(timeout);
        self
    }

    fn command(&self, cx: &TestContext, bus_address: &Utf8Path) -> Result<Command, TestError> {
        let environment = cx.environment();
        let mut argv = environment
            .wrapper()
            .iter()
            .map(String::as_str)
            .chain([self.program.as_str()])
            .chain(self.args.iter().map(String::as_str));
        // The chain always yields the program.
        let program = argv.next().unwrap_or(self.program.as_str());

        let mut command = Command::new(program);
        command
            .args(argv)
            .envs(environment.vars())
            .env(BUS_ADDRESS_ENV, bus_address)
            .env(TEST_UUID_ENV, cx.uuid().to_string())
            .env(
                TEST_ARGUMENTS_ENV,
                serde_json::to_string(cx.arguments()).map_err(|error| {
                    TestError::msg(format!("failed to encode test arguments: {error}"))
                })?,
            )
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(path) = environment.stdout() {
            command.stdout(open_redirect(path)?);
        }
        if let Some(path) = environment.stderr() {
            command.stderr(open_redirect(path)?);
        }
        unix::set_process_group(&mut command);
        Ok(command)
    }
}

fn open_redirect(path: &Utf8Path) -> Result<File, TestError> {
    File::create(path).map_err(|error| TestError::Redirect {
        path: path.to_owned(),
        error,
    })
}

impl TestClass for RemoteTestClass {
    fn schema(&self) -> &'static Schema {
        self.schema
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SUBPROCESS
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn setup_timeout(&self) -> Option<Duration> {
        self.setup_timeout
    }

    fn instantiate(&self, _: &ArgumentValues) -> Result<Box<dyn TestKind>, TestError> {
        if !self.schema.is_a(&PROXY_TEST_SCHEMA) {
            return Err(TestError::msg(format!(
                "schema `{}` does not derive from `{}`",
                self.schema.name(),
                PROXY_TEST_SCHEMA.name(),
            )));
        }
        Ok(Box::new(ProxyTest {
            class: self.clone(),
            bridge: None,
        }))
    }
}

struct ProxyTest {
    class: RemoteTestClass,
    bridge: Option<BridgeHandle>,
}

struct BridgeHandle {
    commands: UnboundedSender<BridgeCommand>,
    task: JoinHandle<()>,
}

impl TestKind for ProxyTest {
    fn set_up<'a>(&'a mut self, cx: &'a TestContext) -> BoxFuture<'a, Result<SetupMode, TestError>> {
        async move {
            let harness = cx
                .harness()
                .ok_or_else(|| TestError::msg("remote tests need a harness context"))?;
            let bus = harness.bus()?;
            // Watch before spawning, so an early attach is not missed.
            let watch = bus.watch(cx.uuid())?;

            let mut command = self.class.command(cx, bus.address())?;
            let child = command.spawn().map_err(|error| TestError::Spawn {
                program: self.class.program.to_string(),
                error,
            })?;
            debug!(
                test_uuid = %cx.uuid(),
                pid = child.id(),
                program = %self.class.program,
                "spawned worker",
            );
            cx.validate_step("dbus-process-spawned", true);

            let (commands, commands_rx) = unbounded_channel();
            let bridge = Bridge {
                cx: cx.clone(),
                settings: cx.worker_settings(),
                child,
                exit_code: None,
                watch,
                commands: commands_rx,
                link: None,
                attached: false,
                finished: false,
                next_serial: 0,
                pending: HashMap::new(),
                create: Some(RemoteCall::CreateTestInstance {
                    source_location: self.class.source_location.clone(),
                    module_name: self.class.module.clone(),
                    class_name: self.class.class.clone(),
                    arguments: cx.arguments().clone(),
                }),
            };
            self.bridge = Some(BridgeHandle {
                commands,
                task: tokio::spawn(bridge.run()),
            });
            Ok(SetupMode::Async)
        }
        .boxed()
    }

    fn test<'a>(&'a mut self, _: &'a TestContext) -> BoxFuture<'a, Result<(), TestError>> {
        async move {
            let Some(bridge) = &self.bridge else {
                return Err(TestError::msg("worker bridge is not running"));
            };
            let (reply, reply_rx) = oneshot::channel();
            bridge
                .commands
                .send(BridgeCommand::Test(reply))
                .map_err(|_| TestError::msg("worker bridge is not running"))?;
            reply_rx.await.map_err(|_| TestError::RemoteCall {
                call: "test",
                message: "worker bridge exited".to_owned(),
            })?
        }
        .boxed()
    }

    fn tear_down<'a>(&'a mut self, cx: &'a TestContext) -> BoxFuture<'a, ()> {
        async move {
            let Some(bridge) = self.bridge.take() else {
                return;
            };
            let (reply, reply_rx) = oneshot::channel();
            let exit_code = if bridge.commands.send(BridgeCommand::Shutdown(reply)).is_ok() {
                reply_rx.await.ok().flatten()
            } else {
                None
            };
            if let Err(error) = bridge.task.await {
                warn!(test_uuid = %cx.uuid(), %error, "worker bridge failed");
            }

            match exit_code {
                Some(code) => {
                    cx.extra_info("subprocess-return-code", i64::from(code));
                    if code == 0 {
                        cx.validate_step("subprocess-exited-normally", true);
                    }
                }
                None => warn!(test_uuid = %cx.uuid(), "worker exit code is unknown"),
            }
        }
        .boxed()
    }

    fn is_async(&self) -> bool {
        true
    }
}

enum BridgeCommand {
    /// Runs the remote test body, replying once the worker has.
    Test(oneshot::Sender<Result<(), TestError>>),

    /// Winds the worker down and reaps it, replying with its exit code.
    Shutdown(oneshot::Sender<Option<i32>>),
}

/// A call awaiting its reply.
enum PendingCall {
    Create,
    SetUp,
    Test(oneshot::Sender<Result<(), TestError>>),
}

struct Bridge {
    cx: TestContext,
    settings: WorkerSettings,
    child: Child,
    exit_code: Option<i32>,
    watch: BusWatch,
    commands: UnboundedReceiver<BridgeCommand>,
    link: Option<WorkerLink>,
    attached: bool,
    finished: bool,
    next_serial: u64,
    pending: HashMap<u64, PendingCall>,
    create: Option<RemoteCall>,
}

impl Bridge {
    async fn run(mut self) {
        let attach_deadline = tokio::time::sleep(self.settings.attach_timeout());
        tokio::pin!(attach_deadline);
        let mut bus_open = true;

        loop {
            tokio::select! {
                status = self.child.wait(), if self.exit_code.is_none() => {
                    self.child_exited(status);
                }
                () = &mut attach_deadline, if !self.attached && !self.finished => {
                    self.finished = true;
                    self.cx.stop_with_error(format!(
                        "worker did not attach to the bus within {:?}",
                        self.settings.attach_timeout(),
                    ));
                }
                event = self.watch.recv(), if bus_open => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        bus_open = false;
                        self.lost_worker("the bus shut down");
                    }
                },
                command = self.commands.recv() => match command {
                    Some(BridgeCommand::Test(reply)) => {
                        self.call(RemoteCall::Test, PendingCall::Test(reply));
                    }
                    Some(BridgeCommand::Shutdown(reply)) => {
                        let exit_code = self.shut_down().await;
                        let _ = reply.send(exit_code);
                        return;
                    }
                    None => {
                        self.shut_down().await;
                        return;
                    }
                },
            }
        }
    }

    fn child_exited(&mut self, status: io::Result<ExitStatus>) {
        let code = match status {
            Ok(status) => unix::exit_code(status),
            Err(error) => {
                warn!(test_uuid = %self.cx.uuid(), %error, "failed to wait for worker");
                i32::MIN
            }
        };
        debug!(test_uuid = %self.cx.uuid(), code, "worker exited");
        self.exit_code = Some(code);
        // After attaching, the closed connection reports the loss instead.
        if !self.attached && !self.finished {
            self.finished = true;
            self.cx.stop_with_error(format!(
                "worker exited with code {code} before attaching to the bus"
            ));
        }
    }

    fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Attached(link) => {
                if self.attached {
                    warn!(test_uuid = %self.cx.uuid(), "worker attached twice, ignoring");
                    return;
                }
                debug!(test_uuid = %self.cx.uuid(), "worker attached");
                self.attached = true;
                self.link = Some(link);
                self.cx.validate_step("dbus-process-connected", true);
                if let Some(create) = self.create.take() {
                    self.call(create, PendingCall::Create);
                }
            }
            BusEvent::Message(message) => self.handle_message(message),
            BusEvent::Detached => self.lost_worker("worker left the bus before the test finished"),
        }
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Hello { .. } => {
                warn!(test_uuid = %self.cx.uuid(), "unexpected hello from worker");
            }
            WorkerMessage::Reply { serial, result } => self.handle_reply(serial, result),
            WorkerMessage::Ready => {
                // The remote side needs time to wind down once stopped.
                self.cx.extend_timeout(self.settings.reap_grace_period());
                self.cx.ready();
            }
            WorkerMessage::Stopped => {
                self.finished = true;
                self.cx.stop();
            }
            WorkerMessage::StepValidated { name, passed } => self.cx.validate_step(name, passed),
            WorkerMessage::ExtraInfo { key, value } => self.cx.extra_info(key, value),
            WorkerMessage::OutputFile { key, path } => self.cx.output_file(key, path),
            WorkerMessage::ExtendTimeout { by } => self.cx.extend_timeout(by),
        }
    }

    fn handle_reply(&mut self, serial: u64, result: Result<(), String>) {
        let Some(pending) = self.pending.remove(&serial) else {
            warn!(test_uuid = %self.cx.uuid(), serial, "reply to unknown call");
            return;
        };
        match (pending, result) {
            (PendingCall::Create, Ok(())) => {
                self.cx.validate_step("remote-instance-created", true);
                self.call(RemoteCall::SetUp, PendingCall::SetUp);
            }
            (PendingCall::SetUp, Ok(())) => {
                debug!(test_uuid = %self.cx.uuid(), "remote setup returned");
            }
            (PendingCall::Test(reply), result) => {
                let _ = reply.send(result.map_err(|message| TestError::RemoteCall {
                    call: "test",
                    message,
                }));
            }
            (pending @ (PendingCall::Create | PendingCall::SetUp), Err(message)) => {
                self.fail(pending, message);
            }
        }
    }

    fn call(&mut self, call: RemoteCall, pending: PendingCall) {
        let serial = self.next_serial;
        self.next_serial += 1;
        let sent = self
            .link
            .as_ref()
            .is_some_and(|link| link.send(ProxyMessage::Call { serial, call }));
        if sent {
            self.pending.insert(serial, pending);
        } else {
            self.fail(pending, "worker is not connected".to_owned());
        }
    }

    /// Fails a call. Every call made outside shutdown is fatal to the test.
    fn fail(&mut self, pending: PendingCall, message: String) {
        let call = match pending {
            PendingCall::Create => "createTestInstance",
            PendingCall::SetUp => "setUp",
            PendingCall::Test(reply) => {
                let _ = reply.send(Err(TestError::RemoteCall {
                    call: "test",
                    message,
                }));
                return;
            }
        };
        self.cx
            .stop_with_error(TestError::RemoteCall { call, message }.to_string());
    }

    fn lost_worker(&mut self, reason: &str) {
        self.link = None;
        for (_, pending) in std::mem::take(&mut self.pending) {
            self.fail(pending, reason.to_owned());
        }
        if !self.finished {
            self.finished = true;
            self.cx.stop_with_error(reason);
        }
    }

    /// Asks the worker to stop and tear down, then reaps it.
    ///
    /// Failures of the cleanup calls are logged and otherwise ignored.
    async fn shut_down(&mut self) -> Option<i32> {
        self.finished = true;
        // Replies to calls made before the shutdown no longer matter.
        self.pending.clear();
        for call in [RemoteCall::Stop, RemoteCall::TearDown] {
            if !self.cleanup_call(call).await {
                break;
            }
        }
        // Dropping the link closes the connection.
        self.link = None;

        if let Some(code) = self.exit_code {
            return Some(code);
        }
        match unix::reap(
            &mut self.child,
            self.settings.reap_grace_period(),
            self.settings.term_grace_period(),
        )
        .await
        {
            Ok(code) => {
                debug!(test_uuid = %self.cx.uuid(), code, "reaped worker");
                Some(code)
            }
            Err(error) => {
                warn!(test_uuid = %self.cx.uuid(), %error, "failed to reap worker");
                None
            }
        }
    }

    /// Makes a best-effort call. Returns false once the worker is gone.
    async fn cleanup_call(&mut self, call: RemoteCall) -> bool {
        let name = call.name();
        let serial = self.next_serial;
        self.next_serial += 1;
        let sent = self
            .link
            .as_ref()
            .is_some_and(|link| link.send(ProxyMessage::Call { serial, call }));
        if !sent {
            debug!(test_uuid = %self.cx.uuid(), call = name, "worker is not connected");
            return false;
        }

        let grace_period = self.settings.reap_grace_period();
        let Self { cx, watch, .. } = self;
        let reply = async {
            loop {
                match watch.recv().await {
                    Some(BusEvent::Message(WorkerMessage::Reply { serial: s, result }))
                        if s == serial =>
                    {
                        return Some(result);
                    }
                    // Results reported while winding down still count.
                    Some(BusEvent::Message(WorkerMessage::StepValidated { name, passed })) => {
                        cx.validate_step(name, passed);
                    }
                    Some(BusEvent::Message(WorkerMessage::ExtraInfo { key, value })) => {
                        cx.extra_info(key, value);
                    }
                    Some(BusEvent::Message(WorkerMessage::OutputFile { key, path })) => {
                        cx.output_file(key, path);
                    }
                    Some(BusEvent::Message(_) | BusEvent::Attached(_)) => {}
                    Some(BusEvent::Detached) | None => return None,
                }
            }
        };

        match tokio::time::timeout(grace_period, reply).await {
            Ok(Some(Ok(()))) => true,
            Ok(Some(Err(message))) => {
                warn!(test_uuid = %self.cx.uuid(), call = name, message, "remote call failed");
                true
            }
            Ok(None) => {
                debug!(test_uuid = %self.cx.uuid(), call = name, "worker left during shutdown");
                false
            }
            Err(_) => {
                warn!(test_uuid = %self.cx.uuid(), call = name, "remote call timed out");
                true
            }
        }
    }
}
