// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker half of a remote test.
//!
//! A worker launcher is a small binary that registers the test classes it can
//! host in a [`WorkerRegistry`] and calls [`run_worker`]. The worker connects
//! to the bus named in its environment, creates the instance the proxy asks
//! for, and runs the proxy's calls against it. Everything the instance reports
//! through its [`TestContext`] is sent back to the proxy as a signal.

use super::protocol::{
    BUS_ADDRESS_ENV, ProxyMessage, RemoteCall, TEST_ARGUMENTS_ENV, TEST_UUID_ENV,
    WorkerMessage, read_message, write_message,
};
use crate::{
    config::WorkerSettings,
    errors::{DisplayErrorChain, WorkerError},
    test::{SetupMode, TestClass, TestContext, TestKind, TestMessage},
};
use camino::Utf8PathBuf;
use futures::future::BoxFuture;
use gauntlet_metadata::{ArgumentValues, TestUuid, Value, worker_bus_name};
use std::{
    collections::{HashMap, VecDeque},
    env::{self, VarError},
    fmt,
    sync::Arc,
};
use tokio::{
    io::BufReader,
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};
use tracing::{debug, warn};

/// The test classes a worker launcher can host, by module and class name.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    classes: HashMap<(String, String), Arc<dyn TestClass>>,
}

impl WorkerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `class` under `module` and `name`, replacing any previous
    /// registration.
    pub fn register(
        &mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        class: Arc<dyn TestClass>,
    ) -> &mut Self {
        self.classes.insert((module.into(), name.into()), class);
        self
    }

    fn get(&self, module: &str, name: &str) -> Option<&Arc<dyn TestClass>> {
        self.classes.get(&(module.to_owned(), name.to_owned()))
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self
            .classes
            .keys()
            .map(|(module, name)| format!("{module}.{name}"))
            .collect();
        names.sort_unstable();
        f.debug_struct("WorkerRegistry")
            .field("classes", &names)
            .finish()
    }
}

/// Runs a worker from the environment set up by the proxy.
///
/// Returns once the proxy has torn the test down or closed the connection.
pub fn run_worker(registry: &WorkerRegistry) -> Result<(), WorkerError> {
    let address = Utf8PathBuf::from(env_var(BUS_ADDRESS_ENV)?);
    let uuid: TestUuid = env_var(TEST_UUID_ENV)?
        .parse()
        .map_err(|error| WorkerError::InvalidEnv {
            name: TEST_UUID_ENV,
            message: format!("{error}"),
        })?;
    let arguments: ArgumentValues = serde_json::from_str(&env_var(TEST_ARGUMENTS_ENV)?)
        .map_err(|error| WorkerError::InvalidEnv {
            name: TEST_ARGUMENTS_ENV,
            message: error.to_string(),
        })?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(WorkerError::TokioRuntimeCreate)?;
    let result = runtime.block_on(serve(registry, address, uuid, arguments));
    // Spawned test tasks may still be running; don't wait for them.
    runtime.shutdown_background();
    result
}

fn env_var(name: &'static str) -> Result<String, WorkerError> {
    env::var(name).map_err(|error| match error {
        VarError::NotPresent => WorkerError::MissingEnv(name),
        VarError::NotUnicode(_) => WorkerError::InvalidEnv {
            name,
            message: "not valid UTF-8".to_owned(),
        },
    })
}

async fn serve(
    registry: &WorkerRegistry,
    address: Utf8PathBuf,
    uuid: TestUuid,
    arguments: ArgumentValues,
) -> Result<(), WorkerError> {
    let stream = UnixStream::connect(&address)
        .await
        .map_err(|error| WorkerError::Connect {
            address: address.clone(),
            error,
        })?;
    let (read, write) = stream.into_split();
    let (calls_tx, calls) = unbounded_channel();
    let reader = tokio::spawn(read_calls(read, calls_tx));

    let mut conversation = Conversation {
        writer: write,
        calls,
        backlog: VecDeque::new(),
    };
    conversation
        .send(&WorkerMessage::Hello {
            name: worker_bus_name(uuid),
        })
        .await?;
    debug!(test_uuid = %uuid, %address, "worker connected");

    let result = run_calls(registry, &mut conversation, uuid, &arguments).await;
    reader.abort();
    result
}

/// Reads calls off the connection until it closes.
async fn read_calls(read: OwnedReadHalf, calls: UnboundedSender<(u64, RemoteCall)>) {
    let mut reader = BufReader::new(read);
    let mut line = String::new();
    loop {
        match read_message::<_, ProxyMessage>(&mut reader, &mut line).await {
            Ok(Some(ProxyMessage::Call { serial, call })) => {
                if calls.send((serial, call)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!("proxy closed the connection");
                return;
            }
            Err(error) => {
                warn!("failed to read from proxy: {}", DisplayErrorChain(&error));
                return;
            }
        }
    }
}

struct Instance {
    kind: Box<dyn TestKind>,
    cx: TestContext,
    messages: UnboundedReceiver<TestMessage>,
}

async fn run_calls(
    registry: &WorkerRegistry,
    conversation: &mut Conversation,
    uuid: TestUuid,
    expected_arguments: &ArgumentValues,
) -> Result<(), WorkerError> {
    let mut instance: Option<Instance> = None;

    while let Some((serial, call)) = conversation
        .next_call(instance.as_mut().map(|instance| &mut instance.messages))
        .await?
    {
        let name = call.name();
        debug!(test_uuid = %uuid, call = name, serial, "handling call");

        if let RemoteCall::CreateTestInstance {
            source_location,
            module_name,
            class_name,
            arguments,
        } = call
        {
            let result = if instance.is_some() {
                Err("a test instance already exists".to_owned())
            } else {
                create_instance(
                    registry,
                    uuid,
                    expected_arguments,
                    source_location.as_deref(),
                    &module_name,
                    &class_name,
                    arguments,
                )
                .map(|created| instance = Some(created))
            };
            conversation.reply(serial, result).await?;
            continue;
        }

        let Some(instance) = &mut instance else {
            conversation
                .reply(serial, Err(format!("{name} called before createTestInstance")))
                .await?;
            if let RemoteCall::TearDown = call {
                return Ok(());
            }
            continue;
        };
        let Instance { kind, cx, messages } = instance;

        match call {
            RemoteCall::CreateTestInstance { .. } => {}
            RemoteCall::SetUp => match conversation.drive(kind.set_up(cx), messages).await? {
                Some(Ok(SetupMode::Sync)) => {
                    conversation.reply(serial, Ok(())).await?;
                    conversation.send(&WorkerMessage::Ready).await?;
                }
                Some(Ok(SetupMode::Async)) => conversation.reply(serial, Ok(())).await?,
                Some(Err(error)) => {
                    conversation
                        .reply(serial, Err(DisplayErrorChain(&error).to_string()))
                        .await?;
                }
                None => {
                    conversation
                        .reply(serial, Err("interrupted by stop".to_owned()))
                        .await?;
                }
            },
            RemoteCall::Test => match conversation.drive(kind.test(cx), messages).await? {
                Some(Ok(())) => {
                    conversation.reply(serial, Ok(())).await?;
                    if !kind.is_async() {
                        conversation.send(&WorkerMessage::Stopped).await?;
                    }
                }
                Some(Err(error)) => {
                    conversation
                        .reply(serial, Err(DisplayErrorChain(&error).to_string()))
                        .await?;
                }
                None => {
                    conversation
                        .reply(serial, Err("interrupted by stop".to_owned()))
                        .await?;
                }
            },
            RemoteCall::Stop => {
                cx.stop_children();
                conversation.reply(serial, Ok(())).await?;
            }
            RemoteCall::TearDown => {
                conversation.drive(kind.tear_down(cx), messages).await?;
                conversation.reply(serial, Ok(())).await?;
                debug!(test_uuid = %uuid, "torn down, exiting");
                return Ok(());
            }
        }
    }
    Ok(())
}

fn create_instance(
    registry: &WorkerRegistry,
    uuid: TestUuid,
    expected_arguments: &ArgumentValues,
    source_location: Option<&str>,
    module_name: &str,
    class_name: &str,
    arguments: ArgumentValues,
) -> Result<Instance, String> {
    // The proxy sends the arguments twice; the copies must agree.
    if &arguments != expected_arguments {
        return Err(format!(
            "arguments do not match `{TEST_ARGUMENTS_ENV}` from the environment"
        ));
    }
    let class = registry.get(module_name, class_name).ok_or_else(|| {
        format!("no test class `{class_name}` registered in module `{module_name}`")
    })?;
    debug!(
        test_uuid = %uuid,
        module_name,
        class_name,
        source_location,
        "creating test instance",
    );
    let kind = class
        .instantiate(&arguments)
        .map_err(|error| DisplayErrorChain(&error).to_string())?;
    let (cx, messages) =
        TestContext::detached(uuid, class.schema(), arguments, WorkerSettings::default());
    Ok(Instance { kind, cx, messages })
}

struct Conversation {
    writer: OwnedWriteHalf,
    calls: UnboundedReceiver<(u64, RemoteCall)>,
    /// Calls received while a phase was running, in arrival order.
    backlog: VecDeque<(u64, RemoteCall)>,
}

impl Conversation {
    async fn send(&mut self, message: &WorkerMessage) -> Result<(), WorkerError> {
        write_message(&mut self.writer, message).await?;
        Ok(())
    }

    async fn reply(&mut self, serial: u64, result: Result<(), String>) -> Result<(), WorkerError> {
        self.send(&WorkerMessage::Reply { serial, result }).await
    }

    /// Waits for the next call, forwarding the instance's messages meanwhile.
    /// Returns `None` once the proxy has closed the connection.
    async fn next_call(
        &mut self,
        mut messages: Option<&mut UnboundedReceiver<TestMessage>>,
    ) -> Result<Option<(u64, RemoteCall)>, WorkerError> {
        if let Some(call) = self.backlog.pop_front() {
            return Ok(Some(call));
        }
        loop {
            tokio::select! {
                call = self.calls.recv() => return Ok(call),
                Some(message) = recv_message(messages.as_deref_mut()) => {
                    self.forward(message).await?;
                }
            }
        }
    }

    /// Runs one phase of the instance, forwarding its messages.
    ///
    /// A `stop` call interrupts the phase; it is then handled like any other
    /// call. Returns `None` if the phase was interrupted.
    async fn drive<T>(
        &mut self,
        mut phase: BoxFuture<'_, T>,
        messages: &mut UnboundedReceiver<TestMessage>,
    ) -> Result<Option<T>, WorkerError> {
        loop {
            tokio::select! {
                output = &mut phase => {
                    // Forward what the phase reported before it returned.
                    while let Ok(message) = messages.try_recv() {
                        self.forward(message).await?;
                    }
                    return Ok(Some(output));
                }
                Some(message) = messages.recv() => self.forward(message).await?,
                call = self.calls.recv() => match call {
                    Some((serial, RemoteCall::Stop)) => {
                        self.backlog.push_back((serial, RemoteCall::Stop));
                        return Ok(None);
                    }
                    Some(call) => self.backlog.push_back(call),
                    None => return Ok(None),
                },
            }
        }
    }

    async fn forward(&mut self, message: TestMessage) -> Result<(), WorkerError> {
        match message {
            TestMessage::Validate { name, passed } => {
                self.send(&WorkerMessage::StepValidated { name, passed }).await
            }
            TestMessage::ExtraInfo { key, value } => {
                self.send(&WorkerMessage::ExtraInfo { key, value }).await
            }
            TestMessage::OutputFile { key, path } => {
                self.send(&WorkerMessage::OutputFile { key, path }).await
            }
            TestMessage::Ready => self.send(&WorkerMessage::Ready).await,
            TestMessage::Stop { error } => {
                if let Some(message) = error {
                    self.send(&WorkerMessage::ExtraInfo {
                        key: "error-message".to_owned(),
                        value: Value::Text(message),
                    })
                    .await?;
                }
                self.send(&WorkerMessage::Stopped).await
            }
            TestMessage::ExtendTimeout(by) => {
                self.send(&WorkerMessage::ExtendTimeout { by }).await
            }
            TestMessage::Subtest { record, .. } => {
                warn!(
                    child_uuid = %record.uuid,
                    "child tests cannot run inside a worker, dropping",
                );
                Ok(())
            }
        }
    }
}

async fn recv_message(
    messages: Option<&mut UnboundedReceiver<TestMessage>>,
) -> Option<TestMessage> {
    match messages {
        Some(messages) => messages.recv().await,
        None => std::future::pending().await,
    }
}
