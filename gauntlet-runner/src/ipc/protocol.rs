// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Messages exchanged over the private bus.
//!
//! Every message is one line of JSON. A worker opens the conversation with
//! [`WorkerMessage::Hello`], naming itself after its test UUID; after that the
//! proxy sends [`ProxyMessage::Call`]s and the worker answers each with a
//! [`WorkerMessage::Reply`] carrying the same serial, interleaved with signals.

use crate::errors::ReadMessageError;
use camino::Utf8PathBuf;
use gauntlet_metadata::{ArgumentValues, Value};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// The environment variable holding the bus socket path.
pub const BUS_ADDRESS_ENV: &str = "GAUNTLET_BUS_ADDRESS";

/// The environment variable holding the test UUID.
pub const TEST_UUID_ENV: &str = "GAUNTLET_TEST_UUID";

/// The environment variable holding the JSON-encoded arguments.
pub const TEST_ARGUMENTS_ENV: &str = "GAUNTLET_TEST_ARGUMENTS";

/// A message sent by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum WorkerMessage {
    /// Claims the bus name of a test.
    Hello { name: String },

    /// Answers the call with the same serial.
    Reply {
        serial: u64,
        result: Result<(), String>,
    },

    /// Asynchronous setup has completed.
    Ready,

    /// The test has stopped on the worker side.
    Stopped,

    /// A check was recorded.
    StepValidated { name: String, passed: bool },

    /// An extra-info value was recorded.
    ExtraInfo { key: String, value: Value },

    /// An output file was registered.
    OutputFile { key: String, path: Utf8PathBuf },

    /// The test asked for more time.
    ExtendTimeout {
        #[serde(with = "humantime_serde")]
        by: Duration,
    },
}

/// A message sent by the proxy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum ProxyMessage {
    /// Invokes a method on the worker.
    Call { serial: u64, call: RemoteCall },
}

/// The methods a proxy can invoke on a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub(crate) enum RemoteCall {
    /// Creates the test instance the worker hosts.
    CreateTestInstance {
        source_location: Option<String>,
        module_name: String,
        class_name: String,
        arguments: ArgumentValues,
    },
    SetUp,
    Test,
    Stop,
    TearDown,
}

impl RemoteCall {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::CreateTestInstance { .. } => "createTestInstance",
            Self::SetUp => "setUp",
            Self::Test => "test",
            Self::Stop => "stop",
            Self::TearDown => "tearDown",
        }
    }
}

/// Writes one message as a line of JSON.
pub(crate) async fn write_message<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Reads one line of JSON. Returns `None` at end of stream.
pub(crate) async fn read_message<R, T>(
    reader: &mut R,
    line: &mut String,
) -> Result<Option<T>, ReadMessageError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    line.clear();
    if reader.read_line(line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}
