// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by gauntlet-runner.

use crate::signal::ShutdownEvent;
use camino::Utf8PathBuf;
use config::ConfigError;
use gauntlet_metadata::{ArgumentTypeError, UndeclaredFieldError};
use gauntlet_store::StoreError;
use std::{error, fmt, io};
use thiserror::Error;

/// An error that occurred while parsing runner configuration.
#[derive(Debug, Error)]
#[error("failed to parse gauntlet config at `{config_file}`")]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),
}

/// Error returned while parsing a [`MaxConcurrency`](crate::config::MaxConcurrency) value.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for max-concurrency: {input}\n(hint: {message})")]
pub struct MaxConcurrencyParseError {
    input: String,
    message: String,
}

impl MaxConcurrencyParseError {
    pub(crate) fn new(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            message: message.into(),
        }
    }
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("failed to listen for {event}")]
pub struct SignalHandlerSetupError {
    event: ShutdownEvent,
    #[source]
    error: io::Error,
}

impl SignalHandlerSetupError {
    pub(crate) fn new(event: ShutdownEvent, error: io::Error) -> Self {
        Self { event, error }
    }

    /// The signal that could not be listened for.
    pub fn event(&self) -> ShutdownEvent {
        self.event
    }
}

/// An error produced while creating the harness context.
#[derive(Debug, Error)]
#[error("failed to create scratch directory for the harness")]
pub struct HarnessContextError(#[from] io::Error);

/// An error produced by an argument generator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GeneratorError {
    /// Reading a file failed.
    #[error("failed to read `{path}`")]
    Read {
        /// The file being read.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// Walking a directory tree failed.
    #[error("failed to walk `{root}`")]
    Walk {
        /// The root of the walk.
        root: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: walkdir::Error,
    },

    /// A path was not valid UTF-8.
    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(std::path::PathBuf),

    /// A glob pattern was invalid.
    #[error("invalid glob pattern")]
    Glob(#[from] globset::Error),

    /// A row had the wrong number of values.
    #[error("generator row {row} has {found} values, expected {expected}")]
    RowWidth {
        /// The index of the row.
        row: usize,

        /// The number of values the generator declares.
        expected: usize,

        /// The number of values found.
        found: usize,
    },

    /// Zipped generators had different lengths.
    #[error("zipped generators have different lengths ({first} and {other})")]
    ZipLength {
        /// The length of the first generator.
        first: usize,

        /// The length of a mismatching generator.
        other: usize,
    },
}

/// An error produced while expanding an [`Arguments`](crate::arguments::Arguments).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArgumentsError {
    /// The same argument name was assigned twice.
    #[error("argument `{0}` is assigned more than once")]
    DuplicateKey(String),

    /// A generator's width did not match the number of keys it assigns.
    #[error("generator for {keys:?} produces {width} values per row")]
    WidthMismatch {
        /// The keys the generator was registered for.
        keys: Vec<String>,

        /// The width the generator declares.
        width: usize,
    },

    /// A generator failed.
    #[error("generator for {keys:?} failed")]
    Generator {
        /// The keys the generator was registered for.
        keys: Vec<String>,

        /// The underlying error.
        #[source]
        error: GeneratorError,
    },
}

/// An error produced while preparing a batch for scheduling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BatchError {
    /// The argument space could not be expanded.
    #[error("failed to expand arguments for `{class}`")]
    Arguments {
        /// The test class of the batch.
        class: &'static str,

        /// The underlying error.
        #[source]
        error: ArgumentsError,
    },

    /// The argument space assigns a name the test class does not accept.
    #[error(transparent)]
    UndeclaredArgument(#[from] UndeclaredFieldError),

    /// A batch was given a monitor schema as its test class, or vice versa.
    #[error("`{name}` is a {found} schema, expected a {expected} schema")]
    WrongSchemaKind {
        /// The class name.
        name: &'static str,

        /// The kind that was expected.
        expected: gauntlet_metadata::SchemaKind,

        /// The kind that was found.
        found: gauntlet_metadata::SchemaKind,
    },
}

/// An error that occurred while building a [`TestRun`](crate::runner::TestRun).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] io::Error),

    /// An error occurred while setting up signals.
    #[error("error setting up signals")]
    SignalHandlerSetup(#[from] SignalHandlerSetupError),

    /// A batch could not be prepared.
    #[error("error preparing batch {index}")]
    Batch {
        /// The index of the batch.
        index: usize,

        /// The underlying error.
        #[source]
        error: BatchError,
    },
}

/// An error that occurred while executing a [`TestRun`](crate::runner::TestRun).
///
/// Failures of individual tests are never reported here: they end up in the
/// test's record.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunExecuteError {
    /// The testrun could not be started in the result sink.
    #[error("failed to record testrun start")]
    Start(#[source] StoreError),

    /// The testrun's stop time could not be recorded.
    #[error("failed to record testrun stop")]
    Stop(#[source] StoreError),
}

/// A failure reported by a test kind, or while driving one.
///
/// Test failures are local to a test instance: they are recorded as the test's
/// `error-message` extra info and stop the test.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestError {
    /// A failure described by the test author.
    #[error("{0}")]
    Message(String),

    /// An argument had the wrong type.
    #[error(transparent)]
    ArgumentType(#[from] ArgumentTypeError),

    /// A required argument was missing.
    #[error("missing argument `{0}`")]
    MissingArgument(String),

    /// The worker process could not be spawned.
    #[error("failed to spawn worker `{program}`")]
    Spawn {
        /// The program that was run.
        program: String,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A worker output redirect could not be opened.
    #[error("failed to open `{path}` for worker output")]
    Redirect {
        /// The redirect target.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A remote call to the worker failed.
    #[error("remote {call} failed: {message}")]
    RemoteCall {
        /// The name of the call.
        call: &'static str,

        /// The error reported by the worker or the bridge.
        message: String,
    },

    /// The private bus could not be used.
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl TestError {
    /// Creates a [`TestError::Message`].
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// A failure reported by a monitor.
#[derive(Debug, Error)]
#[error("monitor `{monitor}` failed: {message}")]
pub struct MonitorError {
    monitor: String,
    message: String,
}

impl MonitorError {
    /// Creates a new monitor error.
    pub fn new(monitor: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            monitor: monitor.into(),
            message: message.into(),
        }
    }
}

/// An error produced by the private bus.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// The bus socket could not be bound.
    #[error("failed to bind bus socket at `{address}`")]
    Bind {
        /// The socket path.
        address: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The bus thread could not be started.
    #[error("failed to start bus thread")]
    Thread(#[source] io::Error),

    /// The bus was shut down.
    #[error("the bus has been shut down")]
    ShutDown,
}

/// An error produced by a worker process.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// A required environment variable was not set.
    #[error("environment variable `{0}` is not set; was this process started by gauntlet?")]
    MissingEnv(&'static str),

    /// An environment variable could not be parsed.
    #[error("invalid value for `{name}`: {message}")]
    InvalidEnv {
        /// The variable name.
        name: &'static str,

        /// Why the value was rejected.
        message: String,
    },

    /// The Tokio runtime could not be created.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] io::Error),

    /// Connecting to the bus failed.
    #[error("failed to connect to bus at `{address}`")]
    Connect {
        /// The socket path.
        address: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// Reading from or writing to the bus failed.
    #[error("bus I/O error")]
    Io(#[from] io::Error),

    /// A message could not be encoded or decoded.
    #[error("malformed bus message")]
    Protocol(#[from] serde_json::Error),
}

/// An error reading a message from the bus.
#[derive(Debug, Error)]
pub(crate) enum ReadMessageError {
    #[error("bus I/O error")]
    Io(#[from] io::Error),

    #[error("malformed bus message")]
    Decode(#[from] serde_json::Error),
}

impl From<ReadMessageError> for WorkerError {
    fn from(error: ReadMessageError) -> Self {
        match error {
            ReadMessageError::Io(error) => Self::Io(error),
            ReadMessageError::Decode(error) => Self::Protocol(error),
        }
    }
}

/// Displays an error followed by its chain of sources, separated by `: `.
pub(crate) struct DisplayErrorChain<E>(pub(crate) E);

impl<E: error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(error) = source {
            write!(f, ": {error}")?;
            source = error.source();
        }
        Ok(())
    }
}
