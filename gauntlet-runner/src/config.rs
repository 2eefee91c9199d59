// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runner configuration.
//!
//! Configuration is layered: the embedded [`RunnerConfig::DEFAULT_CONFIG`]
//! comes first and an optional user file overrides it key by key. Builder
//! settings on [`TestRunBuilder`](crate::runner::TestRunBuilder) win over both.

use crate::errors::{ConfigParseError, ConfigParseErrorKind, MaxConcurrencyParseError};
use camino::{Utf8Path, Utf8PathBuf};
use config::{
    Config, ConfigError, File, FileFormat,
    builder::{ConfigBuilder, DefaultState},
};
use gauntlet_metadata::TestRecord;
use gauntlet_store::{
    ClientInfo, DeferredStore, Environment, ResultSink, Store, StoreError, TestRunId,
};
use serde::Deserialize;
use std::{cmp::Ordering, collections::BTreeSet, fmt, str::FromStr, sync::LazyLock, time::Duration};
use tracing::warn;

/// Gets the number of available CPUs and caches the value.
#[inline]
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Overall runner configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunnerConfig {
    run: RunSettings,
    worker: WorkerSettings,
    store: StoreSettings,
}

impl RunnerConfig {
    /// The default configuration, embedded at build time.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// Loads the default configuration, overridden by `config_file` if given.
    ///
    /// Unknown keys are reported as warnings.
    pub fn load(config_file: Option<&Utf8Path>) -> Result<Self, ConfigParseError> {
        let mut builder = Self::make_default_config();
        if let Some(path) = config_file {
            builder = builder.add_source(File::new(path.as_str(), FileFormat::Toml));
        }
        let display_path = config_file.map_or_else(
            || Utf8PathBuf::from("<default config>"),
            Utf8Path::to_path_buf,
        );

        let (config, ignored) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(display_path.clone(), kind))?;
        if !ignored.is_empty() {
            warn!(
                "ignoring unknown configuration keys in {display_path}: {}",
                ignored.into_iter().collect::<Vec<_>>().join(", ")
            );
        }
        Ok(config)
    }

    /// Parses `contents` as a user config layered over the defaults.
    ///
    /// Returns the config and the set of unknown keys.
    pub fn parse_str(contents: &str) -> Result<(Self, BTreeSet<String>), ConfigParseError> {
        let builder =
            Self::make_default_config().add_source(File::from_str(contents, FileFormat::Toml));
        Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new("<string>", kind))
    }

    /// Settings for test execution.
    pub fn run(&self) -> &RunSettings {
        &self.run
    }

    /// Settings for worker processes.
    pub fn worker(&self) -> &WorkerSettings {
        &self.worker
    }

    /// Settings for the result store.
    pub fn store(&self) -> &StoreSettings {
        &self.store
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(Self, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: RunnerConfig = serde_path_to_error::deserialize(ignored_de).map_err(|error| {
            // serde_path_to_error already reports the key, so drop it from the
            // config error.
            let path = error.path().clone();
            let error = match error.into_inner() {
                ConfigError::At { error, .. } => *error,
                other => other,
            };
            ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                path, error,
            )))
        })?;

        Ok((config, ignored))
    }
}

/// The `[run]` table.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunSettings {
    max_concurrency: MaxConcurrency,
    #[serde(with = "humantime_serde")]
    test_timeout: Duration,
    #[serde(with = "humantime_serde")]
    setup_timeout: Duration,
}

impl RunSettings {
    /// How many tests may run at the same time.
    pub fn max_concurrency(&self) -> MaxConcurrency {
        self.max_concurrency
    }

    /// How long a started test may run.
    pub fn test_timeout(&self) -> Duration {
        self.test_timeout
    }

    /// How long an asynchronous setup may take.
    pub fn setup_timeout(&self) -> Duration {
        self.setup_timeout
    }
}

/// The `[worker]` table.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerSettings {
    #[serde(with = "humantime_serde")]
    attach_timeout: Duration,
    #[serde(with = "humantime_serde")]
    reap_grace_period: Duration,
    #[serde(with = "humantime_serde")]
    term_grace_period: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(20),
            Duration::from_secs(3),
            Duration::from_secs(2),
        )
    }
}

impl WorkerSettings {
    /// Creates worker settings from explicit values.
    pub fn new(
        attach_timeout: Duration,
        reap_grace_period: Duration,
        term_grace_period: Duration,
    ) -> Self {
        Self {
            attach_timeout,
            reap_grace_period,
            term_grace_period,
        }
    }

    /// How long to wait for a worker to attach to the bus.
    pub fn attach_timeout(&self) -> Duration {
        self.attach_timeout
    }

    /// How long a worker may take to exit by itself during teardown.
    pub fn reap_grace_period(&self) -> Duration {
        self.reap_grace_period
    }

    /// How long a worker may take to exit after SIGTERM.
    pub fn term_grace_period(&self) -> Duration {
        self.term_grace_period
    }
}

/// The `[store]` table.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreSettings {
    #[serde(default)]
    path: Option<Utf8PathBuf>,
    mode: StoreMode,
}

impl StoreSettings {
    /// The result database, if configured.
    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// How results are written.
    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Opens the configured store in the configured mode.
    ///
    /// `path` overrides the configured path. Returns `None` if neither is set.
    pub fn open(&self, path: Option<&Utf8Path>) -> Result<Option<ConfiguredStore>, StoreError> {
        let Some(path) = path.or(self.path()) else {
            return Ok(None);
        };
        let store = Store::open(path)?;
        let store = match self.mode {
            StoreMode::Sync => ConfiguredStore::Sync(store),
            StoreMode::Deferred => ConfiguredStore::Deferred(DeferredStore::new(store)?),
        };
        Ok(Some(store))
    }
}

/// A store opened through [`StoreSettings::open`].
#[derive(Debug)]
pub enum ConfiguredStore {
    /// Results are written as they arrive.
    Sync(Store),

    /// Results are queued onto a writer thread.
    Deferred(DeferredStore),
}

impl ConfiguredStore {
    /// Waits for queued writes and returns the underlying store.
    pub fn finish(self) -> Result<Store, StoreError> {
        match self {
            Self::Sync(store) => Ok(store),
            Self::Deferred(deferred) => deferred.finish(),
        }
    }
}

impl ResultSink for ConfiguredStore {
    fn start_testrun(
        &mut self,
        client: &ClientInfo,
        environment: &Environment,
    ) -> Result<TestRunId, StoreError> {
        match self {
            Self::Sync(store) => ResultSink::start_testrun(store, client, environment),
            Self::Deferred(deferred) => ResultSink::start_testrun(deferred, client, environment),
        }
    }

    fn stop_testrun(&mut self, testrun: TestRunId) -> Result<(), StoreError> {
        match self {
            Self::Sync(store) => ResultSink::stop_testrun(store, testrun),
            Self::Deferred(deferred) => ResultSink::stop_testrun(deferred, testrun),
        }
    }

    fn insert_test(&mut self, testrun: TestRunId, record: &TestRecord) -> Result<(), StoreError> {
        match self {
            Self::Sync(store) => ResultSink::insert_test(store, testrun, record),
            Self::Deferred(deferred) => ResultSink::insert_test(deferred, testrun, record),
        }
    }
}

/// How results are written to the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreMode {
    /// Each finished test is written before the next event is processed.
    Sync,

    /// Writes are queued onto a background writer thread.
    Deferred,
}

/// Type for the max-concurrency config key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MaxConcurrency {
    /// Run up to this many tests at once.
    Count(usize),

    /// Run as many tests at once as there are logical CPUs.
    NumCpus,
}

impl MaxConcurrency {
    /// Gets the actual limit computed at runtime.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(count) => count,
            Self::NumCpus => get_num_cpus(),
        }
    }
}

impl FromStr for MaxConcurrency {
    type Err = MaxConcurrencyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "num-cpus" {
            return Ok(Self::NumCpus);
        }

        match s.parse::<isize>() {
            Err(e) => Err(MaxConcurrencyParseError::new(s, e.to_string())),
            Ok(0) => Err(MaxConcurrencyParseError::new(s, "max-concurrency may not be 0")),
            Ok(j) if j < 0 => Ok(Self::Count((get_num_cpus() as isize + j).max(1) as usize)),
            Ok(j) => Ok(Self::Count(j as usize)),
        }
    }
}

impl fmt::Display for MaxConcurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{count}"),
            Self::NumCpus => write!(f, "num-cpus"),
        }
    }
}

impl<'de> Deserialize<'de> for MaxConcurrency {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = MaxConcurrency;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a non-zero integer or the string \"num-cpus\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v == "num-cpus" {
                    Ok(MaxConcurrency::NumCpus)
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &self,
                    ))
                }
            }

            // TOML integers are i64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match v.cmp(&0) {
                    Ordering::Greater => Ok(MaxConcurrency::Count(v as usize)),
                    Ordering::Less => Ok(MaxConcurrency::Count(
                        (get_num_cpus() as i64 + v).max(1) as usize,
                    )),
                    Ordering::Equal => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Signed(v),
                        &self,
                    )),
                }
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match i64::try_from(v) {
                    Ok(v) => self.visit_i64(v),
                    Err(_) => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Unsigned(v),
                        &self,
                    )),
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}
