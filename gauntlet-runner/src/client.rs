// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identifying the program and machine a test run comes from.

use gauntlet_store::{ClientInfo, Environment};
use gauntlet_metadata::Value;
use tracing::debug;

/// Returns the client identity of the current process.
///
/// `software` is recorded verbatim, for example `"gauntlet 0.3.0"`. Host and
/// user names that cannot be determined are recorded as `unknown`.
pub fn current_client(software: impl Into<String>) -> ClientInfo {
    let host = whoami::hostname().unwrap_or_else(|error| {
        debug!(%error, "failed to determine host name");
        "unknown".to_owned()
    });
    let user = whoami::username().unwrap_or_else(|error| {
        debug!(%error, "failed to determine user name");
        "unknown".to_owned()
    });
    ClientInfo {
        software: software.into(),
        host,
        user,
    }
}

/// The client identity of this build of gauntlet-runner.
pub fn default_client() -> ClientInfo {
    current_client(format!("gauntlet {}", env!("CARGO_PKG_VERSION")))
}

/// Captures the environment snapshot stored with a test run.
///
/// Only variables whose names start with one of `prefixes` are captured, along
/// with the platform the run happened on.
pub fn capture_environment<'a>(prefixes: impl IntoIterator<Item = &'a str>) -> Environment {
    let prefixes: Vec<_> = prefixes.into_iter().collect();
    let mut environment: Environment = std::env::vars()
        .filter(|(name, _)| prefixes.iter().any(|prefix| name.starts_with(prefix)))
        .map(|(name, value)| (name, Value::Text(value)))
        .collect();
    environment.insert("os".to_owned(), Value::Text(std::env::consts::OS.to_owned()));
    environment.insert(
        "arch".to_owned(),
        Value::Text(std::env::consts::ARCH.to_owned()),
    );
    environment
}
