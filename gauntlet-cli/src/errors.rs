// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::Styles;
use camino::Utf8PathBuf;
use gauntlet_store::{StoreError, TestRunId};
use owo_colors::OwoColorize;
use std::error::Error;
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

/// Exit codes used by the `gauntlet` binary.
pub struct GauntletExitCode;

impl GauntletExitCode {
    /// The command succeeded.
    pub const OK: i32 = 0;

    /// `compare` found regressed or removed tests.
    pub const REGRESSIONS_FOUND: i32 = 1;

    /// A result store could not be opened.
    pub const STORE_OPEN_FAILED: i32 = 2;

    /// A testrun that was asked for does not exist.
    pub const TESTRUN_NOT_FOUND: i32 = 3;

    /// Reading from or writing to a store failed.
    pub const STORE_ERROR: i32 = 4;
}

// The #[error()] strings are short placeholders: errors are meant to be
// printed with display_to_stderr, which colorizes them and prints the source
// chain.

/// An error the `gauntlet` binary reports to the user.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("failed to open store")]
    StoreOpen {
        path: Utf8PathBuf,
        #[source]
        err: StoreError,
    },
    #[error("testrun not found")]
    TestRunNotFound { path: Utf8PathBuf, testrun: TestRunId },
    #[error("store error")]
    Store {
        context: &'static str,
        #[source]
        err: StoreError,
    },
    #[error("merge failed")]
    Merge {
        testrun: TestRunId,
        #[source]
        err: StoreError,
    },
}

impl ExpectedError {
    pub(crate) fn store_open(path: impl Into<Utf8PathBuf>, err: StoreError) -> Self {
        Self::StoreOpen {
            path: path.into(),
            err,
        }
    }

    pub(crate) fn store(context: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |err| Self::Store { context, err }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::StoreOpen { .. } => GauntletExitCode::STORE_OPEN_FAILED,
            Self::TestRunNotFound { .. } => GauntletExitCode::TESTRUN_NOT_FOUND,
            Self::Store { .. } | Self::Merge { .. } => GauntletExitCode::STORE_ERROR,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &Styles) {
        let mut next_error = match &self {
            Self::StoreOpen { path, err } => {
                error!("failed to open result store at {}", path.style(styles.bold));
                err.source()
            }
            Self::TestRunNotFound { path, testrun } => {
                error!(
                    "testrun {} not found in {}",
                    testrun.style(styles.bold),
                    path.style(styles.bold),
                );
                None
            }
            Self::Store { context, err } => {
                error!("{context}");
                Some(err as &dyn Error)
            }
            Self::Merge { testrun, err } => {
                error!("failed to merge testrun {}", testrun.style(styles.bold));
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: "gauntlet_cli::no_heading", "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
