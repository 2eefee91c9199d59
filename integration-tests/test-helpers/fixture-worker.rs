// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A worker launcher hosting the fixture test kinds.
//!
//! Started by the proxy half of a remote test with the bus address, test UUID
//! and arguments in its environment. With `--exit-early`, it exits with code 1
//! without ever attaching to the bus.

use integration_tests::{EXIT_EARLY_ARG, registry};
use std::process::exit;
use tracing::{error, level_filters::LevelFilter};
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt, Layer};

fn main() {
    if std::env::args().any(|arg| arg == EXIT_EARLY_ARG) {
        exit(1);
    }

    let targets = std::env::var("GAUNTLET_LOG")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or_else(|| Targets::new().with_default(LevelFilter::INFO));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(targets);
    tracing_subscriber::registry().with(layer).init();

    if let Err(err) = gauntlet_runner::ipc::run_worker(&registry()) {
        error!("worker failed: {err}");
        exit(2);
    }
}
