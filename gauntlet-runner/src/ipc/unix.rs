// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use libc::{SIGKILL, SIGTERM};
use std::{
    io,
    os::unix::process::ExitStatusExt,
    process::ExitStatus,
    time::Duration,
};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Puts the worker in its own process group, so signals reach any processes
/// it spawns as well.
pub(super) fn set_process_group(command: &mut Command) {
    command.process_group(0);
}

/// Waits for a worker to exit, escalating to SIGTERM and then SIGKILL.
///
/// Returns the exit code, or the negated signal number if the worker was
/// killed by a signal.
pub(super) async fn reap(
    child: &mut Child,
    grace_period: Duration,
    term_grace_period: Duration,
) -> io::Result<i32> {
    if let Some(status) = child.try_wait()? {
        return Ok(exit_code(status));
    }
    if let Ok(status) = tokio::time::timeout(grace_period, child.wait()).await {
        return status.map(exit_code);
    }

    debug!(?grace_period, "worker did not exit, sending SIGTERM");
    signal_group(child, SIGTERM);
    if let Ok(status) = tokio::time::timeout(term_grace_period, child.wait()).await {
        return status.map(exit_code);
    }

    warn!(?term_grace_period, "worker ignored SIGTERM, sending SIGKILL");
    signal_group(child, SIGKILL);
    child.wait().await.map(exit_code)
}

fn signal_group(child: &Child, signal: libc::c_int) {
    let Some(pid) = child.id() else {
        // The child exited already -- don't send a signal.
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    unsafe {
        // A negative pid targets the whole process group.
        libc::kill(-pid, signal);
    }
}

pub(super) fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => i32::MIN,
    }
}
