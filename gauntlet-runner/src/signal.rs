// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signals that abort a test run.
//!
//! While a run executes, SIGINT, SIGTERM and SIGHUP are turned into
//! [`ShutdownEvent`]s. The dispatcher reacts to the first one by aborting the
//! run: every running test is stopped, pending argument tuples are skipped and
//! the run ends with an aborted event. Later signals are reported but change
//! nothing.

use crate::errors::SignalHandlerSetupError;
use std::{fmt, future::poll_fn, task::Poll};
use tokio::signal::unix::{Signal, SignalKind, signal};

/// The kind of signal handling to set up for a test run.
///
/// A `SignalHandlerKind` can be passed into
/// [`TestRunBuilder::build`](crate::runner::TestRunBuilder::build).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SignalHandlerKind {
    /// SIGINT, SIGTERM and SIGHUP abort the run.
    Standard,

    /// Signals keep their default behavior. Useful for tests.
    Noop,
}

impl SignalHandlerKind {
    /// Must be called within a tokio runtime.
    pub(crate) fn build(self) -> Result<SignalHandler, SignalHandlerSetupError> {
        match self {
            Self::Standard => SignalHandler::listen(ShutdownEvent::ALL),
            Self::Noop => Ok(SignalHandler {
                listeners: Vec::new(),
            }),
        }
    }
}

/// A signal that aborts the run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShutdownEvent {
    /// SIGINT, usually from Ctrl-C.
    Interrupt,

    /// SIGTERM.
    Term,

    /// SIGHUP, usually from the controlling terminal going away.
    Hangup,
}

impl ShutdownEvent {
    const ALL: &'static [Self] = &[Self::Interrupt, Self::Term, Self::Hangup];

    fn signal_kind(self) -> SignalKind {
        match self {
            Self::Interrupt => SignalKind::interrupt(),
            Self::Term => SignalKind::terminate(),
            Self::Hangup => SignalKind::hangup(),
        }
    }
}

impl fmt::Display for ShutdownEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Term => write!(f, "SIGTERM"),
            Self::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Listens for the signals that abort a run.
#[derive(Debug)]
pub(crate) struct SignalHandler {
    // Listeners whose stream ended are removed.
    listeners: Vec<(ShutdownEvent, Signal)>,
}

impl SignalHandler {
    fn listen(events: &[ShutdownEvent]) -> Result<Self, SignalHandlerSetupError> {
        let listeners = events
            .iter()
            .map(|&event| {
                signal(event.signal_kind())
                    .map(|signal| (event, signal))
                    .map_err(|error| SignalHandlerSetupError::new(event, error))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { listeners })
    }

    /// Waits for the next signal.
    ///
    /// Returns `None` once no signal can arrive anymore, which is immediately
    /// for a no-op handler.
    pub(crate) async fn recv(&mut self) -> Option<ShutdownEvent> {
        poll_fn(|cx| {
            let mut index = 0;
            while index < self.listeners.len() {
                let (event, signal) = &mut self.listeners[index];
                match signal.poll_recv(cx) {
                    Poll::Ready(Some(())) => return Poll::Ready(Some(*event)),
                    Poll::Ready(None) => {
                        self.listeners.swap_remove(index);
                    }
                    Poll::Pending => index += 1,
                }
            }
            if self.listeners.is_empty() {
                Poll::Ready(None)
            } else {
                Poll::Pending
            }
        })
        .await
    }
}
