// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use pin_project_lite::pin_project;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Duration,
};
use tokio::time::{Instant, Sleep};
use tracing::debug;

pin_project! {
    /// A timer for a deadline that may move while the timer is in flight.
    ///
    /// When the inner sleep fires, the stored deadline is checked again. If it
    /// was pushed back in the meantime, the sleep is re-armed for the new
    /// deadline instead of completing. A deadline fires at most once; after
    /// that the timer is disarmed.
    #[derive(Debug)]
    pub(crate) struct DeadlineSleep {
        #[pin]
        sleep: Sleep,
        deadline: Option<Instant>,
    }
}

impl DeadlineSleep {
    /// Creates a timer that never fires until armed.
    pub(crate) fn disarmed() -> Self {
        Self {
            sleep: tokio::time::sleep_until(far_future()),
            deadline: None,
        }
    }

    /// Returns true if the deadline is set and has not fired yet.
    pub(crate) fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Sets the deadline to `timeout` from now.
    ///
    /// Timeouts too large to represent are clamped to the far future.
    pub(crate) fn arm(self: Pin<&mut Self>, timeout: Duration) {
        let this = self.project();
        let deadline = clamped_add(Instant::now(), timeout);
        *this.deadline = Some(deadline);
        this.sleep.reset(deadline);
    }

    /// Clears the deadline.
    pub(crate) fn disarm(self: Pin<&mut Self>) {
        let this = self.project();
        *this.deadline = None;
        this.sleep.reset(far_future());
    }

    /// Pushes the deadline back by `by`, leaving the inner sleep alone.
    ///
    /// Does nothing if the timer is not armed.
    pub(crate) fn extend(self: Pin<&mut Self>, by: Duration) {
        let this = self.project();
        if let Some(deadline) = this.deadline {
            *deadline = clamped_add(*deadline, by);
        }
    }
}

impl Future for DeadlineSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            ready!(this.sleep.as_mut().poll(cx));
            match *this.deadline {
                Some(deadline) if Instant::now() < deadline => {
                    debug!("deadline was pushed back while the timer was in flight, re-arming");
                    this.sleep.as_mut().reset(deadline);
                }
                Some(_) => {
                    *this.deadline = None;
                    this.sleep.as_mut().reset(far_future());
                    return Poll::Ready(());
                }
                None => {
                    this.sleep.as_mut().reset(far_future());
                }
            }
        }
    }
}

fn clamped_add(instant: Instant, by: Duration) -> Instant {
    let limit = far_future();
    match instant.checked_add(by) {
        Some(deadline) if deadline < limit => deadline,
        _ => limit,
    }
}

// Cribbed from tokio.
fn far_future() -> Instant {
    // Roughly 30 years from now.
    // API does not provide a way to obtain max `Instant`
    // or convert specific date in the future to instant.
    // 1000 years overflows on macOS, 100 years overflows on FreeBSD.
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}
