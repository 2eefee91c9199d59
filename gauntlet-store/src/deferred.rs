// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A store whose writes are serialized onto a dedicated thread.

use crate::{ClientInfo, Environment, Store, StoreError, TestRunId};
use gauntlet_metadata::TestRecord;
use std::{
    sync::mpsc,
    thread::{self, JoinHandle},
};
use tracing::{debug, warn};

enum Action {
    StartTestRun {
        client: ClientInfo,
        environment: Environment,
        reply: mpsc::SyncSender<Result<TestRunId, StoreError>>,
    },
    StopTestRun {
        testrun: TestRunId,
    },
    InsertTest {
        testrun: TestRunId,
        record: Box<TestRecord>,
    },
    Flush {
        reply: mpsc::SyncSender<Option<StoreError>>,
    },
}

/// A [`Store`] owned by a background writer thread.
///
/// Writes are queued in FIFO order and applied by the writer thread, which is
/// the only user of the connection. Only [`start_testrun`](Self::start_testrun)
/// waits for its reply, since callers need the new testrun id.
///
/// Failed queued writes are logged, and the first one is reported by the
/// next [`flush`](Self::flush) or by [`finish`](Self::finish).
///
/// A deferred store cannot be used as a merge destination: take the store
/// back with [`finish`](Self::finish) first.
#[derive(Debug)]
pub struct DeferredStore {
    sender: Option<mpsc::Sender<Action>>,
    handle: Option<JoinHandle<(Store, Option<StoreError>)>>,
}

impl DeferredStore {
    /// Moves `store` onto a new writer thread.
    pub fn new(store: Store) -> Result<Self, StoreError> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("gauntlet-store-writer".to_owned())
            .spawn(move || writer_loop(store, receiver))
            .map_err(StoreError::SpawnWriter)?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    fn send(&self, action: Action) -> Result<(), StoreError> {
        self.sender
            .as_ref()
            .ok_or(StoreError::WriterGone)?
            .send(action)
            .map_err(|_| StoreError::WriterGone)
    }

    /// Starts a testrun, waiting for the writer thread to assign its id.
    pub fn start_testrun(
        &self,
        client: &ClientInfo,
        environment: &Environment,
    ) -> Result<TestRunId, StoreError> {
        let (reply, response) = mpsc::sync_channel(1);
        self.send(Action::StartTestRun {
            client: client.clone(),
            environment: environment.clone(),
            reply,
        })?;
        response.recv().map_err(|_| StoreError::WriterGone)?
    }

    /// Queues recording the stop time of a testrun.
    pub fn stop_testrun(&self, testrun: TestRunId) -> Result<(), StoreError> {
        self.send(Action::StopTestRun { testrun })
    }

    /// Queues writing a finished test tree.
    pub fn insert_test(&self, testrun: TestRunId, record: TestRecord) -> Result<(), StoreError> {
        self.send(Action::InsertTest {
            testrun,
            record: Box::new(record),
        })
    }

    /// Waits until every queued write has been applied.
    ///
    /// Returns the first error since the previous flush, if any.
    pub fn flush(&self) -> Result<(), StoreError> {
        let (reply, response) = mpsc::sync_channel(1);
        self.send(Action::Flush { reply })?;
        match response.recv().map_err(|_| StoreError::WriterGone)? {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Applies the remaining writes, stops the writer thread and returns the
    /// underlying store.
    pub fn finish(mut self) -> Result<Store, StoreError> {
        let (store, error) = self.join()?;
        match error {
            Some(error) => Err(error),
            None => Ok(store),
        }
    }

    fn join(&mut self) -> Result<(Store, Option<StoreError>), StoreError> {
        // Closing the channel ends the writer loop once the queue is drained.
        self.sender = None;
        let handle = self.handle.take().ok_or(StoreError::WriterGone)?;
        handle.join().map_err(|_| StoreError::WriterGone)
    }
}

impl Drop for DeferredStore {
    fn drop(&mut self) {
        if self.handle.is_some()
            && let Ok((_, Some(error))) = self.join()
        {
            warn!("deferred write failed: {error}");
        }
    }
}

fn writer_loop(
    mut store: Store,
    receiver: mpsc::Receiver<Action>,
) -> (Store, Option<StoreError>) {
    debug!("result store writer started");
    let mut first_error = None;

    for action in receiver {
        match action {
            Action::StartTestRun {
                client,
                environment,
                reply,
            } => {
                // The caller may have given up waiting.
                _ = reply.send(store.start_testrun(&client, &environment));
            }
            Action::StopTestRun { testrun } => {
                note_error(&mut first_error, store.stop_testrun(testrun));
            }
            Action::InsertTest { testrun, record } => {
                note_error(&mut first_error, store.insert_test(testrun, &record).map(|_| ()));
            }
            Action::Flush { reply } => {
                _ = reply.send(first_error.take());
            }
        }
    }
    debug!("result store writer exiting");
    (store, first_error)
}

fn note_error(first_error: &mut Option<StoreError>, result: Result<(), StoreError>) {
    if let Err(error) = result {
        warn!("deferred write failed: {error}");
        first_error.get_or_insert(error);
    }
}
