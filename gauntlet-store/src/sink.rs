// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{ClientInfo, DeferredStore, Environment, Store, StoreError, TestRunId};
use gauntlet_metadata::TestRecord;

/// Where a test run sends its results.
///
/// Implemented by [`Store`], which writes synchronously, and by
/// [`DeferredStore`], which queues writes for a background thread.
pub trait ResultSink: Send {
    /// Starts a testrun and returns its id.
    fn start_testrun(
        &mut self,
        client: &ClientInfo,
        environment: &Environment,
    ) -> Result<TestRunId, StoreError>;

    /// Records that a testrun finished.
    fn stop_testrun(&mut self, testrun: TestRunId) -> Result<(), StoreError>;

    /// Persists a finished test tree.
    fn insert_test(&mut self, testrun: TestRunId, record: &TestRecord) -> Result<(), StoreError>;
}

impl ResultSink for Store {
    fn start_testrun(
        &mut self,
        client: &ClientInfo,
        environment: &Environment,
    ) -> Result<TestRunId, StoreError> {
        Store::start_testrun(self, client, environment)
    }

    fn stop_testrun(&mut self, testrun: TestRunId) -> Result<(), StoreError> {
        Store::stop_testrun(self, testrun)
    }

    fn insert_test(&mut self, testrun: TestRunId, record: &TestRecord) -> Result<(), StoreError> {
        Store::insert_test(self, testrun, record).map(|_| ())
    }
}

impl ResultSink for DeferredStore {
    fn start_testrun(
        &mut self,
        client: &ClientInfo,
        environment: &Environment,
    ) -> Result<TestRunId, StoreError> {
        DeferredStore::start_testrun(self, client, environment)
    }

    fn stop_testrun(&mut self, testrun: TestRunId) -> Result<(), StoreError> {
        DeferredStore::stop_testrun(self, testrun)
    }

    fn insert_test(&mut self, testrun: TestRunId, record: &TestRecord) -> Result<(), StoreError> {
        DeferredStore::insert_test(self, testrun, record.clone())
    }
}
