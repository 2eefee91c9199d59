// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests: remote tests are run through the batch scheduler against
//! the `fixture-worker` binary, and their results are read back from a store.

use color_eyre::eyre::{Result, eyre};
use gauntlet_metadata::Value;
use gauntlet_runner::{
    arguments::{Arguments, RangeGenerator, ValuesGenerator},
    client::{capture_environment, current_client},
    config::{MaxConcurrency, RunnerConfig},
    context::HarnessContext,
    ipc::RemoteTestClass,
    runner::{Batch, RunEventKind, RunStats, TestRunBuilder},
    signal::SignalHandlerKind,
};
use gauntlet_store::{DeferredStore, ResultSink, Store, TestFilter, TestInfo, TestRunId};
use integration_tests::{
    EXIT_EARLY_ARG, FIXTURE_MODULE, LEAVES_BUS_EXIT_CODE, REMOTE_FIXTURE_SCHEMA,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const FIXTURE_WORKER: &str = env!("CARGO_BIN_EXE_fixture-worker");

fn remote_class(class: &str) -> RemoteTestClass {
    RemoteTestClass::new(&REMOTE_FIXTURE_SCHEMA, FIXTURE_WORKER, FIXTURE_MODULE, class)
        .with_source_location(file!())
}

fn run_batches(
    harness: &Arc<HarnessContext>,
    sink: &mut dyn ResultSink,
    batches: Vec<Batch>,
) -> Result<(TestRunId, RunStats)> {
    let mut builder = TestRunBuilder::default();
    for batch in batches {
        builder.add_batch(batch);
    }
    builder.set_max_concurrency(MaxConcurrency::Count(2));
    let run = builder.build(harness, &RunnerConfig::load(None)?, SignalHandlerKind::Noop)?;

    let mut testrun = None;
    let stats = run.execute(
        sink,
        &current_client("gauntlet-integration"),
        &capture_environment(["GAUNTLET_"]),
        |event| {
            if let RunEventKind::RunStarted { testrun: id, .. } = event.kind {
                testrun = Some(id);
            }
        },
    )?;
    let testrun = testrun.ok_or_else(|| eyre!("run never started"))?;
    Ok((testrun, stats))
}

fn stored_tests(store: &Store, testrun: TestRunId) -> Result<Vec<TestInfo>> {
    store
        .list_tests(testrun, TestFilter::default())?
        .into_iter()
        .map(|id| {
            store
                .test_info(id)?
                .ok_or_else(|| eyre!("test {id} listed but not found"))
        })
        .collect()
}

#[test]
fn remote_tests_pass() -> Result<()> {
    let harness = HarnessContext::new()?;
    let mut store = Store::open_in_memory()?;
    let (testrun, stats) = run_batches(
        &harness,
        &mut store,
        vec![
            Batch::new(
                Arc::new(remote_class("Passing")),
                Arguments::new().with_generator("n", RangeGenerator::new(1, 4)),
            ),
            Batch::new(
                Arc::new(remote_class("AsyncPassing")),
                Arguments::new().with_generator("n", ValuesGenerator::new([7])),
            ),
        ],
    )?;
    harness.shutdown();

    assert_eq!(stats.started, 4);
    assert_eq!(stats.passed, 4, "stats: {stats:?}");
    assert!(stats.is_success());

    let tests = stored_tests(&store, testrun)?;
    let squares: Vec<_> = tests
        .iter()
        .map(|test| test.extra_info.get("n-squared").and_then(Value::as_int))
        .collect();
    assert_eq!(squares, [Some(1), Some(4), Some(9), Some(49)]);
    for test in &tests {
        assert_eq!(test.class, "remote-fixture");
        assert_eq!(test.result_percentage, 100.0);
        assert_eq!(test.checklist.get("dbus-process-connected"), Some(true));
        assert_eq!(test.checklist.get("body-ran"), Some(true));
        assert_eq!(
            test.extra_info.get("subprocess-return-code"),
            Some(&Value::Int(0))
        );
    }

    let info = store.testrun_info(testrun)?;
    assert_eq!(info.client.software, "gauntlet-integration");
    assert!(info.stop_time.is_some());
    Ok(())
}

#[test]
fn worker_exiting_before_ready_fails_the_test() -> Result<()> {
    let harness = HarnessContext::new()?;
    let mut store = Store::open_in_memory()?;
    let (testrun, stats) = run_batches(
        &harness,
        &mut store,
        vec![Batch::new(
            Arc::new(remote_class("Passing").with_args([EXIT_EARLY_ARG])),
            Arguments::new().with_static("n", 1),
        )],
    )?;
    harness.shutdown();

    assert_eq!(stats.started, 1);
    assert_eq!(stats.failed, 1);

    let tests = stored_tests(&store, testrun)?;
    let [test] = tests.as_slice() else {
        return Err(eyre!("expected one test, found {}", tests.len()));
    };
    assert_eq!(test.checklist.get("dbus-process-spawned"), Some(true));
    assert_eq!(test.checklist.get("dbus-process-connected"), None);
    assert_eq!(test.checklist.get("subprocess-exited-normally"), None);
    assert_eq!(
        test.extra_info.get("subprocess-return-code"),
        Some(&Value::Int(1))
    );
    assert!(test.result_percentage < 100.0);
    Ok(())
}

fn single_test(store: &Store, testrun: TestRunId) -> Result<TestInfo> {
    let mut tests = stored_tests(store, testrun)?;
    match tests.len() {
        1 => Ok(tests.remove(0)),
        n => Err(eyre!("expected one test, found {n}")),
    }
}

#[test]
fn worker_leaving_the_bus_aborts_the_test() -> Result<()> {
    let harness = HarnessContext::new()?;
    let mut store = Store::open_in_memory()?;
    let (testrun, stats) = run_batches(
        &harness,
        &mut store,
        vec![Batch::new(
            Arc::new(remote_class("LeavesBus")),
            Arguments::new().with_static("n", 2),
        )],
    )?;
    harness.shutdown();
    assert_eq!(stats.failed, 1, "stats: {stats:?}");

    let test = single_test(&store, testrun)?;
    assert_eq!(test.checklist.get("dbus-process-connected"), Some(true));
    assert_eq!(test.checklist.get("remote-instance-created"), Some(true));
    assert_eq!(test.checklist.get("subprocess-exited-normally"), None);
    assert_eq!(
        test.extra_info.get("subprocess-return-code"),
        Some(&Value::Int(i64::from(LEAVES_BUS_EXIT_CODE)))
    );
    let message = test
        .extra_info
        .get("error-message")
        .and_then(Value::as_text)
        .ok_or_else(|| eyre!("no error message recorded"))?;
    assert!(
        message.contains("worker left the bus before the test finished"),
        "unexpected message: {message}"
    );
    assert!(test.result_percentage < 100.0);
    Ok(())
}

#[test]
fn unknown_remote_class_fails_instance_creation() -> Result<()> {
    let harness = HarnessContext::new()?;
    let mut store = Store::open_in_memory()?;
    let (testrun, stats) = run_batches(
        &harness,
        &mut store,
        vec![Batch::new(
            Arc::new(remote_class("Missing")),
            Arguments::new().with_static("n", 1),
        )],
    )?;
    harness.shutdown();
    assert_eq!(stats.failed, 1, "stats: {stats:?}");

    let test = single_test(&store, testrun)?;
    assert_eq!(test.checklist.get("dbus-process-connected"), Some(true));
    assert_eq!(test.checklist.get("remote-instance-created"), None);
    assert_eq!(test.checklist.get("body-ran"), None);
    assert_eq!(
        test.extra_info.get("error-message"),
        Some(&Value::from(
            "remote createTestInstance failed: no test class `Missing` registered in module `fixtures`"
        ))
    );
    // The worker still winds down cleanly.
    assert_eq!(
        test.extra_info.get("subprocess-return-code"),
        Some(&Value::Int(0))
    );
    assert!(test.result_percentage < 100.0);
    Ok(())
}

#[test]
fn deferred_store_receives_every_record() -> Result<()> {
    let dir = camino_tempfile::tempdir()?;
    let harness = HarnessContext::new()?;
    let mut deferred = DeferredStore::new(Store::open(dir.path().join("results.db"))?)?;
    let (testrun, stats) = run_batches(
        &harness,
        &mut deferred,
        vec![Batch::new(
            Arc::new(remote_class("Passing")),
            Arguments::new().with_generator("n", RangeGenerator::new(0, 3)),
        )],
    )?;
    harness.shutdown();
    assert_eq!(stats.passed, 3);

    let store = deferred.finish()?;
    assert_eq!(stored_tests(&store, testrun)?.len(), 3);
    Ok(())
}
