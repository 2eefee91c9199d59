// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test kinds shared by the `fixture-worker` binary and the integration tests.
//!
//! The proxy side of a remote test only knows the schema; the worker side
//! hosts the classes registered in [`registry`].

use futures::future::{BoxFuture, FutureExt};
use gauntlet_metadata::{ArgumentValues, Schema, SchemaKind, field};
use gauntlet_runner::{
    errors::TestError,
    ipc::{PROXY_TEST_SCHEMA, WorkerRegistry},
    test::{SetupMode, TestClass, TestContext, TestKind},
};
use std::{sync::Arc, time::Duration};

/// The module name the fixture classes are registered under.
pub const FIXTURE_MODULE: &str = "fixtures";

/// Passed to `fixture-worker` to make it exit with code 1 before attaching.
pub const EXIT_EARLY_ARG: &str = "--exit-early";

/// The schema shared by both halves of the fixture tests.
pub static REMOTE_FIXTURE_SCHEMA: Schema =
    Schema::new(SchemaKind::Test, "remote-fixture", "A remote test used by the integration tests")
        .with_base(&PROXY_TEST_SCHEMA)
        .with_arguments(&[field("n", "An index")])
        .with_checklist(&[field("body-ran", "The body ran in the worker")])
        .with_extra_info(&[field("n-squared", "The square of the index")]);

/// Builds the registry `fixture-worker` serves.
pub fn registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry
        .register(FIXTURE_MODULE, "Passing", Arc::new(FixtureClass::new(Behavior::Sync)))
        .register(FIXTURE_MODULE, "AsyncPassing", Arc::new(FixtureClass::new(Behavior::Async)))
        .register(FIXTURE_MODULE, "LeavesBus", Arc::new(FixtureClass::new(Behavior::LeavesBus)));
    registry
}

/// The exit code of a `LeavesBus` worker.
pub const LEAVES_BUS_EXIT_CODE: i32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Behavior {
    Sync,
    Async,
    /// Exits the whole worker from the test body, dropping its connection.
    LeavesBus,
}

/// A test that squares its argument.
///
/// The asynchronous flavor reports ready from a background task and stops
/// itself shortly after its body returns.
#[derive(Debug)]
struct FixtureClass {
    behavior: Behavior,
}

impl FixtureClass {
    fn new(behavior: Behavior) -> Self {
        Self { behavior }
    }
}

impl TestClass for FixtureClass {
    fn schema(&self) -> &'static Schema {
        &REMOTE_FIXTURE_SCHEMA
    }

    fn instantiate(&self, _: &ArgumentValues) -> Result<Box<dyn TestKind>, TestError> {
        Ok(Box::new(FixtureTest {
            behavior: self.behavior,
        }))
    }
}

struct FixtureTest {
    behavior: Behavior,
}

impl TestKind for FixtureTest {
    fn set_up<'a>(&'a mut self, cx: &'a TestContext) -> BoxFuture<'a, Result<SetupMode, TestError>> {
        async move {
            if self.behavior != Behavior::Async {
                return Ok(SetupMode::Sync);
            }
            let cx = cx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cx.ready();
            });
            Ok(SetupMode::Async)
        }
        .boxed()
    }

    fn test<'a>(&'a mut self, cx: &'a TestContext) -> BoxFuture<'a, Result<(), TestError>> {
        async move {
            let n = cx.int_argument("n")?;
            cx.extra_info("n-squared", n * n);
            cx.validate_step("body-ran", true);
            if self.behavior == Behavior::LeavesBus {
                std::process::exit(LEAVES_BUS_EXIT_CODE);
            }
            if self.behavior == Behavior::Async {
                let cx = cx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    cx.stop();
                });
            }
            Ok(())
        }
        .boxed()
    }

    fn is_async(&self) -> bool {
        self.behavior == Behavior::Async
    }
}
