// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scenarios: tests made of child tests.
//!
//! A scenario runs its children one after the other. The list of children is
//! not fixed up front: a [`ScenarioPlan`] queues the initial children and may
//! queue more every time one finishes. The scenario's result percentage is the
//! mean of its children's.
//!
//! When the scenario stops (timeout, abort or an explicit stop), the running
//! child is stopped as well and no further children are started.

use crate::{
    errors::TestError,
    monitor::MonitorSpec,
    test::{
        Capabilities, TestClass, TestContext, TestKind,
        driver::{TestSpec, run_test},
    },
};
use futures::future::{BoxFuture, FutureExt};
pub use gauntlet_metadata::SCENARIO_SCHEMA;
use gauntlet_metadata::{ArgumentValues, Schema, TestRecord};
use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};
use tokio::sync::broadcast::error::TryRecvError;
use tracing::debug;

/// Decides which children a scenario runs.
pub trait ScenarioPlan: Send + Sync + fmt::Debug {
    /// The schema of this scenario kind; it should derive from
    /// [`SCENARIO_SCHEMA`].
    fn schema(&self) -> &'static Schema {
        &SCENARIO_SCHEMA
    }

    /// Queues the children to start with.
    fn initial(&self, arguments: &ArgumentValues, queue: &mut SubtestQueue)
    -> Result<(), TestError>;

    /// Called after each child finishes; may queue more children.
    fn subtest_finished(&self, record: &TestRecord, queue: &mut SubtestQueue) {
        let _ = (record, queue);
    }
}

/// The children a scenario has yet to start, in order.
#[derive(Debug, Default)]
pub struct SubtestQueue {
    entries: VecDeque<TestSpec>,
}

impl SubtestQueue {
    /// Queues a child after the ones already queued.
    pub fn push(
        &mut self,
        class: Arc<dyn TestClass>,
        arguments: ArgumentValues,
        monitors: Vec<MonitorSpec>,
    ) {
        self.entries.push_back(TestSpec {
            class,
            arguments,
            monitors: monitors.into(),
        });
    }

    /// The number of children not yet started.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no children are waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn pop(&mut self) -> Option<TestSpec> {
        self.entries.pop_front()
    }
}

/// A [`TestClass`] that runs a [`ScenarioPlan`].
#[derive(Clone, Debug)]
pub struct ScenarioClass {
    plan: Arc<dyn ScenarioPlan>,
    timeout: Duration,
}

impl ScenarioClass {
    /// Scenarios run many children, so they default to a one-day timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

    /// Creates a scenario class for `plan`.
    pub fn new(plan: impl ScenarioPlan + 'static) -> Self {
        Self {
            plan: Arc::new(plan),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the scenario's timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl TestClass for ScenarioClass {
    fn schema(&self) -> &'static Schema {
        self.plan.schema()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SCENARIO
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    fn instantiate(&self, arguments: &ArgumentValues) -> Result<Box<dyn TestKind>, TestError> {
        let mut queue = SubtestQueue::default();
        self.plan.initial(arguments, &mut queue)?;
        Ok(Box::new(Scenario {
            plan: self.plan.clone(),
            queue,
        }))
    }
}

struct Scenario {
    plan: Arc<dyn ScenarioPlan>,
    queue: SubtestQueue,
}

impl TestKind for Scenario {
    fn test<'a>(&'a mut self, cx: &'a TestContext) -> BoxFuture<'a, Result<(), TestError>> {
        async move {
            let mut stopped = cx.subscribe_stop();
            let mut count = 0i64;
            while let Some(spec) = self.queue.pop() {
                if !matches!(stopped.try_recv(), Err(TryRecvError::Empty)) {
                    debug!(remaining = self.queue.len() + 1, "scenario stopped, skipping children");
                    break;
                }

                let guard = cx.options().uuids.allocate();
                debug!(
                    child_uuid = %guard.uuid(),
                    class = spec.class.schema().name(),
                    "starting child test",
                );
                let output = run_test(
                    guard.uuid(),
                    &spec,
                    cx.options().clone(),
                    Some(cx.subscribe_stop()),
                    None,
                )
                .await;

                count += 1;
                self.plan.subtest_finished(&output.record, &mut self.queue);
                let mut guards = output.guards;
                guards.push(guard);
                cx.add_subtest(output.record, guards);
            }
            cx.extra_info("subtest-count", count);
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::driver::test_helpers::{FixtureClass, Script, options};
    use gauntlet_metadata::{TestUuid, Value};
    use pretty_assertions::assert_eq;

    /// Runs `children` fixtures, and one extra passing child after the first
    /// one finishes.
    #[derive(Debug)]
    struct FixturePlan {
        children: Vec<Arc<dyn TestClass>>,
        follow_up: bool,
    }

    impl ScenarioPlan for FixturePlan {
        fn initial(
            &self,
            _: &ArgumentValues,
            queue: &mut SubtestQueue,
        ) -> Result<(), TestError> {
            for (n, class) in self.children.iter().enumerate() {
                let arguments = [("n".to_owned(), Value::from(n as i64))].into_iter().collect();
                queue.push(class.clone(), arguments, Vec::new());
            }
            Ok(())
        }

        fn subtest_finished(&self, record: &TestRecord, queue: &mut SubtestQueue) {
            if self.follow_up && record.arguments["n"] == Value::from(0) {
                let arguments = [("n".to_owned(), Value::from(100))].into_iter().collect();
                queue.push(Arc::new(FixtureClass::default()), arguments, Vec::new());
            }
        }
    }

    fn scenario_spec(class: ScenarioClass) -> TestSpec {
        TestSpec {
            class: Arc::new(class),
            arguments: ArgumentValues::new(),
            monitors: Arc::new([]),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn children_run_in_order_and_average() {
        let failing = FixtureClass {
            script: Script {
                fail_setup: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let plan = FixturePlan {
            children: vec![Arc::new(FixtureClass::default()), Arc::new(failing)],
            follow_up: true,
        };
        let options = options();
        let output = run_test(
            TestUuid::new_v4(),
            &scenario_spec(ScenarioClass::new(plan)),
            options.clone(),
            None,
            None,
        )
        .await;

        let record = output.record;
        let order: Vec<_> = record
            .subtests
            .iter()
            .map(|child| child.arguments["n"].as_int().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 100]);
        assert!((record.result_percentage - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(record.extra_info["subtest-count"], Value::from(3));
        assert!(record.is_scenario());

        // Children hold their UUIDs until the caller drops the guards.
        assert_eq!(output.guards.len(), 3);
        assert_eq!(options.uuids.held_count(), 3);
        drop(output.guards);
        assert_eq!(options.uuids.held_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_stops_running_child() {
        let slow: Arc<dyn TestClass> = Arc::new(FixtureClass {
            script: Script {
                body_sleep: Some(Duration::from_secs(3)),
                ..Default::default()
            },
            ..Default::default()
        });
        let plan = FixturePlan {
            children: vec![slow; 5],
            follow_up: false,
        };
        let class = ScenarioClass::new(plan).with_timeout(Duration::from_secs(5));
        let record = run_test(TestUuid::new_v4(), &scenario_spec(class), options(), None, None)
            .await
            .record;

        assert_eq!(record.subtests.len(), 2);
        assert_eq!(record.subtests[0].result_percentage, 100.0);
        assert_eq!(
            record.subtests[1].extra_info["error-message"],
            Value::from("test run aborted")
        );
        assert_eq!(
            record.extra_info["error-message"],
            Value::from("test timed out")
        );
        // The aborted child did not time out, so it still scores 100%.
        assert_eq!(record.result_percentage, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_scenario_scores_zero() {
        let plan = FixturePlan {
            children: Vec::new(),
            follow_up: false,
        };
        let record = run_test(
            TestUuid::new_v4(),
            &scenario_spec(ScenarioClass::new(plan)),
            options(),
            None,
            None,
        )
        .await
        .record;
        assert_eq!(record.result_percentage, 0.0);
        assert_eq!(record.checklist.get("test-started"), Some(true));
    }
}
