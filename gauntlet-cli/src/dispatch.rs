// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    compare::{Change, ComparedTest, compare},
    errors::{ExpectedError, GauntletExitCode, Result},
    output::{OutputContext, OutputOpts, Styles},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use gauntlet_metadata::ArgumentValues;
use gauntlet_store::{Store, StoreError, TestFilter, TestId, TestRunId, TestRunInfo};
use owo_colors::OwoColorize;
use swrite::{SWrite, swrite, swriteln};
use tracing::info;

/// Inspect, compare and merge gauntlet result stores.
#[derive(Debug, Parser)]
#[command(version, name = "gauntlet")]
pub struct GauntletApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(subcommand)]
    command: Command,
}

impl GauntletApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, appending the report to `out`.
    ///
    /// Returns the exit code.
    pub fn exec(self, output: OutputContext, out: &mut String) -> Result<i32> {
        let styles = output.stdout_styles();
        match self.command {
            Command::List { db } => {
                let store = open_store(&db)?;
                list(&store, &styles, out)?;
                Ok(GauntletExitCode::OK)
            }
            Command::Dump { db, testrun, filter } => {
                let store = open_store(&db)?;
                let testruns = match testrun {
                    Some(id) => vec![check_testrun(&store, &db, TestRunId(id))?],
                    None => store
                        .list_testruns()
                        .map_err(ExpectedError::store("failed to list testruns"))?,
                };
                for testrun in testruns {
                    dump(&store, testrun, filter.to_filter(), &styles, out)?;
                }
                Ok(GauntletExitCode::OK)
            }
            Command::Compare { db, old, new } => {
                let store = open_store(&db)?;
                let old = check_testrun(&store, &db, TestRunId(old))?;
                let new = check_testrun(&store, &db, TestRunId(new))?;
                let comparison = compare(&store, old, new)
                    .map_err(ExpectedError::store("failed to compare testruns"))?;
                write_comparison(&comparison.tests, &styles, out);
                if comparison.is_clean() {
                    Ok(GauntletExitCode::OK)
                } else {
                    Ok(GauntletExitCode::REGRESSIONS_FOUND)
                }
            }
            Command::Merge {
                source,
                dest,
                testruns,
            } => {
                let source_store = open_store(&source)?;
                let mut dest_store = open_store(&dest)?;
                let testruns = if testruns.is_empty() {
                    source_store
                        .list_testruns()
                        .map_err(ExpectedError::store("failed to list testruns"))?
                } else {
                    testruns
                        .into_iter()
                        .map(|id| check_testrun(&source_store, &source, TestRunId(id)))
                        .collect::<Result<Vec<_>>>()?
                };
                for testrun in testruns {
                    let merged = dest_store
                        .merge_testrun(&source_store, testrun)
                        .map_err(|err| ExpectedError::Merge { testrun, err })?;
                    info!("merged testrun {testrun} into {dest} as testrun {merged}");
                    swriteln!(out, "{testrun} -> {merged}");
                }
                Ok(GauntletExitCode::OK)
            }
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the testruns of a store
    List {
        /// Path to the result store
        db: Utf8PathBuf,
    },

    /// Print the tests of one testrun, or of every testrun
    Dump {
        /// Path to the result store
        db: Utf8PathBuf,

        /// The testrun to print [default: all]
        testrun: Option<i64>,

        #[clap(flatten)]
        filter: DumpFilter,
    },

    /// Compare two testruns of a store
    ///
    /// Tests are matched by class, arguments and attached monitors. Exits with
    /// code 1 if a test regressed or is missing from the new run.
    Compare {
        /// Path to the result store
        db: Utf8PathBuf,

        /// The baseline testrun
        old: i64,

        /// The testrun to check against the baseline
        new: i64,
    },

    /// Copy testruns from one store into another
    Merge {
        /// The store to copy from
        source: Utf8PathBuf,

        /// The store to copy into; created if missing
        dest: Utf8PathBuf,

        /// The testruns to copy [default: all]
        testruns: Vec<i64>,
    },
}

#[derive(Copy, Clone, Debug, Args)]
struct DumpFilter {
    /// Only print tests below 100%
    #[arg(long)]
    failed: bool,

    /// Leave out scenarios, printing only their subtests
    #[arg(long)]
    no_scenarios: bool,
}

impl DumpFilter {
    fn to_filter(self) -> TestFilter {
        TestFilter {
            only_failed: self.failed,
            exclude_scenarios: self.no_scenarios,
        }
    }
}

fn open_store(path: &Utf8Path) -> Result<Store> {
    Store::open(path).map_err(|err| ExpectedError::store_open(path, err))
}

fn check_testrun(store: &Store, path: &Utf8Path, testrun: TestRunId) -> Result<TestRunId> {
    match store.testrun_info(testrun) {
        Ok(_) => Ok(testrun),
        Err(StoreError::MissingTestRun(_)) => Err(ExpectedError::TestRunNotFound {
            path: path.to_owned(),
            testrun,
        }),
        Err(err) => Err(ExpectedError::store("failed to read testrun")(err)),
    }
}

fn list(store: &Store, styles: &Styles, out: &mut String) -> Result<()> {
    let testruns = store
        .list_testruns()
        .map_err(ExpectedError::store("failed to list testruns"))?;
    for testrun in testruns {
        let info = store
            .testrun_info(testrun)
            .map_err(ExpectedError::store("failed to read testrun"))?;
        let tests = store
            .list_tests(testrun, TestFilter::default())
            .map_err(ExpectedError::store("failed to list tests"))?;
        swrite!(out, "{:>5}  ", testrun.style(styles.bold));
        write_run_times(&info, out);
        swriteln!(out, "  {} tests  {}", tests.len(), info.client);
    }
    Ok(())
}

fn write_run_times(info: &TestRunInfo, out: &mut String) {
    let start = info.start_time.format("%Y-%m-%d %H:%M:%S");
    match info.stop_time {
        Some(stop) => {
            let secs = (stop - info.start_time).num_seconds();
            swrite!(out, "{start}  {secs:>6}s");
        }
        None => swrite!(out, "{start}  (unfinished)"),
    }
}

fn dump(
    store: &Store,
    testrun: TestRunId,
    filter: TestFilter,
    styles: &Styles,
    out: &mut String,
) -> Result<()> {
    let info = store
        .testrun_info(testrun)
        .map_err(ExpectedError::store("failed to read testrun"))?;
    swrite!(out, "{} {}: ", "testrun".style(styles.bold), testrun);
    write_run_times(&info, out);
    swriteln!(out, "  {}", info.client);

    let environment = store
        .testrun_environment(testrun)
        .map_err(ExpectedError::store("failed to read testrun environment"))?;
    for (name, value) in &environment {
        swriteln!(out, "  {} {name}={value}", "env".style(styles.dimmed));
    }

    let tests = store
        .list_tests(testrun, filter)
        .map_err(ExpectedError::store("failed to list tests"))?;
    for test in tests {
        dump_test(store, test, styles, out)?;
    }
    Ok(())
}

fn dump_test(store: &Store, test: TestId, styles: &Styles, out: &mut String) -> Result<()> {
    let Some(info) = store
        .test_info(test)
        .map_err(ExpectedError::store("failed to read test"))?
    else {
        return Ok(());
    };
    let percentage_style = if info.result_percentage >= 100.0 {
        styles.pass
    } else {
        styles.fail
    };
    swriteln!(
        out,
        "  test {} {} {}",
        test,
        info.class.style(styles.bold),
        format!("{:.1}%", info.result_percentage).style(percentage_style),
    );
    if !info.arguments.is_empty() {
        swriteln!(out, "    arguments: {}", DisplayArguments(&info.arguments));
    }
    for entry in info.checklist.iter() {
        let (label, style) = if entry.passed {
            ("pass", styles.pass)
        } else {
            ("fail", styles.fail)
        };
        swriteln!(out, "    [{}] {}", label.style(style), entry.name);
    }
    for (key, value) in &info.extra_info {
        swriteln!(out, "    {key}: {value}");
    }
    for (key, path) in &info.output_files {
        swriteln!(out, "    {} {key}: {path}", "output".style(styles.dimmed));
    }

    let subtests = store
        .subtests(test)
        .map_err(ExpectedError::store("failed to read subtests"))?;
    if !subtests.is_empty() {
        let ids: Vec<_> = subtests.iter().map(TestId::to_string).collect();
        swriteln!(out, "    subtests: {}", ids.join(", "));
    }

    let monitors = store
        .monitors_for_test(test)
        .map_err(ExpectedError::store("failed to read monitors"))?;
    for monitor in monitors {
        let Some(monitor) = store
            .monitor_info(monitor)
            .map_err(ExpectedError::store("failed to read monitor"))?
        else {
            continue;
        };
        swriteln!(
            out,
            "    monitor {} {:.1}%",
            monitor.class.style(styles.bold),
            monitor.result_percentage,
        );
        for entry in monitor.checklist.iter() {
            let label = if entry.passed { "pass" } else { "fail" };
            swriteln!(out, "      [{label}] {}", entry.name);
        }
        for (key, value) in &monitor.extra_info {
            swriteln!(out, "      {key}: {value}");
        }
    }
    Ok(())
}

fn write_comparison(tests: &[ComparedTest], styles: &Styles, out: &mut String) {
    let mut counts = [0usize; 5];
    for test in tests {
        let (index, line) = match test.change {
            Change::New { new } => (0, format!("{} ({new:.1}%)", "new".style(styles.new))),
            Change::Removed { old } => (
                1,
                format!("{} (was {old:.1}%)", "removed".style(styles.removed)),
            ),
            Change::Regressed { old, new } => (
                2,
                format!("{} {old:.1}% -> {new:.1}%", "regressed".style(styles.fail)),
            ),
            Change::Improved { old, new } => (
                3,
                format!("{} {old:.1}% -> {new:.1}%", "improved".style(styles.pass)),
            ),
            Change::Unchanged { .. } => (4, String::new()),
        };
        counts[index] += 1;
        if !line.is_empty() {
            swriteln!(
                out,
                "{line}  {} {}",
                test.class.style(styles.bold),
                DisplayArguments(&test.arguments),
            );
        }
    }
    let [new, removed, regressed, improved, unchanged] = counts;
    swriteln!(
        out,
        "{new} new, {removed} removed, {regressed} regressed, {improved} improved, {unchanged} unchanged"
    );
}

struct DisplayArguments<'a>(&'a ArgumentValues);

impl std::fmt::Display for DisplayArguments<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (index, (name, value)) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}
