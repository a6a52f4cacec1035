// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rdt_framework::RunContext;
use rdt_tests::rdt_testcase::{Scenario, ScenarioOutcome};
use tracing::{error, info, info_span, warn};

use crate::config::RunOptions;

/// Statistics returned after executing a set of scenarios.
pub struct ExecutionStats {
    /// The number of scenarios that passed.
    pub scenarios_passed: u32,

    /// The number of scenarios that failed.
    pub scenarios_failed: u32,

    /// The number of scenarios that marked themselves as skipped.
    pub scenarios_skipped: u32,

    /// The number of scenarios that the runner decided not to run (e.g.
    /// because the run was interrupted).
    pub scenarios_not_run: u32,

    /// The total time spent running scenarios, including each scenario's
    /// cleanup.
    pub duration: Duration,

    /// A collection of scenarios that returned a failed result.
    pub failed_scenarios: Vec<&'static Scenario>,
}

/// Executes the selected scenarios one at a time using the supplied run
/// context. Stops starting new scenarios once `interrupted` is set.
pub fn run_scenarios_with_ctx(
    ctx: &RunContext,
    run_opts: &RunOptions,
    interrupted: &AtomicBool,
) -> ExecutionStats {
    let executions: Vec<&'static Scenario> =
        rdt_tests::rdt_testcase::filtered_scenarios(
            &run_opts.include_filter,
            &run_opts.exclude_filter,
        )
        .collect();

    let mut stats = ExecutionStats {
        scenarios_passed: 0,
        scenarios_failed: 0,
        scenarios_skipped: 0,
        scenarios_not_run: executions.len() as u32,
        duration: Duration::default(),
        failed_scenarios: Vec::new(),
    };

    if executions.is_empty() {
        info!("No scenarios selected for execution");
        return stats;
    }

    info!("Running {} scenario(s)", executions.len());
    let start_time = Instant::now();
    for sc in executions {
        if interrupted.load(Ordering::SeqCst) {
            info!("Test run interrupted by SIGINT");
            break;
        }

        let name = sc.fully_qualified_name();
        let _span = info_span!("scenario", %name).entered();
        info!("Starting scenario {}", name);
        stats.scenarios_not_run -= 1;

        let scenario_ctx = ctx.start_scenario(sc.name());
        let outcome = sc.run(&scenario_ctx);
        let cleanup = scenario_ctx.finish();
        if cleanup.failed != 0 {
            warn!(?cleanup, "scenario cleanup reported failures");
        }

        info!(
            "scenario {} ... {}{}",
            name,
            match outcome {
                ScenarioOutcome::Passed => "ok",
                ScenarioOutcome::Failed(_) => "FAILED: ",
                ScenarioOutcome::Skipped(_) => "skipped: ",
            },
            match &outcome {
                ScenarioOutcome::Failed(Some(s))
                | ScenarioOutcome::Skipped(Some(s)) => s,
                ScenarioOutcome::Failed(None)
                | ScenarioOutcome::Skipped(None) => "[no message]",
                _ => "",
            }
        );

        match outcome {
            ScenarioOutcome::Passed => stats.scenarios_passed += 1,
            ScenarioOutcome::Failed(_) => {
                stats.scenarios_failed += 1;
                stats.failed_scenarios.push(sc);
            }
            ScenarioOutcome::Skipped(_) => stats.scenarios_skipped += 1,
        }
    }

    stats.duration = start_time.elapsed();
    stats
}

/// Sets a global handler for SIGINT. Returns a flag that the handler sets
/// when the first SIGINT arrives.
pub fn set_sigint_handler() -> anyhow::Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        // If a signal was already received, exit immediately with the
        // customary SIGINT exit code (130 is 128 + SIGINT). This lets users
        // stop a scenario that is stuck on a blocking call, at the cost of
        // not running any cleanup.
        if flag.swap(true, Ordering::SeqCst) {
            error!("SIGINT received while shutting down, rudely terminating");
            error!("some VMs may have been leaked!");
            std::process::exit(130);
        }

        warn!("SIGINT received, no further scenarios will be started");
    })?;

    Ok(interrupted)
}
