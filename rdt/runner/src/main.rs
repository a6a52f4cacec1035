// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod config;
mod execute;

use clap::Parser;
use config::{ListOptions, ProcessArgs, RunOptions};
use rdt_framework::log_config::{LogConfig, LogFormat};
use rdt_framework::RunContext;
use tracing::{debug, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::execute::ExecutionStats;

fn main() -> anyhow::Result<()> {
    let runner_args = ProcessArgs::parse();
    set_tracing_subscriber(LogConfig::new(
        runner_args.emit_bunyan,
        runner_args.disable_ansi,
    ));

    info!(?runner_args);

    match &runner_args.command {
        config::Command::Run(opts) => {
            let exit_code = if run_scenarios(opts)?.scenarios_failed != 0 {
                1
            } else {
                0
            };
            debug!(exit_code);
            std::process::exit(exit_code);
        }
        config::Command::List(opts) => list_scenarios(opts),
    }

    Ok(())
}

fn run_scenarios(run_opts: &RunOptions) -> anyhow::Result<ExecutionStats> {
    let interrupted = execute::set_sigint_handler()?;
    let ctx = RunContext::start(run_opts.harness_parameters()?)?;

    // Run the scenarios, then release whatever the run is still holding
    // before printing results.
    let execution_stats =
        execute::run_scenarios_with_ctx(&ctx, run_opts, &interrupted);
    let cleanup = ctx.finish();
    if cleanup.failed != 0 {
        warn!(?cleanup, "run cleanup reported failures");
    }

    if !execution_stats.failed_scenarios.is_empty() {
        println!("\nfailures:");
        for sc in &execution_stats.failed_scenarios {
            println!("    {}", sc.fully_qualified_name());
        }
        println!();
    }

    println!(
        "test result: {}. {} passed; {} failed; {} skipped; {} not run; \
        finished in {:.2}s\n",
        if execution_stats.scenarios_failed != 0 { "FAILED" } else { "ok" },
        execution_stats.scenarios_passed,
        execution_stats.scenarios_failed,
        execution_stats.scenarios_skipped,
        execution_stats.scenarios_not_run,
        execution_stats.duration.as_secs_f64()
    );

    Ok(execution_stats)
}

fn list_scenarios(list_opts: &ListOptions) {
    println!("Scenarios enabled after applying filters:\n");

    let mut count = 0;
    for sc in rdt_tests::rdt_testcase::filtered_scenarios(
        &list_opts.include_filter,
        &list_opts.exclude_filter,
    ) {
        println!("    {}", sc.fully_qualified_name());
        count += 1
    }

    println!("\n{} scenario(s) selected", count);
}

fn set_tracing_subscriber(config: LogConfig) {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into());
    let subscriber = Registry::default().with(filter.from_env_lossy());
    match config.log_format {
        LogFormat::Bunyan => {
            let bunyan_layer = BunyanFormattingLayer::new(
                "rdt-runner".into(),
                std::io::stdout,
            );
            let subscriber =
                subscriber.with(JsonStorageLayer).with(bunyan_layer);
            tracing::subscriber::set_global_default(subscriber).unwrap();
        }
        LogFormat::Plain => {
            let stdout_log = tracing_subscriber::fmt::layer()
                .with_line_number(true)
                .with_ansi(config.ansi);
            let subscriber = subscriber.with(stdout_log);
            tracing::subscriber::set_global_default(subscriber).unwrap();
        }
    }
}
