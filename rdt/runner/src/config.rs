// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use rdt_framework::{
    command::HostCommand,
    migration::DEFAULT_MIGRATION_TOOL,
    vm::{DEFAULT_HOSTNAME_PREFIX, DEFAULT_VM_BACKEND},
    HarnessParameters,
};

#[derive(Debug, Subcommand)]
pub enum Command {
    Run(RunOptions),
    List(ListOptions),
}

/// Runtime configuration options for the runner.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
pub struct ProcessArgs {
    #[clap(subcommand)]
    pub command: Command,

    /// Suppress emission of terminal control codes in the runner's log output.
    #[clap(long, conflicts_with = "emit_bunyan")]
    pub disable_ansi: bool,

    /// Emit Bunyan-formatted logs.
    #[clap(long)]
    pub emit_bunyan: bool,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct RunOptions {
    /// The directory containing VM definitions. Each subdirectory is one
    /// definition, named after the subdirectory.
    #[clap(long, value_parser)]
    pub vm_definitions_dir: Utf8PathBuf,

    /// The prefix prepended to a VM definition's name to form the hostname
    /// of VMs built from it.
    #[clap(long, default_value = DEFAULT_HOSTNAME_PREFIX)]
    pub hostname_prefix: String,

    /// The program used to bring VMs up, halt them, and destroy them. It is
    /// run from each VM definition's directory.
    #[clap(long, default_value = DEFAULT_VM_BACKEND)]
    pub vm_backend: String,

    /// The command line used to invoke the migration tool, including any
    /// privilege elevation. Subcommands are appended to it.
    #[clap(long, default_value = DEFAULT_MIGRATION_TOOL)]
    pub migration_tool_cmd: String,

    /// The directory from which the migration tool is run.
    #[clap(long, value_parser)]
    pub migration_work_dir: Utf8PathBuf,

    /// The command used to check for elevated privileges before any
    /// scenario runs.
    #[clap(long, default_value = "sudo")]
    pub elevate_cmd: String,

    /// Skip the elevated privilege check at the start of the run.
    #[clap(long)]
    pub skip_elevation_check: bool,

    /// Leave each scenario's VMs running until the whole run finishes
    /// instead of halting or destroying them when the scenario ends.
    ///
    /// VMs are slow to start and stop, so this can make interactive runs
    /// quicker.
    #[clap(long)]
    pub defer_vm_cleanup: bool,

    /// Only run scenarios whose fully-qualified names contain this string.
    /// Can be specified multiple times.
    #[clap(long, value_parser)]
    pub include_filter: Vec<String>,

    /// Only run scenarios whose fully-qualified names do not contain this
    /// string. Can be specified multiple times.
    #[clap(long, value_parser)]
    pub exclude_filter: Vec<String>,
}

impl RunOptions {
    pub fn harness_parameters(&self) -> anyhow::Result<HarnessParameters> {
        let migration_tool =
            HostCommand::from_command_line(&self.migration_tool_cmd)
                .context("migration tool command is empty")?;

        Ok(HarnessParameters {
            vm_definitions_dir: self.vm_definitions_dir.clone(),
            hostname_prefix: self.hostname_prefix.clone(),
            vm_backend: self.vm_backend.clone(),
            migration_tool,
            migration_work_dir: self.migration_work_dir.clone(),
            elevate_cmd: (!self.skip_elevation_check)
                .then(|| self.elevate_cmd.clone()),
            eager_vm_cleanup: !self.defer_vm_cleanup,
        })
    }
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct ListOptions {
    /// Only list scenarios whose fully-qualified names contain this string.
    /// Can be specified multiple times.
    #[clap(long, value_parser)]
    pub include_filter: Vec<String>,

    /// Only list scenarios whose fully-qualified names do not contain this
    /// string. Can be specified multiple times.
    #[clap(long, value_parser)]
    pub exclude_filter: Vec<String>,
}
