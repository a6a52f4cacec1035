// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run-wide and per-scenario state.
//!
//! A test run creates one [`RunContext`] before any scenario runs and
//! finishes it after the last one. Each scenario gets a fresh
//! [`ScenarioContext`] with its own VM registry and teardown stack; the
//! scenario's stack is always unwound before the scenario's outcome is
//! reported.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use tracing::{info, info_span};
use uuid::Uuid;

use crate::{
    command::{CommandRunner, HostCommand, HostCommandRunner},
    http::ServicePoller,
    lifecycle::{LifecycleStack, UnwindReport},
    migration::{MigrationOrchestrator, MigrationTool},
    vm::{VmDefinitions, VmRegistry},
};

/// Parameters that apply to every scenario in a run.
#[derive(Clone, Debug)]
pub struct HarnessParameters {
    /// The directory whose subdirectories are VM definitions.
    pub vm_definitions_dir: Utf8PathBuf,

    /// The prefix that turns a VM definition name into a hostname.
    pub hostname_prefix: String,

    /// The program used to bring VMs up, halt them, and destroy them.
    pub vm_backend: String,

    /// The command prefix used to run the migration tool.
    pub migration_tool: HostCommand,

    /// The directory from which to run the migration tool.
    pub migration_work_dir: Utf8PathBuf,

    /// The command used to obtain elevated privileges, e.g. `sudo`. If set,
    /// the run fails up front unless the command works.
    pub elevate_cmd: Option<String>,

    /// If true, each scenario's VMs are halted or destroyed when the
    /// scenario ends. Otherwise they're left running until the end of the
    /// run, since VMs are slow to start and stop.
    pub eager_vm_cleanup: bool,
}

/// State shared by every scenario in a run.
pub struct RunContext {
    id: Uuid,
    params: HarnessParameters,
    runner: Arc<dyn CommandRunner>,
    definitions: VmDefinitions,
    http: ServicePoller,
    cleanup: LifecycleStack,
}

impl RunContext {
    /// Prepares for a test run that drives real host commands.
    pub fn start(params: HarnessParameters) -> anyhow::Result<Self> {
        Self::start_with_runner(params, Arc::new(HostCommandRunner))
    }

    /// Prepares for a test run: discovers VM definitions and makes sure
    /// elevated privileges are available, so that the run doesn't stop
    /// midway through to prompt for them.
    pub fn start_with_runner(
        params: HarnessParameters,
        runner: Arc<dyn CommandRunner>,
    ) -> anyhow::Result<Self> {
        let id = Uuid::new_v4();
        let _span = info_span!("run", %id).entered();

        let definitions = VmDefinitions::discover(
            &params.vm_definitions_dir,
            &params.hostname_prefix,
        )?;

        if let Some(elevate) = &params.elevate_cmd {
            let cmd = HostCommand::new(elevate)
                .args(["echo", "Elevated permissions needed"]);
            runner
                .run(&cmd, &params.migration_work_dir, false)
                .with_context(|| {
                    format!(
                        "failed to obtain elevated permissions via {elevate}"
                    )
                })?;
        }

        let http =
            ServicePoller::new().context("failed to build HTTP client")?;

        info!(%id, definitions = definitions.len(), "test run started");
        Ok(Self {
            id,
            params,
            runner,
            definitions,
            http,
            cleanup: LifecycleStack::new("run"),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn definitions(&self) -> &VmDefinitions {
        &self.definitions
    }

    /// Registers an action to run when the test run ends.
    pub fn defer<F>(&self, description: impl Into<String>, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.cleanup.register(description, action);
    }

    /// Creates the context for a new scenario.
    pub fn start_scenario(&self, name: &str) -> ScenarioContext {
        let vms = Arc::new(VmRegistry::new(
            self.runner.clone(),
            self.definitions.clone(),
            self.params.vm_backend.clone(),
        ));

        let migration = MigrationOrchestrator::new(
            self.runner.clone(),
            vms.clone(),
            MigrationTool {
                command: self.params.migration_tool.clone(),
                work_dir: self.params.migration_work_dir.clone(),
            },
        );

        let cleanup = LifecycleStack::new(format!("scenario {name}"));

        // The run-wide stack always gets a chance to clean up the
        // scenario's VMs. With eager cleanup the scenario's stack owns the
        // registry, so it's gone (and its VMs released) by the time the run
        // ends and the run-wide action has nothing to do.
        if self.params.eager_vm_cleanup {
            let scenario_vms = vms.clone();
            cleanup.register("close scenario VMs", move || {
                scenario_vms.close_all();
                Ok(())
            });

            let run_vms = Arc::downgrade(&vms);
            self.cleanup.register(format!("close VMs from {name}"), move || {
                if let Some(vms) = run_vms.upgrade() {
                    vms.close_all();
                }
                Ok(())
            });
        } else {
            let run_vms = vms.clone();
            self.cleanup.register(format!("close VMs from {name}"), move || {
                run_vms.close_all();
                Ok(())
            });
        }

        ScenarioContext {
            name: name.to_owned(),
            vms,
            migration,
            http: self.http.clone(),
            cleanup,
        }
    }

    /// Ends the test run, releasing everything registered for cleanup.
    pub fn finish(self) -> UnwindReport {
        let report = self.cleanup.unwind();
        info!(id = %self.id, ?report, "test run finished");
        report
    }
}

/// The resources available to a single scenario.
pub struct ScenarioContext {
    name: String,
    vms: Arc<VmRegistry>,
    migration: MigrationOrchestrator,
    http: ServicePoller,
    cleanup: LifecycleStack,
}

impl ScenarioContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vms(&self) -> &VmRegistry {
        &self.vms
    }

    pub fn migration(&self) -> &MigrationOrchestrator {
        &self.migration
    }

    pub fn http(&self) -> &ServicePoller {
        &self.http
    }

    /// Registers an action to run when this scenario ends, whether or not it
    /// passes.
    pub fn defer<F>(&self, description: impl Into<String>, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.cleanup.register(description, action);
    }

    /// Ends the scenario, running its teardown actions.
    pub fn finish(self) -> UnwindReport {
        self.cleanup.unwind()
    }
}
