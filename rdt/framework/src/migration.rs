// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driving the migration tool: redeploying a VM's workload as a
//! macrocontainer on another VM and finding out where both ended up.

use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    command::{CommandError, CommandRunner, HostCommand},
    vm::{RegistryError, VmRegistry},
};

/// The default command prefix used to invoke the migration tool.
pub const DEFAULT_MIGRATION_TOOL: &str = "sudo /usr/bin/python2 leapp-tool.py";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("migration tool command failed")]
    MigrationCommandFailed(#[source] CommandError),

    #[error("malformed machine listing from migration tool:\n{listing}")]
    MalformedListing {
        listing: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One machine in the migration tool's `list-machines` output.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawMachineRecord")]
pub struct MachineRecord {
    hostname: String,
    addresses: Vec<String>,
}

impl MachineRecord {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The machine's addresses. Never empty.
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    fn first_address(&self) -> &str {
        &self.addresses[0]
    }
}

#[derive(Deserialize)]
struct RawMachineRecord {
    hostname: String,
    ip: Vec<String>,
}

impl TryFrom<RawMachineRecord> for MachineRecord {
    type Error = String;

    fn try_from(raw: RawMachineRecord) -> Result<Self, Self::Error> {
        if raw.ip.is_empty() {
            return Err(format!("machine {} has no addresses", raw.hostname));
        }

        Ok(Self { hostname: raw.hostname, addresses: raw.ip })
    }
}

#[derive(Deserialize)]
struct MachineListing {
    machines: Vec<MachineRecord>,
}

/// Parses the JSON printed by `list-machines`.
pub fn parse_listing(
    output: &str,
) -> Result<Vec<MachineRecord>, MigrationError> {
    serde_json::from_str::<MachineListing>(output)
        .map(|listing| listing.machines)
        .map_err(|source| MigrationError::MalformedListing {
            listing: output.to_owned(),
            source,
        })
}

/// Details of the local hosts involved in a migration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationResult {
    local_vm_count: usize,
    source_addr: Option<String>,
    target_addr: Option<String>,
}

impl MigrationResult {
    /// Builds a result from a machine listing. The source and target
    /// addresses are the first addresses listed for the matching hostnames,
    /// or `None` if a hostname isn't in the listing.
    pub fn from_listing(
        machines: &[MachineRecord],
        source_host: &str,
        target_host: &str,
    ) -> Self {
        let mut source_addr = None;
        let mut target_addr = None;
        for machine in machines {
            if machine.hostname() == source_host {
                source_addr = Some(machine.first_address().to_owned());
            }
            if machine.hostname() == target_host {
                target_addr = Some(machine.first_address().to_owned());
            }
            if source_addr.is_some() && target_addr.is_some() {
                break;
            }
        }

        Self { local_vm_count: machines.len(), source_addr, target_addr }
    }

    /// The number of VMs the migration tool could see.
    pub fn local_vm_count(&self) -> usize {
        self.local_vm_count
    }

    /// The host-reachable address of the source VM, if it was listed.
    pub fn source_addr(&self) -> Option<&str> {
        self.source_addr.as_deref()
    }

    /// The host-reachable address of the target VM, if it was listed.
    pub fn target_addr(&self) -> Option<&str> {
        self.target_addr.as_deref()
    }
}

/// How to invoke the migration tool.
#[derive(Clone, Debug)]
pub struct MigrationTool {
    /// The command prefix, including any privilege elevation. Subcommands
    /// are appended to it.
    pub command: HostCommand,

    /// The directory the tool is run from.
    pub work_dir: Utf8PathBuf,
}

/// Runs the migration tool against VMs held by a [`VmRegistry`].
pub struct MigrationOrchestrator {
    runner: Arc<dyn CommandRunner>,
    registry: Arc<VmRegistry>,
    tool: MigrationTool,
}

impl MigrationOrchestrator {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        registry: Arc<VmRegistry>,
        tool: MigrationTool,
    ) -> Self {
        Self { runner, registry, tool }
    }

    /// Recreates the workload of the VM named `source_vm` as a
    /// macrocontainer on the VM named `target_vm`, then reports where the
    /// two VMs can be reached.
    pub fn redeploy_as_container(
        &self,
        source_vm: &str,
        target_vm: &str,
    ) -> Result<MigrationResult, MigrationError> {
        let source_host = self.registry.hostname_of(source_vm)?;
        let target_host = self.registry.hostname_of(target_vm)?;

        self.run_tool(["migrate-machine", "-t", &target_host, &source_host])?;
        info!(
            %source_host,
            %target_host,
            "Redeployed {} as macrocontainer on {}",
            source_host,
            target_host
        );

        let listing = self.run_tool(["list-machines", "--shallow"])?;
        debug!(%listing, "machine listing");
        let machines = parse_listing(&listing)?;
        Ok(MigrationResult::from_listing(&machines, &source_host, &target_host))
    }

    fn run_tool<const N: usize>(
        &self,
        args: [&str; N],
    ) -> Result<String, MigrationError> {
        let cmd = self.tool.command.clone().args(args);
        self.runner
            .run(&cmd, &self.tool.work_dir, false)
            .map_err(MigrationError::MigrationCommandFailed)
    }
}
