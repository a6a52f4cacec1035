// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Leasing local VMs from the VM backend (e.g. Vagrant).
//!
//! Scenarios refer to VMs by short logical names ("source", "target"). The
//! [`VmRegistry`] maps each name to the backing VM's hostname, brings the VM
//! up with the backend CLI, and registers the action that halts or destroys
//! it when the registry is closed.

use std::{
    collections::{btree_map, BTreeMap},
    fmt,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::info;

use crate::{
    command::{CommandError, CommandRunner, HostCommand},
    lifecycle::{LifecycleStack, UnwindReport},
};

/// The prefix prepended to a VM definition's name to form the backing VM's
/// hostname.
pub const DEFAULT_HOSTNAME_PREFIX: &str = "leapp-tests-";

/// The default program used to drive local VMs.
pub const DEFAULT_VM_BACKEND: &str = "vagrant";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown VM definition: {0}")]
    UnknownDefinition(String),

    #[error("no VM named {0:?} is held by this scenario")]
    UnknownMachine(String),

    #[error(
        "VM name {name:?} is already bound to {existing}, can't rebind it to \
        {requested}"
    )]
    NameConflict { name: String, existing: String, requested: String },

    #[error(
        "{hostname} is already held as {held_by:?}, can't also name it \
        {name:?}"
    )]
    DefinitionInUse { hostname: String, held_by: String, name: String },

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// A directory containing a VM backend definition (e.g. a Vagrantfile).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmDefinition {
    id: String,
    hostname: String,
    directory: Utf8PathBuf,
}

impl VmDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The hostname the backend gives VMs created from this definition.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The directory from which backend commands for this VM are run.
    pub fn directory(&self) -> &Utf8Path {
        &self.directory
    }
}

/// The set of VM definitions available to a test run.
#[derive(Clone, Debug)]
pub struct VmDefinitions {
    hostname_prefix: String,
    definitions: BTreeMap<String, VmDefinition>,
}

impl VmDefinitions {
    pub fn new(hostname_prefix: impl Into<String>) -> Self {
        Self {
            hostname_prefix: hostname_prefix.into(),
            definitions: BTreeMap::new(),
        }
    }

    /// Builds a definition set from the immediate subdirectories of `root`.
    /// Each subdirectory's name is a definition ID.
    pub fn discover(
        root: &Utf8Path,
        hostname_prefix: &str,
    ) -> anyhow::Result<Self> {
        let mut definitions = Self::new(hostname_prefix);
        for entry in root
            .read_dir_utf8()
            .with_context(|| format!("reading VM definitions from {root}"))?
        {
            let entry = entry
                .with_context(|| format!("reading entry in {root}"))?;
            if entry.path().is_dir() {
                definitions.insert(entry.file_name(), entry.path());
            }
        }

        info!(%root, count = definitions.len(), "discovered VM definitions");
        Ok(definitions)
    }

    pub fn insert(&mut self, id: &str, directory: impl Into<Utf8PathBuf>) {
        let definition = VmDefinition {
            id: id.to_owned(),
            hostname: format!("{}{}", self.hostname_prefix, id),
            directory: directory.into(),
        };
        self.definitions.insert(id.to_owned(), definition);
    }

    pub fn get(&self, id: &str) -> Option<&VmDefinition> {
        self.definitions.get(id)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmDefinition> {
        self.definitions.values()
    }
}

/// The lifecycle state of a logical VM within a registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineState {
    /// The name has never been acquired.
    Unprovisioned,
    Running,
    Halted,
    Destroyed,
}

/// What to do with a VM when its registry is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Release {
    Halt,
    Destroy,
}

impl Release {
    fn verb(self) -> &'static str {
        match self {
            Release::Halt => "halt",
            Release::Destroy => "destroy",
        }
    }

    fn final_state(self) -> MachineState {
        match self {
            Release::Halt => MachineState::Halted,
            Release::Destroy => MachineState::Destroyed,
        }
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

#[derive(Debug)]
struct ManagedMachine {
    definition: VmDefinition,
    release: Release,
}

#[derive(Debug, Default)]
struct Machines {
    live: BTreeMap<String, ManagedMachine>,

    /// The final state of every machine that has been released, by name.
    released: BTreeMap<String, MachineState>,
}

/// Runs VM backend subcommands in a definition's directory.
struct VmBackend {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl VmBackend {
    fn run(
        &self,
        definition: &VmDefinition,
        verb: &str,
        ignore_errors: bool,
    ) -> Result<String, CommandError> {
        let cmd = HostCommand::new(&self.program).arg(verb);
        self.runner.run(&cmd, definition.directory(), ignore_errors)
    }
}

/// Tracks the VMs a scenario has acquired.
///
/// Every VM brought up through [`VmRegistry::ensure_vm`] has a matching
/// teardown action on the registry's own [`LifecycleStack`]. Closing the
/// registry (explicitly or by dropping it) halts or destroys each VM exactly
/// once, most recently acquired first.
pub struct VmRegistry {
    definitions: VmDefinitions,
    backend: Arc<VmBackend>,
    machines: Arc<Mutex<Machines>>,
    teardown: LifecycleStack,
}

impl VmRegistry {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        definitions: VmDefinitions,
        backend_program: impl Into<String>,
    ) -> Self {
        Self {
            definitions,
            backend: Arc::new(VmBackend {
                runner,
                program: backend_program.into(),
            }),
            machines: Arc::new(Mutex::new(Machines::default())),
            teardown: LifecycleStack::new("vm-registry"),
        }
    }

    /// Ensures a VM built from `definition_id` is running and can be referred
    /// to as `name`.
    ///
    /// If `destroy` is set, any existing VM for the definition is destroyed
    /// before being brought up again, and the VM is destroyed (rather than
    /// halted) when the registry is closed.
    pub fn ensure_vm(
        &self,
        name: &str,
        definition_id: &str,
        destroy: bool,
    ) -> Result<(), RegistryError> {
        let definition = self
            .definitions
            .get(definition_id)
            .ok_or_else(|| {
                RegistryError::UnknownDefinition(definition_id.to_owned())
            })?
            .clone();
        let hostname = definition.hostname().to_owned();
        let release = if destroy { Release::Destroy } else { Release::Halt };

        {
            let machines = self.machines.lock().unwrap();
            if let Some(existing) = machines.live.get(name) {
                if existing.definition.hostname() != hostname {
                    return Err(RegistryError::NameConflict {
                        name: name.to_owned(),
                        existing: existing.definition.hostname().to_owned(),
                        requested: hostname,
                    });
                }
            }

            // One backend machine per definition, so a second name would
            // release it twice.
            if let Some((held_by, _)) = machines.live.iter().find(|(n, m)| {
                n.as_str() != name && m.definition.hostname() == hostname
            }) {
                return Err(RegistryError::DefinitionInUse {
                    hostname,
                    held_by: held_by.clone(),
                    name: name.to_owned(),
                });
            }
        }

        if destroy {
            // A VM left over from an earlier run may or may not exist; either
            // way there's nothing to report.
            self.backend.run(&definition, "destroy", true)?;
            info!(%hostname, "Destroyed stale VM instance (if any)");
        }

        // Bind the name and register its teardown before bringing the VM up
        // so that a partially started VM is still cleaned up.
        let newly_acquired = {
            let mut machines = self.machines.lock().unwrap();
            machines.released.remove(name);
            match machines.live.entry(name.to_owned()) {
                btree_map::Entry::Occupied(mut entry) => {
                    let machine = entry.get_mut();
                    machine.release = machine.release.max(release);
                    false
                }
                btree_map::Entry::Vacant(entry) => {
                    entry.insert(ManagedMachine {
                        definition: definition.clone(),
                        release,
                    });
                    true
                }
            }
        };

        if newly_acquired {
            let machines = self.machines.clone();
            let backend = self.backend.clone();
            let vm_name = name.to_owned();
            self.teardown.register(
                format!("release VM {name} ({hostname})"),
                move || release_machine(&machines, &backend, &vm_name),
            );
        }

        self.backend.run(&definition, "up", false)?;
        info!(vm_name = name, %hostname, "Started VM instance");
        Ok(())
    }

    /// Returns the hostname of the VM acquired as `name`.
    pub fn hostname_of(&self, name: &str) -> Result<String, RegistryError> {
        self.machines
            .lock()
            .unwrap()
            .live
            .get(name)
            .map(|machine| machine.definition.hostname().to_owned())
            .ok_or_else(|| RegistryError::UnknownMachine(name.to_owned()))
    }

    /// The VM definitions this registry can acquire VMs from.
    pub fn definitions(&self) -> &VmDefinitions {
        &self.definitions
    }

    pub fn state_of(&self, name: &str) -> MachineState {
        let machines = self.machines.lock().unwrap();
        if machines.live.contains_key(name) {
            MachineState::Running
        } else {
            machines
                .released
                .get(name)
                .copied()
                .unwrap_or(MachineState::Unprovisioned)
        }
    }

    /// Halts or destroys every VM this registry holds. Calling this again
    /// does nothing unless more VMs have been acquired in the meantime.
    pub fn close_all(&self) -> UnwindReport {
        self.teardown.unwind()
    }
}

impl Drop for VmRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Halts or destroys the VM bound to `name`, unbinding it first. Backend
/// failures are ignored: a VM that's already gone is as good as released.
fn release_machine(
    machines: &Mutex<Machines>,
    backend: &VmBackend,
    name: &str,
) -> anyhow::Result<()> {
    let Some(machine) = machines.lock().unwrap().live.remove(name) else {
        return Ok(());
    };

    let hostname = machine.definition.hostname();
    let result = backend.run(&machine.definition, machine.release.verb(), true);
    machines
        .lock()
        .unwrap()
        .released
        .insert(name.to_owned(), machine.release.final_state());

    result.with_context(|| {
        format!("failed to {} VM instance {hostname}", machine.release)
    })?;

    match machine.release {
        Release::Halt => {
            info!(vm_name = name, %hostname, "Suspended VM instance")
        }
        Release::Destroy => {
            info!(vm_name = name, %hostname, "Destroyed VM instance")
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::command::MockCommandRunner;

    /// A command runner that records every command it is asked to run and
    /// reports success.
    #[derive(Default)]
    pub(crate) struct RecordingRunner {
        pub(crate) calls: Mutex<Vec<(String, Utf8PathBuf, bool)>>,
    }

    impl RecordingRunner {
        pub(crate) fn count(&self, command: &str, dir: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, d, _)| c == command && d == dir)
                .count()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(
            &self,
            command: &HostCommand,
            work_dir: &Utf8Path,
            ignore_errors: bool,
        ) -> Result<String, CommandError> {
            self.calls.lock().unwrap().push((
                command.to_string(),
                work_dir.to_owned(),
                ignore_errors,
            ));
            Ok(String::new())
        }
    }

    pub(crate) fn test_definitions() -> VmDefinitions {
        let mut defs = VmDefinitions::new(DEFAULT_HOSTNAME_PREFIX);
        defs.insert("centos6-app-vm", "/vmdefs/centos6-app-vm");
        defs.insert("centos7-target", "/vmdefs/centos7-target");
        defs
    }

    fn failed(command: &str) -> CommandError {
        CommandError::Failed {
            command: command.to_owned(),
            status: "exit status: 1".to_owned(),
            code: Some(1),
            stdout: String::new(),
            stderr: "VM not created".to_owned(),
        }
    }

    #[test]
    fn discover_lists_subdirectories() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("centos7-target")).unwrap();
        std::fs::create_dir(root.path().join("centos6-app-vm")).unwrap();
        std::fs::write(root.path().join("README"), "not a definition")
            .unwrap();

        let root_path = Utf8Path::from_path(root.path()).unwrap();
        let defs =
            VmDefinitions::discover(root_path, DEFAULT_HOSTNAME_PREFIX)
                .unwrap();
        assert_eq!(defs.len(), 2);

        let target = defs.get("centos7-target").unwrap();
        assert_eq!(target.hostname(), "leapp-tests-centos7-target");
        assert_eq!(target.directory(), root_path.join("centos7-target"));
        assert!(defs.get("README").is_none());
    }

    #[test]
    fn unknown_definition_is_rejected() {
        let runner = Arc::new(MockCommandRunner::new());
        let registry =
            VmRegistry::new(runner, test_definitions(), DEFAULT_VM_BACKEND);
        let err = registry.ensure_vm("src", "windows-xp", false).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::UnknownDefinition(id) if id == "windows-xp"
        ));
        assert_eq!(registry.state_of("src"), MachineState::Unprovisioned);
    }

    #[test]
    fn hostname_lookup_requires_acquisition() {
        let runner = Arc::new(RecordingRunner::default());
        let registry = VmRegistry::new(
            runner.clone(),
            test_definitions(),
            DEFAULT_VM_BACKEND,
        );
        assert!(matches!(
            registry.hostname_of("src"),
            Err(RegistryError::UnknownMachine(_))
        ));

        registry.ensure_vm("src", "centos6-app-vm", false).unwrap();
        assert_eq!(
            registry.hostname_of("src").unwrap(),
            "leapp-tests-centos6-app-vm"
        );
        assert_eq!(registry.state_of("src"), MachineState::Running);

        registry.close_all();
        assert!(matches!(
            registry.hostname_of("src"),
            Err(RegistryError::UnknownMachine(_))
        ));
        assert_eq!(registry.state_of("src"), MachineState::Halted);
    }

    #[test]
    fn ensure_without_destroy_brings_vm_up_then_halts_it() {
        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        runner
            .expect_run()
            .withf(|cmd, dir, ignore| {
                cmd.to_string() == "vagrant up"
                    && dir == "/vmdefs/centos6-app-vm"
                    && !*ignore
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok("Machine booted and ready!".to_owned()));
        runner
            .expect_run()
            .withf(|cmd, dir, ignore| {
                cmd.to_string() == "vagrant halt"
                    && dir == "/vmdefs/centos6-app-vm"
                    && *ignore
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(String::new()));

        let registry = VmRegistry::new(
            Arc::new(runner),
            test_definitions(),
            DEFAULT_VM_BACKEND,
        );
        registry.ensure_vm("src", "centos6-app-vm", false).unwrap();
        assert_eq!(registry.close_all().ran, 1);
        assert_eq!(registry.close_all().ran, 0);
    }

    #[test]
    fn failed_up_propagates_but_still_tears_down() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd, _, _| cmd.to_string() == "vagrant up")
            .times(1)
            .returning(|cmd, _, _| Err(failed(&cmd.to_string())));
        runner
            .expect_run()
            .withf(|cmd, _, ignore| {
                cmd.to_string() == "vagrant halt" && *ignore
            })
            .times(1)
            .returning(|_, _, _| Ok(String::new()));

        let registry = VmRegistry::new(
            Arc::new(runner),
            test_definitions(),
            DEFAULT_VM_BACKEND,
        );
        let err =
            registry.ensure_vm("src", "centos6-app-vm", false).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Command(CommandError::Failed { .. })
        ));
        assert_eq!(registry.close_all().ran, 1);
    }

    #[test]
    fn repeated_destroying_ensure_tolerates_missing_vm() {
        // The backend complains when asked to destroy a VM that doesn't
        // exist, but the registry asks it to ignore errors.
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd, _, ignore| {
                cmd.to_string() == "vagrant destroy" && *ignore
            })
            .returning(|_, _, _| Ok("VM not created. Moving on...".to_owned()));
        runner
            .expect_run()
            .withf(|cmd, _, ignore| cmd.to_string() == "vagrant up" && !*ignore)
            .times(2)
            .returning(|_, _, _| Ok(String::new()));

        let registry = VmRegistry::new(
            Arc::new(runner),
            test_definitions(),
            DEFAULT_VM_BACKEND,
        );
        registry.ensure_vm("dst", "centos7-target", true).unwrap();
        registry.ensure_vm("dst", "centos7-target", true).unwrap();

        // Only one teardown is registered for the name.
        assert_eq!(registry.close_all().ran, 1);
        assert_eq!(registry.state_of("dst"), MachineState::Destroyed);
    }

    #[test]
    fn rebinding_a_name_to_another_definition_fails() {
        let runner = Arc::new(RecordingRunner::default());
        let registry = VmRegistry::new(
            runner.clone(),
            test_definitions(),
            DEFAULT_VM_BACKEND,
        );
        registry.ensure_vm("src", "centos6-app-vm", false).unwrap();
        let err =
            registry.ensure_vm("src", "centos7-target", false).unwrap_err();
        assert!(matches!(err, RegistryError::NameConflict { .. }));
        assert_eq!(
            registry.hostname_of("src").unwrap(),
            "leapp-tests-centos6-app-vm"
        );
    }

    #[test]
    fn second_name_for_same_definition_is_rejected() {
        let runner = Arc::new(RecordingRunner::default());
        let registry = VmRegistry::new(
            runner.clone(),
            test_definitions(),
            DEFAULT_VM_BACKEND,
        );
        registry.ensure_vm("src", "centos6-app-vm", false).unwrap();
        let err =
            registry.ensure_vm("copy", "centos6-app-vm", true).unwrap_err();
        match err {
            RegistryError::DefinitionInUse { hostname, held_by, name } => {
                assert_eq!(hostname, "leapp-tests-centos6-app-vm");
                assert_eq!(held_by, "src");
                assert_eq!(name, "copy");
            }
            other => panic!("expected DefinitionInUse, got {other:?}"),
        }

        // The rejected name never reached the backend.
        let dir = "/vmdefs/centos6-app-vm";
        assert_eq!(runner.count("vagrant destroy", dir), 0);
        assert_eq!(runner.count("vagrant up", dir), 1);
        assert!(registry.hostname_of("copy").is_err());

        let report = registry.close_all();
        assert_eq!(report.ran, 1);
        assert_eq!(runner.count("vagrant halt", dir), 1);
    }

    #[test]
    fn reacquiring_with_destroy_upgrades_release() {
        let runner = Arc::new(RecordingRunner::default());
        let registry = VmRegistry::new(
            runner.clone(),
            test_definitions(),
            DEFAULT_VM_BACKEND,
        );
        registry.ensure_vm("src", "centos6-app-vm", false).unwrap();
        registry.ensure_vm("src", "centos6-app-vm", true).unwrap();
        registry.close_all();

        let dir = "/vmdefs/centos6-app-vm";
        assert_eq!(runner.count("vagrant halt", dir), 0);
        // One pre-up destroy plus one on close.
        assert_eq!(runner.count("vagrant destroy", dir), 2);
    }

    #[test]
    fn each_vm_is_released_exactly_once() {
        let runner = Arc::new(RecordingRunner::default());
        let registry = VmRegistry::new(
            runner.clone(),
            test_definitions(),
            DEFAULT_VM_BACKEND,
        );
        registry.ensure_vm("src", "centos6-app-vm", false).unwrap();
        registry.ensure_vm("dst", "centos7-target", true).unwrap();

        let acquire_calls = runner.calls.lock().unwrap().len();
        registry.close_all();
        registry.close_all();

        let calls = runner.calls.lock().unwrap();
        let teardown: Vec<_> = calls[acquire_calls..]
            .iter()
            .map(|(cmd, dir, ignore)| (cmd.as_str(), dir.as_str(), *ignore))
            .collect();

        // Most recently acquired first, errors always ignored.
        assert_eq!(
            teardown,
            vec![
                ("vagrant destroy", "/vmdefs/centos7-target", true),
                ("vagrant halt", "/vmdefs/centos6-app-vm", true),
            ]
        );
    }

    #[test]
    fn dropping_the_registry_releases_vms() {
        let runner = Arc::new(RecordingRunner::default());
        {
            let registry = VmRegistry::new(
                runner.clone(),
                test_definitions(),
                DEFAULT_VM_BACKEND,
            );
            registry.ensure_vm("src", "centos6-app-vm", false).unwrap();
        }
        assert_eq!(runner.count("vagrant halt", "/vmdefs/centos6-app-vm"), 1);
    }
}
