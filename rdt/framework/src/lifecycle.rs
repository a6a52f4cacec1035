// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scoped resource release: stacks of deferred teardown actions.
//!
//! Anything that leases an external resource (a running VM, a deployed
//! service) registers an action that releases it on a [`LifecycleStack`]
//! before the lease is considered complete. When the owning scope ends, the
//! stack is unwound and every action runs, last registered first.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Mutex,
};

use tracing::{debug, warn};

/// A deferred operation that releases some resource.
pub type TeardownFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct TeardownAction {
    description: String,
    action: TeardownFn,
}

/// A summary of the work done by a single call to [`LifecycleStack::unwind`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnwindReport {
    /// The number of actions that were run.
    pub ran: usize,

    /// The number of actions that returned an error or panicked.
    pub failed: usize,
}

/// An ordered collection of teardown actions.
///
/// Stacks use interior mutability so that an `Arc<LifecycleStack>` can be
/// shared between the scope that owns it and actions registered on other
/// stacks (e.g. a VM registry's stack being unwound from a scenario's stack).
pub struct LifecycleStack {
    label: String,
    actions: Mutex<Vec<TeardownAction>>,
}

impl LifecycleStack {
    /// Creates an empty stack. `label` identifies the stack in log output.
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), actions: Mutex::new(Vec::new()) }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Pushes an action onto the stack.
    pub fn register<F>(&self, description: impl Into<String>, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let description = description.into();
        debug!(stack = %self.label, %description, "registering teardown");
        self.actions
            .lock()
            .unwrap()
            .push(TeardownAction { description, action: Box::new(action) });
    }

    pub fn len(&self) -> usize {
        self.actions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every registered action in reverse registration order and leaves
    /// the stack empty.
    ///
    /// An action that fails or panics is logged and counted in the returned
    /// report; the remaining actions still run. Actions registered on this
    /// stack while it is unwinding are run before this call returns.
    pub fn unwind(&self) -> UnwindReport {
        let mut report = UnwindReport::default();

        // Pop actions one at a time so the lock is not held while an action
        // runs. Actions are free to register more teardown on this stack.
        while let Some(TeardownAction { description, action }) = self.pop() {
            debug!(stack = %self.label, %description, "running teardown");
            report.ran += 1;
            match panic::catch_unwind(AssertUnwindSafe(action)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        stack = %self.label,
                        %description,
                        error = format!("{e:#}"),
                        "teardown action failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(
                        stack = %self.label,
                        %description,
                        "teardown action panicked"
                    );
                }
            }
        }

        if report.ran > 0 {
            debug!(stack = %self.label, ?report, "finished unwinding");
        }

        report
    }

    fn pop(&self) -> Option<TeardownAction> {
        self.actions.lock().unwrap().pop()
    }
}

impl fmt::Debug for LifecycleStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleStack")
            .field("label", &self.label)
            .field("pending", &self.len())
            .finish()
    }
}

impl Drop for LifecycleStack {
    fn drop(&mut self) {
        if !self.is_empty() {
            warn!(stack = %self.label, "unwinding teardown stack on drop");
            self.unwind();
        }
    }
}
