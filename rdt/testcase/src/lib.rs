// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::panic::{self, AssertUnwindSafe};

pub use anyhow::{Context, Result};
pub use inventory::submit as inventory_submit;
pub use rdt_framework;
pub use rdt_testcase_macros::*;
use thiserror::Error;

pub use rdt_framework::ScenarioContext;

#[derive(Debug, Error)]
pub enum ScenarioSkippedError {
    #[error("Scenario skipped: {0:?}")]
    ScenarioSkipped(Option<String>),
}

/// Stops the current scenario and reports it as skipped, optionally with a
/// message explaining why.
#[macro_export]
macro_rules! rdt_skip {
    () => {
        return Err($crate::ScenarioSkippedError::ScenarioSkipped(None).into())
    };
    ($msg:expr) => {
        return Err($crate::ScenarioSkippedError::ScenarioSkipped(Some(
            $msg.to_string(),
        ))
        .into())
    };
}

/// The outcome from executing a specific scenario.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScenarioOutcome {
    /// The scenario passed.
    Passed,

    /// The scenario failed.
    Failed(Option<String>),

    /// The scenario chose to be skipped, i.e. it detected a parameter or
    /// condition (such as a missing VM definition) that makes it impossible
    /// to execute meaningfully. The payload is an optional message.
    Skipped(Option<String>),
}

impl ScenarioOutcome {
    /// Converts the result of a scenario body into an outcome.
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::Passed,
            Err(e) => match e.downcast_ref::<ScenarioSkippedError>() {
                Some(ScenarioSkippedError::ScenarioSkipped(msg)) => {
                    Self::Skipped(msg.clone())
                }
                None => Self::Failed(Some(format!(
                    "{e:#}\n    error backtrace: {}",
                    e.backtrace()
                ))),
            },
        }
    }
}

/// A wrapper for scenario functions. This is needed to allow [`Scenario`] to
/// have a `const` constructor for the inventory crate.
pub struct ScenarioFunction {
    pub f: fn(&ScenarioContext) -> ScenarioOutcome,
}

/// A description of a single scenario.
pub struct Scenario {
    /// The path to the module containing the scenario. This is generally
    /// derived from the `module_path!()` macro, which the `#[rdt_scenario]`
    /// attribute macro uses when constructing the scenario's inventory entry.
    pub(crate) module_path: &'static str,

    /// The name of this scenario, which is generally its function name.
    pub(crate) name: &'static str,

    /// The function to execute to run this scenario.
    pub(crate) function: ScenarioFunction,
}

impl Scenario {
    /// Constructs a new [`Scenario`].
    pub const fn new(
        module_path: &'static str,
        name: &'static str,
        function: ScenarioFunction,
    ) -> Self {
        Self { module_path, name, function }
    }

    /// Returns the scenario's fully qualified name, i.e. `module_path::name`.
    pub fn fully_qualified_name(&self) -> String {
        format!("{}::{}", self.module_path, self.name)
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Runs the scenario's body with the supplied context and returns its
    /// outcome. A panic in the body (e.g. from a failed `assert!`) is reported
    /// as a failure.
    pub fn run(&self, ctx: &ScenarioContext) -> ScenarioOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.function.f)(ctx))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "scenario panicked".to_string());
                ScenarioOutcome::Failed(Some(format!("panicked: {msg}")))
            }
        }
    }
}

inventory::collect!(Scenario);

pub fn all_scenarios() -> impl Iterator<Item = &'static Scenario> {
    inventory::iter::<Scenario>.into_iter()
}

/// Returns an iterator over the subset of scenarios for which (a) the fully
/// qualified name includes every string in `must_include`, and (b) the fully
/// qualified name does not include any strings in `must_exclude`.
pub fn filtered_scenarios<'rule>(
    must_include: &'rule [String],
    must_exclude: &'rule [String],
) -> impl Iterator<Item = &'static Scenario> + 'rule {
    all_scenarios().filter(|sc| {
        let name = sc.fully_qualified_name();
        must_include.iter().all(|inc| name.contains(inc))
            && must_exclude.iter().all(|exc| !name.contains(exc))
    })
}
