// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Redeploy Test framework: interfaces for leasing throwaway VMs, driving
//! the migration tool against them, and checking that services survive being
//! redeployed as macrocontainers.

pub mod command;
pub mod compare;
pub mod context;
pub mod http;
pub mod lifecycle;
pub mod log_config;
pub mod migration;
pub mod vm;

pub use context::{HarnessParameters, RunContext, ScenarioContext};
