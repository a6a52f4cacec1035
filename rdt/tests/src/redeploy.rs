// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scenarios that redeploy a VM's HTTP service as a macrocontainer on a
//! fresh target VM and check that the service still behaves the same.

use std::time::Duration;

use rdt_testcase::rdt_framework::migration::MigrationResult;
use rdt_testcase::*;
use reqwest::StatusCode;
use tracing::info;

const SOURCE_DEFINITION: &str = "centos6-app-vm";
const TARGET_DEFINITION: &str = "centos7-target";

/// Brings up the source VM as-is and a freshly destroyed target VM, then
/// redeploys the source onto the target and checks that the migration tool
/// can see both of them.
fn redeploy_source_to_target(
    ctx: &ScenarioContext,
) -> Result<(String, String)> {
    for definition in [SOURCE_DEFINITION, TARGET_DEFINITION] {
        if ctx.vms().definitions().get(definition).is_none() {
            rdt_skip!(format!("VM definition {definition} is not available"));
        }
    }

    ctx.vms().ensure_vm("source", SOURCE_DEFINITION, false)?;
    ctx.vms().ensure_vm("target", TARGET_DEFINITION, true)?;

    let result = ctx
        .migration()
        .redeploy_as_container("source", "target")
        .context("redeploying source VM as a macrocontainer")?;
    info!(?result, "migration finished");

    let (source_addr, target_addr) = addresses(&result)?;
    Ok((source_addr.to_owned(), target_addr.to_owned()))
}

fn addresses(result: &MigrationResult) -> Result<(&str, &str)> {
    assert!(
        result.local_vm_count() >= 2,
        "expected at least 2 local VMs, found {}",
        result.local_vm_count()
    );
    let source = result
        .source_addr()
        .context("source VM missing from machine listing")?;
    let target = result
        .target_addr()
        .context("target VM missing from machine listing")?;
    Ok((source, target))
}

#[rdt_scenario]
fn httpd_redeploys_as_macrocontainer(ctx: &ScenarioContext) {
    let (source, target) = redeploy_source_to_target(ctx)?;

    // The stock httpd welcome page answers with 403 Forbidden.
    ctx.http().compare_redeployed(
        &source,
        &target,
        80,
        StatusCode::FORBIDDEN,
        Some(Duration::from_secs(120)),
    )?;
}

#[rdt_scenario]
fn python_http_server_redeploys_as_macrocontainer(ctx: &ScenarioContext) {
    let (source, target) = redeploy_source_to_target(ctx)?;

    ctx.http().compare_redeployed(
        &source,
        &target,
        8000,
        StatusCode::OK,
        Some(Duration::from_secs(120)),
    )?;
}
