//! BDD scenarios for the provisioning workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ProvisionContext, provision_context};

#[scenario(
    path = "tests/features/provision.feature",
    name = "Provision a Linux instance reachable over SSH"
)]
fn scenario_linux_over_ssh(provision_context: ProvisionContext) {
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Retry tagging until the instance is visible to tagging"
)]
fn scenario_tag_retry(provision_context: ProvisionContext) {
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Reject an elastic IP that is not allocated"
)]
fn scenario_unallocated_elastic_ip(provision_context: ProvisionContext) {
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Probe a private instance through a proxy-command gateway"
)]
fn scenario_proxy_command_gateway(provision_context: ProvisionContext) {
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Give up when the shell never answers"
)]
fn scenario_reachability_exhausted(provision_context: ProvisionContext) {
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Retrieve the generated Windows administrator password"
)]
fn scenario_windows_password(provision_context: ProvisionContext) {
    drop(provision_context);
}
