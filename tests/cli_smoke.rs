//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("landfall");
    cmd.assert()
        .failure()
        .code(2)
        .stderr(contains("Usage"))
        .stderr(contains("provision"));
}

#[test]
fn provision_help_lists_bootstrap_options() {
    let mut cmd = cargo_bin_cmd!("landfall");
    cmd.args(["provision", "--help"]);
    cmd.assert()
        .success()
        .stdout(contains("--bootstrap-protocol"))
        .stdout(contains("--ssh-gateway"))
        .stdout(contains("--attach-network-interface"));
}
