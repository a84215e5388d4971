//! BDD step definitions for the provisioning workflow.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cap_std::{ambient_authority, fs_utf8::Dir};
use landfall::control_plane::{ControlPlaneError, InstanceState};
use landfall::{
    BootstrapProtocol, Handoff, InstanceHandle, Pacing, Platform, ProvisionError, ProvisionPlan,
    ProvisioningOrchestrator, SshConfig, Timing,
};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use rstest_bdd_macros::{given, then, when};
use tempfile::TempDir;
use tokio::runtime::Runtime;

use super::test_helpers::{
    INSTANCE_ID, PRIVATE_IP, ProvisionContext, ProvisionFailure, ProvisionResult,
    ProvisionTestError, closed_port, instance, listener, utf8,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] ProvisionTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a Linux plan for node \"{node}\"")]
fn linux_plan(mut provision_context: ProvisionContext, node: String) -> ProvisionContext {
    provision_context.plan = ProvisionPlan {
        node_name: Some(node),
        ..ProvisionPlan::new(Platform::Linux)
    };
    provision_context
}

#[given("a Windows plan with a generated key pair")]
fn windows_plan(mut provision_context: ProvisionContext) -> Result<ProvisionContext, StepError> {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, 1024)
        .map_err(|err| ProvisionTestError::Fixture(format!("generate key: {err}")))?;
    let pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|err| ProvisionTestError::Fixture(format!("encode key: {err}")))?;
    let dir = TempDir::new().map_err(|err| ProvisionTestError::Fixture(err.to_string()))?;
    let root = utf8(&dir)?;
    Dir::open_ambient_dir(&root, ambient_authority())
        .and_then(|handle| handle.write("win.pem", pem.as_bytes()))
        .map_err(|err| ProvisionTestError::Fixture(format!("write key: {err}")))?;

    let password = String::from("Adm1n-Secret!");
    let ciphertext = RsaPublicKey::from(&private)
        .encrypt(&mut rng, Pkcs1v15Encrypt, password.as_bytes())
        .map_err(|err| ProvisionTestError::Fixture(format!("encrypt: {err}")))?;
    provision_context.plane.push_password_blob(None);
    provision_context
        .plane
        .push_password_blob(Some(STANDARD.encode(ciphertext)));

    provision_context.plan = ProvisionPlan {
        identity_file: Some(root.join("win.pem")),
        ..ProvisionPlan::new(Platform::Windows)
    };
    provision_context.expected_password = Some(password);
    provision_context.key_dir = Some(Arc::new(dir));
    Ok(provision_context)
}

#[given("the plan targets a private network")]
fn private_network(mut provision_context: ProvisionContext) -> ProvisionContext {
    provision_context.plan.private_network = true;
    provision_context
}

#[given("the plan requests elastic IP \"{address}\"")]
fn requests_elastic_ip(
    mut provision_context: ProvisionContext,
    address: String,
) -> ProvisionContext {
    provision_context.plan.elastic_ip = Some(address);
    provision_context
}

#[given("the SSH client configuration proxies \"{pattern}\" through \"{gateway}\"")]
fn proxy_command(
    mut provision_context: ProvisionContext,
    pattern: String,
    gateway: String,
) -> ProvisionContext {
    provision_context.ssh_config = SshConfig::parse(&format!(
        "Host {pattern}\n  ProxyCommand ssh {gateway} nc %h %p\n"
    ));
    provision_context
}

#[given("the instance starts running after \"{polls}\" polls")]
fn starts_running(provision_context: ProvisionContext, polls: usize) -> ProvisionContext {
    for _ in 0..polls {
        provision_context
            .plane
            .push_instance(instance(InstanceState::Pending));
    }
    provision_context
        .plane
        .push_instance(instance(InstanceState::Running));
    provision_context
}

#[given("a shell banner answers on the public address")]
fn banner_on_public_address(
    mut provision_context: ProvisionContext,
) -> Result<ProvisionContext, StepError> {
    let addr = listener(true)?;
    provision_context.plan.port = addr.port();
    Ok(provision_context)
}

#[given("a management listener answers on the public address")]
fn management_on_public_address(
    mut provision_context: ProvisionContext,
) -> Result<ProvisionContext, StepError> {
    let addr = listener(false)?;
    provision_context.plan.port = addr.port();
    Ok(provision_context)
}

#[given("a shell banner answers only through the gateway")]
fn banner_through_gateway(
    mut provision_context: ProvisionContext,
) -> Result<ProvisionContext, StepError> {
    let addr = listener(true)?;
    provision_context.plan.port = addr.port();
    provision_context
        .tunneler
        .route(PRIVATE_IP, addr.port(), addr);
    Ok(provision_context)
}

#[given("nothing listens on the public address")]
fn nothing_listens(
    mut provision_context: ProvisionContext,
) -> Result<ProvisionContext, StepError> {
    provision_context.plan.port = closed_port()?;
    Ok(provision_context)
}

#[given("probing stops after \"{attempts}\" attempts")]
fn probe_limit(mut provision_context: ProvisionContext, attempts: u32) -> ProvisionContext {
    provision_context.plan.timing.probe_attempt_limit = NonZeroU32::new(attempts);
    provision_context
}

#[given("tagging reports the instance missing \"{times}\" times")]
fn tagging_misses(provision_context: ProvisionContext, times: usize) -> ProvisionContext {
    for _ in 0..times {
        provision_context
            .plane
            .fail_next_create_tags(ControlPlaneError::NotFound {
                operation: String::from("create-tags"),
                code: String::from("InvalidInstanceID.NotFound"),
            });
    }
    provision_context
}

#[given("the password becomes available after \"{polls}\" empty polls")]
fn password_after(provision_context: ProvisionContext, polls: usize) -> ProvisionContext {
    // The Windows plan step queued one empty poll ahead of the blob.
    for _ in 1..polls {
        provision_context.plane.push_password_blob(None);
    }
    provision_context
}

#[when("I provision the instance")]
fn provision_instance(provision_context: ProvisionContext) -> Result<ProvisionContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let mut context = provision_context;
    let plan = ProvisionPlan {
        timing: Timing {
            banner_timeout: Duration::from_secs(2),
            ..context.plan.timing
        },
        ..context.plan.clone()
    };
    let pacing = Pacing::new(
        Arc::new(context.sleeper.clone()),
        Arc::new(context.progress.clone()),
    );
    let orchestrator = ProvisioningOrchestrator::new(
        context.plane.clone(),
        context.tunneler.clone(),
        context.ssh_config.clone(),
        pacing,
    );
    let handle = InstanceHandle::new(INSTANCE_ID);

    let result = runtime.block_on(async move { orchestrator.execute(&plan, &handle).await });
    context.outcome = Some(match result {
        Ok(handoff) => ProvisionResult::Success(Box::new(handoff)),
        Err(err) => ProvisionResult::Failure(ProvisionFailure {
            step: failure_step(&err).to_owned(),
            message: err.to_string(),
        }),
    });
    Ok(context)
}

const fn failure_step(err: &ProvisionError) -> &'static str {
    match err {
        ProvisionError::Plan(_) => "plan",
        ProvisionError::Launch(_) => "launch",
        ProvisionError::ElasticIpLookup { .. } | ProvisionError::ElasticIpUnavailable { .. } => {
            "elastic-ip"
        }
        ProvisionError::Readiness { .. } => "readiness",
        ProvisionError::Tagging { .. } => "tagging",
        ProvisionError::NetworkInterfaces { .. } => "network-interfaces",
        ProvisionError::Refresh { .. } | ProvisionError::MissingConnectAddress { .. } => {
            "connect-address"
        }
        ProvisionError::Reachability { .. } => "reachability",
        ProvisionError::Credential(_) => "credential",
        ProvisionError::Bootstrap(_) => "bootstrap",
    }
}

fn handoff(provision_context: &ProvisionContext) -> Result<&Handoff, StepError> {
    match &provision_context.outcome {
        Some(ProvisionResult::Success(handoff)) => Ok(handoff),
        Some(ProvisionResult::Failure(failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure at {}: {}",
            failure.step, failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("provisioning succeeds")]
fn provisioning_succeeds(provision_context: &ProvisionContext) -> Result<(), StepError> {
    handoff(provision_context).map(|_| ())
}

#[then("provisioning fails at step \"{step}\"")]
fn provisioning_fails(provision_context: &ProvisionContext, step: String) -> Result<(), StepError> {
    let Some(ProvisionResult::Failure(failure)) = &provision_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if failure.step == step {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure at {step}, got {}: {}",
            failure.step, failure.message
        )))
    }
}

#[then("the instance is tagged \"{key}\" = \"{value}\"")]
fn instance_tagged(
    provision_context: &ProvisionContext,
    key: String,
    value: String,
) -> Result<(), StepError> {
    let tags = provision_context.plane.applied_tags(INSTANCE_ID);
    match tags.get(&key) {
        Some(actual) if *actual == value => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected tag {key}={value}, found {other:?} in {tags:?}"
        ))),
    }
}

#[then("the hand-off connects to \"{address}\"")]
fn handoff_address(provision_context: &ProvisionContext, address: String) -> Result<(), StepError> {
    let handoff = handoff(provision_context)?;
    if handoff.connect_address == address && handoff.port == provision_context.plan.port {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {address}:{}, got {}:{}",
            provision_context.plan.port, handoff.connect_address, handoff.port
        )))
    }
}

#[then("the hand-off goes through gateway \"{gateway}\"")]
fn handoff_gateway(provision_context: &ProvisionContext, gateway: String) -> Result<(), StepError> {
    let handoff = handoff(provision_context)?;
    let actual = handoff.gateway.as_ref().map(ToString::to_string);
    if actual.as_deref() == Some(gateway.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected gateway {gateway}, got {actual:?}"
        )))
    }
}

#[then("the hand-off carries the administrator password")]
fn handoff_password(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let handoff = handoff(provision_context)?;
    let actual = handoff.credential.as_ref().map(|password| password.expose());
    if handoff.protocol == BootstrapProtocol::WinRm
        && actual == provision_context.expected_password.as_deref()
        && provision_context.plane.password_polls() >= 2
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "credential mismatch after {} polls",
            provision_context.plane.password_polls()
        )))
    }
}

#[then("tagging was attempted \"{times}\" times")]
fn tagging_attempts(provision_context: &ProvisionContext, times: usize) -> Result<(), StepError> {
    let calls = provision_context.plane.create_tags_calls();
    if calls == times {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {times} tag calls, got {calls}"
        )))
    }
}

#[then("the instance was never described")]
fn never_described(provision_context: &ProvisionContext) -> Result<(), StepError> {
    match provision_context.plane.describe_calls() {
        0 => Ok(()),
        calls => Err(StepError::Assertion(format!(
            "expected no describe calls, got {calls}"
        ))),
    }
}

#[then("every tunnel was closed")]
fn tunnels_closed(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let opened = provision_context.tunneler.opened();
    let closed = provision_context.tunneler.closed();
    if opened > 0 && opened == closed {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "opened {opened} tunnels but closed {closed}"
        )))
    }
}

#[then("a pause of \"{seconds}\" seconds was recorded")]
fn pause_recorded(provision_context: &ProvisionContext, seconds: u64) -> Result<(), StepError> {
    let recorded = provision_context.sleeper.recorded();
    if recorded.contains(&Duration::from_secs(seconds)) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected a {seconds}s pause in {recorded:?}"
        )))
    }
}
