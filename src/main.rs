//! Binary entry point for the Landfall CLI.

use std::io::{self, Write};
use std::process;
use std::str::FromStr;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use landfall::config::ConfigError;
use landfall::gateway::{GatewayError, SshConfigError};
use landfall::plan::parse_tags;
use landfall::probe::UnsupportedProtocol;
use landfall::util::expand_tilde;
use landfall::{
    AdminPassword, AwsCliControlPlane, BootstrapProtocol, CommandBootstrapExecutor,
    ConnectAttribute, GatewaySpec, InstanceHandle, LaunchRequest, Pacing, PlanError, Platform,
    ProcessCommandRunner, ProvisionConfig, ProvisionError, ProvisionPlan, ProvisioningOrchestrator,
    SshConfig, SshProcessTunneler, SummaryExecutor,
};

mod cli;

use cli::{Cli, LaunchArgs, ProvisionCommand};

/// Environment variable holding the log filter directives.
const LOG_ENV: &str = "LANDFALL_LOG";

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Protocol(#[from] UnsupportedProtocol),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    SshConfig(#[from] SshConfigError),
    #[error("either --instance-id or --image-id with --instance-type is required")]
    MissingInstance,
    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Provision(command) => run_provision(command).await,
    }
}

async fn run_provision(args: ProvisionCommand) -> Result<i32, CliError> {
    let config = ProvisionConfig::load_without_cli_args()?;
    config.validate()?;
    let plan = build_plan(&args, &config)?;
    let target = instance_target(&args)?;
    debug!(platform = %plan.platform, protocol = %plan.protocol, port = plan.port, "plan ready");

    let control_plane = AwsCliControlPlane::new(config.aws_settings(), ProcessCommandRunner);
    let ssh_config_path = Utf8PathBuf::from(expand_tilde(&config.ssh_config_file));
    let ssh_config = SshConfig::load(&ssh_config_path)?;
    let mut tunneler =
        SshProcessTunneler::new(config.ssh_bin.clone(), config.tunnel_setup_timeout());
    // `ssh -F` refuses a missing file; an absent one resolved as empty anyway.
    if ssh_config_path.is_file() {
        tunneler = tunneler.with_config_file(ssh_config_path);
    }
    let orchestrator =
        ProvisioningOrchestrator::new(control_plane, tunneler, ssh_config, Pacing::production());

    let handle = match target {
        InstanceTarget::Existing(handle) => handle,
        InstanceTarget::Launch(request) => orchestrator.launch(&request).await?,
    };
    info!(instance_id = %handle.id, "provisioning instance");
    let handoff = orchestrator.execute(&plan, &handle).await?;

    let bootstrap_command = args.bootstrap_command.or(config.bootstrap_command);
    let code = match bootstrap_command {
        Some(command) => {
            orchestrator
                .hand_off(handoff, &CommandBootstrapExecutor::new(command))
                .await?
        }
        None => orchestrator.hand_off(handoff, &SummaryExecutor).await?,
    };
    Ok(code)
}

#[derive(Debug)]
enum InstanceTarget {
    Existing(InstanceHandle),
    Launch(LaunchRequest),
}

fn instance_target(args: &ProvisionCommand) -> Result<InstanceTarget, CliError> {
    if let Some(id) = &args.instance_id {
        return Ok(InstanceTarget::Existing(InstanceHandle::new(id.clone())));
    }
    launch_request(&args.launch)
        .map(InstanceTarget::Launch)
        .ok_or(CliError::MissingInstance)
}

fn launch_request(args: &LaunchArgs) -> Option<LaunchRequest> {
    let image_id = args.image_id.clone()?;
    let instance_type = args.instance_type.clone()?;
    Some(LaunchRequest {
        image_id,
        instance_type,
        key_name: args.ssh_key.clone(),
        subnet_id: args.subnet.clone(),
        security_group_ids: args.security_group_ids.clone(),
        private_ip_address: args.private_ip_address.clone(),
        associate_public_ip: args.associate_public_ip,
        detailed_monitoring: args.detailed_monitoring,
    })
}

/// Merges command-line overrides over configuration into a validated plan.
fn build_plan(args: &ProvisionCommand, config: &ProvisionConfig) -> Result<ProvisionPlan, CliError> {
    let platform = Platform::from_str(&args.platform)?;
    let protocol = match &args.bootstrap_protocol {
        Some(name) => BootstrapProtocol::from_str(name)?,
        None => platform.default_protocol(),
    };
    let port = match protocol {
        BootstrapProtocol::Ssh => args.ssh_port.unwrap_or(config.ssh_port),
        BootstrapProtocol::WinRm => args.winrm_port.unwrap_or(config.winrm_port),
    };

    let mut tags = parse_tags(&args.tags)?;
    if let Some(kind) = &args.type_tag {
        tags.insert(String::from("Type"), kind.clone());
    }

    let ssh_gateway = args
        .ssh_gateway
        .as_deref()
        .or(config.ssh_gateway.as_deref())
        .map(GatewaySpec::from_str)
        .transpose()?;
    let connect_attribute = args
        .server_connect_attribute
        .as_deref()
        .map(ConnectAttribute::from_str)
        .transpose()?;

    let plan = ProvisionPlan {
        protocol,
        port,
        ssh_user: args.ssh_user.clone().or_else(|| config.ssh_user.clone()),
        winrm_password: args.winrm_password.as_deref().map(AdminPassword::new),
        identity_file: expanded_path(args.identity_file.as_ref().or(config.identity_file.as_ref())),
        ssh_gateway,
        ssh_gateway_identity: expanded_path(
            args.ssh_gateway_identity
                .as_ref()
                .or(config.ssh_gateway_identity.as_ref()),
        )
        .into_iter()
        .collect(),
        connect_attribute,
        private_network: args.launch.subnet.is_some(),
        associate_public_ip: args.launch.associate_public_ip,
        elastic_ip: args.associate_eip.clone(),
        network_interfaces: args.attach_network_interface.clone(),
        tags,
        node_name: args.node_name.clone(),
        timing: config.timing(),
        ..ProvisionPlan::new(platform)
    };
    plan.validate()?;
    Ok(plan)
}

fn expanded_path(path: Option<&String>) -> Option<Utf8PathBuf> {
    path.map(|raw| Utf8PathBuf::from(expand_tilde(raw)))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
