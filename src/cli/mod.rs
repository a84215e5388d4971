//! Command-line interface definitions for the `landfall` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `landfall` binary.
#[derive(Debug, Parser)]
#[command(
    name = "landfall",
    about = "Drive an EC2 instance to a state where it can be bootstrapped",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Wait for an instance, tag it, and confirm it is reachable.
    #[command(
        name = "provision",
        about = "Wait for an instance, tag it, and confirm it is reachable"
    )]
    Provision(ProvisionCommand),
}

/// Arguments for the `landfall provision` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ProvisionCommand {
    /// Drive an instance that already exists instead of launching one.
    #[arg(long, value_name = "ID", conflicts_with = "image_id")]
    pub(crate) instance_id: Option<String>,
    /// Launch parameters used when no instance id is given.
    #[command(flatten)]
    pub(crate) launch: LaunchArgs,
    /// Operating system family of the image: linux or windows.
    #[arg(long, value_name = "PLATFORM", default_value = "linux")]
    pub(crate) platform: String,
    /// Bootstrap protocol: ssh or winrm. Defaults by platform.
    #[arg(long, value_name = "PROTOCOL")]
    pub(crate) bootstrap_protocol: Option<String>,
    /// Override the SSH port probed on the target.
    #[arg(long, value_name = "PORT")]
    pub(crate) ssh_port: Option<u16>,
    /// Override the `WinRM` port probed on the target.
    #[arg(long, value_name = "PORT")]
    pub(crate) winrm_port: Option<u16>,
    /// Login user handed to the bootstrap step.
    #[arg(long, value_name = "USER")]
    pub(crate) ssh_user: Option<String>,
    /// `WinRM` password. When set, the generated password is not fetched.
    #[arg(
        long,
        value_name = "PASSWORD",
        env = "LANDFALL_WINRM_PASSWORD",
        hide_env_values = true
    )]
    pub(crate) winrm_password: Option<String>,
    /// Private key matching the instance key pair.
    #[arg(long, short = 'i', value_name = "PATH")]
    pub(crate) identity_file: Option<String>,
    /// SSH gateway as `[user@]host[:port]`.
    #[arg(long, short = 'G', value_name = "GATEWAY")]
    pub(crate) ssh_gateway: Option<String>,
    /// Private key used for the SSH gateway.
    #[arg(long, value_name = "PATH")]
    pub(crate) ssh_gateway_identity: Option<String>,
    /// Instance attribute to connect to, for example `private_ip_address`.
    #[arg(long, value_name = "ATTRIBUTE")]
    pub(crate) server_connect_attribute: Option<String>,
    /// Elastic IP to associate with the instance.
    #[arg(long, value_name = "IP")]
    pub(crate) associate_eip: Option<String>,
    /// Secondary network interfaces to attach, comma separated.
    #[arg(long, value_name = "ENI1,ENI2", value_delimiter = ',')]
    pub(crate) attach_network_interface: Vec<String>,
    /// Tag to apply as `Key=Value`. Repeatable.
    #[arg(long = "tag", short = 'T', value_name = "KEY=VALUE")]
    pub(crate) tags: Vec<String>,
    /// Value of the `Type` tag.
    #[arg(long, value_name = "TYPE")]
    pub(crate) type_tag: Option<String>,
    /// Node name used as the default `Name` tag.
    #[arg(long, short = 'N', value_name = "NAME")]
    pub(crate) node_name: Option<String>,
    /// Command run once the instance is reachable. Prints a summary when
    /// neither this nor the configured command is set.
    #[arg(long, value_name = "COMMAND")]
    pub(crate) bootstrap_command: Option<String>,
}

/// Instance launch parameters. Image lookup and subnet resolution are left to
/// the provider.
#[derive(Debug, Args)]
pub(crate) struct LaunchArgs {
    /// Machine image to launch.
    #[arg(long, short = 'I', value_name = "AMI", requires = "instance_type")]
    pub(crate) image_id: Option<String>,
    /// Instance type to launch, for example `t3.micro`.
    #[arg(long, short = 'f', value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Key pair injected into the instance.
    #[arg(long, short = 'S', value_name = "KEY")]
    pub(crate) ssh_key: Option<String>,
    /// Subnet to launch into. Enables private-network behaviour.
    #[arg(long, short = 's', value_name = "SUBNET")]
    pub(crate) subnet: Option<String>,
    /// Security group ids, comma separated.
    #[arg(long, short = 'g', value_name = "X,Y,Z", value_delimiter = ',')]
    pub(crate) security_group_ids: Vec<String>,
    /// Fixed private address for the primary interface.
    #[arg(long, value_name = "IP")]
    pub(crate) private_ip_address: Option<String>,
    /// Request a public address for an instance inside a subnet.
    #[arg(long)]
    pub(crate) associate_public_ip: bool,
    /// Enable detailed (one-minute) `CloudWatch` monitoring on launch.
    #[arg(long)]
    pub(crate) detailed_monitoring: bool,
}
