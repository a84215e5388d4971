//! Hand-off of a reachable target to the bootstrap step.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::future::Future;
use std::io::{self, Write};
use std::pin::Pin;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use crate::control_plane::InstanceSnapshot;
use crate::credential::AdminPassword;
use crate::gateway::GatewayDescriptor;
use crate::plan::ConnectAttribute;
use crate::probe::BootstrapProtocol;

/// Environment variable carrying the connect address.
pub const ENV_CONNECT_ADDRESS: &str = "LANDFALL_CONNECT_ADDRESS";
/// Environment variable carrying the probed port.
pub const ENV_CONNECT_PORT: &str = "LANDFALL_CONNECT_PORT";
/// Environment variable carrying the protocol name.
pub const ENV_PROTOCOL: &str = "LANDFALL_PROTOCOL";
/// Environment variable carrying the gateway, when one is used.
pub const ENV_SSH_GATEWAY: &str = "LANDFALL_SSH_GATEWAY";
/// Environment variable carrying the login user, when configured.
pub const ENV_SSH_USER: &str = "LANDFALL_SSH_USER";
/// Environment variable carrying the administrator password, when known.
pub const ENV_ADMIN_PASSWORD: &str = "LANDFALL_ADMIN_PASSWORD";

/// Everything the bootstrap step receives, produced exactly once per run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Handoff {
    /// Provider instance identifier.
    pub instance_id: String,
    /// Address the bootstrap step connects to.
    pub connect_address: String,
    /// Attribute the address was read from.
    pub connect_attribute: ConnectAttribute,
    /// Port that answered the probe.
    pub port: u16,
    /// Bootstrap protocol.
    pub protocol: BootstrapProtocol,
    /// Gateway the target was reached through.
    pub gateway: Option<GatewayDescriptor>,
    /// Login user, when configured.
    pub ssh_user: Option<String>,
    /// Administrator password, retrieved or supplied.
    pub credential: Option<AdminPassword>,
    /// Final instance snapshot.
    pub snapshot: InstanceSnapshot,
    /// Tags applied to the instance.
    pub tags: BTreeMap<String, String>,
}

/// Errors raised by bootstrap executors.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BootstrapError {
    /// The bootstrap command could not be started.
    #[error("failed to spawn bootstrap command: {message}")]
    Spawn {
        /// Operating system error string.
        message: String,
    },
    /// The bootstrap command was killed by a signal.
    #[error("bootstrap command terminated without an exit status")]
    MissingExitCode,
    /// Output could not be written.
    #[error("failed to write summary: {message}")]
    Output {
        /// I/O error message.
        message: String,
    },
}

/// Future returned by [`BootstrapExecutor::execute`].
pub type BootstrapFuture<'a> = Pin<Box<dyn Future<Output = Result<i32, BootstrapError>> + Send + 'a>>;

/// Consumes the hand-off and returns the exit code for the process.
pub trait BootstrapExecutor: Send + Sync {
    /// Runs the bootstrap step for `handoff`.
    fn execute(&self, handoff: Handoff) -> BootstrapFuture<'_>;
}

/// Runs a shell command with the hand-off exported as environment variables.
#[derive(Clone, Debug)]
pub struct CommandBootstrapExecutor {
    command: String,
}

impl CommandBootstrapExecutor {
    /// Creates an executor running `command` through `sh -c`.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Environment passed to the command.
    #[must_use]
    pub fn environment(handoff: &Handoff) -> Vec<(&'static str, String)> {
        let mut env = vec![
            (ENV_CONNECT_ADDRESS, handoff.connect_address.clone()),
            (ENV_CONNECT_PORT, handoff.port.to_string()),
            (ENV_PROTOCOL, handoff.protocol.to_string()),
        ];
        if let Some(gateway) = &handoff.gateway {
            env.push((ENV_SSH_GATEWAY, gateway.to_string()));
        }
        if let Some(user) = &handoff.ssh_user {
            env.push((ENV_SSH_USER, user.clone()));
        }
        if let Some(password) = &handoff.credential {
            env.push((ENV_ADMIN_PASSWORD, password.expose().to_owned()));
        }
        env
    }

    async fn run(&self, handoff: Handoff) -> Result<i32, BootstrapError> {
        info!(instance_id = %handoff.instance_id, address = %handoff.connect_address, "starting bootstrap command");
        let status = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .envs(Self::environment(&handoff))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|err| BootstrapError::Spawn {
                message: err.to_string(),
            })?;
        status.code().ok_or(BootstrapError::MissingExitCode)
    }
}

impl BootstrapExecutor for CommandBootstrapExecutor {
    fn execute(&self, handoff: Handoff) -> BootstrapFuture<'_> {
        Box::pin(self.run(handoff))
    }
}

/// Prints an instance summary to stdout. The credential is never printed.
#[derive(Clone, Copy, Debug, Default)]
pub struct SummaryExecutor;

impl SummaryExecutor {
    /// Renders the summary lines for `handoff`.
    #[must_use]
    pub fn render(handoff: &Handoff) -> String {
        let snapshot = &handoff.snapshot;
        let mut out = String::new();
        let rows = [
            ("Instance ID", Some(snapshot.id.as_str())),
            ("Public DNS Name", snapshot.public_dns_name.as_deref()),
            ("Public IP Address", snapshot.public_ip_address.as_deref()),
            ("Private DNS Name", snapshot.private_dns_name.as_deref()),
            ("Private IP Address", snapshot.private_ip_address.as_deref()),
            ("Subnet ID", snapshot.subnet_id.as_deref()),
        ];
        for (label, value) in rows {
            if let Some(text) = value {
                writeln!(out, "{label}: {text}").ok();
            }
        }
        for (key, value) in &handoff.tags {
            writeln!(out, "Tag {key}: {value}").ok();
        }
        writeln!(
            out,
            "Connect: {}:{} ({}, via {})",
            handoff.connect_address, handoff.port, handoff.protocol, handoff.connect_attribute
        )
        .ok();
        if let Some(gateway) = &handoff.gateway {
            writeln!(out, "SSH Gateway: {gateway}").ok();
        }
        if handoff.credential.is_some() {
            writeln!(out, "Administrator password: available").ok();
        }
        out
    }
}

impl BootstrapExecutor for SummaryExecutor {
    fn execute(&self, handoff: Handoff) -> BootstrapFuture<'_> {
        Box::pin(async move {
            io::stdout()
                .write_all(Self::render(&handoff).as_bytes())
                .map_err(|err| BootstrapError::Output {
                    message: err.to_string(),
                })?;
            Ok(0)
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::control_plane::InstanceState;
    use crate::gateway::GatewaySource;

    #[fixture]
    fn handoff() -> Handoff {
        Handoff {
            instance_id: String::from("i-1"),
            connect_address: String::from("10.0.0.5"),
            connect_attribute: ConnectAttribute::PrivateIpAddress,
            port: 5985,
            protocol: BootstrapProtocol::WinRm,
            gateway: Some(GatewayDescriptor {
                user: Some(String::from("ops")),
                host: String::from("bastion"),
                port: 22,
                identity_files: Vec::new(),
                source: GatewaySource::Explicit,
            }),
            ssh_user: None,
            credential: Some(AdminPassword::new("pa55")),
            snapshot: InstanceSnapshot {
                private_ip_address: Some(String::from("10.0.0.5")),
                ..InstanceSnapshot::new("i-1", InstanceState::Running)
            },
            tags: BTreeMap::from([(String::from("Name"), String::from("web-01"))]),
        }
    }

    #[rstest]
    fn environment_exports_address_protocol_and_credential(handoff: Handoff) {
        let env = CommandBootstrapExecutor::environment(&handoff);
        let lookup = |key: &str| {
            env.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.as_str())
        };

        assert_eq!(lookup(ENV_CONNECT_ADDRESS), Some("10.0.0.5"));
        assert_eq!(lookup(ENV_CONNECT_PORT), Some("5985"));
        assert_eq!(lookup(ENV_PROTOCOL), Some("winrm"));
        assert_eq!(lookup(ENV_SSH_GATEWAY), Some("ops@bastion:22"));
        assert_eq!(lookup(ENV_ADMIN_PASSWORD), Some("pa55"));
        assert_eq!(lookup(ENV_SSH_USER), None);
    }

    #[rstest]
    fn summary_never_contains_the_password(handoff: Handoff) {
        let summary = SummaryExecutor::render(&handoff);
        assert!(summary.contains("Instance ID: i-1"), "{summary}");
        assert!(summary.contains("Tag Name: web-01"), "{summary}");
        assert!(summary.contains("Connect: 10.0.0.5:5985 (winrm"), "{summary}");
        assert!(!summary.contains("pa55"), "{summary}");
    }

    #[rstest]
    #[tokio::test]
    async fn command_executor_sees_handoff_environment(handoff: Handoff) {
        let executor = CommandBootstrapExecutor::new(
            "test \"$LANDFALL_CONNECT_ADDRESS\" = 10.0.0.5 && exit 7",
        );
        let code = executor.execute(handoff).await.expect("command should run");
        assert_eq!(code, 7);
    }
}
