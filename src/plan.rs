//! The immutable provisioning plan passed into every step.
//!
//! A [`ProvisionPlan`] is built once from configuration and command-line
//! overrides. Nothing downstream mutates it; values resolved during the run
//! (gateway, connect address, credential) live on the orchestrator's run
//! context instead.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::control_plane::InstanceSnapshot;
use crate::credential::AdminPassword;
use crate::gateway::GatewaySpec;
use crate::probe::BootstrapProtocol;
use crate::reachability::ReachabilitySchedule;
use crate::retry::RetryPolicy;

/// Default SSH port probed on the target.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default `WinRM` port probed on the target.
pub const DEFAULT_WINRM_PORT: u16 = 5985;

/// Errors raised while building or validating a plan.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PlanError {
    /// A tag is not a single `key=value` pair.
    #[error("Tags should be entered in a key = value pair: '{tag}'")]
    MalformedTag {
        /// Tag as supplied.
        tag: String,
    },
    /// The platform name is unknown.
    #[error("unsupported platform '{value}' (supported: linux, windows)")]
    UnknownPlatform {
        /// Name as supplied.
        value: String,
    },
    /// The connect attribute name is unknown.
    #[error("unknown connect attribute '{value}'")]
    UnknownConnectAttribute {
        /// Name as supplied.
        value: String,
    },
    /// The protocol cannot be used on the platform.
    #[error("{protocol} bootstrap is not supported on {platform} instances")]
    ProtocolNotSupported {
        /// Platform of the instance.
        platform: Platform,
        /// Requested protocol.
        protocol: BootstrapProtocol,
    },
    /// A password must be fetched but no key was configured.
    #[error("Cannot find SSH Identity file, required to fetch dynamically generated password")]
    MissingIdentityFile,
}

/// Operating system family of the instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    /// Linux and other Unix-like images.
    Linux,
    /// Windows images.
    Windows,
}

impl Platform {
    /// Protocol used when none is requested.
    #[must_use]
    pub const fn default_protocol(self) -> BootstrapProtocol {
        match self {
            Self::Linux => BootstrapProtocol::Ssh,
            Self::Windows => BootstrapProtocol::WinRm,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => f.write_str("linux"),
            Self::Windows => f.write_str("windows"),
        }
    }
}

impl FromStr for Platform {
    type Err = PlanError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "windows" => Ok(Self::Windows),
            _ => Err(PlanError::UnknownPlatform {
                value: value.to_owned(),
            }),
        }
    }
}

/// Instance attribute used as the connect address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectAttribute {
    /// Public DNS name.
    PublicDnsName,
    /// Public IPv4 address.
    PublicIpAddress,
    /// Private DNS name.
    PrivateDnsName,
    /// Private IPv4 address.
    PrivateIpAddress,
}

impl ConnectAttribute {
    /// Reads the attribute from a snapshot.
    #[must_use]
    pub fn select(self, snapshot: &InstanceSnapshot) -> Option<&str> {
        match self {
            Self::PublicDnsName => snapshot.public_dns_name.as_deref(),
            Self::PublicIpAddress => snapshot.public_ip_address.as_deref(),
            Self::PrivateDnsName => snapshot.private_dns_name.as_deref(),
            Self::PrivateIpAddress => snapshot.private_ip_address.as_deref(),
        }
    }

    /// Canonical attribute name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PublicDnsName => "public_dns_name",
            Self::PublicIpAddress => "public_ip_address",
            Self::PrivateDnsName => "private_dns_name",
            Self::PrivateIpAddress => "private_ip_address",
        }
    }
}

impl fmt::Display for ConnectAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectAttribute {
    type Err = PlanError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "public_dns_name" | "dns_name" => Ok(Self::PublicDnsName),
            "public_ip_address" | "public_ip" => Ok(Self::PublicIpAddress),
            "private_dns_name" => Ok(Self::PrivateDnsName),
            "private_ip_address" | "private_ip" => Ok(Self::PrivateIpAddress),
            _ => Err(PlanError::UnknownConnectAttribute {
                value: value.to_owned(),
            }),
        }
    }
}

/// Parses `key=value` tag strings. Each entry must contain exactly one `=`.
///
/// # Errors
///
/// Returns [`PlanError::MalformedTag`] for the first malformed entry.
pub fn parse_tags<S: AsRef<str>>(entries: &[S]) -> Result<BTreeMap<String, String>, PlanError> {
    let mut tags = BTreeMap::new();
    for entry in entries {
        let raw = entry.as_ref();
        let malformed = || PlanError::MalformedTag {
            tag: raw.to_owned(),
        };
        if raw.matches('=').count() != 1 {
            return Err(malformed());
        }
        let (key, value) = raw.split_once('=').ok_or_else(malformed)?;
        if key.trim().is_empty() {
            return Err(malformed());
        }
        tags.insert(key.trim().to_owned(), value.trim().to_owned());
    }
    Ok(tags)
}

/// Polling and retry constants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timing {
    /// Budget for the tag and elastic-IP step.
    pub tag_retry: RetryPolicy,
    /// Interval between readiness polls.
    pub readiness_poll_interval: Duration,
    /// Probe delay before the first attempt outside a VPC.
    pub probe_initial_delay: Duration,
    /// Probe delay before the first attempt inside a VPC.
    pub probe_private_network_initial_delay: Duration,
    /// Interval between probe attempts.
    pub probe_interval: Duration,
    /// Shell banner wait per attempt.
    pub banner_timeout: Duration,
    /// Optional cap on probe attempts.
    pub probe_attempt_limit: Option<NonZeroU32>,
    /// Interval between password polls.
    pub password_poll_interval: Duration,
    /// Interval between attachment polls.
    pub nic_poll_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        let public = ReachabilitySchedule::for_network(false);
        let private = ReachabilitySchedule::for_network(true);
        Self {
            tag_retry: RetryPolicy::default(),
            readiness_poll_interval: Duration::from_secs(1),
            probe_initial_delay: public.initial_delay,
            probe_private_network_initial_delay: private.initial_delay,
            probe_interval: public.interval,
            banner_timeout: public.banner_timeout,
            probe_attempt_limit: None,
            password_poll_interval: Duration::from_secs(1000),
            nic_poll_interval: Duration::ZERO,
        }
    }
}

impl Timing {
    /// Reachability schedule for an instance inside or outside a VPC.
    #[must_use]
    pub const fn reachability(&self, private_network: bool) -> ReachabilitySchedule {
        ReachabilitySchedule {
            initial_delay: if private_network {
                self.probe_private_network_initial_delay
            } else {
                self.probe_initial_delay
            },
            interval: self.probe_interval,
            banner_timeout: self.banner_timeout,
            attempt_limit: self.probe_attempt_limit,
        }
    }
}

/// Everything the orchestrator needs to drive one instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionPlan {
    /// Operating system family.
    pub platform: Platform,
    /// Bootstrap protocol.
    pub protocol: BootstrapProtocol,
    /// Port probed on the target.
    pub port: u16,
    /// Login user handed to the bootstrap step.
    pub ssh_user: Option<String>,
    /// `WinRM` password supplied by the operator.
    pub winrm_password: Option<AdminPassword>,
    /// Private key matching the instance key pair.
    pub identity_file: Option<Utf8PathBuf>,
    /// Explicit SSH gateway.
    pub ssh_gateway: Option<GatewaySpec>,
    /// Keys for the gateway, overriding SSH client configuration.
    pub ssh_gateway_identity: Vec<Utf8PathBuf>,
    /// Connect address override.
    pub connect_attribute: Option<ConnectAttribute>,
    /// Instance runs inside a VPC subnet.
    pub private_network: bool,
    /// Instance requested a public address inside its VPC.
    pub associate_public_ip: bool,
    /// Elastic IP to associate.
    pub elastic_ip: Option<String>,
    /// Secondary interfaces to attach.
    pub network_interfaces: Vec<String>,
    /// Operator tags, including `Type` when requested.
    pub tags: BTreeMap<String, String>,
    /// Node name used as the default `Name` tag.
    pub node_name: Option<String>,
    /// Polling and retry constants.
    pub timing: Timing,
}

impl ProvisionPlan {
    /// Creates a plan for `platform` using its default protocol and port.
    #[must_use]
    pub fn new(platform: Platform) -> Self {
        let protocol = platform.default_protocol();
        Self {
            platform,
            protocol,
            port: default_port(protocol),
            ssh_user: None,
            winrm_password: None,
            identity_file: None,
            ssh_gateway: None,
            ssh_gateway_identity: Vec::new(),
            connect_attribute: None,
            private_network: false,
            associate_public_ip: false,
            elastic_ip: None,
            network_interfaces: Vec::new(),
            tags: BTreeMap::new(),
            node_name: None,
            timing: Timing::default(),
        }
    }

    /// Rejects combinations that can never succeed.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::ProtocolNotSupported`] for `WinRM` on Linux and
    /// [`PlanError::MissingIdentityFile`] when a password must be fetched
    /// without a key to decrypt it.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.platform == Platform::Linux && self.protocol == BootstrapProtocol::WinRm {
            return Err(PlanError::ProtocolNotSupported {
                platform: self.platform,
                protocol: self.protocol,
            });
        }
        if self.needs_credential() && self.identity_file.is_none() {
            return Err(PlanError::MissingIdentityFile);
        }
        Ok(())
    }

    /// Returns `true` when the generated administrator password must be
    /// retrieved.
    #[must_use]
    pub const fn needs_credential(&self) -> bool {
        matches!(self.platform, Platform::Windows)
            && matches!(self.protocol, BootstrapProtocol::WinRm)
            && self.winrm_password.is_none()
    }

    /// The instance sits in a VPC: the plan placed it in a subnet, or the
    /// provider reports a VPC for an instance created elsewhere.
    #[must_use]
    pub const fn in_private_network(&self, snapshot: &InstanceSnapshot) -> bool {
        self.private_network || snapshot.vpc_id.is_some()
    }

    /// Target is reached on its private address.
    #[must_use]
    pub const fn uses_private_address(&self, snapshot: &InstanceSnapshot) -> bool {
        self.in_private_network(snapshot) && !self.associate_public_ip
    }

    /// Tags to apply: operator tags plus a `Name` tag defaulting to the node
    /// name, then the instance id.
    #[must_use]
    pub fn tags_for(&self, instance_id: &str) -> BTreeMap<String, String> {
        let mut tags = self.tags.clone();
        tags.entry(String::from("Name"))
            .or_insert_with(|| self.node_name.clone().unwrap_or_else(|| instance_id.to_owned()));
        tags
    }

    /// Picks the connect address from a snapshot.
    ///
    /// Returns the attribute that was consulted together with its value.
    #[must_use]
    pub fn connect_address<'s>(
        &self,
        snapshot: &'s InstanceSnapshot,
    ) -> (ConnectAttribute, Option<&'s str>) {
        if let Some(attribute) = self.connect_attribute {
            return (attribute, attribute.select(snapshot));
        }
        if self.uses_private_address(snapshot) {
            return (
                ConnectAttribute::PrivateIpAddress,
                snapshot.private_ip_address.as_deref(),
            );
        }
        snapshot.public_dns_name.as_deref().map_or(
            (
                ConnectAttribute::PublicIpAddress,
                snapshot.public_ip_address.as_deref(),
            ),
            |dns| (ConnectAttribute::PublicDnsName, Some(dns)),
        )
    }
}

/// Default probe port for a protocol.
#[must_use]
pub const fn default_port(protocol: BootstrapProtocol) -> u16 {
    match protocol {
        BootstrapProtocol::Ssh => DEFAULT_SSH_PORT,
        BootstrapProtocol::WinRm => DEFAULT_WINRM_PORT,
    }
}
