//! Control-plane abstraction over the cloud provider API.
//!
//! The orchestrator only needs a handful of EC2 calls. They sit behind
//! [`ControlPlane`] so the AWS command-line backend can be swapped for an
//! in-memory double in tests.

mod aws_cli;
mod types;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::command::CommandError;

pub use aws_cli::{AwsCliControlPlane, AwsCliSettings, DEFAULT_AWS_BIN, classify_error_code};

/// Future returned by control-plane operations.
pub type ControlPlaneFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ControlPlaneError>> + Send + 'a>>;

/// Lifecycle state reported for an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// Instance is still booting.
    Pending,
    /// Instance is running and queryable.
    Running,
    /// Instance is shutting down or gone.
    Terminated,
    /// Any other state string reported by the provider.
    Other(String),
}

impl InstanceState {
    /// Maps a provider state name onto a variant.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" | "terminated" => Self::Terminated,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Returns `true` when the instance is running.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::Terminated => f.write_str("terminated"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// Point-in-time view of an instance as reported by the provider.
///
/// Snapshots are never mutated locally; every state transition is observed
/// by fetching a fresh snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSnapshot {
    /// Provider identifier (for example `i-0abc`).
    pub id: String,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Public DNS name, when assigned.
    pub public_dns_name: Option<String>,
    /// Public IPv4 address, when assigned.
    pub public_ip_address: Option<String>,
    /// Private DNS name, when assigned.
    pub private_dns_name: Option<String>,
    /// Private IPv4 address, when assigned.
    pub private_ip_address: Option<String>,
    /// VPC the instance lives in, if any.
    pub vpc_id: Option<String>,
    /// Subnet the instance lives in, if any.
    pub subnet_id: Option<String>,
    /// Network interfaces currently attached to the instance.
    pub network_interface_ids: Vec<String>,
    /// Tags reported by the provider.
    pub tags: BTreeMap<String, String>,
}

impl InstanceSnapshot {
    /// Creates a snapshot with only an identifier and state populated.
    #[must_use]
    pub fn new(id: impl Into<String>, state: InstanceState) -> Self {
        Self {
            id: id.into(),
            state,
            public_dns_name: None,
            public_ip_address: None,
            private_dns_name: None,
            private_ip_address: None,
            vpc_id: None,
            subnet_id: None,
            network_interface_ids: Vec::new(),
            tags: BTreeMap::new(),
        }
    }
}

/// Scope an elastic IP was allocated for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressDomain {
    /// Address usable inside a VPC.
    Vpc,
    /// Classic address outside any VPC.
    Standard,
}

impl AddressDomain {
    /// Provider name of the domain.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vpc => "vpc",
            Self::Standard => "standard",
        }
    }
}

/// Elastic IP as listed by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ElasticAddress {
    /// The public address itself.
    pub public_ip: String,
    /// Allocation identifier for VPC addresses.
    pub allocation_id: Option<String>,
    /// Allocation scope.
    pub domain: AddressDomain,
    /// Instance currently holding the address, if any.
    pub instance_id: Option<String>,
}

/// Attachment state of a network interface.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttachmentStatus {
    /// Attachment has been requested but is not complete.
    Attaching,
    /// Interface is attached.
    Attached,
    /// Interface is detaching.
    Detaching,
    /// Interface is not attached to anything.
    Detached,
    /// Any other status string.
    Other(String),
}

impl AttachmentStatus {
    /// Maps a provider status name onto a variant.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "attaching" => Self::Attaching,
            "attached" => Self::Attached,
            "detaching" => Self::Detaching,
            "detached" => Self::Detached,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// Parameters passed through to instance creation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Machine image identifier.
    pub image_id: String,
    /// Instance type (for example `t3.micro`).
    pub instance_type: String,
    /// Key pair name injected into the instance.
    pub key_name: Option<String>,
    /// Subnet to launch into.
    pub subnet_id: Option<String>,
    /// Security groups attached to the primary interface.
    pub security_group_ids: Vec<String>,
    /// Fixed private address for the primary interface.
    pub private_ip_address: Option<String>,
    /// Whether to request a public address in a VPC subnet.
    pub associate_public_ip: bool,
    /// Enables one-minute `CloudWatch` metrics for the instance.
    pub detailed_monitoring: bool,
}

/// Handle to an instance the orchestrator can drive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider identifier.
    pub id: String,
}

impl InstanceHandle {
    /// Wraps an existing instance identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Errors raised by control-plane calls.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ControlPlaneError {
    /// Referenced resource is not visible to the control plane yet.
    #[error("{operation}: resource not found ({code})")]
    NotFound {
        /// Control-plane operation that failed.
        operation: String,
        /// Provider error code.
        code: String,
    },
    /// Provider reported a transient failure.
    #[error("{operation}: transient provider error ({code}): {message}")]
    Transient {
        /// Control-plane operation that failed.
        operation: String,
        /// Provider error code.
        code: String,
        /// Provider message.
        message: String,
    },
    /// Provider rejected the request.
    #[error("{operation}: request rejected: {message}")]
    Rejected {
        /// Control-plane operation that failed.
        operation: String,
        /// Provider message.
        message: String,
    },
    /// Client command could not be executed.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Provider response could not be parsed.
    #[error("{operation}: unexpected response: {message}")]
    Parse {
        /// Control-plane operation that failed.
        operation: String,
        /// Parse error detail.
        message: String,
    },
}

impl ControlPlaneError {
    /// Returns `true` for not-found and transient provider errors.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Transient { .. })
    }
}

/// EC2 operations consumed by the orchestrator.
pub trait ControlPlane: Send + Sync {
    /// Launches a single instance.
    fn create_instance<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> ControlPlaneFuture<'a, InstanceHandle>;

    /// Fetches the current view of an instance, or `None` while the
    /// instance is not yet visible.
    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ControlPlaneFuture<'a, Option<InstanceSnapshot>>;

    /// Creates or overwrites the given tags in a single call.
    fn create_tags<'a>(
        &'a self,
        instance_id: &'a str,
        tags: &'a BTreeMap<String, String>,
    ) -> ControlPlaneFuture<'a, ()>;

    /// Lists elastic IPs matching `public_ip`.
    fn list_addresses<'a>(
        &'a self,
        public_ip: &'a str,
    ) -> ControlPlaneFuture<'a, Vec<ElasticAddress>>;

    /// Associates an elastic IP with an instance.
    fn associate_address<'a>(
        &'a self,
        instance_id: &'a str,
        address: &'a ElasticAddress,
    ) -> ControlPlaneFuture<'a, ()>;

    /// Lists interface identifiers, optionally scoped to a VPC.
    fn list_network_interface_ids<'a>(
        &'a self,
        vpc_id: Option<&'a str>,
    ) -> ControlPlaneFuture<'a, Vec<String>>;

    /// Attaches an interface at `device_index` and returns the attachment id.
    fn attach_network_interface<'a>(
        &'a self,
        interface_id: &'a str,
        instance_id: &'a str,
        device_index: u32,
    ) -> ControlPlaneFuture<'a, String>;

    /// Reports the attachment status of an interface, `None` when it has no
    /// attachment yet.
    fn network_interface_attachment_status<'a>(
        &'a self,
        interface_id: &'a str,
    ) -> ControlPlaneFuture<'a, Option<AttachmentStatus>>;

    /// Returns the encrypted generated password, `None` while it is not yet
    /// available.
    fn password_data<'a>(&'a self, instance_id: &'a str) -> ControlPlaneFuture<'a, Option<String>>;
}
