//! Core library for the Landfall provisioning tool.
//!
//! The crate takes a freshly created EC2 instance and drives it, through
//! bounded retries and polling loops, to the point where a bootstrap step can
//! connect to it: running, tagged, reachable over SSH or `WinRM` (directly or
//! through an SSH gateway), and, for Windows, with its generated
//! administrator password decrypted.

pub mod bootstrap;
pub mod command;
pub mod config;
pub mod control_plane;
pub mod credential;
pub mod gateway;
pub mod nic;
pub mod pacing;
pub mod plan;
pub mod probe;
pub mod provision;
pub mod reachability;
pub mod readiness;
pub mod retry;
pub mod test_support;
pub mod tunnel;
pub mod util;

pub use bootstrap::{
    BootstrapError, BootstrapExecutor, CommandBootstrapExecutor, Handoff, SummaryExecutor,
};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, ProvisionConfig};
pub use control_plane::{
    AwsCliControlPlane, ControlPlane, ControlPlaneError, InstanceHandle, InstanceSnapshot,
    LaunchRequest,
};
pub use credential::{AdminPassword, CredentialError, CredentialRetriever};
pub use gateway::{GatewayDescriptor, GatewayResolver, GatewaySpec, SshConfig};
pub use nic::{NicAttachmentWaiter, NicError};
pub use pacing::{Pacing, Phase, ProgressReporter, Sleeper};
pub use plan::{ConnectAttribute, PlanError, Platform, ProvisionPlan, Timing};
pub use probe::{BootstrapProtocol, ProbeOutcome};
pub use provision::{ProvisionError, ProvisionState, ProvisioningOrchestrator};
pub use reachability::{ProbeTarget, ReachabilitySchedule, ReachabilityWaiter};
pub use readiness::{ReadinessError, ReadinessWaiter};
pub use retry::RetryPolicy;
pub use tunnel::{SshProcessTunneler, TunnelSession, Tunneler};
