//! Drives a freshly created instance to the point where it can be bootstrapped.
//!
//! The workflow runs strictly in order: wait for the instance to run, tag it
//! and associate the elastic IP, attach secondary interfaces, confirm the
//! bootstrap protocol listener is reachable, fetch the administrator
//! password when needed, and hand the result to a bootstrap executor. A
//! failing step aborts the rest. Nothing is rolled back; the instance is left
//! in place for the operator to inspect.

mod tagging;

use std::fmt;

use thiserror::Error;
use tracing::{info, warn};

use crate::bootstrap::{BootstrapError, BootstrapExecutor, Handoff};
use crate::control_plane::{
    AddressDomain, ControlPlane, ControlPlaneError, ElasticAddress, InstanceHandle,
    InstanceSnapshot, LaunchRequest,
};
use crate::credential::{AdminPassword, CredentialError, CredentialRetriever};
use crate::gateway::{GatewayDescriptor, GatewayResolver, SshConfigSource};
use crate::nic::{NicAttachmentWaiter, NicError, validate_interfaces};
use crate::pacing::Pacing;
use crate::plan::{ConnectAttribute, PlanError, ProvisionPlan};
use crate::probe::BootstrapProtocol;
use crate::reachability::{ProbeTarget, ReachabilityError, ReachabilityWaiter};
use crate::readiness::{ReadinessError, ReadinessWaiter};
use crate::tunnel::Tunneler;

pub use tagging::TaggingError;

/// Steps of the provisioning state machine.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProvisionState {
    /// The instance exists but has not been observed running.
    Created,
    /// The provider reports the instance running.
    Ready,
    /// Tags are applied and the elastic IP, if any, is associated.
    Tagged,
    /// Secondary interfaces report attached.
    NicsAttached,
    /// The bootstrap protocol listener answered.
    ReachabilityConfirmed,
    /// The administrator password was decrypted.
    CredentialResolved,
    /// The bootstrap executor received the hand-off.
    HandedOff,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Ready => "ready",
            Self::Tagged => "tagged",
            Self::NicsAttached => "nics-attached",
            Self::ReachabilityConfirmed => "reachability-confirmed",
            Self::CredentialResolved => "credential-resolved",
            Self::HandedOff => "handed-off",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by a provisioning run, one variant per step.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The plan cannot succeed as configured.
    #[error(transparent)]
    Plan(#[from] PlanError),
    /// Launching the instance failed.
    #[error("failed to create instance: {0}")]
    Launch(#[source] ControlPlaneError),
    /// Looking up the requested elastic IP failed.
    #[error("failed to look up elastic IP {public_ip}: {source}")]
    ElasticIpLookup {
        /// Requested address.
        public_ip: String,
        /// Control-plane failure.
        #[source]
        source: ControlPlaneError,
    },
    /// The requested elastic IP is missing, associated, or in the wrong scope.
    #[error("Elastic IP requested is not available: {public_ip}")]
    ElasticIpUnavailable {
        /// Requested address.
        public_ip: String,
    },
    /// The instance did not reach the running state.
    #[error("instance {instance_id} did not become ready: {source}")]
    Readiness {
        /// Provider instance identifier.
        instance_id: String,
        /// Underlying wait failure.
        #[source]
        source: ReadinessError,
    },
    /// Tagging or elastic-IP association failed for good.
    #[error("instance {instance_id} could not be tagged: {source}")]
    Tagging {
        /// Provider instance identifier.
        instance_id: String,
        /// Last failure observed.
        #[source]
        source: TaggingError,
    },
    /// Secondary interfaces could not be validated or attached.
    #[error("network interface attachment failed for {instance_id}: {source}")]
    NetworkInterfaces {
        /// Provider instance identifier.
        instance_id: String,
        /// Underlying failure.
        #[source]
        source: NicError,
    },
    /// The instance vanished between steps.
    #[error("failed to refresh instance {instance_id}: {source}")]
    Refresh {
        /// Provider instance identifier.
        instance_id: String,
        /// Underlying failure.
        #[source]
        source: ControlPlaneError,
    },
    /// The connect attribute has no value on the instance.
    #[error("instance {instance_id} has no {attribute} to connect to")]
    MissingConnectAddress {
        /// Provider instance identifier.
        instance_id: String,
        /// Attribute that was consulted.
        attribute: ConnectAttribute,
    },
    /// The bootstrap protocol listener never answered.
    #[error("{protocol} on {address} is not reachable: {source}")]
    Reachability {
        /// Address probed.
        address: String,
        /// Protocol probed.
        protocol: BootstrapProtocol,
        /// Underlying failure.
        #[source]
        source: ReachabilityError,
    },
    /// The administrator password could not be retrieved.
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// The bootstrap executor failed.
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),
}

/// Executes the post-create provisioning workflow.
///
/// Every collaborator is injected so the workflow can run against in-memory
/// doubles. The plan is borrowed for the duration of a run and never
/// modified; values resolved along the way are collected into the returned
/// [`Handoff`].
#[derive(Debug)]
pub struct ProvisioningOrchestrator<C, T, S> {
    control_plane: C,
    tunneler: T,
    ssh_config: S,
    pacing: Pacing,
}

impl<C, T, S> ProvisioningOrchestrator<C, T, S>
where
    C: ControlPlane,
    T: Tunneler,
    S: SshConfigSource,
{
    /// Creates a new orchestrator.
    #[must_use]
    pub const fn new(control_plane: C, tunneler: T, ssh_config: S, pacing: Pacing) -> Self {
        Self {
            control_plane,
            tunneler,
            ssh_config,
            pacing,
        }
    }

    /// Returns the control plane, mainly so tests can inspect their double.
    #[must_use]
    pub const fn control_plane(&self) -> &C {
        &self.control_plane
    }

    /// Launches a new instance for the workflow to drive.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Launch`] when the provider rejects the
    /// request.
    pub async fn launch(&self, request: &LaunchRequest) -> Result<InstanceHandle, ProvisionError> {
        let handle = self
            .control_plane
            .create_instance(request)
            .await
            .map_err(ProvisionError::Launch)?;
        info!(instance_id = %handle.id, state = %ProvisionState::Created, "instance launched");
        Ok(handle)
    }

    /// Runs every step up to the hand-off and returns what the bootstrap
    /// step needs.
    ///
    /// # Errors
    ///
    /// Returns the [`ProvisionError`] of the first step that fails. Steps
    /// after it are not attempted.
    pub async fn execute(
        &self,
        plan: &ProvisionPlan,
        instance: &InstanceHandle,
    ) -> Result<Handoff, ProvisionError> {
        plan.validate()?;
        let instance_id = instance.id.as_str();
        let elastic_ip = self.reserve_elastic_ip(plan).await?;

        let ready = ReadinessWaiter::new(
            &self.control_plane,
            &self.pacing,
            plan.timing.readiness_poll_interval,
        )
        .wait_until_running(instance_id)
        .await
        .map_err(|source| ProvisionError::Readiness {
            instance_id: instance_id.to_owned(),
            source,
        })?;
        transition(instance_id, ProvisionState::Ready);

        let tags = plan.tags_for(instance_id);
        self.tag_and_associate(plan, instance_id, &tags, elastic_ip.as_ref())
            .await
            .map_err(|source| ProvisionError::Tagging {
                instance_id: instance_id.to_owned(),
                source,
            })?;
        transition(instance_id, ProvisionState::Tagged);

        if !plan.network_interfaces.is_empty() {
            self.attach_interfaces(plan, instance_id, ready.vpc_id.as_deref())
                .await
                .map_err(|source| ProvisionError::NetworkInterfaces {
                    instance_id: instance_id.to_owned(),
                    source,
                })?;
            transition(instance_id, ProvisionState::NicsAttached);
        }

        let snapshot = self.refresh(instance_id, ready).await?;
        let (attribute, address) = connect_target(plan, &snapshot)?;
        let gateway = GatewayResolver::new(&self.ssh_config, plan.ssh_gateway_identity.clone())
            .resolve(plan.ssh_gateway.as_ref(), &address);
        let private_network = plan.in_private_network(&snapshot);
        self.confirm_reachability(plan, &address, private_network, gateway.as_ref())
            .await?;
        transition(instance_id, ProvisionState::ReachabilityConfirmed);

        let credential = self.resolve_credential(plan, instance_id).await?;

        Ok(Handoff {
            instance_id: instance_id.to_owned(),
            connect_address: address,
            connect_attribute: attribute,
            port: plan.port,
            protocol: plan.protocol,
            gateway,
            ssh_user: plan.ssh_user.clone(),
            credential,
            snapshot,
            tags,
        })
    }

    /// Passes `handoff` to `executor` and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Bootstrap`] when the executor fails.
    pub async fn hand_off<E>(&self, handoff: Handoff, executor: &E) -> Result<i32, ProvisionError>
    where
        E: BootstrapExecutor + ?Sized,
    {
        let instance_id = handoff.instance_id.clone();
        transition(&instance_id, ProvisionState::HandedOff);
        Ok(executor.execute(handoff).await?)
    }

    async fn reserve_elastic_ip(
        &self,
        plan: &ProvisionPlan,
    ) -> Result<Option<ElasticAddress>, ProvisionError> {
        let Some(public_ip) = plan.elastic_ip.as_deref() else {
            return Ok(None);
        };
        let domain = if plan.private_network {
            AddressDomain::Vpc
        } else {
            AddressDomain::Standard
        };
        let addresses = self
            .control_plane
            .list_addresses(public_ip)
            .await
            .map_err(|source| ProvisionError::ElasticIpLookup {
                public_ip: public_ip.to_owned(),
                source,
            })?;
        addresses
            .into_iter()
            .find(|address| {
                address.public_ip == public_ip
                    && address.domain == domain
                    && address.instance_id.is_none()
            })
            .map(Some)
            .ok_or_else(|| ProvisionError::ElasticIpUnavailable {
                public_ip: public_ip.to_owned(),
            })
    }

    async fn attach_interfaces(
        &self,
        plan: &ProvisionPlan,
        instance_id: &str,
        vpc_id: Option<&str>,
    ) -> Result<(), NicError> {
        validate_interfaces(&self.control_plane, &plan.network_interfaces, vpc_id).await?;
        let waiter = NicAttachmentWaiter::new(
            &self.control_plane,
            &self.pacing,
            plan.timing.nic_poll_interval,
        );
        waiter
            .attach_all(instance_id, &plan.network_interfaces)
            .await?;
        waiter
            .wait_for_attachment(&plan.network_interfaces)
            .await?;
        Ok(())
    }

    /// Fetches the latest snapshot so addresses assigned during tagging are
    /// visible. Falls back to `previous` if the instance briefly disappears.
    async fn refresh(
        &self,
        instance_id: &str,
        previous: InstanceSnapshot,
    ) -> Result<InstanceSnapshot, ProvisionError> {
        match self.control_plane.describe_instance(instance_id).await {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => Ok(previous),
            Err(err) if err.is_retryable() => {
                warn!(instance_id, error = %err, "using previous snapshot after transient failure");
                Ok(previous)
            }
            Err(source) => Err(ProvisionError::Refresh {
                instance_id: instance_id.to_owned(),
                source,
            }),
        }
    }

    async fn confirm_reachability(
        &self,
        plan: &ProvisionPlan,
        address: &str,
        private_network: bool,
        gateway: Option<&GatewayDescriptor>,
    ) -> Result<(), ProvisionError> {
        let target = ProbeTarget {
            host: address.to_owned(),
            port: plan.port,
            protocol: plan.protocol,
        };
        let schedule = plan.timing.reachability(private_network);
        ReachabilityWaiter::new(&self.tunneler, &self.pacing, schedule)
            .wait(&target, gateway)
            .await
            .map(|_| ())
            .map_err(|source| ProvisionError::Reachability {
                address: address.to_owned(),
                protocol: plan.protocol,
                source,
            })
    }

    async fn resolve_credential(
        &self,
        plan: &ProvisionPlan,
        instance_id: &str,
    ) -> Result<Option<AdminPassword>, ProvisionError> {
        if !plan.needs_credential() {
            return Ok(plan.winrm_password.clone());
        }
        let password = CredentialRetriever::new(
            &self.control_plane,
            &self.pacing,
            plan.timing.password_poll_interval,
        )
        .retrieve(instance_id, plan.identity_file.as_deref())
        .await?;
        transition(instance_id, ProvisionState::CredentialResolved);
        Ok(Some(password))
    }
}

fn connect_target(
    plan: &ProvisionPlan,
    snapshot: &InstanceSnapshot,
) -> Result<(ConnectAttribute, String), ProvisionError> {
    let (attribute, address) = plan.connect_address(snapshot);
    address
        .map(|value| (attribute, value.to_owned()))
        .ok_or_else(|| ProvisionError::MissingConnectAddress {
            instance_id: snapshot.id.clone(),
            attribute,
        })
}

fn transition(instance_id: &str, state: ProvisionState) {
    info!(instance_id, %state, "provisioning state reached");
}
