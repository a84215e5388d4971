//! Tag creation and elastic-IP association, retried as one unit.
//!
//! The control plane may not know about an instance it has just reported as
//! running. Tags and the association are therefore retried together under
//! the plan's tag retry policy, and the association only counts once the
//! instance reports the elastic IP as its public address.

use std::collections::BTreeMap;

use thiserror::Error;

use super::ProvisioningOrchestrator;
use crate::control_plane::{ControlPlane, ControlPlaneError, ElasticAddress};
use crate::gateway::SshConfigSource;
use crate::pacing::Phase;
use crate::plan::ProvisionPlan;
use crate::readiness::{ReadinessError, ReadinessWaiter};
use crate::tunnel::Tunneler;

/// Failure of a single tag-and-associate attempt.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TaggingError {
    /// Tagging or association was refused.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
    /// Waiting for the elastic IP to show up failed.
    #[error(transparent)]
    PublicAddress(#[from] ReadinessError),
}

impl TaggingError {
    /// Returns `true` when the attempt may succeed once the control plane
    /// catches up.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ControlPlane(err) | Self::PublicAddress(ReadinessError::ControlPlane(err)) => {
                err.is_retryable()
            }
            Self::PublicAddress(ReadinessError::Terminated { .. }) => false,
        }
    }
}

impl<C, T, S> ProvisioningOrchestrator<C, T, S>
where
    C: ControlPlane,
    T: Tunneler,
    S: SshConfigSource,
{
    pub(super) async fn tag_and_associate(
        &self,
        plan: &ProvisionPlan,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
        elastic_ip: Option<&ElasticAddress>,
    ) -> Result<(), TaggingError> {
        let progress = self.pacing.progress();
        progress.phase_started(Phase::Tagging);
        plan.timing
            .tag_retry
            .execute(
                &self.pacing,
                Phase::Tagging,
                TaggingError::is_retryable,
                || self.tag_once(plan, instance_id, tags, elastic_ip),
            )
            .await?;
        progress.phase_finished(Phase::Tagging);
        Ok(())
    }

    async fn tag_once(
        &self,
        plan: &ProvisionPlan,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
        elastic_ip: Option<&ElasticAddress>,
    ) -> Result<(), TaggingError> {
        if !tags.is_empty() {
            self.control_plane.create_tags(instance_id, tags).await?;
        }
        let Some(address) = elastic_ip else {
            return Ok(());
        };
        self.control_plane
            .associate_address(instance_id, address)
            .await?;
        ReadinessWaiter::new(
            &self.control_plane,
            &self.pacing,
            plan.timing.readiness_poll_interval,
        )
        .wait_until(instance_id, Phase::PublicAddress, |snapshot| {
            snapshot.public_ip_address.as_deref() == Some(address.public_ip.as_str())
        })
        .await?;
        Ok(())
    }
}
