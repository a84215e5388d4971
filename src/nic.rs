//! Secondary network interface validation, attachment and attachment wait.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::control_plane::{AttachmentStatus, ControlPlane, ControlPlaneError};
use crate::pacing::{Pacing, Phase};

/// Errors raised while handling secondary interfaces.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NicError {
    /// Some requested identifiers are not known to the control plane.
    #[error("network interfaces not found: {}", ids.join(", "))]
    Unknown {
        /// Identifiers that could not be found.
        ids: Vec<String>,
    },
    /// A control-plane call failed.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}

/// Checks that every requested interface exists, scoped to `vpc_id` when
/// known.
///
/// # Errors
///
/// Returns [`NicError::Unknown`] listing the missing identifiers.
pub async fn validate_interfaces<C>(
    control_plane: &C,
    requested: &[String],
    vpc_id: Option<&str>,
) -> Result<(), NicError>
where
    C: ControlPlane + ?Sized,
{
    if requested.is_empty() {
        return Ok(());
    }
    let known = control_plane.list_network_interface_ids(vpc_id).await?;
    let missing = requested
        .iter()
        .filter(|id| !known.contains(id))
        .cloned()
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(NicError::Unknown { ids: missing })
    }
}

/// Attaches interfaces and waits for every one to report attached.
#[derive(Debug)]
pub struct NicAttachmentWaiter<'a, C: ?Sized> {
    control_plane: &'a C,
    pacing: &'a Pacing,
    interval: Duration,
}

impl<'a, C> NicAttachmentWaiter<'a, C>
where
    C: ControlPlane + ?Sized,
{
    /// Creates a waiter. A zero `interval` polls back to back.
    #[must_use]
    pub const fn new(control_plane: &'a C, pacing: &'a Pacing, interval: Duration) -> Self {
        Self {
            control_plane,
            pacing,
            interval,
        }
    }

    /// Attaches `interface_ids` in order at device indexes starting from 1
    /// and returns the attachment identifiers.
    ///
    /// # Errors
    ///
    /// Returns the first control-plane failure.
    pub async fn attach_all(
        &self,
        instance_id: &str,
        interface_ids: &[String],
    ) -> Result<Vec<String>, NicError> {
        let mut attachments = Vec::with_capacity(interface_ids.len());
        for (device_index, interface_id) in (1_u32..).zip(interface_ids) {
            let attachment = self
                .control_plane
                .attach_network_interface(interface_id, instance_id, device_index)
                .await?;
            debug!(%interface_id, instance_id, device_index, %attachment, "attachment requested");
            attachments.push(attachment);
        }
        Ok(attachments)
    }

    /// Polls until every interface in `interface_ids` reports attached and
    /// returns the number of polls.
    ///
    /// # Errors
    ///
    /// Returns non-retryable control-plane failures. Retryable failures
    /// count the interface as not attached for that poll.
    pub async fn wait_for_attachment(&self, interface_ids: &[String]) -> Result<u32, NicError> {
        if interface_ids.is_empty() {
            return Ok(0);
        }
        let phase = Phase::NicAttachment;
        let progress = self.pacing.progress();
        progress.phase_started(phase);
        let mut polls: u32 = 0;
        loop {
            polls = polls.saturating_add(1);
            progress.attempt(phase);
            let attached = self.count_attached(interface_ids).await?;
            debug!(attached, requested = interface_ids.len(), polls, "attachment poll");
            if attached == interface_ids.len() {
                progress.phase_finished(phase);
                info!(count = attached, polls, "network interfaces attached");
                return Ok(polls);
            }
            self.pacing.pause(self.interval).await;
        }
    }

    async fn count_attached(&self, interface_ids: &[String]) -> Result<usize, NicError> {
        let mut attached = 0_usize;
        for interface_id in interface_ids {
            match self
                .control_plane
                .network_interface_attachment_status(interface_id)
                .await
            {
                Ok(Some(AttachmentStatus::Attached)) => attached = attached.saturating_add(1),
                Ok(_) => {}
                Err(err) if err.is_retryable() => {
                    debug!(%interface_id, error = %err, "attachment status not visible yet");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(attached)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::{fixture, rstest};

    use super::*;
    use crate::test_support::{FakeControlPlane, RecordingProgress, RecordingSleeper};

    #[fixture]
    fn pacing() -> Pacing {
        Pacing::new(
            Arc::new(RecordingSleeper::new()),
            Arc::new(RecordingProgress::new()),
        )
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    fn script(plane: &FakeControlPlane, interface_id: &str, attached_from_poll: usize) {
        for poll in 1..=5 {
            let status = (poll >= attached_from_poll).then_some(AttachmentStatus::Attached);
            plane.push_attachment_status(interface_id, status);
        }
    }

    #[rstest]
    #[tokio::test]
    async fn waits_until_every_interface_is_attached(pacing: Pacing) {
        let plane = FakeControlPlane::new();
        // attached counts per poll: 0, 1, 1, 2, 3
        script(&plane, "eni-a", 2);
        script(&plane, "eni-b", 4);
        script(&plane, "eni-c", 5);

        let polls = NicAttachmentWaiter::new(&plane, &pacing, Duration::ZERO)
            .wait_for_attachment(&ids(&["eni-a", "eni-b", "eni-c"]))
            .await
            .expect("all interfaces should attach");

        assert_eq!(polls, 5);
    }

    #[rstest]
    #[tokio::test]
    async fn attach_all_uses_device_indexes_from_one(pacing: Pacing) {
        let plane = FakeControlPlane::new();

        let attachments = NicAttachmentWaiter::new(&plane, &pacing, Duration::ZERO)
            .attach_all("i-1", &ids(&["eni-a", "eni-b"]))
            .await
            .expect("attach should succeed");

        assert_eq!(attachments.len(), 2);
        assert_eq!(
            plane.attach_calls(),
            vec![
                (String::from("eni-a"), String::from("i-1"), 1),
                (String::from("eni-b"), String::from("i-1"), 2),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_interfaces_are_listed() {
        let plane = FakeControlPlane::new();
        plane.add_network_interface("eni-a");

        let err = validate_interfaces(&plane, &ids(&["eni-a", "eni-x", "eni-y"]), Some("vpc-1"))
            .await
            .expect_err("unknown ids must be rejected");

        assert_eq!(err.to_string(), "network interfaces not found: eni-x, eni-y");
    }
}
