//! Uncapped polling of an instance until a predicate over its snapshot holds.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::control_plane::{ControlPlane, ControlPlaneError, InstanceSnapshot, InstanceState};
use crate::pacing::{Pacing, Phase};

/// Errors that stop a readiness wait.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReadinessError {
    /// The control plane returned a non-retryable error.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
    /// The instance terminated while we were waiting on it.
    #[error("instance {instance_id} terminated while waiting")]
    Terminated {
        /// Provider instance identifier.
        instance_id: String,
    },
}

/// Polls the control plane at a fixed interval until a predicate holds.
///
/// There is no attempt cap. Every poll emits one progress event so the
/// operator can tell a slow provider from a hung process.
#[derive(Debug)]
pub struct ReadinessWaiter<'a, C: ?Sized> {
    control_plane: &'a C,
    pacing: &'a Pacing,
    interval: Duration,
}

impl<'a, C> ReadinessWaiter<'a, C>
where
    C: ControlPlane + ?Sized,
{
    /// Creates a waiter that sleeps `interval` between polls.
    #[must_use]
    pub const fn new(control_plane: &'a C, pacing: &'a Pacing, interval: Duration) -> Self {
        Self {
            control_plane,
            pacing,
            interval,
        }
    }

    /// Waits until the instance reports the running state.
    ///
    /// # Errors
    ///
    /// See [`ReadinessWaiter::wait_until`].
    pub async fn wait_until_running(
        &self,
        instance_id: &str,
    ) -> Result<InstanceSnapshot, ReadinessError> {
        self.wait_until(instance_id, Phase::Readiness, |snapshot| {
            snapshot.state.is_ready()
        })
        .await
    }

    /// Polls until `predicate` accepts a snapshot of `instance_id` and
    /// returns that snapshot.
    ///
    /// An instance that is not visible yet, and retryable control-plane
    /// errors, count as a negative poll.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError::ControlPlane`] for fatal provider errors and
    /// [`ReadinessError::Terminated`] if the instance terminates.
    pub async fn wait_until<P>(
        &self,
        instance_id: &str,
        phase: Phase,
        predicate: P,
    ) -> Result<InstanceSnapshot, ReadinessError>
    where
        P: Fn(&InstanceSnapshot) -> bool,
    {
        let progress = self.pacing.progress();
        progress.phase_started(phase);
        loop {
            progress.attempt(phase);
            match self.control_plane.describe_instance(instance_id).await {
                Ok(Some(snapshot)) if predicate(&snapshot) => {
                    progress.phase_finished(phase);
                    return Ok(snapshot);
                }
                Ok(Some(snapshot)) if snapshot.state == InstanceState::Terminated => {
                    return Err(ReadinessError::Terminated {
                        instance_id: instance_id.to_owned(),
                    });
                }
                Ok(Some(snapshot)) => {
                    debug!(instance_id, state = %snapshot.state, %phase, "instance not ready");
                }
                Ok(None) => debug!(instance_id, %phase, "instance not visible yet"),
                Err(err) if err.is_retryable() => {
                    debug!(instance_id, %phase, error = %err, "transient describe failure");
                }
                Err(err) => return Err(err.into()),
            }
            self.pacing.pause(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_support::{FakeControlPlane, RecordingProgress, RecordingSleeper};

    #[tokio::test]
    async fn polls_until_running_with_one_progress_event_per_poll() {
        let plane = FakeControlPlane::new();
        plane.push_instance_state("i-1", InstanceState::Pending);
        plane.push_instance_state("i-1", InstanceState::Pending);
        plane.push_instance_state("i-1", InstanceState::Running);
        let sleeper = RecordingSleeper::new();
        let progress = RecordingProgress::new();
        let pacing = Pacing::new(Arc::new(sleeper.clone()), Arc::new(progress.clone()));

        let snapshot = ReadinessWaiter::new(&plane, &pacing, Duration::from_secs(1))
            .wait_until_running("i-1")
            .await
            .expect("instance should become ready");

        assert_eq!(snapshot.state, InstanceState::Running);
        assert_eq!(progress.attempts(Phase::Readiness), 3);
        assert_eq!(sleeper.recorded(), vec![Duration::from_secs(1); 2]);
        assert!(progress.finished(Phase::Readiness));
    }

    #[tokio::test]
    async fn terminated_instance_aborts_the_wait() {
        let plane = FakeControlPlane::new();
        plane.push_instance_state("i-1", InstanceState::Terminated);
        let pacing = Pacing::new(
            Arc::new(RecordingSleeper::new()),
            Arc::new(RecordingProgress::new()),
        );

        let result = ReadinessWaiter::new(&plane, &pacing, Duration::from_secs(1))
            .wait_until_running("i-1")
            .await;

        assert_eq!(
            result,
            Err(ReadinessError::Terminated {
                instance_id: String::from("i-1")
            })
        );
    }
}
