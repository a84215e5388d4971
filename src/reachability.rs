//! Polling loop that waits for the bootstrap protocol listener.

use std::num::NonZeroU32;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::gateway::GatewayDescriptor;
use crate::pacing::Pacing;
use crate::probe::{BootstrapProtocol, ProbeError, ProbeOutcome, probe_forwarded_once, probe_once};
use crate::tunnel::{Tunneler, with_tunnel};

/// Host a forwarded probe connects to.
const TUNNEL_LOCAL_HOST: &str = "127.0.0.1";

/// Timing of the reachability loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReachabilitySchedule {
    /// Sleep before the first attempt.
    pub initial_delay: Duration,
    /// Sleep between attempts.
    pub interval: Duration,
    /// How long the shell probe waits for a banner, and how long a
    /// tunnelled management probe waits for the forward to settle.
    pub banner_timeout: Duration,
    /// Optional cap on attempts. `None` polls until the target answers.
    pub attempt_limit: Option<NonZeroU32>,
}

impl ReachabilitySchedule {
    /// Default schedule: 40s initial delay inside a private network without
    /// public egress, 10s otherwise, then 10s between attempts.
    #[must_use]
    pub const fn for_network(private_network: bool) -> Self {
        let initial_secs = if private_network { 40 } else { 10 };
        Self {
            initial_delay: Duration::from_secs(initial_secs),
            interval: Duration::from_secs(10),
            banner_timeout: Duration::from_secs(5),
            attempt_limit: None,
        }
    }
}

/// Endpoint the bootstrap step will connect to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProbeTarget {
    /// Target host or address.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Protocol expected on the port.
    pub protocol: BootstrapProtocol,
}

/// Errors that end the reachability loop without success.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReachabilityError {
    /// A probe reported an unrecoverable failure.
    #[error(transparent)]
    Fatal(#[from] ProbeError),
    /// The configured attempt cap was reached.
    #[error("{host}:{port} not reachable after {attempts} attempts: {last_reason}")]
    AttemptsExhausted {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// Attempts made.
        attempts: u32,
        /// Reason reported by the final attempt.
        last_reason: String,
    },
}

/// Polls a [`ProbeTarget`] until its listener answers, tunnelling every
/// attempt through the gateway when one is resolved.
#[derive(Debug)]
pub struct ReachabilityWaiter<'a, T: ?Sized> {
    tunneler: &'a T,
    pacing: &'a Pacing,
    schedule: ReachabilitySchedule,
}

impl<'a, T> ReachabilityWaiter<'a, T>
where
    T: Tunneler + ?Sized,
{
    /// Creates a waiter.
    #[must_use]
    pub const fn new(tunneler: &'a T, pacing: &'a Pacing, schedule: ReachabilitySchedule) -> Self {
        Self {
            tunneler,
            pacing,
            schedule,
        }
    }

    /// Waits for `target` and returns the number of attempts it took.
    ///
    /// # Errors
    ///
    /// Returns [`ReachabilityError::Fatal`] when a probe cannot run and
    /// [`ReachabilityError::AttemptsExhausted`] when an attempt cap is set
    /// and reached.
    pub async fn wait(
        &self,
        target: &ProbeTarget,
        gateway: Option<&GatewayDescriptor>,
    ) -> Result<u32, ReachabilityError> {
        let phase = target.protocol.phase();
        let progress = self.pacing.progress();
        progress.phase_started(phase);
        self.pacing.pause(self.schedule.initial_delay).await;

        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            progress.attempt(phase);
            match self.attempt(target, gateway).await {
                ProbeOutcome::Ready => {
                    progress.phase_finished(phase);
                    info!(host = %target.host, port = target.port, attempts, "target reachable");
                    return Ok(attempts);
                }
                ProbeOutcome::Fatal(err) => return Err(err.into()),
                ProbeOutcome::NotReadyYet(reason) => {
                    debug!(host = %target.host, port = target.port, attempts, %reason, "target not ready");
                    if let Some(limit) = self.schedule.attempt_limit
                        && attempts >= limit.get()
                    {
                        return Err(ReachabilityError::AttemptsExhausted {
                            host: target.host.clone(),
                            port: target.port,
                            attempts,
                            last_reason: reason,
                        });
                    }
                }
            }
            self.pacing.pause(self.schedule.interval).await;
        }
    }

    async fn attempt(
        &self,
        target: &ProbeTarget,
        gateway: Option<&GatewayDescriptor>,
    ) -> ProbeOutcome {
        let banner_timeout = self.schedule.banner_timeout;
        let Some(gateway_descriptor) = gateway else {
            return probe_once(target.protocol, &target.host, target.port, banner_timeout).await;
        };

        let tunnelled = with_tunnel(
            self.tunneler,
            gateway_descriptor,
            &target.host,
            target.port,
            |local_port| {
                probe_forwarded_once(target.protocol, TUNNEL_LOCAL_HOST, local_port, banner_timeout)
            },
        )
        .await;
        match tunnelled {
            Ok(outcome) => outcome,
            Err(err) if err.is_fatal() => ProbeOutcome::Fatal(err.into()),
            Err(err) => ProbeOutcome::NotReadyYet(err.to_string()),
        }
    }
}
