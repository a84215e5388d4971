//! Sleep and progress seams shared by every polling loop.
//!
//! Polling policy (how many attempts, how long between them) lives in the
//! loops themselves. The side effects they interleave, namely waiting and
//! telling the operator that something is still happening, sit behind the
//! [`Sleeper`] and [`ProgressReporter`] traits so tests can observe both
//! without touching the wall clock.

use std::fmt;
use std::future::Future;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

/// Future returned by [`Sleeper::sleep`].
pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Suspends the caller for a fixed duration.
pub trait Sleeper: Send + Sync {
    /// Waits for `duration` before resolving.
    fn sleep(&self, duration: Duration) -> SleepFuture<'_>;
}

/// Sleeper backed by the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Waiting phases of a provisioning run, used to label progress output.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Phase {
    /// Waiting for the instance to report the running state.
    Readiness,
    /// Creating tags and associating the elastic IP.
    Tagging,
    /// Waiting for the elastic IP to show up as the public address.
    PublicAddress,
    /// Waiting for secondary network interfaces to attach.
    NicAttachment,
    /// Waiting for the shell protocol banner.
    ShellReachability,
    /// Waiting for the management protocol listener.
    ManagementReachability,
    /// Waiting for the generated administrator password.
    Credential,
}

impl Phase {
    /// Operator-facing description printed when the phase starts.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Readiness => "Waiting for instance",
            Self::Tagging => "Tagging instance",
            Self::PublicAddress => "Waiting for elastic IP",
            Self::NicAttachment => "Waiting for network interfaces to attach",
            Self::ShellReachability => "Waiting for sshd access",
            Self::ManagementReachability => "Waiting for winrm access",
            Self::Credential => "Waiting for Windows Admin password to be available",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Receives operator progress events from the polling loops.
///
/// Implementations must not block; they are called from inside the loops.
pub trait ProgressReporter: Send + Sync {
    /// Called once when a waiting phase begins.
    fn phase_started(&self, phase: Phase);
    /// Called once per poll or attempt.
    fn attempt(&self, phase: Phase);
    /// Called when a bounded operation failed and will be retried.
    fn retrying(&self, phase: Phase, remaining: u32, reason: &str);
    /// Called once when a waiting phase completes successfully.
    fn phase_finished(&self, phase: Phase);
}

/// Progress reporter that prints a banner and one dot per attempt to stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn phase_started(&self, phase: Phase) {
        write!(io::stderr(), "{phase}").ok();
    }

    fn attempt(&self, _phase: Phase) {
        let mut stderr = io::stderr();
        write!(stderr, ".").ok();
        stderr.flush().ok();
    }

    fn retrying(&self, phase: Phase, remaining: u32, reason: &str) {
        writeln!(
            io::stderr(),
            "\n{phase}: retrying ({remaining} attempts left): {reason}"
        )
        .ok();
    }

    fn phase_finished(&self, _phase: Phase) {
        writeln!(io::stderr(), "done").ok();
    }
}

/// Bundles the sleeper and progress reporter handed to every loop.
#[derive(Clone)]
pub struct Pacing {
    sleeper: Arc<dyn Sleeper>,
    progress: Arc<dyn ProgressReporter>,
}

impl Pacing {
    /// Creates a pacing bundle from explicit collaborators.
    #[must_use]
    pub fn new(sleeper: Arc<dyn Sleeper>, progress: Arc<dyn ProgressReporter>) -> Self {
        Self { sleeper, progress }
    }

    /// Pacing used by the binary: tokio timers and stderr dots.
    #[must_use]
    pub fn production() -> Self {
        Self::new(Arc::new(TokioSleeper), Arc::new(StderrProgress))
    }

    /// Returns the progress reporter.
    #[must_use]
    pub fn progress(&self) -> &dyn ProgressReporter {
        self.progress.as_ref()
    }

    /// Sleeps for `duration`. A zero duration returns immediately without
    /// consulting the sleeper.
    pub async fn pause(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        trace!(?duration, "pausing between attempts");
        self.sleeper.sleep(duration).await;
    }
}

impl fmt::Debug for Pacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pacing").finish_non_exhaustive()
    }
}
