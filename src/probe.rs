//! Single-attempt liveness checks for the two bootstrap protocols.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::pacing::Phase;
use crate::tunnel::TunnelError;

/// Longest banner line read from the shell listener.
const MAX_BANNER_BYTES: u64 = 1024;

/// Remote-management protocol the bootstrap step will use.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BootstrapProtocol {
    /// Byte-stream shell protocol (SSH).
    Ssh,
    /// Remote-management protocol (`WinRM`).
    WinRm,
}

impl BootstrapProtocol {
    /// Progress phase used while probing this protocol.
    #[must_use]
    pub const fn phase(self) -> Phase {
        match self {
            Self::Ssh => Phase::ShellReachability,
            Self::WinRm => Phase::ManagementReachability,
        }
    }

    /// Protocol name as accepted on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::WinRm => "winrm",
        }
    }
}

impl fmt::Display for BootstrapProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a protocol name is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unsupported bootstrap protocol '{value}' (supported: winrm, ssh)")]
pub struct UnsupportedProtocol {
    /// Name as supplied.
    pub value: String,
}

impl FromStr for BootstrapProtocol {
    type Err = UnsupportedProtocol;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(Self::Ssh),
            "winrm" => Ok(Self::WinRm),
            _ => Err(UnsupportedProtocol {
                value: value.to_owned(),
            }),
        }
    }
}

/// Fatal errors that stop the reachability loop.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProbeError {
    /// The tunnel client cannot run at all.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Result of one probe attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProbeOutcome {
    /// The listener answered as expected.
    Ready,
    /// The target is not reachable yet; the reason is for diagnostics only.
    NotReadyYet(String),
    /// Polling cannot succeed and must stop.
    Fatal(ProbeError),
}

impl ProbeOutcome {
    /// Returns `true` for [`ProbeOutcome::Ready`].
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Maps a socket error onto a probe outcome.
///
/// Refused, reset, unreachable, timed-out and permission errors all mean the
/// target is still coming up, whether the socket is direct or tunnelled.
#[must_use]
pub fn classify_io_error(err: &io::Error) -> ProbeOutcome {
    debug!(kind = ?err.kind(), error = %err, "socket error while probing");
    ProbeOutcome::NotReadyYet(format!("{:?}: {err}", err.kind()))
}

/// Connects to `host:port` and waits up to `banner_timeout` for a non-empty
/// banner line.
pub async fn probe_shell(host: &str, port: u16, banner_timeout: Duration) -> ProbeOutcome {
    let stream = match TcpStream::connect((host, port)).await {
        Ok(stream) => stream,
        Err(err) => return classify_io_error(&err),
    };

    let mut banner = String::new();
    let mut reader = BufReader::new(stream).take(MAX_BANNER_BYTES);
    match timeout(banner_timeout, reader.read_line(&mut banner)).await {
        Err(_) => ProbeOutcome::NotReadyYet(format!(
            "no banner within {}s",
            banner_timeout.as_secs()
        )),
        Ok(Err(err)) => classify_io_error(&err),
        Ok(Ok(0)) => ProbeOutcome::NotReadyYet(String::from("connection closed before banner")),
        Ok(Ok(_)) if banner.trim().is_empty() => {
            ProbeOutcome::NotReadyYet(String::from("empty banner line"))
        }
        Ok(Ok(_)) => {
            debug!(host, port, banner = banner.trim_end(), "received shell banner");
            ProbeOutcome::Ready
        }
    }
}

/// Connects to `host:port` and closes the connection straight away.
pub async fn probe_management(host: &str, port: u16) -> ProbeOutcome {
    match TcpStream::connect((host, port)).await {
        Ok(stream) => {
            drop(stream);
            ProbeOutcome::Ready
        }
        Err(err) => classify_io_error(&err),
    }
}

/// Connects to a forwarded `host:port` and waits up to `settle` for the
/// forwarding client to give up on the remote end.
///
/// A port forward accepts the local connection before the far side is
/// reached and closes it once the remote open fails. End of stream or a reset
/// inside the window therefore means the target port is still closed; a
/// connection that stays open, or starts sending, means it is listening.
pub async fn probe_forwarded_management(host: &str, port: u16, settle: Duration) -> ProbeOutcome {
    let mut stream = match TcpStream::connect((host, port)).await {
        Ok(stream) => stream,
        Err(err) => return classify_io_error(&err),
    };
    let mut byte = [0_u8; 1];
    match timeout(settle, stream.read(&mut byte)).await {
        Ok(Ok(0)) => ProbeOutcome::NotReadyYet(String::from("forwarded channel closed by gateway")),
        Ok(Err(err)) => classify_io_error(&err),
        Err(_) | Ok(Ok(_)) => {
            debug!(host, port, "forwarded management channel held open");
            ProbeOutcome::Ready
        }
    }
}

/// Runs the probe matching `protocol` once.
pub async fn probe_once(
    protocol: BootstrapProtocol,
    host: &str,
    port: u16,
    banner_timeout: Duration,
) -> ProbeOutcome {
    match protocol {
        BootstrapProtocol::Ssh => probe_shell(host, port, banner_timeout).await,
        BootstrapProtocol::WinRm => probe_management(host, port).await,
    }
}

/// Runs the probe matching `protocol` once against a local port forward.
pub async fn probe_forwarded_once(
    protocol: BootstrapProtocol,
    host: &str,
    port: u16,
    banner_timeout: Duration,
) -> ProbeOutcome {
    match protocol {
        BootstrapProtocol::Ssh => probe_shell(host, port, banner_timeout).await,
        BootstrapProtocol::WinRm => probe_forwarded_management(host, port, banner_timeout).await,
    }
}
