//! Per-attempt local port forwards through an SSH gateway.
//!
//! A [`TunnelSession`] lives for exactly one probe attempt. [`with_tunnel`]
//! opens it, hands the forwarded local port to the probe, and closes it
//! whatever the probe reported.

use std::ffi::OsString;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::gateway::GatewayDescriptor;

/// Default `ssh` client binary name.
pub const DEFAULT_SSH_BIN: &str = "ssh";

const SETUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fresh ports tried after the reserved one was taken.
const PORT_IN_USE_RETRIES: u32 = 3;

/// Future returned by [`Tunneler::open`].
pub type TunnelFuture<'a> = Pin<Box<dyn Future<Output = Result<TunnelSession, TunnelError>> + Send + 'a>>;

/// Errors raised while opening a tunnel.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TunnelError {
    /// The tunnel client could not be started at all.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Client program.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// The gateway did not provide a working forward for this attempt.
    #[error("tunnel through {gateway} not ready: {message}")]
    Setup {
        /// Gateway rendered as `user@host:port`.
        gateway: String,
        /// What went wrong.
        message: String,
    },
}

impl TunnelError {
    /// Returns `true` when retrying cannot help.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Spawn { .. })
    }
}

enum SessionGuard {
    Process(Child),
    Task(JoinHandle<()>),
}

/// A live local port forward scoped to one probe attempt.
pub struct TunnelSession {
    local_port: u16,
    guard: Option<SessionGuard>,
}

impl TunnelSession {
    /// Wraps a forwarding client process listening on `local_port`.
    #[must_use]
    pub const fn from_process(local_port: u16, child: Child) -> Self {
        Self {
            local_port,
            guard: Some(SessionGuard::Process(child)),
        }
    }

    /// Wraps an in-process forwarding task listening on `local_port`.
    #[must_use]
    pub const fn from_task(local_port: u16, task: JoinHandle<()>) -> Self {
        Self {
            local_port,
            guard: Some(SessionGuard::Task(task)),
        }
    }

    /// Loopback port that forwards to the target.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Tears the forward down and waits for it to stop.
    pub async fn close(mut self) {
        match self.guard.take() {
            Some(SessionGuard::Process(mut child)) => {
                child.kill().await.ok();
            }
            Some(SessionGuard::Task(task)) => {
                task.abort();
                task.await.ok();
            }
            None => {}
        }
        debug!(local_port = self.local_port, "tunnel closed");
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        match self.guard.take() {
            Some(SessionGuard::Process(mut child)) => {
                child.start_kill().ok();
            }
            Some(SessionGuard::Task(task)) => task.abort(),
            None => {}
        }
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}

/// Opens port forwards through a gateway.
pub trait Tunneler: Send + Sync {
    /// Opens a forward from a loopback port to `target_host:target_port`.
    fn open<'a>(
        &'a self,
        gateway: &'a GatewayDescriptor,
        target_host: &'a str,
        target_port: u16,
    ) -> TunnelFuture<'a>;
}

/// Runs `probe` against a fresh tunnel and closes the tunnel afterwards.
///
/// # Errors
///
/// Returns the [`TunnelError`] raised while opening the tunnel. The probe is
/// not called in that case.
pub async fn with_tunnel<T, P, F, Fut>(
    tunneler: &T,
    gateway: &GatewayDescriptor,
    target_host: &str,
    target_port: u16,
    probe: F,
) -> Result<P, TunnelError>
where
    T: Tunneler + ?Sized,
    F: FnOnce(u16) -> Fut,
    Fut: Future<Output = P>,
{
    let session = tunneler.open(gateway, target_host, target_port).await?;
    debug!(%gateway, target_host, target_port, local_port = session.local_port(), "tunnel open");
    let outcome = probe(session.local_port()).await;
    session.close().await;
    Ok(outcome)
}

/// Why a single forward attempt did not produce a session.
enum ForwardFailure {
    /// Another process took the reserved loopback port first.
    PortInUse(u16),
    Tunnel(TunnelError),
}

impl From<TunnelError> for ForwardFailure {
    fn from(err: TunnelError) -> Self {
        Self::Tunnel(err)
    }
}

/// Tunneler that runs the system `ssh` client with `-L`.
#[derive(Clone, Debug)]
pub struct SshProcessTunneler {
    program: String,
    setup_timeout: Duration,
    config_file: Option<Utf8PathBuf>,
}

impl SshProcessTunneler {
    /// Creates a tunneler that waits up to `setup_timeout` for the forward.
    #[must_use]
    pub fn new(program: impl Into<String>, setup_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            setup_timeout,
            config_file: None,
        }
    }

    /// Makes `ssh` read `path` instead of its default client configuration,
    /// so the tunnel sees the same file the gateway was resolved from.
    #[must_use]
    pub fn with_config_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Builds the `ssh` argument list for one forward.
    #[must_use]
    pub fn build_args(
        &self,
        gateway: &GatewayDescriptor,
        local_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> Vec<OsString> {
        let mut args = vec![OsString::from("-N")];
        if let Some(path) = &self.config_file {
            args.push(OsString::from("-F"));
            args.push(OsString::from(path.as_str()));
        }
        args.extend([
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
            OsString::from("-o"),
            OsString::from("UserKnownHostsFile=/dev/null"),
            OsString::from("-o"),
            OsString::from("ExitOnForwardFailure=yes"),
            OsString::from("-o"),
            OsString::from("LogLevel=ERROR"),
            OsString::from("-p"),
            OsString::from(gateway.port.to_string()),
        ]);
        for identity in &gateway.identity_files {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity.as_str()));
        }
        if let Some(user) = &gateway.user {
            args.push(OsString::from("-l"));
            args.push(OsString::from(user));
        }
        args.push(OsString::from("-L"));
        args.push(OsString::from(format!(
            "127.0.0.1:{local_port}:{target_host}:{target_port}"
        )));
        args.push(OsString::from(&gateway.host));
        args
    }

    async fn open_forward(
        &self,
        gateway: &GatewayDescriptor,
        target_host: &str,
        target_port: u16,
    ) -> Result<TunnelSession, TunnelError> {
        let mut retries_left = PORT_IN_USE_RETRIES;
        loop {
            match self.try_forward(gateway, target_host, target_port).await {
                Ok(session) => return Ok(session),
                Err(ForwardFailure::Tunnel(err)) => return Err(err),
                Err(ForwardFailure::PortInUse(port)) if retries_left > 0 => {
                    retries_left -= 1;
                    debug!(local_port = port, retries_left, "local forward port taken, retrying");
                }
                Err(ForwardFailure::PortInUse(port)) => {
                    return Err(TunnelError::Setup {
                        gateway: gateway.to_string(),
                        message: format!("local port {port} already in use"),
                    });
                }
            }
        }
    }

    async fn try_forward(
        &self,
        gateway: &GatewayDescriptor,
        target_host: &str,
        target_port: u16,
    ) -> Result<TunnelSession, ForwardFailure> {
        let setup_error = |message: String| TunnelError::Setup {
            gateway: gateway.to_string(),
            message,
        };
        let local_port = reserve_local_port().map_err(|err| setup_error(err.to_string()))?;
        let args = self.build_args(gateway, local_port, target_host, target_port);
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TunnelError::Spawn {
                program: self.program.clone(),
                message: err.to_string(),
            })?;

        let deadline = Instant::now() + self.setup_timeout;
        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|err| setup_error(err.to_string()))?
            {
                let stderr = drain_stderr(&mut child).await;
                if is_port_in_use(&stderr) {
                    return Err(ForwardFailure::PortInUse(local_port));
                }
                return Err(setup_error(format!(
                    "{} exited with {status}: {}",
                    self.program,
                    stderr.trim()
                ))
                .into());
            }
            if TcpStream::connect(local).await.is_ok() {
                return Ok(TunnelSession::from_process(local_port, child));
            }
            if Instant::now() >= deadline {
                child.kill().await.ok();
                return Err(setup_error(format!(
                    "forward not listening after {}s",
                    self.setup_timeout.as_secs()
                ))
                .into());
            }
            tokio::time::sleep(SETUP_POLL_INTERVAL).await;
        }
    }
}

impl Tunneler for SshProcessTunneler {
    fn open<'a>(
        &'a self,
        gateway: &'a GatewayDescriptor,
        target_host: &'a str,
        target_port: u16,
    ) -> TunnelFuture<'a> {
        Box::pin(self.open_forward(gateway, target_host, target_port))
    }
}

/// Asks the kernel for a free loopback port.
///
/// The port is released before `ssh` binds it, so another process can win
/// the race; [`SshProcessTunneler`] retries with a fresh port when it does.
fn reserve_local_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

async fn drain_stderr(child: &mut Child) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        stderr.read_to_string(&mut text).await.ok();
    }
    text
}

fn is_port_in_use(stderr: &str) -> bool {
    stderr.contains("Address already in use") || stderr.contains("cannot listen to port")
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use rstest::rstest;

    use super::*;
    use crate::gateway::GatewaySource;
    use crate::test_support::LoopbackTunneler;

    fn gateway() -> GatewayDescriptor {
        GatewayDescriptor {
            user: Some(String::from("ops")),
            host: String::from("bastion.example.com"),
            port: 2222,
            identity_files: vec![Utf8PathBuf::from("/keys/a"), Utf8PathBuf::from("/keys/b")],
            source: GatewaySource::Explicit,
        }
    }

    fn render(args: &[OsString]) -> String {
        args.iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn ssh_args_forward_loopback_port_to_target() {
        let tunneler = SshProcessTunneler::new("ssh", Duration::from_secs(1));
        let rendered = render(&tunneler.build_args(&gateway(), 40000, "10.0.0.5", 22));

        assert!(rendered.starts_with("-N -o BatchMode=yes"), "{rendered}");
        assert!(!rendered.contains("-F"), "{rendered}");
        assert!(rendered.contains("-o ExitOnForwardFailure=yes"), "{rendered}");
        assert!(rendered.contains("-p 2222 -i /keys/a -i /keys/b -l ops"), "{rendered}");
        assert!(
            rendered.ends_with("-L 127.0.0.1:40000:10.0.0.5:22 bastion.example.com"),
            "{rendered}"
        );
    }

    #[test]
    fn ssh_args_name_the_configured_client_file() {
        let tunneler = SshProcessTunneler::new("ssh", Duration::from_secs(1))
            .with_config_file("/home/ops/.ssh/landfall_config");
        let rendered = render(&tunneler.build_args(&gateway(), 40000, "10.0.0.5", 22));

        assert!(
            rendered.starts_with("-N -F /home/ops/.ssh/landfall_config -o BatchMode=yes"),
            "{rendered}"
        );
    }

    #[rstest]
    #[case("bind [127.0.0.1]:40000: Address already in use\n", true)]
    #[case("channel_setup_fwd_listener_tcpip: cannot listen to port: 40000\n", true)]
    #[case("ssh: connect to host bastion port 22: Connection refused\n", false)]
    fn port_collisions_are_recognised(#[case] stderr: &str, #[case] expected: bool) {
        assert_eq!(is_port_in_use(stderr), expected);
    }

    #[tokio::test]
    async fn taken_local_port_is_retried_with_a_fresh_one() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let log = dir.path().join("invocations.log");
        let script = dir.path().join("ssh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$*\" >> '{}'\necho 'bind [127.0.0.1]:1: Address already in use' >&2\nexit 255\n",
                log.display()
            ),
        )
        .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        let tunneler = SshProcessTunneler::new(script.to_string_lossy(), Duration::from_secs(5));

        let err = tunneler
            .open(&gateway(), "10.0.0.5", 22)
            .await
            .expect_err("every port is reported taken");

        assert!(!err.is_fatal(), "{err}");
        assert!(err.to_string().contains("already in use"), "{err}");
        let invocations = std::fs::read_to_string(&log).expect("read log");
        assert_eq!(invocations.lines().count(), 4, "{invocations}");
    }

    #[tokio::test]
    async fn missing_ssh_binary_is_fatal() {
        let tunneler =
            SshProcessTunneler::new("/nonexistent/landfall-ssh", Duration::from_secs(1));

        let err = tunneler
            .open(&gateway(), "10.0.0.5", 22)
            .await
            .expect_err("spawn should fail");
        assert!(err.is_fatal(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn with_tunnel_closes_session_after_probe() {
        let tunneler = LoopbackTunneler::new();
        let probed = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&probed);

        let port = with_tunnel(&tunneler, &gateway(), "10.0.0.5", 22, |local_port| async move {
            seen.store(true, Ordering::SeqCst);
            local_port
        })
        .await
        .expect("loopback tunnel should open");

        assert!(probed.load(Ordering::SeqCst));
        assert_ne!(port, 0);
        assert_eq!(tunneler.opened(), 1);
        assert_eq!(tunneler.closed(), 1);
    }

    #[tokio::test]
    async fn with_tunnel_skips_probe_when_setup_fails() {
        let tunneler = LoopbackTunneler::new();
        tunneler.fail_next_opens(1);

        let result = with_tunnel(&tunneler, &gateway(), "10.0.0.5", 22, |_| async {
            panic!("probe must not run without a tunnel")
        })
        .await;

        assert!(matches!(result, Err(TunnelError::Setup { .. })), "{result:?}");
    }
}
