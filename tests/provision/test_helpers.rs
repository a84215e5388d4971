//! Shared fixtures for provisioning BDD scenarios.

use std::io::Write;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;

use camino::Utf8PathBuf;
use landfall::control_plane::{InstanceSnapshot, InstanceState};
use landfall::test_support::{
    FakeControlPlane, LoopbackTunneler, RecordingProgress, RecordingSleeper,
};
use landfall::{Handoff, Platform, ProvisionPlan, SshConfig};
use rstest::fixture;
use tempfile::TempDir;
use thiserror::Error;

pub const INSTANCE_ID: &str = "i-0bdd";
pub const PUBLIC_IP: &str = "127.0.0.1";
pub const PRIVATE_IP: &str = "10.1.2.3";

#[derive(Clone, Debug)]
pub struct ProvisionContext {
    pub plane: FakeControlPlane,
    pub tunneler: LoopbackTunneler,
    pub sleeper: RecordingSleeper,
    pub progress: RecordingProgress,
    pub plan: ProvisionPlan,
    pub ssh_config: SshConfig,
    pub expected_password: Option<String>,
    pub key_dir: Option<Arc<TempDir>>,
    pub outcome: Option<ProvisionResult>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionFailure {
    pub step: String,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum ProvisionResult {
    Success(Box<Handoff>),
    Failure(ProvisionFailure),
}

#[derive(Clone, Debug, Error)]
pub enum ProvisionTestError {
    #[error("invalid provision fixture: {0}")]
    Fixture(String),
}

pub type ProvisionContextResult = Result<ProvisionContext, ProvisionTestError>;

#[fixture]
pub fn provision_context_result() -> ProvisionContextResult {
    Ok(ProvisionContext {
        plane: FakeControlPlane::new(),
        tunneler: LoopbackTunneler::new(),
        sleeper: RecordingSleeper::new(),
        progress: RecordingProgress::new(),
        plan: ProvisionPlan::new(Platform::Linux),
        ssh_config: SshConfig::default(),
        expected_password: None,
        key_dir: None,
        outcome: None,
    })
}

#[fixture]
pub fn provision_context(provision_context_result: ProvisionContextResult) -> ProvisionContext {
    provision_context_result
        .unwrap_or_else(|err| panic!("provision context fixture should initialise: {err}"))
}

/// Snapshot of the scenario instance in `state`, outside any VPC.
pub fn instance(state: InstanceState) -> InstanceSnapshot {
    InstanceSnapshot {
        public_ip_address: Some(String::from(PUBLIC_IP)),
        private_ip_address: Some(String::from(PRIVATE_IP)),
        ..InstanceSnapshot::new(INSTANCE_ID, state)
    }
}

/// Listener on a loopback port. With `banner` set, every connection is
/// greeted with an SSH identification line.
pub fn listener(banner: bool) -> Result<SocketAddr, ProvisionTestError> {
    let bound = TcpListener::bind("127.0.0.1:0")
        .map_err(|err| ProvisionTestError::Fixture(format!("bind listener: {err}")))?;
    let addr = bound
        .local_addr()
        .map_err(|err| ProvisionTestError::Fixture(format!("listener address: {err}")))?;
    thread::spawn(move || {
        for mut stream in bound.incoming().flatten() {
            if banner {
                stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").ok();
            }
        }
    });
    Ok(addr)
}

/// A loopback port with nothing listening on it.
pub fn closed_port() -> Result<u16, ProvisionTestError> {
    let bound = TcpListener::bind("127.0.0.1:0")
        .map_err(|err| ProvisionTestError::Fixture(format!("bind listener: {err}")))?;
    let port = bound
        .local_addr()
        .map_err(|err| ProvisionTestError::Fixture(format!("listener address: {err}")))?
        .port();
    drop(bound);
    Ok(port)
}

pub fn utf8(dir: &TempDir) -> Result<Utf8PathBuf, ProvisionTestError> {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).map_err(|path| {
        ProvisionTestError::Fixture(format!("temp dir is not utf8: {}", path.display()))
    })
}
