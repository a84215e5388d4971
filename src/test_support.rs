//! Test support utilities shared across unit and integration tests.
//!
//! Every double here is cheap to clone; clones share state so a test can keep
//! one handle for assertions while the code under test owns another.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::control_plane::{
    AttachmentStatus, ControlPlane, ControlPlaneError, ControlPlaneFuture, ElasticAddress,
    InstanceHandle, InstanceSnapshot, InstanceState, LaunchRequest,
};
use crate::gateway::GatewayDescriptor;
use crate::pacing::{Phase, ProgressReporter, SleepFuture, Sleeper};
use crate::tunnel::{TunnelError, TunnelFuture, TunnelSession, Tunneler};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Sleeper that records requested durations and returns immediately.
#[derive(Clone, Debug, Default)]
pub struct RecordingSleeper {
    recorded: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    /// Creates a sleeper with an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Durations requested so far, in order.
    #[must_use]
    pub fn recorded(&self) -> Vec<Duration> {
        lock(&self.recorded).clone()
    }

    /// Sum of every requested duration.
    #[must_use]
    pub fn total(&self) -> Duration {
        lock(&self.recorded).iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        lock(&self.recorded).push(duration);
        Box::pin(std::future::ready(()))
    }
}

/// Progress event captured by [`RecordingProgress`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProgressEvent {
    /// A phase started.
    Started(Phase),
    /// One attempt was made.
    Attempt(Phase),
    /// A bounded operation will be retried.
    Retrying(Phase, u32),
    /// A phase finished.
    Finished(Phase),
}

/// Progress reporter that keeps every event for later assertions.
#[derive(Clone, Debug, Default)]
pub struct RecordingProgress {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingProgress {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event in the order it was reported.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        lock(&self.events).clone()
    }

    /// Number of attempts reported for `phase`.
    #[must_use]
    pub fn attempts(&self, phase: Phase) -> usize {
        lock(&self.events)
            .iter()
            .filter(|event| **event == ProgressEvent::Attempt(phase))
            .count()
    }

    /// Returns `true` once `phase` reported completion.
    #[must_use]
    pub fn finished(&self, phase: Phase) -> bool {
        lock(&self.events).contains(&ProgressEvent::Finished(phase))
    }

    /// Phases in the order they started.
    #[must_use]
    pub fn started_phases(&self) -> Vec<Phase> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Started(phase) => Some(*phase),
                _ => None,
            })
            .collect()
    }
}

impl ProgressReporter for RecordingProgress {
    fn phase_started(&self, phase: Phase) {
        lock(&self.events).push(ProgressEvent::Started(phase));
    }

    fn attempt(&self, phase: Phase) {
        lock(&self.events).push(ProgressEvent::Attempt(phase));
    }

    fn retrying(&self, phase: Phase, remaining: u32, _reason: &str) {
        lock(&self.events).push(ProgressEvent::Retrying(phase, remaining));
    }

    fn phase_finished(&self, phase: Phase) {
        lock(&self.events).push(ProgressEvent::Finished(phase));
    }
}

/// Pops the next scripted value, repeating the last one once the queue has a
/// single entry left.
fn next_sticky<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

#[derive(Debug, Default)]
struct PlaneState {
    launched_id: Option<String>,
    launches: Vec<LaunchRequest>,
    describe_script: HashMap<String, VecDeque<InstanceSnapshot>>,
    current: HashMap<String, InstanceSnapshot>,
    describe_failures: VecDeque<ControlPlaneError>,
    describe_calls: usize,
    tag_failures: VecDeque<ControlPlaneError>,
    tag_calls: usize,
    applied_tags: HashMap<String, BTreeMap<String, String>>,
    addresses: Vec<ElasticAddress>,
    associate_failures: VecDeque<ControlPlaneError>,
    associations: Vec<(String, String)>,
    interfaces: Vec<String>,
    attach_calls: Vec<(String, String, u32)>,
    attachment_script: HashMap<String, VecDeque<Option<AttachmentStatus>>>,
    password_script: VecDeque<Option<String>>,
    password_polls: usize,
}

impl PlaneState {
    fn template(&self, instance_id: &str) -> InstanceSnapshot {
        self.describe_script
            .get(instance_id)
            .and_then(VecDeque::back)
            .or_else(|| self.current.get(instance_id))
            .cloned()
            .unwrap_or_else(|| InstanceSnapshot::new(instance_id, InstanceState::Pending))
    }

    fn describe(&mut self, instance_id: &str) -> Result<Option<InstanceSnapshot>, ControlPlaneError> {
        self.describe_calls = self.describe_calls.saturating_add(1);
        if let Some(err) = self.describe_failures.pop_front() {
            return Err(err);
        }
        if let Some(next) = self
            .describe_script
            .get_mut(instance_id)
            .and_then(VecDeque::pop_front)
        {
            let mut snapshot = next;
            if let Some(current) = self.current.get(instance_id) {
                // Tags and associated addresses survive scripted transitions.
                snapshot.tags.extend(current.tags.clone());
                if snapshot.public_ip_address.is_none() {
                    snapshot.public_ip_address.clone_from(&current.public_ip_address);
                }
            }
            self.current.insert(instance_id.to_owned(), snapshot);
        }
        Ok(self.current.get(instance_id).cloned())
    }
}

/// In-memory [`ControlPlane`] with scripted responses.
///
/// Describe calls consume queued snapshots in order and then keep returning
/// the latest one. Tagging and association update that latest snapshot, so
/// waits that depend on them observe the change.
#[derive(Clone, Debug, Default)]
pub struct FakeControlPlane {
    state: Arc<Mutex<PlaneState>>,
}

impl FakeControlPlane {
    /// Creates a control plane with no instances.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PlaneState> {
        lock(&self.state)
    }

    /// Sets the identifier returned by instance creation.
    pub fn set_launched_id(&self, instance_id: impl Into<String>) {
        self.state().launched_id = Some(instance_id.into());
    }

    /// Queues a snapshot returned by a later describe call.
    pub fn push_instance(&self, snapshot: InstanceSnapshot) {
        self.state()
            .describe_script
            .entry(snapshot.id.clone())
            .or_default()
            .push_back(snapshot);
    }

    /// Queues a copy of the latest known snapshot in `state`.
    pub fn push_instance_state(&self, instance_id: &str, state: InstanceState) {
        let snapshot = InstanceSnapshot {
            state,
            ..self.state().template(instance_id)
        };
        self.push_instance(snapshot);
    }

    /// Makes the next describe call fail with `err`.
    pub fn fail_next_describe(&self, err: ControlPlaneError) {
        self.state().describe_failures.push_back(err);
    }

    /// Makes the next tag call fail with `err`.
    pub fn fail_next_create_tags(&self, err: ControlPlaneError) {
        self.state().tag_failures.push_back(err);
    }

    /// Makes the next association fail with `err`.
    pub fn fail_next_associate(&self, err: ControlPlaneError) {
        self.state().associate_failures.push_back(err);
    }

    /// Registers an elastic IP.
    pub fn add_address(&self, address: ElasticAddress) {
        self.state().addresses.push(address);
    }

    /// Registers a network interface identifier.
    pub fn add_network_interface(&self, interface_id: &str) {
        self.state().interfaces.push(interface_id.to_owned());
    }

    /// Queues an attachment status for `interface_id`.
    pub fn push_attachment_status(&self, interface_id: &str, status: Option<AttachmentStatus>) {
        self.state()
            .attachment_script
            .entry(interface_id.to_owned())
            .or_default()
            .push_back(status);
    }

    /// Queues a password poll result.
    pub fn push_password_blob(&self, blob: Option<String>) {
        self.state().password_script.push_back(blob);
    }

    /// Launch requests received so far.
    #[must_use]
    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.state().launches.clone()
    }

    /// Number of describe calls made.
    #[must_use]
    pub fn describe_calls(&self) -> usize {
        self.state().describe_calls
    }

    /// Number of tag calls made, successful or not.
    #[must_use]
    pub fn create_tags_calls(&self) -> usize {
        self.state().tag_calls
    }

    /// Tags successfully applied to `instance_id`.
    #[must_use]
    pub fn applied_tags(&self, instance_id: &str) -> BTreeMap<String, String> {
        self.state()
            .applied_tags
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Successful associations as `(instance_id, public_ip)`.
    #[must_use]
    pub fn associations(&self) -> Vec<(String, String)> {
        self.state().associations.clone()
    }

    /// Attachment requests as `(interface_id, instance_id, device_index)`.
    #[must_use]
    pub fn attach_calls(&self) -> Vec<(String, String, u32)> {
        self.state().attach_calls.clone()
    }

    /// Number of password polls made.
    #[must_use]
    pub fn password_polls(&self) -> usize {
        self.state().password_polls
    }

    fn launch(&self, request: &LaunchRequest) -> InstanceHandle {
        let mut state = self.state();
        state.launches.push(request.clone());
        let instance_id = state
            .launched_id
            .clone()
            .unwrap_or_else(|| String::from("i-0fake"));
        state
            .current
            .entry(instance_id.clone())
            .or_insert_with(|| InstanceSnapshot::new(instance_id.clone(), InstanceState::Pending));
        InstanceHandle::new(instance_id)
    }

    fn tag(
        &self,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ControlPlaneError> {
        let mut state = self.state();
        state.tag_calls = state.tag_calls.saturating_add(1);
        if let Some(err) = state.tag_failures.pop_front() {
            return Err(err);
        }
        state
            .applied_tags
            .entry(instance_id.to_owned())
            .or_default()
            .extend(tags.clone());
        if let Some(current) = state.current.get_mut(instance_id) {
            current.tags.extend(tags.clone());
        }
        Ok(())
    }

    fn associate(
        &self,
        instance_id: &str,
        address: &ElasticAddress,
    ) -> Result<(), ControlPlaneError> {
        let mut state = self.state();
        if let Some(err) = state.associate_failures.pop_front() {
            return Err(err);
        }
        state
            .associations
            .push((instance_id.to_owned(), address.public_ip.clone()));
        if let Some(current) = state.current.get_mut(instance_id) {
            current.public_ip_address = Some(address.public_ip.clone());
        }
        Ok(())
    }

    fn attach(&self, interface_id: &str, instance_id: &str, device_index: u32) -> String {
        let mut state = self.state();
        state
            .attach_calls
            .push((interface_id.to_owned(), instance_id.to_owned(), device_index));
        format!("eni-attach-{}", state.attach_calls.len())
    }

    fn attachment(&self, interface_id: &str) -> Option<AttachmentStatus> {
        self.state()
            .attachment_script
            .get_mut(interface_id)
            .and_then(next_sticky)
            .flatten()
    }

    fn password(&self) -> Option<String> {
        let mut state = self.state();
        state.password_polls = state.password_polls.saturating_add(1);
        next_sticky(&mut state.password_script).flatten()
    }
}

fn ready<'a, T: Send + 'a>(result: Result<T, ControlPlaneError>) -> ControlPlaneFuture<'a, T> {
    Box::pin(std::future::ready(result))
}

impl ControlPlane for FakeControlPlane {
    fn create_instance<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> ControlPlaneFuture<'a, InstanceHandle> {
        ready(Ok(self.launch(request)))
    }

    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ControlPlaneFuture<'a, Option<InstanceSnapshot>> {
        ready(self.state().describe(instance_id))
    }

    fn create_tags<'a>(
        &'a self,
        instance_id: &'a str,
        tags: &'a BTreeMap<String, String>,
    ) -> ControlPlaneFuture<'a, ()> {
        ready(self.tag(instance_id, tags))
    }

    fn list_addresses<'a>(
        &'a self,
        public_ip: &'a str,
    ) -> ControlPlaneFuture<'a, Vec<ElasticAddress>> {
        let matching = self
            .state()
            .addresses
            .iter()
            .filter(|address| address.public_ip == public_ip)
            .cloned()
            .collect();
        ready(Ok(matching))
    }

    fn associate_address<'a>(
        &'a self,
        instance_id: &'a str,
        address: &'a ElasticAddress,
    ) -> ControlPlaneFuture<'a, ()> {
        ready(self.associate(instance_id, address))
    }

    fn list_network_interface_ids<'a>(
        &'a self,
        _vpc_id: Option<&'a str>,
    ) -> ControlPlaneFuture<'a, Vec<String>> {
        ready(Ok(self.state().interfaces.clone()))
    }

    fn attach_network_interface<'a>(
        &'a self,
        interface_id: &'a str,
        instance_id: &'a str,
        device_index: u32,
    ) -> ControlPlaneFuture<'a, String> {
        ready(Ok(self.attach(interface_id, instance_id, device_index)))
    }

    fn network_interface_attachment_status<'a>(
        &'a self,
        interface_id: &'a str,
    ) -> ControlPlaneFuture<'a, Option<AttachmentStatus>> {
        ready(Ok(self.attachment(interface_id)))
    }

    fn password_data<'a>(&'a self, _instance_id: &'a str) -> ControlPlaneFuture<'a, Option<String>> {
        ready(Ok(self.password()))
    }
}

/// Counts a close when dropped together with the forwarding task.
struct CloseMarker(Arc<AtomicUsize>);

impl Drop for CloseMarker {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct TunnelLog {
    routes: HashMap<(String, u16), SocketAddr>,
    failures_left: usize,
    targets: Vec<(String, u16)>,
    local_ports: Vec<u16>,
}

/// In-process [`Tunneler`] that forwards a loopback port to a target.
///
/// Targets can be rerouted to another address, which lets a test model a
/// host that is only reachable through the gateway.
#[derive(Clone, Debug, Default)]
pub struct LoopbackTunneler {
    log: Arc<Mutex<TunnelLog>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl LoopbackTunneler {
    /// Creates a tunneler that forwards straight to the requested target.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forwards connections for `host:port` to `upstream` instead.
    pub fn route(&self, host: &str, port: u16, upstream: SocketAddr) {
        lock(&self.log)
            .routes
            .insert((host.to_owned(), port), upstream);
    }

    /// Makes the next `count` opens fail with a setup error.
    pub fn fail_next_opens(&self, count: usize) {
        lock(&self.log).failures_left = count;
    }

    /// Number of tunnels opened.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of tunnels torn down.
    #[must_use]
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Targets requested, in order.
    #[must_use]
    pub fn targets(&self) -> Vec<(String, u16)> {
        lock(&self.log).targets.clone()
    }

    /// Loopback ports handed to probes, in order.
    #[must_use]
    pub fn local_ports(&self) -> Vec<u16> {
        lock(&self.log).local_ports.clone()
    }

    async fn open_forward(
        &self,
        gateway: &GatewayDescriptor,
        target_host: &str,
        target_port: u16,
    ) -> Result<TunnelSession, TunnelError> {
        let setup_error = |message: String| TunnelError::Setup {
            gateway: gateway.to_string(),
            message,
        };
        let upstream = {
            let mut log = lock(&self.log);
            log.targets.push((target_host.to_owned(), target_port));
            if log.failures_left > 0 {
                log.failures_left -= 1;
                return Err(setup_error(String::from("simulated gateway failure")));
            }
            log.routes
                .get(&(target_host.to_owned(), target_port))
                .copied()
        };

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|err| setup_error(err.to_string()))?;
        let local_port = listener
            .local_addr()
            .map_err(|err| setup_error(err.to_string()))?
            .port();
        lock(&self.log).local_ports.push(local_port);
        self.opened.fetch_add(1, Ordering::SeqCst);

        let marker = CloseMarker(Arc::clone(&self.closed));
        let host = target_host.to_owned();
        let task = tokio::spawn(async move {
            let _marker = marker;
            while let Ok((mut inbound, _)) = listener.accept().await {
                let connected = match upstream {
                    Some(addr) => TcpStream::connect(addr).await,
                    None => TcpStream::connect((host.as_str(), target_port)).await,
                };
                if let Ok(mut outbound) = connected {
                    tokio::io::copy_bidirectional(&mut inbound, &mut outbound)
                        .await
                        .ok();
                }
            }
        });
        Ok(TunnelSession::from_task(local_port, task))
    }
}

impl Tunneler for LoopbackTunneler {
    fn open<'a>(
        &'a self,
        gateway: &'a GatewayDescriptor,
        target_host: &'a str,
        target_port: u16,
    ) -> TunnelFuture<'a> {
        Box::pin(self.open_forward(gateway, target_host, target_port))
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
