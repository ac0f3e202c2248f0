//! Scripted stand-ins for controller collaborators.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::ThreadId;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use vmlite_shared::errors::{VmliteError, VmliteResult};

use crate::monitor::StatusMonitor;
use crate::net::{AddressResolver, HostNetwork};
use crate::portal::{ExecOutput, GuestConnector, GuestExecSession};
use crate::vmm::VmState;
use crate::vmm::process::{
    ExitState, ExitStatus, ProcessError, ProcessEvent, ProcessFactory, ProcessSpec, ProcessState,
    VmProcess,
};
use crate::vmm::qemu::{HypervisorProbe, ResumeMetadata};

pub const GREETING: &[u8] =
    b"{\"QMP\": {\"version\": {\"qemu\": {\"micro\": 2, \"minor\": 2, \"major\": 8}}, \"capabilities\": []}}\r\n";
pub const ACK: &[u8] = b"{\"return\": {}}\r\n";

pub fn event_line(name: &str) -> Vec<u8> {
    format!(
        "{{\"timestamp\": {{\"seconds\": 1700000000, \"microseconds\": 1}}, \"event\": \"{}\"}}\r\n",
        name
    )
    .into_bytes()
}

/// How a `FakeProcess` behaves when started.
#[derive(Debug, Clone)]
pub enum Launch {
    /// Starts, greets, and acknowledges the capability handshake.
    Boot,
    /// Starts and greets but never acknowledges the handshake.
    BootWithoutAck,
    /// Writes `stderr` and exits before reporting started.
    CrashBeforeStarted { stderr: String },
    /// Reports started, then writes `stderr` and exits before the handshake
    /// can be sent.
    ExitAfterStarted { stderr: String },
    /// Cannot be spawned at all.
    FailToSpawn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Exited,
}

/// A hypervisor process that reacts to QMP commands like QEMU would.
pub struct FakeProcess {
    spec: ProcessSpec,
    launch: Launch,
    tx: Mutex<Option<UnboundedSender<ProcessEvent>>>,
    rx: Mutex<Option<UnboundedReceiver<ProcessEvent>>>,
    phase: watch::Sender<Phase>,
    started: AtomicBool,
    writes: Mutex<Vec<String>>,
    kills: AtomicUsize,
    channel_broken: AtomicBool,
}

impl FakeProcess {
    pub fn new(spec: ProcessSpec, launch: Launch) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            spec,
            launch,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            phase,
            started: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
            kills: AtomicUsize::new(0),
            channel_broken: AtomicBool::new(false),
        }
    }

    fn emit(&self, event: ProcessEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn finish(&self, exit: ExitState) {
        if *self.phase.borrow() == Phase::Exited {
            return;
        }
        self.emit(ProcessEvent::StateChanged(ProcessState::NotRunning));
        self.emit(ProcessEvent::Finished(exit));
        self.tx.lock().take();
        self.phase.send_replace(Phase::Exited);
    }

    /// Deliver one read event of hypervisor output.
    pub fn inject_stdout(&self, bytes: &[u8]) {
        self.emit(ProcessEvent::Stdout(bytes.to_vec()));
    }

    pub fn inject_stderr(&self, text: &str) {
        self.emit(ProcessEvent::Stderr(text.as_bytes().to_vec()));
    }

    /// Exit on its own with `code`.
    pub fn exit(&self, code: i32) {
        self.finish(ExitState {
            code: Some(code),
            status: ExitStatus::NormalExit,
        });
    }

    /// Commands written so far, one JSON document each.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Fail every later write while the process keeps running.
    pub fn break_control_channel(&self) {
        self.channel_broken.store(true, Ordering::SeqCst);
    }

    /// Exit abnormally, reporting the crash before the exit like `HostProcess`.
    pub fn crash(&self) {
        if *self.phase.borrow() != Phase::Running {
            return;
        }
        self.emit(ProcessEvent::ErrorOccurred(ProcessError::Crashed));
        self.finish(ExitState {
            code: None,
            status: ExitStatus::CrashExit,
        });
    }

    fn respond(&self, command: &Value) {
        let execute = command["execute"].as_str().unwrap_or_default();
        let command_line = command["arguments"]["command-line"]
            .as_str()
            .unwrap_or_default();

        match execute {
            "qmp_capabilities" => {
                if matches!(self.launch, Launch::Boot) {
                    self.inject_stdout(ACK);
                }
            }
            "system_powerdown" => {
                self.inject_stdout(&event_line("POWERDOWN"));
                self.inject_stdout(&event_line("SHUTDOWN"));
                self.exit(0);
            }
            "human-monitor-command" if command_line.starts_with("savevm") => {
                self.inject_stdout(&event_line("STOP"));
                self.inject_stdout(&event_line("RESUME"));
            }
            _ => self.inject_stdout(ACK),
        }
    }
}

#[async_trait::async_trait]
impl VmProcess for FakeProcess {
    async fn start(&self) -> VmliteResult<()> {
        self.emit(ProcessEvent::StateChanged(ProcessState::Starting));

        match &self.launch {
            Launch::Boot | Launch::BootWithoutAck => {
                self.started.store(true, Ordering::SeqCst);
                self.phase.send_replace(Phase::Running);
                self.emit(ProcessEvent::StateChanged(ProcessState::Running));
                self.emit(ProcessEvent::Started);
                self.inject_stdout(GREETING);
                Ok(())
            }
            Launch::ExitAfterStarted { stderr } => {
                self.started.store(true, Ordering::SeqCst);
                self.phase.send_replace(Phase::Running);
                self.emit(ProcessEvent::StateChanged(ProcessState::Running));
                self.emit(ProcessEvent::Started);
                self.emit(ProcessEvent::Stderr(stderr.as_bytes().to_vec()));
                self.exit(1);
                Ok(())
            }
            Launch::CrashBeforeStarted { stderr } => {
                self.emit(ProcessEvent::Stderr(stderr.as_bytes().to_vec()));
                self.exit(1);
                Ok(())
            }
            Launch::FailToSpawn => {
                self.emit(ProcessEvent::ErrorOccurred(ProcessError::FailedToStart(
                    "no such file".into(),
                )));
                self.emit(ProcessEvent::StateChanged(ProcessState::NotRunning));
                self.tx.lock().take();
                self.phase.send_replace(Phase::Exited);
                Err(VmliteError::Engine(format!(
                    "Failed to spawn {}: no such file",
                    self.spec.program
                )))
            }
        }
    }

    fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.crash();
    }

    async fn write(&self, data: &[u8]) -> VmliteResult<()> {
        if *self.phase.borrow() != Phase::Running || self.channel_broken.load(Ordering::SeqCst) {
            return Err(VmliteError::Engine(
                "failed to write to process: Broken pipe".into(),
            ));
        }

        let text = String::from_utf8_lossy(data).trim_end().to_string();
        let command: Value = serde_json::from_str(&text)?;
        self.writes.lock().push(text);
        self.respond(&command);
        Ok(())
    }

    async fn wait_for_started(&self) -> bool {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|p| *p != Phase::Idle).await;
        self.started.load(Ordering::SeqCst)
    }

    async fn wait_for_finished(&self) {
        if *self.phase.borrow() == Phase::Idle {
            return;
        }
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|p| *p == Phase::Exited).await;
    }

    fn running(&self) -> bool {
        *self.phase.borrow() == Phase::Running
    }

    fn pid(&self) -> Option<u32> {
        self.running().then_some(4242)
    }

    fn take_events(&self) -> Option<UnboundedReceiver<ProcessEvent>> {
        self.rx.lock().take()
    }

    fn spec(&self) -> &ProcessSpec {
        &self.spec
    }
}

/// Hands out `FakeProcess`es following a launch script.
pub struct FakeFactory {
    launches: Mutex<Vec<Launch>>,
    specs: Mutex<Vec<ProcessSpec>>,
    last: Mutex<Option<Arc<FakeProcess>>>,
}

impl FakeFactory {
    /// Every process launches as `launch`.
    pub fn new(launch: Launch) -> Self {
        Self::scripted(vec![launch])
    }

    /// Processes launch as listed; the last entry repeats.
    pub fn scripted(launches: Vec<Launch>) -> Self {
        Self {
            launches: Mutex::new(launches),
            specs: Mutex::new(Vec::new()),
            last: Mutex::new(None),
        }
    }

    pub fn specs(&self) -> Vec<ProcessSpec> {
        self.specs.lock().clone()
    }

    pub fn last(&self) -> Arc<FakeProcess> {
        self.last.lock().clone().expect("no process created")
    }
}

impl ProcessFactory for FakeFactory {
    fn create(&self, spec: ProcessSpec) -> VmliteResult<Arc<dyn VmProcess>> {
        let launch = {
            let mut launches = self.launches.lock();
            if launches.len() > 1 {
                launches.remove(0)
            } else {
                launches.first().cloned().unwrap_or(Launch::Boot)
            }
        };

        self.specs.lock().push(spec.clone());
        let process = Arc::new(FakeProcess::new(spec, launch));
        *self.last.lock() = Some(Arc::clone(&process));
        Ok(process)
    }
}

/// Records everything reported to it.
#[derive(Default)]
pub struct FakeMonitor {
    persisted: Mutex<Vec<(String, VmState)>>,
    metadata: Mutex<HashMap<String, ResumeMetadata>>,
    pub resumes: AtomicUsize,
    pub suspends: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub restarts: AtomicUsize,
}

impl FakeMonitor {
    pub fn states(&self) -> Vec<VmState> {
        self.persisted.lock().iter().map(|(_, s)| *s).collect()
    }

    pub fn metadata_for(&self, name: &str) -> Option<ResumeMetadata> {
        self.metadata.lock().get(name).cloned()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl StatusMonitor for FakeMonitor {
    fn persist_state(&self, name: &str, state: VmState) -> VmliteResult<()> {
        self.persisted.lock().push((name.to_string(), state));
        Ok(())
    }

    fn retrieve_metadata(&self, name: &str) -> VmliteResult<ResumeMetadata> {
        Ok(self.metadata_for(name).unwrap_or_default())
    }

    fn update_metadata(&self, name: &str, metadata: &ResumeMetadata) -> VmliteResult<()> {
        self.metadata
            .lock()
            .insert(name.to_string(), metadata.clone());
        Ok(())
    }

    fn on_resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_suspend(&self) {
        self.suspends.fetch_add(1, Ordering::SeqCst);
    }

    fn on_shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    fn on_restart(&self, _name: &str) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Misses a fixed number of lookups, then answers.
pub struct FakeResolver {
    misses: AtomicUsize,
    ip: Option<Ipv4Addr>,
    lookups: AtomicUsize,
}

impl FakeResolver {
    pub fn after(misses: usize, ip: Ipv4Addr) -> Self {
        Self {
            misses: AtomicUsize::new(misses),
            ip: Some(ip),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn never() -> Self {
        Self {
            misses: AtomicUsize::new(0),
            ip: None,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl AddressResolver for FakeResolver {
    fn lookup(&self, _mac_addr: &str) -> Option<Ipv4Addr> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let remaining = self.misses.load(Ordering::SeqCst);
        if remaining > 0 {
            self.misses.store(remaining - 1, Ordering::SeqCst);
            return None;
        }
        self.ip
    }
}

/// Answers probe queries from fixed values.
pub struct FakeProbe {
    machine_type: Option<String>,
    version: Option<String>,
    supported: Option<Vec<String>>,
    tags: Option<Vec<String>>,
    threads: Mutex<Vec<ThreadId>>,
}

impl FakeProbe {
    pub fn new(machine_type: &str, version: &str) -> Self {
        Self {
            machine_type: Some(machine_type.to_string()),
            version: Some(version.to_string()),
            supported: Some(vec![machine_type.to_string()]),
            tags: Some(Vec::new()),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            machine_type: None,
            version: None,
            supported: None,
            tags: None,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_snapshot(mut self, tag: &str) -> Self {
        self.tags.get_or_insert_with(Vec::new).push(tag.to_string());
        self
    }

    pub fn with_supported(mut self, machines: &[&str]) -> Self {
        self.supported = Some(machines.iter().map(|m| m.to_string()).collect());
        self
    }

    /// Threads that ran the hypervisor queries (not image inspection).
    pub fn query_threads(&self) -> Vec<ThreadId> {
        self.threads.lock().clone()
    }

    fn note_thread(&self) {
        self.threads.lock().push(std::thread::current().id());
    }
}

fn probe_err<T>() -> VmliteResult<T> {
    Err(VmliteError::Engine("probe unavailable".into()))
}

impl HypervisorProbe for FakeProbe {
    fn machine_type(&self) -> VmliteResult<String> {
        self.note_thread();
        self.machine_type.clone().map_or_else(probe_err, Ok)
    }

    fn version(&self) -> VmliteResult<String> {
        self.note_thread();
        self.version.clone().map_or_else(probe_err, Ok)
    }

    fn supported_machines(&self) -> VmliteResult<Vec<String>> {
        self.note_thread();
        self.supported.clone().map_or_else(probe_err, Ok)
    }

    fn snapshot_tags(&self, _image: &Path) -> VmliteResult<Vec<String>> {
        self.tags.clone().map_or_else(probe_err, Ok)
    }
}

/// Records tap device operations.
#[derive(Default)]
pub struct FakeNetwork {
    created: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl FakeNetwork {
    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }
}

impl HostNetwork for FakeNetwork {
    fn create_tap(&self, name: &str) -> VmliteResult<()> {
        self.created.lock().push(name.to_string());
        Ok(())
    }

    fn remove_tap(&self, name: &str) {
        self.removed.lock().push(name.to_string());
    }
}

/// Guest connector whose guests accept connections after a number of refusals.
pub struct FakeConnector {
    refusals: AtomicUsize,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn reachable() -> Self {
        Self::after(0)
    }

    pub fn after(refusals: usize) -> Self {
        Self {
            refusals: AtomicUsize::new(refusals),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self::after(usize::MAX)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl GuestConnector for FakeConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        _username: &str,
    ) -> VmliteResult<Box<dyn GuestExecSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.refusals.load(Ordering::SeqCst);
        if remaining > 0 {
            self.refusals.store(remaining.saturating_sub(1), Ordering::SeqCst);
            return Err(VmliteError::Engine(format!(
                "connection refused: {}:{}",
                host, port
            )));
        }
        Ok(Box::new(FakeSession { connected: true }))
    }
}

pub struct FakeSession {
    connected: bool,
}

#[async_trait::async_trait]
impl GuestExecSession for FakeSession {
    async fn execute(&mut self, command: &str) -> VmliteResult<ExecOutput> {
        Ok(ExecOutput {
            exit_code: 0,
            stdout: command.to_string(),
            stderr: String::new(),
        })
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn force_shutdown(&mut self) {
        self.connected = false;
    }
}
