//! Tokio-backed `VmProcess` implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vmlite_shared::errors::{VmliteError, VmliteResult};

use super::spawn::spawn_subprocess;
use super::{
    ExitState, ExitStatus, ProcessError, ProcessEvent, ProcessFactory, ProcessSpec, ProcessState,
    VmProcess,
};

const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Exited,
}

/// A hypervisor child process spawned on the host.
///
/// Output readers and the exit supervisor run as tokio tasks; the supervisor
/// owns the `Child` and emits `Finished` only after both output streams hit
/// EOF, so consumers always see the final output before the exit.
pub struct HostProcess {
    spec: ProcessSpec,
    phase: Arc<watch::Sender<Phase>>,
    launched: AtomicBool,
    started: AtomicBool,
    pid: AtomicU32,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    events_tx: Mutex<Option<UnboundedSender<ProcessEvent>>>,
    events_rx: Mutex<Option<UnboundedReceiver<ProcessEvent>>>,
    kill_tx: Mutex<Option<UnboundedSender<()>>>,
}

impl HostProcess {
    pub fn new(spec: ProcessSpec) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(Phase::Idle);

        Self {
            spec,
            phase: Arc::new(phase),
            launched: AtomicBool::new(false),
            started: AtomicBool::new(false),
            pid: AtomicU32::new(0),
            stdin: tokio::sync::Mutex::new(None),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            kill_tx: Mutex::new(None),
        }
    }

    fn phase(&self) -> Phase {
        *self.phase.borrow()
    }
}

#[async_trait::async_trait]
impl VmProcess for HostProcess {
    async fn start(&self) -> VmliteResult<()> {
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(VmliteError::Internal(format!(
                "process {} was already started",
                self.spec.program
            )));
        }

        let events = self
            .events_tx
            .lock()
            .take()
            .ok_or_else(|| VmliteError::Internal("process event sender missing".into()))?;

        let _ = events.send(ProcessEvent::StateChanged(ProcessState::Starting));

        let mut child = match spawn_subprocess(&self.spec) {
            Ok(child) => child,
            Err(e) => {
                let _ = events.send(ProcessEvent::ErrorOccurred(ProcessError::FailedToStart(
                    e.to_string(),
                )));
                let _ = events.send(ProcessEvent::StateChanged(ProcessState::NotRunning));
                self.phase.send_replace(Phase::Exited);
                return Err(e);
            }
        };

        if let Some(pid) = child.id() {
            self.pid.store(pid, Ordering::SeqCst);
        }
        *self.stdin.lock().await = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        self.started.store(true, Ordering::SeqCst);
        self.phase.send_replace(Phase::Running);
        let _ = events.send(ProcessEvent::StateChanged(ProcessState::Running));
        let _ = events.send(ProcessEvent::Started);

        tracing::debug!(
            program = %self.spec.program,
            pid = self.pid.load(Ordering::SeqCst),
            "Process spawned"
        );

        let stdout_task = stdout.map(|out| {
            tokio::spawn(forward_output(out, events.clone(), ProcessEvent::Stdout))
        });
        let stderr_task = stderr.map(|err| {
            tokio::spawn(forward_output(err, events.clone(), ProcessEvent::Stderr))
        });

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        *self.kill_tx.lock() = Some(kill_tx);

        tokio::spawn(supervise(
            child,
            kill_rx,
            [stdout_task, stderr_task],
            events,
            Arc::clone(&self.phase),
        ));

        Ok(())
    }

    fn kill(&self) {
        if self.phase() != Phase::Running {
            return;
        }

        let signalled = self
            .kill_tx
            .lock()
            .as_ref()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false);

        // Supervisor already gone (runtime shutting down): signal directly.
        if !signalled && let Some(pid) = self.pid() {
            crate::util::kill_process(pid);
        }
    }

    async fn write(&self, data: &[u8]) -> VmliteResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| VmliteError::Engine("process stdin is not available".into()))?;

        stdin
            .write_all(data)
            .await
            .map_err(|e| VmliteError::Engine(format!("failed to write to process: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| VmliteError::Engine(format!("failed to flush process stdin: {}", e)))
    }

    async fn wait_for_started(&self) -> bool {
        if !self.launched.load(Ordering::SeqCst) {
            return false;
        }

        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase != Phase::Idle).await;
        self.started.load(Ordering::SeqCst)
    }

    async fn wait_for_finished(&self) {
        if !self.launched.load(Ordering::SeqCst) {
            return;
        }

        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == Phase::Exited).await;
    }

    fn running(&self) -> bool {
        self.phase() == Phase::Running
    }

    fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn take_events(&self) -> Option<UnboundedReceiver<ProcessEvent>> {
        self.events_rx.lock().take()
    }

    fn spec(&self) -> &ProcessSpec {
        &self.spec
    }
}

async fn forward_output<R>(
    mut reader: R,
    events: UnboundedSender<ProcessEvent>,
    wrap: fn(Vec<u8>) -> ProcessEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if events.send(wrap(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = events.send(ProcessEvent::ErrorOccurred(ProcessError::ReadError(
                    e.to_string(),
                )));
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    mut kill_rx: UnboundedReceiver<()>,
    readers: [Option<JoinHandle<()>>; 2],
    events: UnboundedSender<ProcessEvent>,
    phase: Arc<watch::Sender<Phase>>,
) {
    let mut killed = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            // A closed channel means the handle was dropped: terminate as well.
            _ = kill_rx.recv(), if !killed => {
                killed = true;
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "Failed to kill process");
                }
            }
        }
    };

    for reader in readers.into_iter().flatten() {
        let _ = reader.await;
    }

    let exit = match status {
        Ok(status) => ExitState {
            code: status.code(),
            status: if killed || status.code().is_none() {
                ExitStatus::CrashExit
            } else {
                ExitStatus::NormalExit
            },
        },
        Err(e) => {
            tracing::warn!(error = %e, "Failed to reap process");
            ExitState {
                code: None,
                status: ExitStatus::CrashExit,
            }
        }
    };

    if exit.status == ExitStatus::CrashExit {
        let _ = events.send(ProcessEvent::ErrorOccurred(ProcessError::Crashed));
    }
    let _ = events.send(ProcessEvent::StateChanged(ProcessState::NotRunning));
    let _ = events.send(ProcessEvent::Finished(exit));
    phase.send_replace(Phase::Exited);
}

/// Factory producing `HostProcess` handles.
#[derive(Debug, Default, Clone)]
pub struct HostProcessFactory;

impl ProcessFactory for HostProcessFactory {
    fn create(&self, spec: ProcessSpec) -> VmliteResult<Arc<dyn VmProcess>> {
        if let Some(dir) = &spec.working_dir {
            tracing::debug!(working_dir = %dir.display(), "process working dir");
        }
        tracing::info!(program = %spec.program, "process program");
        tracing::info!(arguments = %spec.args.join(", "), "process arguments");

        Ok(Arc::new(HostProcess::new(spec)))
    }
}
