use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::{InMemoryJobRegistry, JobRegistry};
use super::spec::SandboxJobSpec;
use super::state::{JobRecord, JobStatus, SandboxJobState};
use crate::config::SandboxSettings;
use crate::errors::SandboxError;

/// How long a signalled process gets to exit before it is force-killed.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Longest single log entry. Output without newlines is split at this size.
pub const MAX_LOG_LINE_BYTES: usize = 16 * 1024;

/// How long the exit handler waits for output readers to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Retention of terminal jobs in the registry.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    pub max_terminal_jobs: Option<usize>,
    pub max_age: Option<Duration>,
}

/// Outcome of running one command to completion (or timeout) in a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub job_id: String,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status == JobStatus::Exited && self.exit_code == Some(0)
    }

    fn from_state(state: &SandboxJobState, timed_out: bool) -> Self {
        Self {
            job_id: state.id.clone(),
            status: state.status,
            exit_code: state.exit_code,
            output: state.output(),
            timed_out,
        }
    }
}

/// Runs sandboxed commands on behalf of pipeline stages.
/// Real implementation: `SandboxJobManager`. Test doubles live in the stage tests.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, spec: SandboxJobSpec, timeout: Duration) -> CommandOutcome;
}

/// Per-job control channels, separate from the registry's data.
struct JobControl {
    /// Present only while the process is live; taken by `stop()`.
    kill: Option<oneshot::Sender<()>>,
    done: watch::Receiver<bool>,
}

/// Launches and tracks container-backed jobs.
///
/// Each job is owned by its own supervisor task, which is the only writer of
/// the job's record after `start()` returns.
pub struct SandboxJobManager {
    engine: String,
    max_log_lines: usize,
    retention: RetentionPolicy,
    registry: Arc<dyn JobRegistry>,
    controls: Arc<Mutex<HashMap<String, JobControl>>>,
}

impl SandboxJobManager {
    pub fn new(engine: &str, max_log_lines: usize, registry: Arc<dyn JobRegistry>) -> Self {
        Self {
            engine: engine.to_string(),
            max_log_lines,
            retention: RetentionPolicy::default(),
            registry,
            controls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self::new(
            &settings.engine,
            settings.max_log_lines,
            Arc::new(InMemoryJobRegistry::new()),
        )
        .with_retention(RetentionPolicy {
            max_terminal_jobs: settings.retain_max_jobs,
            max_age: settings.retain_max_age_secs.map(Duration::from_secs),
        })
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    fn controls(&self) -> MutexGuard<'_, HashMap<String, JobControl>> {
        self.controls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate the spec, spawn the engine process and register the job.
    ///
    /// Never fails: an invalid spec or a spawn failure yields a job in `error`
    /// status with a diagnostic in its log. Must be called within a Tokio runtime.
    pub fn start(&self, spec: SandboxJobSpec) -> SandboxJobState {
        self.reap();

        let id = Uuid::new_v4().to_string();
        let mut record = JobRecord::new(id.clone(), spec.clone(), self.max_log_lines);

        if let Err(e) = spec.validate() {
            warn!(job_id = %id, error = %e, "rejected sandbox spec");
            record.mark_error(&e.to_string());
            return self.register_finished(record);
        }

        let mut cmd = Command::new(&self.engine);
        cmd.args(spec.engine_args(&id))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let e = SandboxError::SpawnFailed {
                    engine: self.engine.clone(),
                    source,
                };
                warn!(job_id = %id, error = %e, "sandbox spawn failed");
                record.mark_error(&e.to_string());
                return self.register_finished(record);
            }
        };

        record.pid = child.id();
        let snapshot = record.snapshot();
        self.registry.insert(record);

        let (kill_tx, kill_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);
        self.controls().insert(
            id.clone(),
            JobControl {
                kill: Some(kill_tx),
                done: done_rx,
            },
        );

        info!(job_id = %id, pid = ?snapshot.pid, image = %spec.image, cmd = %spec.cmd, "sandbox job started");

        tokio::spawn(supervise(
            Arc::clone(&self.registry),
            Arc::clone(&self.controls),
            id,
            child,
            kill_rx,
            done_tx,
        ));

        snapshot
    }

    fn register_finished(&self, record: JobRecord) -> SandboxJobState {
        let snapshot = record.snapshot();
        let (_, done_rx) = watch::channel(true);
        self.controls().insert(
            record.id.clone(),
            JobControl {
                kill: None,
                done: done_rx,
            },
        );
        self.registry.insert(record);
        snapshot
    }

    pub fn get(&self, id: &str) -> Option<SandboxJobState> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<SandboxJobState> {
        self.registry.list()
    }

    /// Ask a live job to terminate. Returns false for unknown or terminal jobs.
    /// Does not wait for the exit; poll `get()` or use `wait()`.
    pub fn stop(&self, id: &str) -> bool {
        let kill = self.controls().get_mut(id).and_then(|c| c.kill.take());
        match kill {
            Some(tx) => {
                let signalled = tx.send(()).is_ok();
                if signalled {
                    info!(job_id = %id, "stop requested");
                }
                signalled
            }
            None => false,
        }
    }

    /// Wait until the job is terminal or `timeout` elapses, then return its state.
    pub async fn wait(&self, id: &str, timeout: Duration) -> Option<SandboxJobState> {
        let done = self.controls().get(id).map(|c| c.done.clone());
        let Some(mut done) = done else {
            return self.get(id);
        };
        // A closed channel means the supervisor is gone; the registry is authoritative.
        let _ = tokio::time::timeout(timeout, done.wait_for(|finished| *finished)).await;
        self.get(id)
    }

    /// Drop terminal jobs that fall outside the retention policy.
    pub fn reap(&self) -> usize {
        let mut terminal = self.registry.terminal_jobs();
        let mut doomed: Vec<String> = Vec::new();

        if let Some(max_age) = self.retention.max_age
            && let Ok(max_age) = chrono::Duration::from_std(max_age)
        {
            let cutoff = Utc::now() - max_age;
            let (expired, kept): (Vec<_>, Vec<_>) =
                terminal.into_iter().partition(|(_, ended)| *ended < cutoff);
            doomed.extend(expired.into_iter().map(|(id, _)| id));
            terminal = kept;
        }

        if let Some(max) = self.retention.max_terminal_jobs
            && terminal.len() > max
        {
            let excess = terminal.len() - max;
            doomed.extend(terminal.drain(..excess).map(|(id, _)| id));
        }

        if doomed.is_empty() {
            return 0;
        }

        let mut controls = self.controls();
        for id in &doomed {
            self.registry.remove(id);
            controls.remove(id);
        }
        debug!(count = doomed.len(), "reaped terminal sandbox jobs");
        doomed.len()
    }

    /// Signal every live job. Used on server shutdown.
    pub fn shutdown(&self) -> usize {
        let kills: Vec<(String, oneshot::Sender<()>)> = self
            .controls()
            .iter_mut()
            .filter_map(|(id, c)| c.kill.take().map(|tx| (id.clone(), tx)))
            .collect();
        let mut signalled = 0;
        for (id, tx) in kills {
            if tx.send(()).is_ok() {
                info!(job_id = %id, "stopping sandbox job on shutdown");
                signalled += 1;
            }
        }
        signalled
    }
}

#[async_trait]
impl SandboxRunner for SandboxJobManager {
    async fn run(&self, spec: SandboxJobSpec, timeout: Duration) -> CommandOutcome {
        let started = self.start(spec);
        if started.status.is_terminal() {
            return CommandOutcome::from_state(&started, false);
        }

        let state = self.wait(&started.id, timeout).await.unwrap_or(started);
        if state.status.is_terminal() {
            return CommandOutcome::from_state(&state, false);
        }

        warn!(job_id = %state.id, timeout_secs = timeout.as_secs(), "sandbox job timed out");
        self.stop(&state.id);
        CommandOutcome::from_state(&state, true)
    }
}

/// Exit handler for one job: pumps output, waits for exit or a stop request,
/// records the terminal state, then notifies waiters.
async fn supervise(
    registry: Arc<dyn JobRegistry>,
    controls: Arc<Mutex<HashMap<String, JobControl>>>,
    id: String,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    done_tx: watch::Sender<bool>,
) {
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_lines(Arc::clone(&registry), id.clone(), stdout)));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_lines(Arc::clone(&registry), id.clone(), stderr)));
    }

    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => terminate(&id, &mut child).await,
    };
    drop(kill_rx);

    for pump in pumps {
        if tokio::time::timeout(DRAIN_TIMEOUT, pump).await.is_err() {
            debug!(job_id = %id, "output reader still open after exit");
        }
    }

    registry.update(&id, &mut |record| match &status {
        Ok(exit) => record.mark_exited(exit.code()),
        Err(e) => record.mark_error(&format!("failed to wait for process: {}", e)),
    });

    if let Some(control) = controls
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_mut(&id)
    {
        control.kill = None;
    }
    let _ = done_tx.send(true);

    match status {
        Ok(exit) => info!(job_id = %id, exit_code = ?exit.code(), "sandbox job exited"),
        Err(e) => warn!(job_id = %id, error = %e, "sandbox job errored"),
    }
}

async fn pump_lines<R>(registry: Arc<dyn JobRegistry>, id: String, stream: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        let room = MAX_LOG_LINE_BYTES.saturating_sub(buf.len()) as u64;
        match (&mut reader).take(room).read_until(b'\n', &mut buf).await {
            Ok(0) => {
                if !buf.is_empty() {
                    push_entry(&*registry, &id, &buf);
                }
                break;
            }
            Ok(_) if buf.ends_with(b"\n") => {
                push_entry(&*registry, &id, &buf);
                buf.clear();
            }
            Ok(_) if buf.len() >= MAX_LOG_LINE_BYTES => {
                // keep a split multi-byte char for the next entry
                let rest = buf.split_off(buf.len() - incomplete_utf8_tail(&buf));
                push_entry(&*registry, &id, &buf);
                buf = rest;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(job_id = %id, error = %e, "output stream read failed");
                break;
            }
        }
    }
}

fn push_entry(registry: &dyn JobRegistry, id: &str, bytes: &[u8]) {
    let mut line = Some(
        String::from_utf8_lossy(bytes)
            .trim_end_matches(['\n', '\r'])
            .to_string(),
    );
    registry.update(id, &mut |record| {
        if let Some(l) = line.take() {
            record.logs.push(l);
        }
    });
}

/// Bytes at the end of `buf` that start a UTF-8 sequence but do not finish it.
fn incomplete_utf8_tail(buf: &[u8]) -> usize {
    match std::str::from_utf8(buf) {
        Err(e) if e.error_len().is_none() => buf.len() - e.valid_up_to(),
        _ => 0,
    }
}

async fn terminate(id: &str, child: &mut Child) -> std::io::Result<ExitStatus> {
    send_sigterm(id, child);
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(job_id = %id, "process ignored SIGTERM, killing");
            child.start_kill()?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_sigterm(id: &str, child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(job_id = %id, pid, error = %e, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_sigterm(id: &str, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(job_id = %id, error = %e, "failed to kill process");
    }
}
