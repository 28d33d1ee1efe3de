//! Launch and lifecycle of the supervised install script.
//!
//! One supervisor drives one script invocation: it applies the pre-launch
//! hygiene rewrites, spawns the script under the chosen execution strategy,
//! wires the raw-line source into classification and the transcript, and
//! owns the guard that takes the process tree down with it. Progress events
//! reach the caller over a single-consumer channel; the transcript and the
//! exit status are readable at any point.

mod error;

pub use error::SupervisorError;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classify::{self, Classification, ProgressEvent};
use crate::guard::ProcessTreeGuard;
use crate::hygiene;
use crate::source;
use crate::transcript::Transcript;

/// Log file written by the shell-redirect strategy, created in the script's
/// working directory and deleted before each run.
pub const DEFAULT_LOG_FILE: &str = "patchrun_script_log.txt";

/// Malformed output lines logged individually before the log falls back to
/// a running count.
const PARSE_ERROR_LOG_LIMIT: u32 = 10;

/// How the script is launched and its output captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Spawn the script directly with its stdout piped to the supervisor.
    DirectPipe,
    /// Spawn through the command interpreter with output redirected to a
    /// log file, which the supervisor polls. Keeps the script's console
    /// window hidden on platforms where a direct spawn would show one.
    ShellRedirectToFile,
}

/// Everything needed to launch one script run. Immutable once launched.
#[derive(Debug, Clone)]
pub struct ScriptInvocation {
    pub script: PathBuf,
    pub working_dir: PathBuf,
    pub strategy: ExecutionStrategy,
    /// Log file for [`ExecutionStrategy::ShellRedirectToFile`]; defaults to
    /// [`DEFAULT_LOG_FILE`] in the working directory.
    pub log_file: Option<PathBuf>,
    /// Patch the script to disable IPv6 downloads before launching.
    pub disable_ipv6: bool,
}

impl ScriptInvocation {
    pub fn new(script: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            working_dir: working_dir.into(),
            strategy: ExecutionStrategy::DirectPipe,
            log_file: None,
            disable_ipv6: false,
        }
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_log_file(mut self, log_file: Option<PathBuf>) -> Self {
        self.log_file = log_file;
        self
    }

    pub fn with_disable_ipv6(mut self, disable_ipv6: bool) -> Self {
        self.disable_ipv6 = disable_ipv6;
        self
    }

    fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.working_dir.join(DEFAULT_LOG_FILE))
    }
}

/// Lifecycle of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Launching,
    Running,
    /// The script has exited; buffered output is still draining.
    ReadingDrain,
    Exited,
}

/// Final outcome of the script process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStatus {
    Success,
    Error(i32),
    Signal(i32),
}

impl ScriptStatus {
    pub fn success(&self) -> bool {
        matches!(self, ScriptStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ScriptStatus::Success => Some(0),
            ScriptStatus::Error(code) => Some(*code),
            ScriptStatus::Signal(_) => None,
        }
    }

    fn from_exit(status: std::process::ExitStatus) -> Self {
        if status.success() {
            return ScriptStatus::Success;
        }
        if let Some(code) = status.code() {
            return ScriptStatus::Error(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ScriptStatus::Signal(signal);
            }
        }
        ScriptStatus::Error(1)
    }
}

/// Supervises exactly one script invocation.
///
/// The process handle is owned here, not shared by convention: launching a
/// second time on the same supervisor is a configuration error. Dropping a
/// supervisor mid-run fires the tree guard, so descendants cannot survive
/// the supervisor by accident.
pub struct ProcessSupervisor {
    invocation: ScriptInvocation,
    state: Arc<Mutex<SupervisorState>>,
    transcript: Arc<Mutex<Transcript>>,
    exit: Arc<Mutex<Option<ScriptStatus>>>,
    exited: Arc<AtomicBool>,
    guard: Option<ProcessTreeGuard>,
    waiter: Option<JoinHandle<()>>,
    pipeline: Option<JoinHandle<()>>,
}

impl ProcessSupervisor {
    pub fn new(invocation: ScriptInvocation) -> Self {
        Self {
            invocation,
            state: Arc::new(Mutex::new(SupervisorState::Idle)),
            transcript: Arc::new(Mutex::new(Transcript::new())),
            exit: Arc::new(Mutex::new(None)),
            exited: Arc::new(AtomicBool::new(false)),
            guard: None,
            waiter: None,
            pipeline: None,
        }
    }

    /// Launch the script and return the progress-event receiver.
    ///
    /// Hygiene rewrites (CRLF normalization, the optional IPv6 patch) and
    /// stale-log deletion are warnings on failure; only spawn failures and
    /// double launches abort.
    pub async fn launch(
        &mut self,
    ) -> Result<UnboundedReceiver<ProgressEvent>, SupervisorError> {
        let current = self.state();
        if current != SupervisorState::Idle {
            return Err(SupervisorError::AlreadyLaunched(current));
        }
        self.set_state(SupervisorState::Launching);

        info!(
            script = %self.invocation.script.display(),
            strategy = ?self.invocation.strategy,
            "launching install script"
        );
        self.apply_hygiene();

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let child = match self.invocation.strategy {
            ExecutionStrategy::DirectPipe => self.spawn_direct(&raw_tx)?,
            ExecutionStrategy::ShellRedirectToFile => self.spawn_shell_redirect(&raw_tx)?,
        };
        drop(raw_tx);

        let pid = child.id().unwrap_or(0);
        self.guard = Some(ProcessTreeGuard::register(pid));
        self.set_state(SupervisorState::Running);

        self.waiter = Some(spawn_waiter(
            child,
            Arc::clone(&self.exit),
            Arc::clone(&self.exited),
            Arc::clone(&self.state),
        ));
        self.pipeline = Some(tokio::spawn(run_pipeline(
            raw_rx,
            event_tx,
            Arc::clone(&self.transcript),
            Arc::clone(&self.state),
        )));

        Ok(event_rx)
    }

    /// Line-ending and networking fixes on the script file itself.
    /// Recoverable by design: a read-only script still installs.
    fn apply_hygiene(&self) {
        match hygiene::normalize_line_endings(&self.invocation.script) {
            Ok(true) => {
                warn!("script line endings did not match the platform; fixed in place")
            }
            Ok(false) => {}
            Err(err) => warn!("could not normalize script line endings: {err}"),
        }

        if self.invocation.disable_ipv6 {
            match hygiene::disable_ipv6(&self.invocation.script) {
                Ok(true) => debug!("patched script to disable IPv6 downloads"),
                Ok(false) => {}
                Err(err) => warn!("could not apply IPv6 patch to script: {err}"),
            }
        }
    }

    fn spawn_direct(
        &self,
        raw_tx: &UnboundedSender<String>,
    ) -> Result<Child, SupervisorError> {
        let mut cmd = Command::new(&self.invocation.script);
        cmd.current_dir(&self.invocation.working_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|err| map_spawn_error(err, &self.invocation.script))?;
        let stdout = child.stdout.take().ok_or(SupervisorError::MissingStdout)?;
        source::spawn_pipe_reader(stdout, raw_tx.clone());
        Ok(child)
    }

    fn spawn_shell_redirect(
        &self,
        raw_tx: &UnboundedSender<String>,
    ) -> Result<Child, SupervisorError> {
        let log_path = self.invocation.log_path();
        if log_path.exists() {
            if let Err(err) = std::fs::remove_file(&log_path) {
                warn!(
                    log = %log_path.display(),
                    "could not delete stale script log: {err}"
                );
            }
        }
        debug!(log = %log_path.display(), "script output will be redirected");

        let mut cmd = shell_redirect_command(&self.invocation.script, &log_path);
        cmd.current_dir(&self.invocation.working_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|err| map_spawn_error(err, &self.invocation.script))?;
        source::spawn_file_poller(log_path, Arc::clone(&self.exited), raw_tx.clone());
        Ok(child)
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: SupervisorState) {
        *self.state.lock().unwrap() = next;
    }

    /// Exit status, once the script has finished.
    pub fn exit_status(&self) -> Option<ScriptStatus> {
        *self.exit.lock().unwrap()
    }

    /// Render the collapsed transcript accumulated so far.
    pub fn transcript(&self) -> String {
        self.transcript.lock().unwrap().render()
    }

    /// Wait until the script has exited and all buffered output drained,
    /// then report the outcome.
    pub async fn wait(&mut self) -> Result<ScriptStatus, SupervisorError> {
        if let Some(waiter) = self.waiter.take() {
            waiter.await?;
        }
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.await?;
        }
        self.set_state(SupervisorState::Exited);
        Ok(self.exit_status().unwrap_or(ScriptStatus::Error(-1)))
    }

    /// User-triggered cancellation (window closed, Ctrl-C): tear down the
    /// whole process tree now.
    pub async fn terminate(&mut self) {
        if let Some(guard) = self.guard.as_mut() {
            info!("terminating install script process tree");
            guard.terminate().await;
        }
    }
}

fn map_spawn_error(err: std::io::Error, script: &Path) -> SupervisorError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SupervisorError::ScriptNotFound(script.to_path_buf())
    } else {
        SupervisorError::SpawnFailed {
            script: script.display().to_string(),
            source: err,
        }
    }
}

#[cfg(unix)]
fn shell_redirect_command(script: &Path, log: &Path) -> Command {
    let line = format!(
        "{} > {}",
        shell_words::quote(&script.to_string_lossy()),
        shell_words::quote(&log.to_string_lossy()),
    );
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(not(unix))]
fn shell_redirect_command(script: &Path, log: &Path) -> Command {
    let mut cmd = Command::new("cmd.exe");
    cmd.arg("/C")
        .arg(format!("{} > {}", script.display(), log.display()));
    cmd
}

/// Owns the child handle, records its exit, and flips the shared exit flag
/// so the file poller knows to run its final drain.
fn spawn_waiter(
    mut child: Child,
    exit: Arc<Mutex<Option<ScriptStatus>>>,
    exited: Arc<AtomicBool>,
    state: Arc<Mutex<SupervisorState>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(status) => ScriptStatus::from_exit(status),
            Err(err) => {
                warn!("failed waiting on script process: {err}");
                ScriptStatus::Error(-1)
            }
        };
        info!("script finished with exit code {:?}", status.code());

        *exit.lock().unwrap() = Some(status);
        exited.store(true, Ordering::SeqCst);

        let mut state = state.lock().unwrap();
        if *state == SupervisorState::Running {
            *state = SupervisorState::ReadingDrain;
        }
    })
}

/// Consume raw lines, keep the transcript, classify, and emit events.
///
/// Classification never errors out of here: malformed lines degrade to a
/// rate-limited warning, which is the failure-isolation boundary for the
/// whole telemetry path.
async fn run_pipeline(
    mut raw_rx: UnboundedReceiver<String>,
    event_tx: UnboundedSender<ProgressEvent>,
    transcript: Arc<Mutex<Transcript>>,
    state: Arc<Mutex<SupervisorState>>,
) {
    let mut parse_errors: u32 = 0;
    while let Some(line) = raw_rx.recv().await {
        debug!(target: "patchrun::script", "{line}");
        match classify::classify(&line) {
            Classification::Discard => continue,
            Classification::Event(event) => {
                transcript.lock().unwrap().push(&line);
                // receiver gone just means nobody is rendering; keep
                // draining so the transcript stays complete
                let _ = event_tx.send(event);
            }
            Classification::Skipped => {
                transcript.lock().unwrap().push(&line);
            }
            Classification::Malformed => {
                transcript.lock().unwrap().push(&line);
                parse_errors += 1;
                if parse_errors <= PARSE_ERROR_LOG_LIMIT {
                    warn!("could not parse progress line: {line:?}");
                } else {
                    debug!("could not parse progress line ({parse_errors} so far)");
                }
            }
        }
    }

    // a pipe can hit EOF a beat before the waiter records the exit status;
    // only the post-exit drain may declare Exited, so Exited always implies
    // a recorded status
    let mut state = state.lock().unwrap();
    if *state == SupervisorState::ReadingDrain {
        *state = SupervisorState::Exited;
    }
}
