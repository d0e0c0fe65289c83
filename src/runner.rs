//! Process supervision for the external finder and zeroizer tools.
//!
//! Every run gets its own tokio task. stdout and stderr share one OS pipe so
//! the line stream interleaves exactly as the tool wrote it. A blocking reader
//! forwards each line over a bounded channel as soon as it is read, and tees
//! it into the capture file when one is requested. The terminal
//! [`RunEvent::Finished`] is sent only after the reader has drained the pipe.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::types::{RunEvent, RunId, RunStatus, ToolName, SPAWN_FAILURE_CODE};

/// How long to keep draining output after a cancelled process was killed
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(5);

/// A command either as a shell string or as an argument vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::Argv(args.into_iter().map(Into::into).collect())
    }

    /// The argument vector actually executed
    pub fn to_args(&self) -> Vec<String> {
        match self {
            #[cfg(unix)]
            CommandSpec::Shell(script) => vec!["sh".into(), "-c".into(), script.clone()],
            #[cfg(not(unix))]
            CommandSpec::Shell(script) => vec!["cmd".into(), "/C".into(), script.clone()],
            CommandSpec::Argv(args) => args.clone(),
        }
    }

    pub fn display(&self) -> String {
        match self {
            CommandSpec::Shell(script) => script.clone(),
            CommandSpec::Argv(args) => args.join(" "),
        }
    }

    fn to_command(&self) -> std::io::Result<std::process::Command> {
        let args = self.to_args();
        let (program, rest) = args.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
        })?;
        let mut command = std::process::Command::new(program);
        command.args(rest);
        Ok(command)
    }
}

/// Everything needed to launch one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: CommandSpec,
    pub working_dir: Option<PathBuf>,
    /// File receiving a copy of every captured line
    pub capture_path: Option<PathBuf>,
}

impl RunRequest {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            working_dir: None,
            capture_path: None,
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn capture_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.capture_path = Some(path.into());
        self
    }
}

/// Terminates a run from outside the event consumer
#[derive(Debug)]
pub struct CancelHandle(oneshot::Sender<()>);

impl CancelHandle {
    /// Returns false when the run had already finished
    pub fn cancel(self) -> bool {
        self.0.send(()).is_ok()
    }
}

/// Caller side of a single run
#[derive(Debug)]
pub struct RunHandle {
    events: mpsc::Receiver<RunEvent>,
    cancel: Option<CancelHandle>,
}

impl RunHandle {
    /// Next line or the terminal event; `None` after the terminal event
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel.take().map(CancelHandle::cancel).unwrap_or(false)
    }

    /// Detach the cancel capability, e.g. to hand it to a [`RunRegistry`]
    pub fn take_cancel(&mut self) -> Option<CancelHandle> {
        self.cancel.take()
    }

    /// Drain the run, calling `on_line` for each line as it arrives
    pub async fn wait_with<F>(mut self, mut on_line: F) -> RunStatus
    where
        F: FnMut(&str),
    {
        while let Some(event) = self.events.recv().await {
            match event {
                RunEvent::Line(line) => on_line(&line),
                RunEvent::Finished(status) => return status,
            }
        }
        RunStatus::SpawnFailed {
            reason: "runner stopped without reporting an exit status".to_string(),
        }
    }
}

/// Launches external commands without blocking the caller
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    buffer: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self { buffer: 256 }
    }
}

impl ProcessRunner {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }

    /// Spawn the run on the tokio runtime and return immediately
    pub fn start(&self, request: RunRequest) -> RunHandle {
        let (sender, events) = mpsc::channel(self.buffer);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        tokio::spawn(supervise(request, sender, cancel_rx));

        RunHandle {
            events,
            cancel: Some(CancelHandle(cancel_tx)),
        }
    }
}

async fn supervise(
    request: RunRequest,
    sender: mpsc::Sender<RunEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let command_line = request.command.display();
    debug!(command = %command_line, cwd = ?request.working_dir, "spawning");

    let status = match launch(&request) {
        Err(err) => {
            warn!(command = %command_line, error = %err, "spawn failed");
            RunStatus::SpawnFailed {
                reason: err.to_string(),
            }
        }
        Ok((mut child, reader, capture)) => {
            let gate: LineGate = Arc::new(Mutex::new(Some(sender.clone())));
            let pump_gate = Arc::clone(&gate);
            let mut pump =
                tokio::task::spawn_blocking(move || pump_lines(reader, capture, pump_gate));

            let status = tokio::select! {
                waited = child.wait() => match waited {
                    Ok(exit) => RunStatus::Exited { code: exit_code(exit) },
                    Err(err) => RunStatus::SpawnFailed { reason: err.to_string() },
                },
                Ok(()) = &mut cancel_rx => {
                    info!(command = %command_line, "cancelling");
                    kill_tree(&mut child).await;
                    RunStatus::Cancelled
                }
            };

            if status == RunStatus::Cancelled {
                if tokio::time::timeout(DRAIN_AFTER_KILL, &mut pump).await.is_err() {
                    warn!(command = %command_line, "output still open after kill, abandoning reader");
                    // No line may follow the terminal event
                    let _ = tokio::task::spawn_blocking(move || {
                        lock_gate(&gate).take();
                    })
                    .await;
                }
            } else if let Err(err) = pump.await {
                warn!(command = %command_line, error = %err, "output reader failed");
            }
            status
        }
    };

    debug!(command = %command_line, ?status, "run finished");
    let _ = sender.send(RunEvent::Finished(status)).await;
}

fn launch(request: &RunRequest) -> std::io::Result<(Child, std::io::PipeReader, Option<File>)> {
    // Opened before spawning so a bad capture path never leaves a tool running
    let capture = request
        .capture_path
        .as_deref()
        .map(File::create)
        .transpose()?;

    let (reader, writer) = std::io::pipe()?;
    let child = {
        let mut std_command = request.command.to_command()?;
        if let Some(dir) = &request.working_dir {
            std_command.current_dir(dir);
        }
        std_command
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.process_group(0);
        }
        let mut command = Command::from(std_command);
        command.kill_on_drop(true);
        command.spawn()?
        // `command` drops here and releases its copies of the write end
    };
    Ok((child, reader, capture))
}

/// Sender shared with the reader thread; emptied once the run is finalized
type LineGate = Arc<Mutex<Option<mpsc::Sender<RunEvent>>>>;

fn lock_gate(gate: &LineGate) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<RunEvent>>> {
    gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Forward lines in production order; keeps filling the capture file even
/// when nobody listens to the event stream anymore.
fn pump_lines<R: Read>(reader: R, mut capture: Option<File>, gate: LineGate) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut listening = true;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "reading tool output failed");
                break;
            }
        }

        if let Some(file) = capture.as_mut() {
            let mut write = file.write_all(&buf);
            if write.is_ok() && !buf.ends_with(b"\n") {
                write = file.write_all(b"\n");
            }
            if let Err(err) = write {
                warn!(error = %err, "capture file write failed, continuing without it");
                capture = None;
            }
        }

        if listening {
            let line = String::from_utf8_lossy(&buf)
                .trim_end_matches(['\n', '\r'])
                .to_string();
            let guard = lock_gate(&gate);
            listening = match guard.as_ref() {
                Some(sender) => sender.blocking_send(RunEvent::Line(line)).is_ok(),
                None => false,
            };
        }
    }

    if let Some(mut file) = capture {
        if let Err(err) = file.flush() {
            warn!(error = %err, "capture file flush failed");
        }
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(SPAWN_FAILURE_CODE)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(SPAWN_FAILURE_CODE)
}

async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // The child leads its own process group, so this reaches shells' children too
            let _ = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        }
    }
    if let Err(err) = child.kill().await {
        debug!(error = %err, "kill after group signal");
    }
}

#[derive(Debug)]
struct LiveRun {
    tool: ToolName,
    command: String,
    cancel: Option<CancelHandle>,
}

/// Live runs keyed by id: inserted on start, removed on the terminal event
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    next_id: Arc<AtomicU64>,
    live: Arc<Mutex<HashMap<RunId, LiveRun>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: ToolName, command: &str, cancel: Option<CancelHandle>) -> RunId {
        let id = RunId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock().insert(
            id,
            LiveRun {
                tool,
                command: command.to_string(),
                cancel,
            },
        );
        id
    }

    pub fn complete(&self, id: RunId) {
        self.lock().remove(&id);
    }

    /// Ask a live run to stop; false when it is unknown or already finishing
    pub fn cancel(&self, id: RunId) -> bool {
        let handle = self.lock().get_mut(&id).and_then(|run| run.cancel.take());
        handle.map(CancelHandle::cancel).unwrap_or(false)
    }

    /// Cancel every live run, returning how many were signalled
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<CancelHandle> = self
            .lock()
            .values_mut()
            .filter_map(|run| run.cancel.take())
            .collect();
        handles
            .into_iter()
            .map(CancelHandle::cancel)
            .filter(|sent| *sent)
            .count()
    }

    pub fn active(&self) -> Vec<(RunId, ToolName, String)> {
        let mut runs: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, run)| (*id, run.tool, run.command.clone()))
            .collect();
        runs.sort_by_key(|(id, _, _)| *id);
        runs
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, LiveRun>> {
        // A panic while holding the lock cannot leave the map inconsistent
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    async fn collect(handle: RunHandle) -> (Vec<String>, RunStatus) {
        let mut lines = Vec::new();
        let status = handle.wait_with(|line| lines.push(line.to_string())).await;
        (lines, status)
    }

    #[tokio::test]
    async fn test_lines_stream_before_exit() {
        let runner = ProcessRunner::default();
        let started = Instant::now();
        let mut handle = runner.start(RunRequest::new(CommandSpec::Shell(
            "echo one; sleep 0.3; echo two; sleep 0.3; echo three".into(),
        )));

        let first = handle.next_event().await;
        assert_eq!(first, Some(RunEvent::Line("one".into())));
        assert!(started.elapsed() < Duration::from_millis(500));

        let mut rest = Vec::new();
        while let Some(event) = handle.next_event().await {
            rest.push(event);
        }
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert_eq!(
            rest,
            vec![
                RunEvent::Line("two".into()),
                RunEvent::Line("three".into()),
                RunEvent::Finished(RunStatus::Exited { code: 0 }),
            ]
        );
    }

    #[tokio::test]
    async fn test_stderr_is_merged_in_order() {
        let runner = ProcessRunner::default();
        let handle = runner.start(RunRequest::new(CommandSpec::argv([
            "sh",
            "-c",
            "echo out; echo err 1>&2; echo again",
        ])));

        let (lines, status) = collect(handle).await;
        assert_eq!(lines, vec!["out", "err", "again"]);
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let runner = ProcessRunner::default();
        let (lines, status) = collect(runner.start(RunRequest::new(CommandSpec::Shell(
            "echo partial; exit 3".into(),
        ))))
        .await;

        assert_eq!(lines, vec!["partial"]);
        assert_eq!(status, RunStatus::Exited { code: 3 });
    }

    #[tokio::test]
    async fn test_spawn_failure_is_terminal_event() {
        let runner = ProcessRunner::default();
        let (lines, status) = collect(runner.start(RunRequest::new(CommandSpec::argv([
            "ram-extractor-no-such-binary",
        ]))))
        .await;

        assert!(lines.is_empty());
        assert!(matches!(status, RunStatus::SpawnFailed { .. }));
        assert_eq!(status.code(), Some(SPAWN_FAILURE_CODE));
    }

    #[tokio::test]
    async fn test_empty_argv_is_spawn_failure() {
        let runner = ProcessRunner::default();
        let (_, status) = collect(runner.start(RunRequest::new(CommandSpec::Argv(vec![])))).await;
        assert!(matches!(status, RunStatus::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_capture_file_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("capture.txt");
        let runner = ProcessRunner::default();
        let request = RunRequest::new(CommandSpec::Shell("pwd; printf 'no newline'".into()))
            .current_dir(dir.path())
            .capture_to(&capture);

        let (lines, status) = collect(runner.start(request)).await;
        assert!(status.success());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "no newline");

        let written = std::fs::read_to_string(&capture).unwrap();
        assert_eq!(written, format!("{}\nno newline\n", lines[0]));
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled() {
        let runner = ProcessRunner::default();
        let mut handle = runner.start(RunRequest::new(CommandSpec::Shell(
            "echo started; sleep 30".into(),
        )));

        assert_eq!(handle.next_event().await, Some(RunEvent::Line("started".into())));
        assert!(handle.cancel());

        let finished = tokio::time::timeout(Duration::from_secs(10), handle.next_event())
            .await
            .expect("cancelled run must finish promptly");
        assert_eq!(finished, Some(RunEvent::Finished(RunStatus::Cancelled)));
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let registry = RunRegistry::new();
        let runner = ProcessRunner::default();
        let mut handle = runner.start(RunRequest::new(CommandSpec::Shell("sleep 30".into())));

        let id = registry.register(ToolName::Aes, "sleep 30", handle.take_cancel());
        assert_eq!(registry.active().len(), 1);
        assert!(registry.cancel(id));
        assert!(!registry.cancel(id));

        let status = handle.wait_with(|_| {}).await;
        assert_eq!(status, RunStatus::Cancelled);
        registry.complete(id);
        assert!(registry.is_empty());
    }
}
