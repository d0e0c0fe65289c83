//! Composition root: validate → run → extract → report.
//!
//! Each user action walks `Validating → Running → (Extracting) → Done|Failed`
//! on its own. Progress and tool output are pushed to an optional event
//! channel while the action is in flight; the final [`ActionReport`] is the
//! return value.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::{ExtractorError, Result};
use crate::extractor;
use crate::integrity::{sha256_file_async, ImageDigests};
use crate::runner::{ProcessRunner, RunRegistry, RunRequest};
use crate::tools::{prepare_results_dir, validate_image, Invocation, Prerequisite, ToolInvoker};
use crate::types::{
    ActionState, Algorithm, KeyRecord, OrchestratorConfig, RunEvent, RunStatus, ToolName, ToolRun,
};
use crate::zeroize::{ZeroizeInvoker, ZeroizeRequest, ZEROIZER_BIN};

/// Progress update sent via tokio channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionEvent {
    /// The action moved to a new state
    State { tool: ToolName, state: ActionState },
    /// Narration about the action ("… is working, please wait")
    Message { tool: ToolName, text: String },
    /// One line of live tool output
    Output { tool: ToolName, line: String },
}

/// Why an action ended in `Failed`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Failure {
    pub kind: &'static str,
    pub message: String,
    /// Tool exit code, when the tool ran
    pub exit_code: Option<i32>,
}

impl From<&ExtractorError> for Failure {
    fn from(err: &ExtractorError) -> Self {
        let exit_code = match err {
            ExtractorError::ProcessExit { code, .. } => Some(*code),
            ExtractorError::ProcessSpawn { .. } => Some(crate::types::SPAWN_FAILURE_CODE),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            exit_code,
        }
    }
}

/// Final result of one action
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    pub tool: ToolName,
    pub state: ActionState,
    pub run: Option<ToolRun>,
    pub capture_path: Option<PathBuf>,
    pub record_path: Option<PathBuf>,
    pub records: Vec<KeyRecord>,
    pub destination: Option<PathBuf>,
    pub digests: Option<ImageDigests>,
    pub failure: Option<Failure>,
}

impl ActionReport {
    fn new(tool: ToolName) -> Self {
        Self {
            tool,
            state: ActionState::Idle,
            run: None,
            capture_path: None,
            record_path: None,
            records: Vec::new(),
            destination: None,
            digests: None,
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == ActionState::Done
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.run.as_ref().and_then(ToolRun::exit_code)
    }
}

/// Sequences the finder and zeroizer actions
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    tools: ToolInvoker,
    zeroizer: ZeroizeInvoker,
    runner: ProcessRunner,
    registry: RunRegistry,
    events: Option<Sender<ActionEvent>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            tools: ToolInvoker::from_config(&config),
            zeroizer: ZeroizeInvoker::new(&config.zeroizer_dir),
            runner: ProcessRunner::new(config.event_buffer),
            registry: RunRegistry::new(),
            events: None,
            config,
        }
    }

    /// Stream progress and live output to `sender`
    pub fn with_events(mut self, sender: Sender<ActionEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Cancel every action currently in `Running`
    pub fn cancel_all(&self) -> usize {
        self.registry.cancel_all()
    }

    /// Presence of every external prerequisite
    pub fn check(&self) -> Vec<Prerequisite> {
        let mut report = self.tools.prerequisite_report();
        let zeroizer = self.zeroizer.resolve_binary().ok();
        report.push(Prerequisite {
            name: ZEROIZER_BIN.to_string(),
            present: zeroizer.is_some(),
            location: zeroizer.or_else(|| Some(self.config.zeroizer_dir.join(ZEROIZER_BIN))),
        });
        report
    }

    /// Run one finder tool and extract its records
    pub async fn run_finder(&self, algorithm: Algorithm) -> ActionReport {
        let tool = ToolName::from(algorithm);
        let mut report = ActionReport::new(tool);
        self.transition(&mut report, ActionState::Validating).await;

        let (invocation, results) = match self.validate_finder(algorithm) {
            Ok(validated) => validated,
            Err(err) => return self.fail(report, err).await,
        };
        let capture_path = invocation.capture_path.clone();
        let record_path = record_path(&results, algorithm);
        report.capture_path = Some(capture_path.clone());

        self.message(tool, format!("{tool} is working, please wait…")).await;
        if let Some(image) = &self.config.image_path {
            self.message(tool, format!("Running {tool} on: {}", image.display()))
                .await;
        }

        self.transition(&mut report, ActionState::Running).await;
        let run = self.supervise(tool, invocation.request).await;
        let status = run.status.clone();
        report.run = Some(run);

        let code = match status {
            Some(RunStatus::Exited { code }) => code,
            Some(RunStatus::SpawnFailed { reason }) => {
                let command = report.run.as_ref().map(ToolRun::command_line).unwrap_or_default();
                return self
                    .fail(report, ExtractorError::ProcessSpawn { command, reason })
                    .await;
            }
            Some(RunStatus::Cancelled) | None => {
                let command = report.run.as_ref().map(ToolRun::command_line).unwrap_or_default();
                return self.fail(report, ExtractorError::Cancelled { command }).await;
            }
        };

        self.message(
            tool,
            format!("{tool} finished. Output saved to {}", capture_path.display()),
        )
        .await;

        // Partial output of a failed run is still worth extracting
        self.transition(&mut report, ActionState::Extracting).await;
        match extractor::extract_file(algorithm, &capture_path, &record_path) {
            Ok(records) => {
                self.message(
                    tool,
                    format!(
                        "{} values saved to {} ({} found)",
                        algorithm.label(),
                        record_path.display(),
                        records.len()
                    ),
                )
                .await;
                report.records = records;
                report.record_path = Some(record_path);
            }
            Err(err) => return self.fail(report, err).await,
        }

        if code != 0 {
            let command = report.run.as_ref().map(ToolRun::command_line).unwrap_or_default();
            return self
                .fail(report, ExtractorError::ProcessExit { command, code })
                .await;
        }

        self.transition(&mut report, ActionState::Done).await;
        report
    }

    /// Run several finders concurrently; reports come back in algorithm order
    pub async fn run_finders(&self, algorithms: &[Algorithm]) -> Vec<ActionReport> {
        let unique: BTreeSet<Algorithm> = algorithms.iter().copied().collect();
        let mut set = JoinSet::new();
        for algorithm in unique {
            let this = self.clone();
            set.spawn(async move { this.run_finder(algorithm).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => error!(error = %err, "finder task panicked"),
            }
        }
        reports.sort_by_key(|r| r.tool.algorithm());
        reports
    }

    /// Re-run extraction over an existing capture without scanning again
    pub async fn extract_existing(&self, algorithm: Algorithm, capture: Option<PathBuf>) -> ActionReport {
        let tool = ToolName::from(algorithm);
        let mut report = ActionReport::new(tool);
        self.transition(&mut report, ActionState::Validating).await;

        let results = match self.require_results_dir() {
            Ok(dir) => dir,
            Err(err) => return self.fail(report, err).await,
        };
        let capture_path = capture.unwrap_or_else(|| results.join(algorithm.capture_file_name()));
        let record_path = results.join(algorithm.record_file_name());
        report.capture_path = Some(capture_path.clone());

        self.transition(&mut report, ActionState::Extracting).await;
        match extractor::extract_file(algorithm, &capture_path, &record_path) {
            Ok(records) => {
                self.message(
                    tool,
                    format!("{} values saved to {}", algorithm.label(), record_path.display()),
                )
                .await;
                report.records = records;
                report.record_path = Some(record_path);
                self.transition(&mut report, ActionState::Done).await;
                report
            }
            Err(err) => self.fail(report, err).await,
        }
    }

    /// Zero the recorded key ranges of `selected` into a copy of the image
    pub async fn run_zeroize(
        &self,
        selected: BTreeSet<Algorithm>,
        destination_name: &str,
        hash: bool,
    ) -> ActionReport {
        let tool = ToolName::Zeroize;
        let mut report = ActionReport::new(tool);
        self.transition(&mut report, ActionState::Validating).await;

        let (request, run_request) = match self.validate_zeroize(selected, destination_name) {
            Ok(pair) => pair,
            Err(err) => return self.fail(report, err).await,
        };
        report.destination = Some(request.destination.clone());

        for (algorithm, path) in &request.record_files {
            match extractor::read_records(path) {
                Ok(records) => {
                    self.message(
                        tool,
                        format!("{}: {} offsets from {}", algorithm.label(), records.len(), path.display()),
                    )
                    .await
                }
                Err(err) => warn!(path = %path.display(), error = %err, "record file not parseable"),
            }
        }

        let source_digest = if hash {
            match sha256_file_async(request.source_image.clone()).await {
                Ok(digest) => Some(digest),
                Err(err) => return self.fail(report, err).await,
            }
        } else {
            None
        };

        self.message(tool, "Zeroizing selected keys, please wait…".to_string())
            .await;
        self.transition(&mut report, ActionState::Running).await;
        let run = self.supervise(tool, run_request).await;
        let status = run.status.clone();
        let command = run.command_line();
        report.run = Some(run);

        match status {
            Some(RunStatus::Exited { code: 0 }) => {}
            Some(RunStatus::Exited { code }) => {
                self.message(tool, format!("{tool} failed")).await;
                return self.fail(report, ExtractorError::ProcessExit { command, code }).await;
            }
            Some(RunStatus::SpawnFailed { reason }) => {
                return self
                    .fail(report, ExtractorError::ProcessSpawn { command, reason })
                    .await;
            }
            Some(RunStatus::Cancelled) | None => {
                return self.fail(report, ExtractorError::Cancelled { command }).await;
            }
        }

        if let Some(source_sha256) = source_digest {
            match sha256_file_async(request.destination.clone()).await {
                Ok(destination_sha256) => {
                    info!(source = %source_sha256, destination = %destination_sha256, "image digests");
                    report.digests = Some(ImageDigests {
                        source_sha256,
                        destination_sha256,
                    });
                }
                Err(err) => return self.fail(report, err).await,
            }
        }

        self.message(
            tool,
            format!(
                "{tool} finished with exit code 0\nZeroed dump saved to: {}",
                request.destination.display()
            ),
        )
        .await;
        self.transition(&mut report, ActionState::Done).await;
        report
    }

    fn validate_finder(&self, algorithm: Algorithm) -> Result<(Invocation, PathBuf)> {
        let image = self.require_image()?;
        let results = self.require_results_dir()?;
        let capture = results.join(algorithm.capture_file_name());
        let invocation = self.tools.build(algorithm, &image, &capture)?;
        let results = prepare_results_dir(&results)?;
        Ok((invocation, results))
    }

    fn validate_zeroize(
        &self,
        selected: BTreeSet<Algorithm>,
        destination_name: &str,
    ) -> Result<(ZeroizeRequest, RunRequest)> {
        let image = validate_image(&self.require_image()?)?;
        let results = self.require_results_dir()?;
        let request = ZeroizeRequest::from_results_dir(selected, &results, image, destination_name)?;
        let run_request = self.zeroizer.build(&request)?;
        Ok((request, run_request))
    }

    fn require_image(&self) -> Result<PathBuf> {
        match &self.config.image_path {
            Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            _ => Err(ExtractorError::InvalidInput(
                "Provide a memory file and a results folder".to_string(),
            )),
        }
    }

    /// Absolute results path; the directory itself may not exist yet
    fn require_results_dir(&self) -> Result<PathBuf> {
        match &self.config.results_dir {
            Some(path) if !path.as_os_str().is_empty() => Ok(std::path::absolute(path)?),
            _ => Err(ExtractorError::InvalidInput(
                "Provide a memory file and a results folder".to_string(),
            )),
        }
    }

    /// Start one process, forward its output and collect it into a [`ToolRun`]
    async fn supervise(&self, tool: ToolName, request: RunRequest) -> ToolRun {
        let args = request.command.to_args();
        let working_dir = request.working_dir.clone();
        let capture = request.capture_path.clone();
        self.message(tool, format!("Executing command: {}", args.join(" ")))
            .await;

        let mut handle = self.runner.start(request);
        let id = self
            .registry
            .register(tool, &args.join(" "), handle.take_cancel());
        let mut run = ToolRun::new(id, tool, args, working_dir, capture);
        info!(%id, %tool, command = %run.command_line(), "started");

        while let Some(event) = handle.next_event().await {
            match event {
                RunEvent::Line(line) => {
                    self.emit(ActionEvent::Output {
                        tool,
                        line: line.clone(),
                    })
                    .await;
                    run.push_line(line);
                }
                RunEvent::Finished(status) => {
                    run.finish(status);
                    break;
                }
            }
        }
        self.registry.complete(id);

        match run.exit_code() {
            Some(code) => {
                info!(%id, %tool, code, "finished");
                self.message(tool, format!("Command finished with code: {code}"))
                    .await;
            }
            None => {
                info!(%id, %tool, "cancelled");
                self.message(tool, "Command cancelled".to_string()).await;
            }
        }
        run
    }

    async fn transition(&self, report: &mut ActionReport, state: ActionState) {
        report.state = state;
        self.emit(ActionEvent::State {
            tool: report.tool,
            state,
        })
        .await;
    }

    async fn fail(&self, mut report: ActionReport, err: ExtractorError) -> ActionReport {
        warn!(tool = %report.tool, error = %err, "action failed");
        report.failure = Some(Failure::from(&err));
        self.message(report.tool, format!("Error: {err}")).await;
        self.transition(&mut report, ActionState::Failed).await;
        report
    }

    async fn message(&self, tool: ToolName, text: String) {
        self.emit(ActionEvent::Message { tool, text }).await;
    }

    async fn emit(&self, event: ActionEvent) {
        if let Some(sender) = &self.events {
            if !sender.is_closed() {
                let _ = sender.send(event).await;
            }
        }
    }
}

/// Record file path for `algorithm` under `results_dir`
pub fn record_path(results_dir: &Path, algorithm: Algorithm) -> PathBuf {
    results_dir.join(algorithm.record_file_name())
}
