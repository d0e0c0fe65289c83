use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{ExtractorError, Result};

/// Key families the finder tools can locate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Aes,
    Rsa,
    Serpent,
    Twofish,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::Aes,
        Algorithm::Rsa,
        Algorithm::Serpent,
        Algorithm::Twofish,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Aes => "aes",
            Algorithm::Rsa => "rsa",
            Algorithm::Serpent => "serpent",
            Algorithm::Twofish => "twofish",
        }
    }

    /// Human-facing label used in console messages
    pub fn label(&self) -> &'static str {
        match self {
            Algorithm::Aes => "AES",
            Algorithm::Rsa => "RSA",
            Algorithm::Serpent => "Serpent",
            Algorithm::Twofish => "Twofish",
        }
    }

    /// Flag passed to the zeroizer in front of this algorithm's record file
    pub fn zeroize_flag(&self) -> &'static str {
        match self {
            Algorithm::Aes => "-a",
            Algorithm::Rsa => "-r",
            Algorithm::Serpent => "-s",
            Algorithm::Twofish => "-t",
        }
    }

    /// Raw capture file name inside the results directory
    pub fn capture_file_name(&self) -> &'static str {
        match self {
            Algorithm::Aes => "aeskeyfind_output.txt",
            Algorithm::Rsa => "rsakeyfind_output.txt",
            Algorithm::Serpent => "serpent_output.txt",
            Algorithm::Twofish => "twofish_output.txt",
        }
    }

    /// Record file name inside the results directory
    pub fn record_file_name(&self) -> String {
        format!("{}_values.txt", self.name())
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = ExtractorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes" => Ok(Algorithm::Aes),
            "rsa" => Ok(Algorithm::Rsa),
            "serpent" => Ok(Algorithm::Serpent),
            "twofish" => Ok(Algorithm::Twofish),
            other => Err(ExtractorError::InvalidInput(format!(
                "unknown algorithm '{other}'"
            ))),
        }
    }
}

/// Every external tool this crate drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolName {
    Aes,
    Rsa,
    Serpent,
    Twofish,
    Zeroize,
}

impl ToolName {
    /// The key family a finder tool searches for; `None` for the zeroizer
    pub fn algorithm(&self) -> Option<Algorithm> {
        match self {
            ToolName::Aes => Some(Algorithm::Aes),
            ToolName::Rsa => Some(Algorithm::Rsa),
            ToolName::Serpent => Some(Algorithm::Serpent),
            ToolName::Twofish => Some(Algorithm::Twofish),
            ToolName::Zeroize => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ToolName::Aes => "aeskeyfind",
            ToolName::Rsa => "rsakeyfind",
            ToolName::Serpent => "Serpent finder",
            ToolName::Twofish => "Twofish finder",
            ToolName::Zeroize => "zeroize_dump",
        }
    }
}

impl From<Algorithm> for ToolName {
    fn from(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Aes => ToolName::Aes,
            Algorithm::Rsa => ToolName::Rsa,
            Algorithm::Serpent => ToolName::Serpent,
            Algorithm::Twofish => ToolName::Twofish,
        }
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// A normalized `(offset, key size)` pair extracted from finder output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Hex offset without `0x`, lowercase
    pub offset_hex: String,
    /// 128 or 256 for AES, 0 where the tool reports no size
    pub key_size_bits: u32,
}

impl KeyRecord {
    pub fn new(offset_hex: &str, key_size_bits: u32) -> Result<Self> {
        if offset_hex.is_empty() || !offset_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ExtractorError::InvalidInput(format!(
                "'{offset_hex}' is not a hexadecimal offset"
            )));
        }
        Ok(Self {
            offset_hex: offset_hex.to_ascii_lowercase(),
            key_size_bits,
        })
    }

    /// Numeric offset, if it fits in 64 bits
    pub fn offset(&self) -> Option<u64> {
        u64::from_str_radix(&self.offset_hex, 16).ok()
    }
}

impl std::fmt::Display for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.offset_hex, self.key_size_bits)
    }
}

impl FromStr for KeyRecord {
    type Err = ExtractorError;

    fn from_str(line: &str) -> Result<Self> {
        let (offset, size) = line.trim().split_once(',').ok_or_else(|| {
            ExtractorError::InvalidInput(format!("record line '{line}' has no comma"))
        })?;
        let size = size.parse::<u32>().map_err(|e| {
            ExtractorError::InvalidInput(format!("bad key size in '{line}': {e}"))
        })?;
        KeyRecord::new(offset, size)
    }
}

/// Newtype wrapper for run identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RunId(pub u64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run_{}", self.0)
    }
}

/// Exit code reported when the process could not be launched at all
pub const SPAWN_FAILURE_CODE: i32 = -1;

/// Terminal outcome of one process run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Exited { code: i32 },
    SpawnFailed { reason: String },
    Cancelled,
}

impl RunStatus {
    pub fn success(&self) -> bool {
        matches!(self, RunStatus::Exited { code: 0 })
    }

    /// Numeric code, with the spawn-failure sentinel; `None` when cancelled
    pub fn code(&self) -> Option<i32> {
        match self {
            RunStatus::Exited { code } => Some(*code),
            RunStatus::SpawnFailed { .. } => Some(SPAWN_FAILURE_CODE),
            RunStatus::Cancelled => None,
        }
    }
}

/// Event streamed from a running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// One line of merged stdout/stderr, without its terminator
    Line(String),
    /// Always the last event of a run
    Finished(RunStatus),
}

/// Record of one external tool invocation
#[derive(Debug, Clone, Serialize)]
pub struct ToolRun {
    pub id: RunId,
    pub tool: ToolName,
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub captured_lines: Vec<String>,
    pub status: Option<RunStatus>,
    pub output_file_path: Option<PathBuf>,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
}

impl ToolRun {
    pub fn new(
        id: RunId,
        tool: ToolName,
        command: Vec<String>,
        working_dir: Option<PathBuf>,
        output_file_path: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            tool,
            command,
            working_dir,
            captured_lines: Vec::new(),
            status: None,
            output_file_path,
            started_at: Local::now(),
            finished_at: None,
        }
    }

    /// Append a line; ignored once the run has finished
    pub fn push_line(&mut self, line: String) {
        if self.status.is_none() {
            self.captured_lines.push(line);
        }
    }

    /// Set the terminal status; the first status wins
    pub fn finish(&mut self, status: RunStatus) {
        if self.status.is_none() {
            self.status = Some(status);
            self.finished_at = Some(Local::now());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.as_ref().and_then(RunStatus::code)
    }

    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// Lifecycle of one user-triggered action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Idle,
    Validating,
    Running,
    Extracting,
    Done,
    Failed,
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionState::Done | ActionState::Failed)
    }
}

/// Settings shared by every action
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Memory image to analyse
    pub image_path: Option<PathBuf>,

    /// Folder receiving captures, record files and zeroized images
    pub results_dir: Option<PathBuf>,

    /// Checkout holding the interrogate binary (serpent/twofish)
    pub interrogate_dir: PathBuf,

    /// Checkout holding the zeroize_dump binary
    pub zeroizer_dir: PathBuf,

    /// Search path for finder binaries (None = $PATH)
    pub search_path: Option<OsString>,

    /// Capacity of each run's event channel
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            image_path: None,
            results_dir: None,
            interrogate_dir: PathBuf::from("interrogate"),
            zeroizer_dir: PathBuf::from("Zeroizer"),
            search_path: None,
            event_buffer: 256,
        }
    }
}

impl OrchestratorConfig {
    pub fn new(image_path: impl Into<PathBuf>, results_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_path: Some(image_path.into()),
            results_dir: Some(results_dir.into()),
            ..Default::default()
        }
    }
}
