use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the extraction pipeline
#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A binary, directory or record file needed before spawning is absent
    #[error("{what} not found. {hint}")]
    PrerequisiteMissing { what: String, hint: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Select at least one algorithm to zeroize")]
    NothingSelected,

    #[error("Failed to launch `{command}`: {reason}")]
    ProcessSpawn { command: String, reason: String },

    #[error("`{command}` failed with exit code {code}")]
    ProcessExit { command: String, code: i32 },

    #[error("`{command}` was cancelled")]
    Cancelled { command: String },

    #[error("Extraction from {} failed: {reason}", path.display())]
    Extraction { path: PathBuf, reason: String },
}

impl ExtractorError {
    pub fn prerequisite(what: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::PrerequisiteMissing {
            what: what.into(),
            hint: hint.into(),
        }
    }

    /// Short machine-readable tag, used in `--json` outcomes
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::PrerequisiteMissing { .. } => "prerequisite_missing",
            Self::InvalidInput(_) | Self::NothingSelected => "invalid_input",
            Self::ProcessSpawn { .. } => "process_spawn_failure",
            Self::ProcessExit { .. } => "process_exit_failure",
            Self::Cancelled { .. } => "cancelled",
            Self::Extraction { .. } => "extraction_failure",
        }
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, ExtractorError>;
