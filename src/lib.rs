//! RAM-Extractor: key-finder orchestration for memory images
//!
//! This library drives external forensic tools over a raw memory image:
//! - aeskeyfind / rsakeyfind / interrogate (serpent, twofish) as non-blocking subprocesses
//! - Live merged stdout/stderr streaming via tokio::sync::mpsc
//! - Whitespace-insensitive extraction of `(offset, key size)` records
//! - Canonical `<offset>,<bits>` record files under the results folder
//! - zeroize_dump invocation over the selected record files
//! - Per-action state machine with cancellation through a run registry

pub mod cli;
pub mod error;
pub mod extractor;
pub mod integrity;
pub mod orchestrator;
pub mod runner;
pub mod tools;
pub mod types;
pub mod zeroize;

// Re-export commonly used types
pub use types::{Algorithm, ToolName, KeyRecord, RunId, RunEvent, RunStatus, ToolRun};
pub use types::{ActionState, OrchestratorConfig, SPAWN_FAILURE_CODE};
pub use runner::{CommandSpec, ProcessRunner, RunHandle, RunRegistry, RunRequest};
pub use tools::{Invocation, Prerequisite, ToolInvoker};
pub use extractor::{extract, extract_file, read_records, strip_whitespace, write_records};
pub use zeroize::{normalize_destination, ZeroizeInvoker, ZeroizeRequest};
pub use orchestrator::{ActionEvent, ActionReport, Failure, Orchestrator};
pub use integrity::{sha256_file, ImageDigests};
pub use error::{ExtractorError, Result};
