//! Record extraction from raw finder captures.
//!
//! Finder tools print human-readable findings and wrap lines wherever they
//! like. Captures are flattened by dropping all whitespace, matched against
//! the per-algorithm pattern, and written as `<offsetHex>,<keySizeBits>`
//! lines: the record file the zeroizer consumes.

pub mod patterns;

use std::fs;
use std::path::Path;
use tracing::{debug, error, info};

use crate::error::{ExtractorError, Result};
use crate::types::{Algorithm, KeyRecord};
use patterns::pattern_for;

/// Remove every whitespace character
pub fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Records in order of appearance; duplicates are kept
pub fn extract(algorithm: Algorithm, raw: &str) -> Vec<KeyRecord> {
    let compact = strip_whitespace(raw);
    let pattern = pattern_for(algorithm);

    pattern
        .regex
        .captures_iter(&compact)
        .filter_map(|caps| {
            let offset = caps.get(pattern.offset_group)?.as_str();
            let size = match pattern.size_group {
                Some(group) => caps.get(group)?.as_str().parse().ok()?,
                None => 0,
            };
            KeyRecord::new(offset, size).ok()
        })
        .collect()
}

/// Canonical record file text: one record per line, no header, no trailing newline
pub fn render_records(records: &[KeyRecord]) -> String {
    records
        .iter()
        .map(KeyRecord::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Write (or overwrite) a record file
pub fn write_records(records: &[KeyRecord], path: &Path) -> Result<()> {
    fs::write(path, render_records(records))?;
    Ok(())
}

/// Parse a record file back into records, skipping blank lines
pub fn read_records(path: &Path) -> Result<Vec<KeyRecord>> {
    let text = fs::read_to_string(path)?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Extract records from a capture file and write them to `record_path`.
///
/// On failure nothing is written, so a stale or missing record file keeps
/// signalling that extraction did not succeed.
pub fn extract_file(algorithm: Algorithm, capture_path: &Path, record_path: &Path) -> Result<Vec<KeyRecord>> {
    let extraction_error = |path: &Path, err: std::io::Error| ExtractorError::Extraction {
        path: path.to_path_buf(),
        reason: err.to_string(),
    };

    let bytes = fs::read(capture_path).map_err(|err| {
        error!(tool = %algorithm, path = %capture_path.display(), error = %err, "capture unreadable");
        extraction_error(capture_path, err)
    })?;
    // Tools occasionally print raw key bytes; those never match a pattern anyway
    let raw = String::from_utf8_lossy(&bytes);

    let records = extract(algorithm, &raw);
    debug!(tool = %algorithm, count = records.len(), "records extracted");

    write_records(&records, record_path).map_err(|err| match err {
        ExtractorError::Io(io) => {
            error!(tool = %algorithm, path = %record_path.display(), error = %io, "record file not written");
            extraction_error(record_path, io)
        }
        other => other,
    })?;

    info!(
        tool = %algorithm,
        count = records.len(),
        path = %record_path.display(),
        "record file written"
    );
    Ok(records)
}
