use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ExtractorError, Result};
use crate::runner::{CommandSpec, RunRequest};
use crate::tools::is_file;
use crate::types::Algorithm;

/// Destination used when the caller leaves the name empty
pub const DEFAULT_DESTINATION: &str = "zero_mem.mem";

/// Binary produced by the Zeroizer build
pub const ZEROIZER_BIN: &str = "zeroize_dump";

const ZEROIZED_SUFFIX: &str = ".mem";

/// Empty → `zero_mem.mem`; names without a `.mem` suffix (any case) get one
pub fn normalize_destination(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return DEFAULT_DESTINATION.to_string();
    }
    if name.to_ascii_lowercase().ends_with(ZEROIZED_SUFFIX) {
        name.to_string()
    } else {
        format!("{name}{ZEROIZED_SUFFIX}")
    }
}

/// A validated zeroize job: every selected algorithm has an existing record file
#[derive(Debug, Clone)]
pub struct ZeroizeRequest {
    pub selected: BTreeSet<Algorithm>,
    pub record_files: BTreeMap<Algorithm, PathBuf>,
    pub source_image: PathBuf,
    pub destination: PathBuf,
}

impl ZeroizeRequest {
    pub fn new(
        selected: BTreeSet<Algorithm>,
        record_files: BTreeMap<Algorithm, PathBuf>,
        source_image: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Result<Self> {
        if selected.is_empty() {
            return Err(ExtractorError::NothingSelected);
        }

        for algorithm in &selected {
            match record_files.get(algorithm) {
                Some(path) if is_file(path) => {}
                Some(path) => {
                    return Err(ExtractorError::prerequisite(
                        path.display().to_string(),
                        format!("Run the {} finder first.", algorithm.name()),
                    ))
                }
                None => {
                    return Err(ExtractorError::prerequisite(
                        format!("{} record file", algorithm.name()),
                        format!("Run the {} finder first.", algorithm.name()),
                    ))
                }
            }
        }

        let destination = destination.into();
        if !destination
            .to_string_lossy()
            .to_ascii_lowercase()
            .ends_with(ZEROIZED_SUFFIX)
        {
            return Err(ExtractorError::InvalidInput(format!(
                "zeroized image {} must end in {ZEROIZED_SUFFIX}",
                destination.display()
            )));
        }

        let record_files = record_files
            .into_iter()
            .filter(|(algorithm, _)| selected.contains(algorithm))
            .collect();

        Ok(Self {
            selected,
            record_files,
            source_image: source_image.into(),
            destination,
        })
    }

    /// Use the conventional `<results>/<alg>_values.txt` record files and
    /// place the normalized destination name inside `results_dir`
    pub fn from_results_dir(
        selected: BTreeSet<Algorithm>,
        results_dir: &Path,
        source_image: impl Into<PathBuf>,
        destination_name: &str,
    ) -> Result<Self> {
        let record_files = selected
            .iter()
            .map(|algorithm| (*algorithm, results_dir.join(algorithm.record_file_name())))
            .collect();
        let destination = results_dir.join(normalize_destination(destination_name));
        Self::new(selected, record_files, source_image, destination)
    }

    /// `<bin> [-a f] [-r f] [-s f] [-t f] -o <dest> <source>`
    pub fn args(&self, binary: &Path) -> Vec<String> {
        let mut args = vec![binary.to_string_lossy().to_string()];
        for (algorithm, path) in &self.record_files {
            args.push(algorithm.zeroize_flag().to_string());
            args.push(path.to_string_lossy().to_string());
        }
        args.push("-o".to_string());
        args.push(self.destination.to_string_lossy().to_string());
        args.push(self.source_image.to_string_lossy().to_string());
        args
    }
}

/// Locates and prepares the zeroizing binary
#[derive(Debug, Clone)]
pub struct ZeroizeInvoker {
    zeroizer_dir: PathBuf,
}

impl ZeroizeInvoker {
    pub fn new(zeroizer_dir: impl Into<PathBuf>) -> Self {
        Self {
            zeroizer_dir: zeroizer_dir.into(),
        }
    }

    fn candidates(&self) -> [PathBuf; 2] {
        [
            self.zeroizer_dir.join(ZEROIZER_BIN),
            Path::new(".").join(ZEROIZER_BIN),
        ]
    }

    /// Build location first, then the current directory
    pub fn resolve_binary(&self) -> Result<PathBuf> {
        self.candidates()
            .into_iter()
            .find(|candidate| is_file(candidate))
            .map(|found| found.canonicalize())
            .transpose()?
            .ok_or_else(|| {
                ExtractorError::prerequisite(
                    format!("{ZEROIZER_BIN} binary"),
                    "Build Zeroizer first (run the setup tasks).",
                )
            })
    }

    /// Resolve the binary, mark it executable and build the run request
    pub fn build(&self, request: &ZeroizeRequest) -> Result<RunRequest> {
        let binary = self.resolve_binary()?;
        ensure_executable(&binary)?;
        let args = request.args(&binary);
        debug!(command = %args.join(" "), "built zeroize command");
        Ok(RunRequest::new(CommandSpec::Argv(args)))
    }
}

#[cfg(unix)]
fn ensure_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = std::fs::metadata(path)?.permissions();
    if permissions.mode() & 0o777 != 0o755 {
        permissions.set_mode(0o755);
        std::fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_records(dir: &Path, algorithms: &[Algorithm]) {
        for algorithm in algorithms {
            fs::write(dir.join(algorithm.record_file_name()), "10,0").unwrap();
        }
    }

    /// All non-empty subsets of the four algorithms
    fn subsets() -> Vec<BTreeSet<Algorithm>> {
        (1u8..16)
            .map(|mask| {
                Algorithm::ALL
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, a)| *a)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_destination_normalization() {
        assert_eq!(normalize_destination(""), "zero_mem.mem");
        assert_eq!(normalize_destination("   "), "zero_mem.mem");
        assert_eq!(normalize_destination("foo"), "foo.mem");
        assert_eq!(normalize_destination("foo.mem"), "foo.mem");
        assert_eq!(normalize_destination("FOO.MEM"), "FOO.MEM");
        assert_eq!(normalize_destination("dump.raw"), "dump.raw.mem");
    }

    #[test]
    fn test_refuses_when_any_record_file_missing() {
        for selected in subsets() {
            for missing in &selected {
                let dir = tempfile::tempdir().unwrap();
                let present: Vec<Algorithm> =
                    selected.iter().copied().filter(|a| a != missing).collect();
                write_records(dir.path(), &present);

                let err = ZeroizeRequest::from_results_dir(
                    selected.clone(),
                    dir.path(),
                    dir.path().join("mem.raw"),
                    "",
                )
                .unwrap_err();

                assert!(
                    matches!(err, ExtractorError::PrerequisiteMissing { .. }),
                    "{selected:?} missing {missing}"
                );
            }
        }
    }

    #[test]
    fn test_missing_message_names_algorithm_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let selected = BTreeSet::from([Algorithm::Serpent]);
        let err = ZeroizeRequest::from_results_dir(selected, dir.path(), "mem.raw", "x").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("serpent_values.txt"));
        assert!(message.contains("serpent finder"));
    }

    #[test]
    fn test_nothing_selected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ZeroizeRequest::from_results_dir(BTreeSet::new(), dir.path(), "mem.raw", "")
            .unwrap_err();
        assert!(matches!(err, ExtractorError::NothingSelected));
    }

    #[test]
    fn test_args_follow_flag_table() {
        let dir = tempfile::tempdir().unwrap();
        write_records(dir.path(), &Algorithm::ALL);
        let selected = BTreeSet::from([Algorithm::Twofish, Algorithm::Aes]);

        let request =
            ZeroizeRequest::from_results_dir(selected, dir.path(), "/img/mem.raw", "clean").unwrap();
        let args = request.args(Path::new("/opt/zeroize_dump"));

        let aes = dir.path().join("aes_values.txt").to_string_lossy().to_string();
        let twofish = dir.path().join("twofish_values.txt").to_string_lossy().to_string();
        let dest = dir.path().join("clean.mem").to_string_lossy().to_string();
        assert_eq!(
            args,
            vec![
                "/opt/zeroize_dump".to_string(),
                "-a".to_string(),
                aes,
                "-t".to_string(),
                twofish,
                "-o".to_string(),
                dest,
                "/img/mem.raw".to_string(),
            ]
        );
    }

    #[test]
    fn test_destination_must_end_in_mem() {
        let dir = tempfile::tempdir().unwrap();
        write_records(dir.path(), &[Algorithm::Rsa]);
        let files = BTreeMap::from([(Algorithm::Rsa, dir.path().join("rsa_values.txt"))]);

        let err = ZeroizeRequest::new(
            BTreeSet::from([Algorithm::Rsa]),
            files,
            "mem.raw",
            dir.path().join("out.img"),
        )
        .unwrap_err();
        assert!(matches!(err, ExtractorError::InvalidInput(_)));
    }

    #[test]
    fn test_missing_zeroizer_binary() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = ZeroizeInvoker::new(dir.path().join("Zeroizer"));
        // Only meaningful when the test's working directory has no stray binary
        if !Path::new(ZEROIZER_BIN).exists() {
            let err = invoker.resolve_binary().unwrap_err();
            assert!(matches!(err, ExtractorError::PrerequisiteMissing { .. }));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_build_marks_binary_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let zeroizer = dir.path().join("Zeroizer");
        fs::create_dir(&zeroizer).unwrap();
        let binary = zeroizer.join(ZEROIZER_BIN);
        fs::write(&binary, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o644)).unwrap();
        write_records(dir.path(), &[Algorithm::Rsa]);

        let request = ZeroizeRequest::from_results_dir(
            BTreeSet::from([Algorithm::Rsa]),
            dir.path(),
            "mem.raw",
            "",
        )
        .unwrap();
        let run = ZeroizeInvoker::new(&zeroizer).build(&request).unwrap();

        let mode = fs::metadata(&binary).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let args = run.command.to_args();
        assert_eq!(args[0], binary.canonicalize().unwrap().to_string_lossy());
        assert_eq!(&args[1..3], ["-r".to_string(), dir.path().join("rsa_values.txt").to_string_lossy().to_string()]);
    }
}
