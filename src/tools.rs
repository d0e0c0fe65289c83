use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ExtractorError, Result};
use crate::runner::{CommandSpec, RunRequest};
use crate::types::{Algorithm, OrchestratorConfig, ToolName};

const SETUP_HINT: &str = "Run the setup tasks (install the finder tools) first.";

/// Name of the binary built inside the interrogate checkout
pub const INTERROGATE_BIN: &str = "interrogate";

/// A fully validated finder command, ready for the runner
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: ToolName,
    pub request: RunRequest,
    pub capture_path: PathBuf,
}

impl Invocation {
    pub fn args(&self) -> Vec<String> {
        self.request.command.to_args()
    }
}

/// Presence of one external prerequisite, as reported by `check`
#[derive(Debug, Clone, Serialize)]
pub struct Prerequisite {
    pub name: String,
    pub location: Option<PathBuf>,
    pub present: bool,
}

/// Builds finder command lines and owns their prerequisite checks
#[derive(Debug, Clone)]
pub struct ToolInvoker {
    interrogate_dir: PathBuf,
    search_path: Option<OsString>,
}

impl ToolInvoker {
    pub fn new(interrogate_dir: impl Into<PathBuf>) -> Self {
        Self {
            interrogate_dir: interrogate_dir.into(),
            search_path: None,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            interrogate_dir: config.interrogate_dir.clone(),
            search_path: config.search_path.clone(),
        }
    }

    /// Override the directories searched for finder binaries
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    pub fn interrogate_dir(&self) -> &Path {
        &self.interrogate_dir
    }

    /// Locate an executable the way a shell would
    pub fn resolve_binary(&self, name: &str) -> Option<PathBuf> {
        if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
            let path = PathBuf::from(name);
            return is_executable(&path).then_some(path);
        }

        let search = self
            .search_path
            .clone()
            .or_else(|| std::env::var_os("PATH"))?;
        std::env::split_paths(&search)
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }

    /// Fails with `PrerequisiteMissing` when the finder for `algorithm` cannot run
    pub fn check_prerequisites(&self, algorithm: Algorithm) -> Result<()> {
        self.locate(algorithm).map(|_| ())
    }

    fn locate(&self, algorithm: Algorithm) -> Result<PathBuf> {
        match algorithm {
            Algorithm::Aes => self
                .resolve_binary("aeskeyfind")
                .ok_or_else(|| ExtractorError::prerequisite("aeskeyfind", SETUP_HINT)),
            Algorithm::Rsa => self
                .resolve_binary("rsakeyfind")
                .ok_or_else(|| ExtractorError::prerequisite("rsakeyfind", SETUP_HINT)),
            Algorithm::Serpent | Algorithm::Twofish => {
                if !self.interrogate_dir.is_dir() {
                    return Err(ExtractorError::prerequisite(
                        format!("interrogate directory {}", self.interrogate_dir.display()),
                        SETUP_HINT,
                    ));
                }
                let dir = self.interrogate_dir.canonicalize()?;
                Ok(dir)
            }
        }
    }

    /// Build the command for one finder run.
    ///
    /// `image` must be an existing regular file; `output_path` receives the
    /// raw capture. Both are made absolute so the interrogate finders, which
    /// run inside their own checkout, still see them.
    pub fn build(&self, algorithm: Algorithm, image: &Path, output_path: &Path) -> Result<Invocation> {
        let location = self.locate(algorithm)?;
        let image = validate_image(image)?;
        let image_arg = image.to_string_lossy().to_string();
        let capture_path = std::path::absolute(output_path)?;

        let request = match algorithm {
            Algorithm::Aes => RunRequest::new(CommandSpec::argv([
                location.to_string_lossy().to_string(),
                "-v".to_string(),
                "-q".to_string(),
                image_arg,
            ])),
            Algorithm::Rsa => RunRequest::new(CommandSpec::argv([
                location.to_string_lossy().to_string(),
                image_arg,
            ])),
            Algorithm::Serpent | Algorithm::Twofish => {
                let binary = location.join(INTERROGATE_BIN);
                RunRequest::new(CommandSpec::argv([
                    binary.to_string_lossy().to_string(),
                    "-a".to_string(),
                    algorithm.name().to_string(),
                    image_arg,
                ]))
                .current_dir(location)
            }
        }
        .capture_to(&capture_path);

        debug!(tool = %algorithm, command = %request.command.display(), "built finder command");
        Ok(Invocation {
            tool: algorithm.into(),
            request,
            capture_path,
        })
    }

    /// Finder-side prerequisites, for the `check` command
    pub fn prerequisite_report(&self) -> Vec<Prerequisite> {
        let mut report: Vec<Prerequisite> = ["aeskeyfind", "rsakeyfind"]
            .iter()
            .map(|name| {
                let location = self.resolve_binary(name);
                Prerequisite {
                    name: name.to_string(),
                    present: location.is_some(),
                    location,
                }
            })
            .collect();

        let binary = self.interrogate_dir.join(INTERROGATE_BIN);
        report.push(Prerequisite {
            name: "interrogate (serpent/twofish)".to_string(),
            present: self.interrogate_dir.is_dir() && is_executable(&binary),
            location: Some(binary),
        });
        report
    }
}

/// Reject empty, missing or non-regular image paths; returns the absolute path
pub fn validate_image(image: &Path) -> Result<PathBuf> {
    if image.as_os_str().is_empty() {
        return Err(ExtractorError::InvalidInput(
            "Provide a memory file and a results folder".to_string(),
        ));
    }
    if !is_file(image) {
        return Err(ExtractorError::InvalidInput(format!(
            "Memory file not found: {}",
            image.display()
        )));
    }
    Ok(image.canonicalize()?)
}

/// Create the results directory if needed; returns the absolute path
pub fn prepare_results_dir(dir: &Path) -> Result<PathBuf> {
    if dir.as_os_str().is_empty() {
        return Err(ExtractorError::InvalidInput(
            "Provide a memory file and a results folder".to_string(),
        ));
    }
    std::fs::create_dir_all(dir)?;
    Ok(dir.canonicalize()?)
}

pub(crate) fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}

#[cfg(unix)]
pub(crate) fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub(crate) fn is_executable(path: &Path) -> bool {
    is_file(path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn fake_binary(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn image(dir: &Path) -> PathBuf {
        let path = dir.join("mem.raw");
        fs::write(&path, b"\x00\x01\x02").unwrap();
        path
    }

    #[test]
    fn test_aes_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let bin_dir = dir.path().join("bin");
        fs::create_dir(&bin_dir).unwrap();
        let aes = fake_binary(&bin_dir, "aeskeyfind");
        let image = image(dir.path());

        let invoker = ToolInvoker::new(dir.path().join("interrogate")).with_search_path(&bin_dir);
        let out = dir.path().join("aeskeyfind_output.txt");
        let invocation = invoker.build(Algorithm::Aes, &image, &out).unwrap();

        let args = invocation.args();
        assert_eq!(args[0], aes.to_string_lossy());
        assert_eq!(&args[1..3], ["-v", "-q"]);
        assert_eq!(args[3], image.canonicalize().unwrap().to_string_lossy());
        assert_eq!(invocation.capture_path, out);
        assert_eq!(invocation.tool, ToolName::Aes);
        assert!(invocation.request.working_dir.is_none());
    }

    #[test]
    fn test_missing_binary_is_prerequisite_error() {
        let dir = tempfile::tempdir().unwrap();
        let image = image(dir.path());
        let invoker = ToolInvoker::new("interrogate").with_search_path(dir.path());

        let err = invoker
            .build(Algorithm::Rsa, &image, &dir.path().join("out.txt"))
            .unwrap_err();
        assert!(matches!(err, ExtractorError::PrerequisiteMissing { .. }));
        assert!(err.to_string().contains("rsakeyfind"));
    }

    #[test]
    fn test_non_executable_is_not_resolved() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("rsakeyfind"), "data").unwrap();
        let invoker = ToolInvoker::new("interrogate").with_search_path(dir.path());
        assert!(invoker.resolve_binary("rsakeyfind").is_none());
    }

    #[test]
    fn test_interrogate_runs_in_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let checkout = dir.path().join("interrogate");
        fs::create_dir(&checkout).unwrap();
        fake_binary(&checkout, INTERROGATE_BIN);
        let image = image(dir.path());

        let invoker = ToolInvoker::new(&checkout);
        let invocation = invoker
            .build(Algorithm::Twofish, &image, &dir.path().join("twofish_output.txt"))
            .unwrap();

        let args = invocation.args();
        assert!(args[0].ends_with("interrogate/interrogate"));
        assert_eq!(&args[1..3], ["-a", "twofish"]);
        assert_eq!(
            invocation.request.working_dir,
            Some(checkout.canonicalize().unwrap())
        );
    }

    #[test]
    fn test_missing_interrogate_dir() {
        let dir = tempfile::tempdir().unwrap();
        let image = image(dir.path());
        let invoker = ToolInvoker::new(dir.path().join("absent"));

        let err = invoker
            .build(Algorithm::Serpent, &image, &dir.path().join("o.txt"))
            .unwrap_err();
        assert!(matches!(err, ExtractorError::PrerequisiteMissing { .. }));
    }

    #[test]
    fn test_prerequisites_checked_before_image() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = ToolInvoker::new("interrogate").with_search_path(dir.path());
        let err = invoker
            .build(Algorithm::Aes, Path::new("/no/such/image"), Path::new("o.txt"))
            .unwrap_err();
        assert!(matches!(err, ExtractorError::PrerequisiteMissing { .. }));
    }

    #[test]
    fn test_image_validation() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            validate_image(Path::new("")),
            Err(ExtractorError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_image(&dir.path().join("missing.raw")),
            Err(ExtractorError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_image(dir.path()),
            Err(ExtractorError::InvalidInput(_))
        ));
        assert!(validate_image(&image(dir.path())).is_ok());
    }

    #[test]
    fn test_results_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("a").join("b");
        let prepared = prepare_results_dir(&results).unwrap();
        assert!(prepared.is_dir());
        assert!(prepare_results_dir(Path::new("")).is_err());
    }

    #[test]
    fn test_prerequisite_report() {
        let dir = tempfile::tempdir().unwrap();
        fake_binary(dir.path(), "aeskeyfind");
        let invoker = ToolInvoker::new(dir.path().join("interrogate")).with_search_path(dir.path());

        let report = invoker.prerequisite_report();
        assert_eq!(report.len(), 3);
        assert!(report[0].present);
        assert!(!report[1].present);
        assert!(!report[2].present);
    }
}
