use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::types::{Algorithm, OrchestratorConfig};

/// RAM-Extractor - find and zeroize key material in memory images
/// by driving aeskeyfind, rsakeyfind, interrogate and zeroize_dump
#[derive(Parser, Debug, Clone)]
#[command(name = "ram-extractor")]
#[command(version)]
#[command(about = "Find and zeroize cryptographic keys in RAM images", long_about = None)]
pub struct Args {
    /// Memory image to analyse
    #[arg(short = 'm', long = "image", env = "RAM_EXTRACTOR_IMAGE", global = true)]
    pub image: Option<PathBuf>,

    /// Folder for captures, record files and zeroized images
    #[arg(short = 'r', long = "results", env = "RAM_EXTRACTOR_RESULTS", global = true)]
    pub results: Option<PathBuf>,

    /// Checkout containing the interrogate binary (serpent/twofish)
    #[arg(long = "interrogate-dir", default_value = "interrogate", global = true)]
    pub interrogate_dir: PathBuf,

    /// Checkout containing the zeroize_dump binary
    #[arg(long = "zeroizer-dir", default_value = "Zeroizer", global = true)]
    pub zeroizer_dir: PathBuf,

    /// Print the final outcome as JSON on stdout
    #[arg(long = "json", global = true)]
    pub json: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run finder tools over the image and extract key offsets
    Find {
        /// Tools to run; several run concurrently
        #[arg(value_enum, required = true, num_args = 1..)]
        tools: Vec<FindTarget>,
    },

    /// Re-extract records from an existing capture file
    Extract {
        #[arg(value_enum)]
        algorithm: AlgorithmArg,

        /// Capture to read (default: <results>/<tool>_output.txt)
        #[arg(long = "capture")]
        capture: Option<PathBuf>,
    },

    /// Write a copy of the image with the recorded key bytes zeroed
    Zeroize {
        #[arg(long = "aes")]
        aes: bool,

        #[arg(long = "rsa")]
        rsa: bool,

        #[arg(long = "serpent")]
        serpent: bool,

        #[arg(long = "twofish")]
        twofish: bool,

        /// File name for the zeroized image (.mem is appended if missing)
        #[arg(long = "name", default_value = "")]
        name: String,

        /// SHA-256 the source and zeroized images
        #[arg(long = "hash")]
        hash: bool,
    },

    /// Report which external tools are installed
    Check,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmArg {
    Aes,
    Rsa,
    Serpent,
    Twofish,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Aes => Algorithm::Aes,
            AlgorithmArg::Rsa => Algorithm::Rsa,
            AlgorithmArg::Serpent => Algorithm::Serpent,
            AlgorithmArg::Twofish => Algorithm::Twofish,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindTarget {
    Aes,
    Rsa,
    Serpent,
    Twofish,
    All,
}

/// Expand `all` and drop repeats, keeping first-mention order
pub fn expand_targets(targets: &[FindTarget]) -> Vec<Algorithm> {
    let mut algorithms = Vec::new();
    for target in targets {
        let expanded: &[Algorithm] = match target {
            FindTarget::Aes => &[Algorithm::Aes],
            FindTarget::Rsa => &[Algorithm::Rsa],
            FindTarget::Serpent => &[Algorithm::Serpent],
            FindTarget::Twofish => &[Algorithm::Twofish],
            FindTarget::All => &Algorithm::ALL,
        };
        for algorithm in expanded {
            if !algorithms.contains(algorithm) {
                algorithms.push(*algorithm);
            }
        }
    }
    algorithms
}

impl Args {
    /// Validate the arguments
    pub fn validate(&self) -> Result<(), String> {
        let missing = |value: &Option<PathBuf>| {
            value
                .as_ref()
                .map(|p| p.as_os_str().is_empty())
                .unwrap_or(true)
        };

        match &self.command {
            Command::Find { .. } | Command::Zeroize { .. } => {
                if missing(&self.image) || missing(&self.results) {
                    return Err("Provide a memory file (--image) and a results folder (--results)".to_string());
                }
            }
            Command::Extract { .. } => {
                if missing(&self.results) {
                    return Err("Provide a results folder (--results)".to_string());
                }
            }
            Command::Check => {}
        }

        if let Command::Zeroize { .. } = &self.command {
            if self.zeroize_selection().is_empty() {
                return Err("Select at least one algorithm to zeroize (--aes, --rsa, --serpent, --twofish)".to_string());
            }
        }

        Ok(())
    }

    /// Algorithms ticked on the zeroize command; empty for other commands
    pub fn zeroize_selection(&self) -> BTreeSet<Algorithm> {
        match &self.command {
            Command::Zeroize {
                aes,
                rsa,
                serpent,
                twofish,
                ..
            } => [
                (*aes, Algorithm::Aes),
                (*rsa, Algorithm::Rsa),
                (*serpent, Algorithm::Serpent),
                (*twofish, Algorithm::Twofish),
            ]
            .into_iter()
            .filter(|(selected, _)| *selected)
            .map(|(_, algorithm)| algorithm)
            .collect(),
            _ => BTreeSet::new(),
        }
    }

    pub fn to_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            image_path: self.image.clone(),
            results_dir: self.results.clone(),
            interrogate_dir: self.interrogate_dir.clone(),
            zeroizer_dir: self.zeroizer_dir.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("ram-extractor").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_find_requires_paths() {
        let args = parse(&["find", "aes"]);
        if std::env::var_os("RAM_EXTRACTOR_IMAGE").is_none() {
            assert!(args.validate().is_err());
        }

        let args = parse(&["-m", "mem.raw", "-r", "out", "find", "aes", "rsa"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_find_all_expands() {
        let args = parse(&["find", "rsa", "all", "aes"]);
        let Command::Find { tools } = &args.command else {
            panic!("expected find");
        };
        assert_eq!(
            expand_targets(tools),
            vec![Algorithm::Rsa, Algorithm::Aes, Algorithm::Serpent, Algorithm::Twofish]
        );
    }

    #[test]
    fn test_zeroize_selection() {
        let args = parse(&["-m", "m", "-r", "r", "zeroize", "--twofish", "--aes", "--name", "clean"]);
        assert_eq!(
            args.zeroize_selection(),
            BTreeSet::from([Algorithm::Aes, Algorithm::Twofish])
        );
        assert!(args.validate().is_ok());

        let args = parse(&["-m", "m", "-r", "r", "zeroize"]);
        assert!(args.validate().unwrap_err().contains("at least one"));
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let args = parse(&["check", "--interrogate-dir", "/opt/interrogate", "--json"]);
        assert!(args.json);
        let config = args.to_config();
        assert_eq!(config.interrogate_dir, PathBuf::from("/opt/interrogate"));
        assert_eq!(config.zeroizer_dir, PathBuf::from("Zeroizer"));
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_unknown_tool_rejected() {
        assert!(Args::try_parse_from(["ram-extractor", "find", "des"]).is_err());
    }
}
