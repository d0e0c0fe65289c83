use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tokio::task;

use crate::error::{ExtractorError, Result};

/// SHA-256 of the source image and of the zeroized copy
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImageDigests {
    pub source_sha256: String,
    pub destination_sha256: String,
}

/// SHA-256 over the whole file, streamed
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// [`sha256_file`] off the async executor; images are often several GB
pub async fn sha256_file_async(path: PathBuf) -> Result<String> {
    task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|err| ExtractorError::Io(std::io::Error::other(format!("hash task failed: {err}"))))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_async_hash_missing_file() {
        let result = sha256_file_async(PathBuf::from("/no/such/ram-extractor/image")).await;
        assert!(matches!(result, Err(ExtractorError::Io(_))));
    }
}
