//! Whole-file digests of downloaded and installed artifacts.

use crate::error::{Result, UpdaterError};
use crate::manifest::Checksum;
use sha2::{Digest, Sha256, Sha512};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::task;

const READ_BUFFER: usize = 64 * 1024;

/// Digest `path` with the algorithm of `like`.
pub fn digest_file(path: &Path, like: &Checksum) -> Result<Checksum> {
    let mut file = File::open(path)?;
    match like {
        Checksum::Sha512(_) => {
            let mut hasher = Sha512::new();
            pump(&mut file, |chunk| hasher.update(chunk))?;
            Ok(Checksum::Sha512(hasher.finalize().into()))
        }
        Checksum::Sha256(_) => {
            let mut hasher = Sha256::new();
            pump(&mut file, |chunk| hasher.update(chunk))?;
            Ok(Checksum::Sha256(hasher.finalize().into()))
        }
    }
}

fn pump(file: &mut File, mut sink: impl FnMut(&[u8])) -> std::io::Result<()> {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        sink(&buf[..n]);
    }
}

/// Fail with [`UpdaterError::ChecksumMismatch`] unless `path` hashes to `expected`.
///
/// Hashing runs on the blocking pool.
pub async fn verify_file(path: &Path, expected: &Checksum) -> Result<()> {
    let owned: PathBuf = path.to_path_buf();
    let wanted = expected.clone();
    let actual = task::spawn_blocking(move || digest_file(&owned, &wanted))
        .await
        .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))??;
    if &actual != expected {
        return Err(UpdaterError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    tracing::debug!("verified {} of {}", expected.algorithm(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose, Engine as _};

    fn sha512_of(data: &[u8]) -> Checksum {
        Checksum::parse_sha512(&general_purpose::STANDARD.encode(Sha512::digest(data))).unwrap()
    }

    #[tokio::test]
    async fn verifies_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"payload").unwrap();
        verify_file(&path, &sha512_of(b"payload")).await.unwrap();
    }

    #[tokio::test]
    async fn reports_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"payload").unwrap();
        let err = verify_file(&path, &sha512_of(b"other")).await.unwrap_err();
        assert!(matches!(err, UpdaterError::ChecksumMismatch { .. }));
        assert_eq!(err.code(), "ERR_UPDATER_CHECKSUM_MISMATCH");
    }

    #[test]
    fn sha256_follows_expected_algorithm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"abc").unwrap();
        let like = Checksum::Sha256([0; 32]);
        let digest = digest_file(&path, &like).unwrap();
        assert_eq!(
            digest.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
