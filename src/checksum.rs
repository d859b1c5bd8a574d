//! SHA256 helpers used by the Binary Manager and Model Manager for archive and
//! component integrity.

use crate::error::{CoreError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Hashes a file on disk, streaming it in fixed chunks so multi-gigabyte model
/// and archive files don't need to be read into memory at once.
pub async fn sha256_file(path: &Path) -> Result<String> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verifies a file's SHA256 against an expected hex digest (case-insensitive).
pub async fn verify_file(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path).await?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CoreError::ChecksumError {
            message: format!(
                "checksum mismatch for {}: expected {expected}, got {actual}",
                path.display()
            ),
        })
    }
}
