//! Post-merge verification: file size and SHA-256 checksum.

use std::fmt::Write as _;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

use super::error::DownloadError;

const HASH_BUFFER_SIZE: usize = 64 * 1024;
const SHA256_HEX_LEN: usize = 64;

/// Normalizes an expected checksum to lowercase hex.
///
/// Accepts `sha256:<hex>` or a bare 64-character hex digest; anything else
/// is `None`.
#[must_use]
pub fn parse_checksum(value: &str) -> Option<String> {
    let value = value.trim();
    let hex = match value.split_once(':') {
        Some((algorithm, hex)) if algorithm.eq_ignore_ascii_case("sha256") => hex,
        Some(_) => return None,
        None => value,
    };
    (hex.len() == SHA256_HEX_LEN && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| hex.to_ascii_lowercase())
}

/// Computes the SHA-256 digest of a file as lowercase hex.
///
/// # Errors
///
/// Returns `DownloadError::Io` if the file cannot be read.
pub async fn sha256_file(path: &Path) -> Result<String, DownloadError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(SHA256_HEX_LEN);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

/// Checks the final file against the expected size and checksum.
///
/// # Errors
///
/// - `Integrity` when the size differs
/// - `ChecksumMismatch` when the digest differs
/// - `Io` when the file cannot be read
#[instrument(skip(checksum), fields(path = %path.display()))]
pub async fn verify_file(
    path: &Path,
    expected_size: Option<u64>,
    checksum: Option<&str>,
) -> Result<(), DownloadError> {
    let actual_size = tokio::fs::metadata(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?
        .len();
    if let Some(expected) = expected_size
        && expected != actual_size
    {
        return Err(DownloadError::integrity(path, expected, actual_size));
    }

    if let Some(raw) = checksum {
        let expected = parse_checksum(raw).unwrap_or_else(|| raw.to_string());
        let actual = sha256_file(path).await?;
        if actual != expected {
            return Err(DownloadError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
            });
        }
        debug!("checksum verified");
    }
    Ok(())
}
