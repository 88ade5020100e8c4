//! Free-space checks before a download claims disk.

use std::path::Path;

use tracing::debug;

use super::error::DownloadError;

/// Headroom demanded on top of the bytes still to be written (10%).
const SPACE_HEADROOM_DIVISOR: u64 = 10;

/// Bytes that must be free to write `remaining` more bytes.
pub(crate) fn required_space(remaining: u64) -> u64 {
    remaining.saturating_add(remaining / SPACE_HEADROOM_DIVISOR)
}

/// Refuses when `available` cannot hold `remaining` bytes plus headroom.
pub(crate) fn check_free_space(
    dir: &Path,
    remaining: u64,
    available: u64,
) -> Result<(), DownloadError> {
    let required = required_space(remaining);
    if available < required {
        return Err(DownloadError::InsufficientSpace {
            path: dir.to_path_buf(),
            required,
            available,
        });
    }
    Ok(())
}

/// Checks the volume holding `dir` for room for `remaining` more bytes.
///
/// Part-files are sparse, so reserving them says nothing about free space;
/// this is checked up front instead of failing mid-transfer.
pub(crate) fn ensure_free_space(dir: &Path, remaining: u64) -> Result<(), DownloadError> {
    if remaining == 0 {
        return Ok(());
    }
    let available = fs2::available_space(dir).map_err(|e| DownloadError::io(dir, e))?;
    check_free_space(dir, remaining, available)?;
    debug!(
        dir = %dir.display(),
        remaining,
        available,
        "enough free space"
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_required_space_adds_headroom() {
        assert_eq!(required_space(1_000), 1_100);
        assert_eq!(required_space(5), 5);
        assert_eq!(required_space(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_check_free_space_refuses_without_headroom() {
        let dir = Path::new("/downloads");
        assert!(check_free_space(dir, 1_000, 1_100).is_ok());

        let err = check_free_space(dir, 1_000, 1_050).unwrap_err();
        assert!(matches!(
            err,
            DownloadError::InsufficientSpace {
                required: 1_100,
                available: 1_050,
                ..
            }
        ));
    }

    #[test]
    fn test_ensure_free_space_on_real_volume() {
        let dir = TempDir::new().unwrap();
        ensure_free_space(dir.path(), 0).unwrap();
        ensure_free_space(dir.path(), 1024).unwrap();

        let err = ensure_free_space(dir.path(), u64::MAX / 2).unwrap_err();
        assert!(matches!(err, DownloadError::InsufficientSpace { .. }));
    }

    #[test]
    fn test_ensure_free_space_missing_dir_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = ensure_free_space(&dir.path().join("gone"), 1).unwrap_err();
        assert!(matches!(err, DownloadError::Io { .. }));
    }
}
