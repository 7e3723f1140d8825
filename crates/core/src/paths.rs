//! Cache directory resolution.

use std::path::{Path, PathBuf};

/// Application subdirectory under the platform cache directory.
pub const APP_DIR: &str = "pixstash";

/// Resolve and create the directory of `namespace`.
///
/// Uses `base` when given, otherwise the platform cache directory, otherwise
/// the temp directory.
///
/// # Errors
///
/// Returns the I/O error of creating the directory.
pub fn cache_dir(base: Option<&Path>, namespace: &str) -> std::io::Result<PathBuf> {
    let root = match base {
        Some(base) => base.to_path_buf(),
        None => dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join(APP_DIR),
    };
    let dir = root.join(namespace);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_base() {
        let base = tempfile::tempdir().unwrap();
        let dir = cache_dir(Some(base.path()), "thumbs").unwrap();
        assert_eq!(dir, base.path().join("thumbs"));
        assert!(dir.is_dir());
    }

    #[test]
    fn test_platform_fallback_ends_in_namespace() {
        let dir = cache_dir(None, "pixstash-test-namespace").unwrap();
        assert!(dir.ends_with(Path::new(APP_DIR).join("pixstash-test-namespace")));
        let _ = std::fs::remove_dir(&dir);
    }
}
