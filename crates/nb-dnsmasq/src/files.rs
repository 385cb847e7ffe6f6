use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// `<path>.tmp`, the staging file for an atomic replace of `path`.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Write `content` to `<path>.tmp` then rename it over `path`.
pub async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to rename {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Read `path`, treating a missing file as `None`.
pub async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Remove `path` if present. Returns true when a file was removed.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

pub async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir())
}

pub async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

/// Create `dir` if needed. Returns true when it did not exist before.
pub async fn ensure_dir(dir: &Path) -> Result<bool> {
    if is_dir(dir).await {
        return Ok(false);
    }
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tmp_path_keeps_extension() {
        assert_eq!(
            tmp_path(Path::new("/var/lib/dnsmasq.leases")),
            PathBuf::from("/var/lib/dnsmasq.leases.tmp")
        );
    }

    #[tokio::test]
    async fn test_write_atomic_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.conf");

        write_atomic(&path, "one\n").await.unwrap();
        write_atomic(&path, "two\n").await.unwrap();

        assert_eq!(read_optional(&path).await.unwrap().as_deref(), Some("two\n"));
        assert!(!tmp_path(&path).exists());
        assert!(is_file(&path).await);
    }

    #[tokio::test]
    async fn test_ensure_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        assert!(ensure_dir(&nested).await.unwrap());
        assert!(!ensure_dir(&nested).await.unwrap());
        assert!(is_dir(&nested).await);
    }

    #[tokio::test]
    async fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.conf");
        assert_eq!(read_optional(&path).await.unwrap(), None);
        assert!(!remove_if_exists(&path).await.unwrap());

        write_atomic(&path, "x\n").await.unwrap();
        assert!(remove_if_exists(&path).await.unwrap());
        assert!(!path.exists());
    }
}
