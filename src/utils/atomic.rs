//! Atomic file operations
//!
//! Snapshots are replaced, never rewritten in place:
//!
//! 1. Write to a temporary file (.tmp) next to the target
//! 2. Call sync_all() to flush to disk
//! 3. Rename the temp file over the final path
//!
//! A crash leaves either the old snapshot or the new one, plus at worst a
//! stray `.tmp` file that [`cleanup_temp_files`] removes on the next open.

use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Atomically replace `path` with whatever `write_fn` writes.
///
/// Parent directories are created as needed.
///
/// ```ignore
/// atomic_write_with("data/orders/42.snapshot", |file| {
///     file.write_all(&offset.to_be_bytes())?;
///     file.write_all(&body)
/// })?;
/// ```
pub fn atomic_write_with<P, F>(path: P, write_fn: F) -> io::Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let path = path.as_ref();
    let temp_path = path.with_extension("tmp");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = File::create(&temp_path)?;
    if let Err(e) = write_fn(&mut file).and_then(|()| file.sync_all()) {
        drop(file);
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    fs::rename(&temp_path, path)
}

/// Remove leftover `.tmp` files from interrupted writes in `dir`.
///
/// Returns the number of files removed.
pub fn cleanup_temp_files<P: AsRef<Path>>(dir: P) -> io::Result<usize> {
    let dir = dir.as_ref();
    let mut cleaned = 0;

    if !dir.exists() {
        return Ok(0);
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();

        if path.extension().map(|e| e == "tmp").unwrap_or(false) {
            fs::remove_file(&path)?;
            cleaned += 1;
        }
    }

    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_with() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("42.snapshot");

        atomic_write_with(&path, |file| {
            file.write_all(&7u64.to_be_bytes())?;
            file.write_all(b"{}")
        })
        .unwrap();

        let content = fs::read(&path).unwrap();
        assert_eq!(&content[..8], &7u64.to_be_bytes());
        assert_eq!(&content[8..], b"{}");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_failed_write_keeps_previous_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("42.snapshot");
        fs::write(&path, "old").unwrap();

        let result = atomic_write_with(&path, |_| Err(io::Error::other("boom")));

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "old");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("repo").join("nested").join("1.snapshot");

        atomic_write_with(&path, |file| file.write_all(b"x")).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_cleanup_temp_files() {
        let temp_dir = TempDir::new().unwrap();

        fs::write(temp_dir.path().join("a.tmp"), "temp1").unwrap();
        fs::write(temp_dir.path().join("b.tmp"), "temp2").unwrap();
        fs::write(temp_dir.path().join("a.snapshot"), "keep").unwrap();

        let cleaned = cleanup_temp_files(temp_dir.path()).unwrap();
        assert_eq!(cleaned, 2);

        assert!(!temp_dir.path().join("a.tmp").exists());
        assert!(!temp_dir.path().join("b.tmp").exists());
        assert!(temp_dir.path().join("a.snapshot").exists());
    }

    #[test]
    fn test_cleanup_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(cleanup_temp_files(temp_dir.path().join("absent")).unwrap(), 0);
    }
}
