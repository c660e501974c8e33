//! Listing, deletion and renaming of stored files.

use std::path::{Path, PathBuf};

use airshare_protocol::FileEntry;

use crate::FileOpsError;

/// Resolves a client-supplied file name inside `storage`.
pub fn resolve(storage: &Path, name: &str) -> Result<PathBuf, FileOpsError> {
    airshare_transfer::validate_file_name(name)
        .map_err(|e| FileOpsError::InvalidName(e.to_string()))?;
    Ok(storage.join(name))
}

/// Lists regular files in `storage`, sorted case-insensitively.
///
/// Hidden entries (starting with `.`), including the chunk store, and
/// directories are excluded.
pub fn list_files(storage: &Path) -> Result<Vec<FileEntry>, FileOpsError> {
    let entries = std::fs::read_dir(storage)?;

    let mut files: Vec<FileEntry> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                return None;
            }
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            Some(FileEntry {
                name,
                size: metadata.len(),
            })
        })
        .collect();

    files.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(files)
}

/// Deletes a stored file. Directories are never removed.
pub fn delete_file(storage: &Path, name: &str) -> Result<(), FileOpsError> {
    let path = resolve(storage, name)?;
    match std::fs::metadata(&path) {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Err(FileOpsError::InvalidName(format!("not a file: {name}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(FileOpsError::NotFound(name.to_string()));
        }
        Err(e) => return Err(e.into()),
    }

    std::fs::remove_file(&path)?;
    tracing::info!(file = %name, "deleted file");
    Ok(())
}

/// Renames a stored file. The target must not exist yet.
pub fn rename_file(storage: &Path, from: &str, to: &str) -> Result<(), FileOpsError> {
    let source = resolve(storage, from)?;
    let target = resolve(storage, to)?;

    if !source.is_file() {
        return Err(FileOpsError::NotFound(from.to_string()));
    }
    if target.exists() {
        return Err(FileOpsError::AlreadyExists(to.to_string()));
    }

    std::fs::rename(&source, &target)?;
    tracing::info!(from = %from, to = %to, "renamed file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage_with(files: &[(&str, &[u8])]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (name, data) in files {
            std::fs::write(tmp.path().join(name), data).unwrap();
        }
        tmp
    }

    #[test]
    fn list_skips_hidden_and_directories() {
        let tmp = storage_with(&[("b.txt", b"bb"), ("A.jpg", b"a"), (".hidden", b"x")]);
        std::fs::create_dir_all(tmp.path().join(".chunks").join("s1")).unwrap();
        std::fs::create_dir(tmp.path().join("folder")).unwrap();

        let files = list_files(tmp.path()).unwrap();
        assert_eq!(
            files,
            vec![
                FileEntry { name: "A.jpg".into(), size: 1 },
                FileEntry { name: "b.txt".into(), size: 2 },
            ]
        );
    }

    #[test]
    fn list_missing_storage_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = list_files(&tmp.path().join("absent")).unwrap_err();
        assert!(matches!(err, FileOpsError::Io(_)));
    }

    #[test]
    fn resolve_rejects_escapes() {
        let tmp = TempDir::new().unwrap();
        assert!(resolve(tmp.path(), "../secret").is_err());
        assert!(resolve(tmp.path(), "/etc/passwd").is_err());
        assert!(resolve(tmp.path(), ".chunks").is_err());
        assert_eq!(resolve(tmp.path(), "ok.txt").unwrap(), tmp.path().join("ok.txt"));
    }

    #[test]
    fn delete_removes_file() {
        let tmp = storage_with(&[("gone.txt", b"x")]);
        delete_file(tmp.path(), "gone.txt").unwrap();
        assert!(!tmp.path().join("gone.txt").exists());

        let err = delete_file(tmp.path(), "gone.txt").unwrap_err();
        assert!(matches!(err, FileOpsError::NotFound(_)));
    }

    #[test]
    fn delete_refuses_directories() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("dir")).unwrap();
        assert!(matches!(
            delete_file(tmp.path(), "dir"),
            Err(FileOpsError::InvalidName(_))
        ));
        assert!(tmp.path().join("dir").exists());
    }

    #[test]
    fn rename_moves_file() {
        let tmp = storage_with(&[("old.txt", b"data")]);
        rename_file(tmp.path(), "old.txt", "new.txt").unwrap();
        assert!(!tmp.path().join("old.txt").exists());
        assert_eq!(std::fs::read(tmp.path().join("new.txt")).unwrap(), b"data");
    }

    #[test]
    fn rename_errors() {
        let tmp = storage_with(&[("a.txt", b"a"), ("b.txt", b"b")]);
        assert!(matches!(
            rename_file(tmp.path(), "missing.txt", "c.txt"),
            Err(FileOpsError::NotFound(_))
        ));
        assert!(matches!(
            rename_file(tmp.path(), "a.txt", "b.txt"),
            Err(FileOpsError::AlreadyExists(_))
        ));
        assert!(matches!(
            rename_file(tmp.path(), "a.txt", "../a.txt"),
            Err(FileOpsError::InvalidName(_))
        ));
        assert_eq!(std::fs::read(tmp.path().join("b.txt")).unwrap(), b"b");
    }
}
