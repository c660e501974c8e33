use std::path::{Component, Path};

use crate::TransferError;

/// Validates a bare file name that will be joined onto the storage directory.
///
/// Rejects:
/// - Empty names
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
/// - Anything with more than one component (`sub/file.txt`)
/// - Hidden names (leading `.`), which would collide with the chunk store
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty name".into()));
    }

    let path = Path::new(name);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {name}"
        )));
    }

    let mut normal = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {name}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {name}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {name}"
                )));
            }
            Component::CurDir => {
                return Err(TransferError::InvalidPath(format!(
                    "relative prefix not allowed: {name}"
                )));
            }
            Component::Normal(_) => normal += 1,
        }
    }

    if normal != 1 || name.contains(['/', '\\']) {
        return Err(TransferError::InvalidPath(format!(
            "nested paths not allowed: {name}"
        )));
    }

    if name.starts_with('.') {
        return Err(TransferError::InvalidPath(format!(
            "hidden names not allowed: {name}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        assert!(validate_file_name("").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(validate_file_name("../../../etc/passwd").is_err());
        assert!(validate_file_name("..").is_err());
    }

    #[test]
    fn rejects_absolute_unix_path() {
        assert!(validate_file_name("/tmp/malicious").is_err());
    }

    #[test]
    fn rejects_windows_style_separators() {
        assert!(validate_file_name("C:\\Windows\\evil").is_err());
        assert!(validate_file_name("sub\\file.txt").is_err());
    }

    #[test]
    fn rejects_nested_paths() {
        assert!(validate_file_name("sub/dir/file.txt").is_err());
        assert!(validate_file_name("./photo.jpg").is_err());
    }

    #[test]
    fn rejects_hidden_names() {
        assert!(validate_file_name(".chunks").is_err());
        assert!(validate_file_name(".bashrc").is_err());
    }

    #[test]
    fn accepts_plain_names() {
        assert!(validate_file_name("photo.jpg").is_ok());
        assert!(validate_file_name("Quarterly Report (final).pdf").is_ok());
        assert!(validate_file_name("archive.tar.gz").is_ok());
    }
}
