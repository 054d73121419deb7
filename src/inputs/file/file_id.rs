// SPDX-License-Identifier: Apache-2.0

//! File identity based on device and inode, stable across renames. Rotation
//! is detected by comparing the identity of the open handle with a fresh
//! stat of the configured path.

use std::fs::{File, Metadata};
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    pub fn from_file(file: &File) -> io::Result<Self> {
        Ok(Self::from_metadata(&file.metadata()?))
    }

    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::from_metadata(&std::fs::metadata(path)?))
    }

    /// Inode number, as persisted in the position marker.
    pub fn ino(&self) -> u64 {
        self.ino
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_same_file_same_id() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"content").unwrap();
        file.flush().unwrap();

        let a = FileId::from_path(file.path()).unwrap();
        let b = FileId::from_path(file.path()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_files_differ() {
        let a = NamedTempFile::new().unwrap();
        let b = NamedTempFile::new().unwrap();
        assert_ne!(
            FileId::from_path(a.path()).unwrap(),
            FileId::from_path(b.path()).unwrap()
        );
    }

    #[test]
    fn test_stable_across_rename() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("a.log");
        std::fs::write(&old, "x\n").unwrap();
        let id = FileId::from_path(&old).unwrap();

        let renamed = dir.path().join("a.log.1");
        std::fs::rename(&old, &renamed).unwrap();
        assert_eq!(id, FileId::from_path(&renamed).unwrap());
    }
}
