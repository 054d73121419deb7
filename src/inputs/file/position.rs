// SPDX-License-Identifier: Apache-2.0

//! Durable position marker: a 29-byte ASCII file holding
//! `%014d:%014d` of `(inode, byte position)`, rewritten in place with a
//! forced flush after every batch. Exactly one tailer owns a marker for its
//! lifetime, so no locking is needed.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub const MARKER_LEN: u64 = 29;

#[derive(Debug, Clone)]
pub struct PositionFile {
    path: PathBuf,
}

impl PositionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored `(inode, position)`. Returns `None` when the marker is
    /// missing or does not parse as two colon-separated numbers.
    pub fn read(&self) -> Option<(u64, u64)> {
        let mut text = String::new();
        std::fs::File::open(&self.path)
            .ok()?
            .read_to_string(&mut text)
            .ok()?;
        let (inode, position) = text.trim_end().split_once(':')?;
        Some((inode.parse().ok()?, position.parse().ok()?))
    }

    /// Overwrite the marker with `(inode, position)` and flush it to disk,
    /// truncating to exactly the marker length.
    pub fn write(&self, inode: u64, position: u64) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file.write_all(format!("{:014}:{:014}", inode, position).as_bytes())?;
        file.set_len(MARKER_LEN)?;
        file.flush()?;
        file.sync_data()
    }
}
