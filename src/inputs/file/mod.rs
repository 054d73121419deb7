// SPDX-License-Identifier: Apache-2.0

//! File tailing across rotation.
//!
//! A tailer follows one concrete path. The open handle is identified by
//! device+inode; when the path disappears or points at a different inode, the
//! old handle keeps being drained for a grace window of consecutive
//! end-of-file pulls before the tailer moves to the new file at offset 0.

pub mod file_id;
pub mod position;

use async_trait::async_trait;
use regex::Regex;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{FileInputConfig, StartPosition};
use crate::inputs::Input;
use file_id::FileId;
use position::PositionFile;

/// Consecutive end-of-file pulls a rotated-away handle is drained for before
/// it is closed. At the default 500 ms poll this is roughly ten seconds.
pub const GRACE_EOF_PULLS: u32 = 20;

struct OpenFile {
    file: File,
    id: FileId,
    pos: u64,
}

pub struct FileTailer {
    path: PathBuf,
    source_path: String,
    marker: Option<PositionFile>,
    start_position: StartPosition,
    skip: Vec<Regex>,
    grep: Vec<Regex>,
    open: Option<OpenFile>,
    last_pull_eof: bool,
    /// Remaining EOF pulls in the rotation grace window, when one is active.
    rotation: Option<u32>,
    /// The next open is a post-rotation open and starts at offset 0.
    reopen_at_start: bool,
    /// The grace window expired with the path missing while lines from the
    /// old handle were still being returned; the next pull reports closure.
    path_gone: bool,
}

impl FileTailer {
    pub fn new(config: &FileInputConfig, path: &Path, start_position: StartPosition) -> Self {
        let marker = config.save_position.then(|| {
            let marker_path = config
                .position_file
                .clone()
                .unwrap_or_else(|| default_marker_path(path));
            PositionFile::new(marker_path)
        });
        Self {
            path: path.to_path_buf(),
            source_path: path.to_string_lossy().into_owned(),
            marker,
            start_position,
            skip: config.skip.clone(),
            grep: config.grep.clone(),
            open: None,
            last_pull_eof: false,
            rotation: None,
            reopen_at_start: false,
            path_gone: false,
        }
    }

    fn check_rotation(&mut self) {
        let Some(open) = &mut self.open else { return };

        match fs::metadata(&self.path) {
            Ok(metadata) => {
                if FileId::from_metadata(&metadata) != open.id {
                    if self.rotation.is_none() {
                        debug!(path = self.source_path, "rotation detected, starting grace window");
                        self.rotation = Some(GRACE_EOF_PULLS);
                    }
                } else {
                    self.rotation = None;
                    if metadata.len() < open.pos {
                        warn!(path = self.source_path, "file truncated, restarting from offset 0");
                        open.pos = 0;
                    }
                }
            }
            Err(_) => {
                if self.rotation.is_none() {
                    debug!(path = self.source_path, "path gone, starting grace window");
                    self.rotation = Some(GRACE_EOF_PULLS);
                }
            }
        }
    }

    fn open_file(&mut self) -> bool {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = self.source_path, error = %e, "unable to open file");
                return false;
            }
        };
        let metadata = match file.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = self.source_path, error = %e, "unable to stat file");
                return false;
            }
        };
        let id = FileId::from_metadata(&metadata);
        let len = metadata.len();

        let pos = if self.reopen_at_start {
            0
        } else if let Some((inode, stored)) = self.marker.as_ref().and_then(|m| m.read()) {
            if inode == id.ino() && stored <= len {
                stored
            } else if inode == id.ino() {
                // marker beyond the file: it was truncated since
                0
            } else {
                self.configured_start(len)
            }
        } else {
            self.configured_start(len)
        };

        self.reopen_at_start = false;
        self.open = Some(OpenFile { file, id, pos });
        true
    }

    fn configured_start(&self, len: u64) -> u64 {
        match self.start_position {
            StartPosition::Begin => 0,
            StartPosition::End => len,
        }
    }

    /// One pull. See [`Input::pull`] for the contract.
    fn pull_lines(&mut self, max_lines: usize) -> Option<Vec<String>> {
        if self.path_gone {
            self.path_gone = false;
            if fs::metadata(&self.path).is_err() {
                return None;
            }
            // the path came back; open it like any post-rotation file
        }

        if self.last_pull_eof {
            self.check_rotation();
        }

        if self.open.is_none() && !self.open_file() {
            return Some(Vec::new());
        }

        // take the handle while reading so error paths can simply drop it
        let mut open = self.open.take().unwrap();
        let mut lines = Vec::new();
        let mut hit_eof = false;

        if let Err(e) = open.file.seek(SeekFrom::Start(open.pos)) {
            warn!(path = self.source_path, error = %e, "seek failed");
            return None;
        }
        {
            let mut reader = BufReader::new(&mut open.file);
            let mut buf = String::new();

            while lines.len() < max_lines {
                buf.clear();
                match reader.read_line(&mut buf) {
                    Ok(0) => {
                        hit_eof = true;
                        break;
                    }
                    Ok(n) => {
                        if !buf.ends_with('\n') {
                            // partial line still being written, leave it for
                            // the next pull
                            hit_eof = true;
                            break;
                        }
                        open.pos += n as u64;
                        let line = buf.trim_end_matches('\n').trim_end_matches('\r');
                        if line_survives(&self.skip, &self.grep, line) {
                            lines.push(line.to_string());
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        // skip one byte of invalid UTF-8 and continue
                        open.pos += 1;
                        if reader.seek(SeekFrom::Start(open.pos)).is_err() {
                            hit_eof = true;
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(path = self.source_path, error = %e, "read failed");
                        return None;
                    }
                }
            }
        }
        self.open = Some(open);

        self.last_pull_eof = hit_eof;

        if hit_eof {
            if let Some(remaining) = self.rotation.as_mut() {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    debug!(path = self.source_path, "grace window expired, closing old handle");
                    self.rotation = None;
                    self.open = None;
                    self.reopen_at_start = true;
                    if fs::metadata(&self.path).is_err() {
                        // path is gone for good, but lines drained from the
                        // old handle this pull still go out; the next pull
                        // signals closure
                        if lines.is_empty() {
                            return None;
                        }
                        self.path_gone = true;
                    }
                }
            }
        }

        if let (Some(marker), Some(open)) = (&self.marker, &self.open) {
            if let Err(e) = marker.write(open.id.ino(), open.pos) {
                warn!(marker = %marker.path().display(), error = %e, "unable to persist position");
            }
        }

        Some(lines)
    }
}

#[async_trait]
impl Input for FileTailer {
    async fn pull(&mut self, max_lines: usize) -> Option<Vec<String>> {
        self.pull_lines(max_lines)
    }

    fn source_path(&self) -> &str {
        &self.source_path
    }
}

fn default_marker_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".pos");
    PathBuf::from(os)
}

/// `skip` first: any match drops the line. Then `grep`: when non-empty, the
/// line survives only if some pattern matches.
fn line_survives(skip: &[Regex], grep: &[Regex], line: &str) -> bool {
    if skip.iter().any(|re| re.is_match(line)) {
        return false;
    }
    if !grep.is_empty() && !grep.iter().any(|re| re.is_match(line)) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputCommon;
    use std::io::Write;

    fn file_config(save_position: bool) -> FileInputConfig {
        FileInputConfig {
            common: InputCommon::default(),
            paths: Vec::new(),
            save_position,
            position_file: None,
            start_position: StartPosition::Begin,
            skip: Vec::new(),
            grep: Vec::new(),
        }
    }

    fn append(path: &Path, text: &str) {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f.flush().unwrap();
    }

    #[test]
    fn test_pull_from_beginning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "1\n2\n3\n");

        let mut tailer = FileTailer::new(&file_config(false), &path, StartPosition::Begin);
        assert_eq!(tailer.pull_lines(10).unwrap(), vec!["1", "2", "3"]);
        assert!(tailer.pull_lines(10).unwrap().is_empty());

        append(&path, "4\n");
        assert_eq!(tailer.pull_lines(10).unwrap(), vec!["4"]);
    }

    #[test]
    fn test_start_at_end_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "old\n");

        let mut tailer = FileTailer::new(&file_config(false), &path, StartPosition::End);
        assert!(tailer.pull_lines(10).unwrap().is_empty());

        append(&path, "new\n");
        assert_eq!(tailer.pull_lines(10).unwrap(), vec!["new"]);
    }

    #[test]
    fn test_line_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "1\n2\n3\n4\n5\n");

        let mut tailer = FileTailer::new(&file_config(false), &path, StartPosition::Begin);
        assert_eq!(tailer.pull_lines(2).unwrap(), vec!["1", "2"]);
        assert_eq!(tailer.pull_lines(2).unwrap(), vec!["3", "4"]);
        assert_eq!(tailer.pull_lines(2).unwrap(), vec!["5"]);
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "whole\npart");

        let mut tailer = FileTailer::new(&file_config(false), &path, StartPosition::Begin);
        assert_eq!(tailer.pull_lines(10).unwrap(), vec!["whole"]);

        append(&path, "ial\n");
        assert_eq!(tailer.pull_lines(10).unwrap(), vec!["partial"]);
    }

    #[test]
    fn test_rotation_picks_up_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "1\n2\n3\n");

        let mut tailer = FileTailer::new(&file_config(false), &path, StartPosition::Begin);
        assert_eq!(tailer.pull_lines(10).unwrap(), vec!["1", "2", "3"]);

        fs::rename(&path, dir.path().join("a.log.1")).unwrap();
        append(&path, "4\n5\n");

        let mut collected = Vec::new();
        for _ in 0..(GRACE_EOF_PULLS + 2) {
            collected.extend(tailer.pull_lines(10).unwrap());
        }
        assert_eq!(collected, vec!["4", "5"]);
    }

    #[test]
    fn test_rotation_drains_old_handle_during_grace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "1\n");

        let mut tailer = FileTailer::new(&file_config(false), &path, StartPosition::Begin);
        assert_eq!(tailer.pull_lines(10).unwrap(), vec!["1"]);

        let rotated = dir.path().join("a.log.1");
        fs::rename(&path, &rotated).unwrap();
        // the writer still appends to the renamed file for a moment
        append(&rotated, "late\n");
        append(&path, "new\n");

        let mut collected = Vec::new();
        for _ in 0..(GRACE_EOF_PULLS + 2) {
            collected.extend(tailer.pull_lines(10).unwrap());
        }
        assert_eq!(collected, vec!["late", "new"]);
    }

    #[test]
    fn test_truncation_resets_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "a long first line\nanother\n");

        let mut tailer = FileTailer::new(&file_config(false), &path, StartPosition::Begin);
        assert_eq!(tailer.pull_lines(10).unwrap().len(), 2);

        fs::write(&path, "x\n").unwrap();
        // first pull after truncation re-stats and resets
        let mut collected = Vec::new();
        for _ in 0..3 {
            collected.extend(tailer.pull_lines(10).unwrap());
        }
        assert_eq!(collected, vec!["x"]);
    }

    #[test]
    fn test_missing_file_returns_empty_then_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.log");

        let mut tailer = FileTailer::new(&file_config(false), &path, StartPosition::Begin);
        assert!(tailer.pull_lines(10).unwrap().is_empty());

        append(&path, "here\n");
        assert_eq!(tailer.pull_lines(10).unwrap(), vec!["here"]);
    }

    #[test]
    fn test_deleted_file_exhausts_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "1\n");

        let mut tailer = FileTailer::new(&file_config(false), &path, StartPosition::Begin);
        assert_eq!(tailer.pull_lines(10).unwrap(), vec!["1"]);

        fs::remove_file(&path).unwrap();
        let mut saw_none = false;
        for _ in 0..(GRACE_EOF_PULLS + 2) {
            if tailer.pull_lines(10).is_none() {
                saw_none = true;
                break;
            }
        }
        assert!(saw_none, "tailer should signal an unusable path");
    }

    #[test]
    fn test_grace_expiry_does_not_drop_final_drain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "1\n");

        let mut tailer = FileTailer::new(&file_config(false), &path, StartPosition::Begin);
        assert_eq!(tailer.pull_lines(10).unwrap(), vec!["1"]);

        // keep a writer to the inode, then unlink the path
        let mut writer = fs::OpenOptions::new().append(true).open(&path).unwrap();
        fs::remove_file(&path).unwrap();

        // spend all but the last pull of the grace window
        for _ in 0..(GRACE_EOF_PULLS - 1) {
            assert!(tailer.pull_lines(10).unwrap().is_empty());
        }

        // data landing just before the window closes still goes out
        writer.write_all(b"late\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(tailer.pull_lines(10).unwrap(), vec!["late"]);

        // closure is reported on the following pull
        assert!(tailer.pull_lines(10).is_none());
    }

    #[test]
    fn test_skip_then_grep() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "keep one\ndrop two\nkeep three\nunrelated\n");

        let mut config = file_config(false);
        config.skip = vec![Regex::new("two").unwrap()];
        config.grep = vec![Regex::new("^keep").unwrap()];

        let mut tailer = FileTailer::new(&config, &path, StartPosition::Begin);
        assert_eq!(
            tailer.pull_lines(10).unwrap(),
            vec!["keep one", "keep three"]
        );
    }

    #[test]
    fn test_skip_wins_over_grep() {
        // skip is applied first; grep cannot re-admit a skipped line
        assert!(!line_survives(
            &[Regex::new("x").unwrap()],
            &[Regex::new("x").unwrap()],
            "x marks the spot"
        ));
    }

    #[test]
    fn test_save_position_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "1\n2\n");

        let config = file_config(true);
        {
            let mut tailer = FileTailer::new(&config, &path, StartPosition::Begin);
            assert_eq!(tailer.pull_lines(10).unwrap(), vec!["1", "2"]);
        }

        let marker = PositionFile::new(default_marker_path(&path));
        let (inode, pos) = marker.read().expect("marker written");
        assert_eq!(inode, FileId::from_path(&path).unwrap().ino());
        assert_eq!(pos, 4);

        append(&path, "3\n");
        // a fresh tailer resumes from the marker, not from the start
        let mut tailer = FileTailer::new(&config, &path, StartPosition::Begin);
        assert_eq!(tailer.pull_lines(10).unwrap(), vec!["3"]);
    }

    #[test]
    fn test_stale_marker_inode_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "1\n2\n");

        let config = file_config(true);
        let marker = PositionFile::new(default_marker_path(&path));
        marker.write(999_999_999, 4).unwrap();

        let mut tailer = FileTailer::new(&config, &path, StartPosition::Begin);
        // inode mismatch falls back to the configured start position
        assert_eq!(tailer.pull_lines(10).unwrap(), vec!["1", "2"]);
    }
}
