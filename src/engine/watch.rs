// SPDX-License-Identifier: Apache-2.0

//! Glob watching for file inputs. A configured path enrolls a watch iff it
//! contains a `*`, regardless of how many files it matches at load time.
//! Rescans run on the watch interval and report paths not already bound to
//! this worker; discovered files start at the beginning and are retired when
//! they stop being readable.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::config::FileInputConfig;

struct WatchedGlob {
    pattern: String,
    config: FileInputConfig,
}

pub struct GlobWatcher {
    watches: Vec<WatchedGlob>,
    bound: HashSet<PathBuf>,
    interval: Duration,
    next_scan: Instant,
}

impl GlobWatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            watches: Vec::new(),
            bound: HashSet::new(),
            interval,
            next_scan: Instant::now(),
        }
    }

    /// Whether `path` should be watched rather than bound directly.
    pub fn is_glob(path: &str) -> bool {
        path.contains('*')
    }

    pub fn add_watch(&mut self, pattern: &str, config: &FileInputConfig) {
        self.watches.push(WatchedGlob {
            pattern: pattern.to_string(),
            config: config.clone(),
        });
    }

    /// Record a path bound at load time so rescans do not re-discover it.
    pub fn bind(&mut self, path: impl Into<PathBuf>) {
        self.bound.insert(path.into());
    }

    pub fn has_watches(&self) -> bool {
        !self.watches.is_empty()
    }

    /// Rescan every watched glob when the interval has elapsed. Returns the
    /// newly discovered paths with the file-input config they inherit.
    pub fn scan_due(&mut self, now: Instant) -> Vec<(PathBuf, FileInputConfig)> {
        if self.watches.is_empty() || now < self.next_scan {
            return Vec::new();
        }
        self.next_scan = now + self.interval;

        let mut discovered = Vec::new();
        for watch in &self.watches {
            let paths = match glob::glob(&watch.pattern) {
                Ok(paths) => paths,
                Err(e) => {
                    warn!(pattern = watch.pattern, error = %e, "bad glob pattern");
                    continue;
                }
            };
            for entry in paths {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        warn!(pattern = watch.pattern, error = %e, "glob entry unreadable");
                        continue;
                    }
                };
                if path.is_dir() {
                    continue;
                }
                if self.bound.insert(path.clone()) {
                    discovered.push((path, watch.config.clone()));
                }
            }
        }
        discovered
    }
}
