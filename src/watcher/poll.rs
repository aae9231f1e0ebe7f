// SPDX-License-Identifier: Apache-2.0

//! Polling watcher for filesystems where native notifications are
//! unavailable or unreliable (NFS and friends). Scans watched directories
//! on an interval and diffs size + mtime against the last scan.
//!
//! Unlike the native backend this one reports precise event kinds, which
//! also makes it the backend of choice for deterministic tests.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use super::event::{FileWatcher, PathEvent, WatcherError};

#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryState {
    modified: Option<SystemTime>,
    size: u64,
}

impl EntryState {
    fn from_metadata(metadata: &fs::Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            size: metadata.len(),
        }
    }
}

pub struct PollWatcher {
    watched_dirs: Vec<PathBuf>,
    entry_states: HashMap<PathBuf, EntryState>,
    poll_interval: Duration,
    last_scan: Option<Instant>,
    pending: Vec<PathEvent>,
}

impl PollWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            watched_dirs: Vec::new(),
            entry_states: HashMap::new(),
            poll_interval,
            last_scan: None,
            pending: Vec::new(),
        }
    }

    fn scan_due(&self) -> bool {
        match self.last_scan {
            None => true,
            Some(at) => at.elapsed() >= self.poll_interval,
        }
    }

    /// Diff every watched directory against the previous scan, queueing
    /// Create/Update/Remove events for the changes.
    fn scan_all(&mut self) {
        let mut seen: HashSet<PathBuf> = HashSet::with_capacity(self.entry_states.len());

        for i in 0..self.watched_dirs.len() {
            let dir = self.watched_dirs[i].clone();
            if let Err(e) = self.scan_directory(&dir, &mut seen) {
                tracing::debug!("error scanning directory {:?}: {}", dir, e);
            }
        }

        // anything we knew about but did not see was removed
        let mut removed = Vec::new();
        self.entry_states.retain(|path, _| {
            if seen.contains(path) {
                true
            } else {
                removed.push(PathEvent::remove(path.clone()));
                false
            }
        });
        self.pending.extend(removed);

        self.last_scan = Some(Instant::now());
    }

    fn baseline_directory(&mut self, dir: &Path) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_file() {
                    self.entry_states
                        .insert(entry.path(), EntryState::from_metadata(&metadata));
                }
            }
        }
        Ok(())
    }

    fn scan_directory(&mut self, dir: &Path, seen: &mut HashSet<PathBuf>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };

            let state = EntryState::from_metadata(&metadata);
            seen.insert(path.clone());

            match self.entry_states.get(&path) {
                None => {
                    self.pending.push(PathEvent::create(path.clone()));
                    self.entry_states.insert(path, state);
                }
                Some(prev) if *prev != state => {
                    self.pending.push(PathEvent::update(path.clone()));
                    self.entry_states.insert(path, state);
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

impl FileWatcher for PollWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatcherError> {
        let path = path.to_path_buf();
        if !self.watched_dirs.contains(&path) {
            // baseline the directory silently: files that already exist
            // at watch time are not changes, matching native semantics
            if let Err(e) = self.baseline_directory(&path) {
                tracing::debug!("error reading directory {:?}: {}", path, e);
            }
            self.watched_dirs.push(path);
        }
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.watched_dirs.retain(|p| p != path);
        self.entry_states.retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Vec<PathEvent>, WatcherError> {
        if self.scan_due() {
            self.scan_all();
        }
        Ok(std::mem::take(&mut self.pending))
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<PathEvent>, WatcherError> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.scan_due() {
                self.scan_all();
            }

            if !self.pending.is_empty() {
                return Ok(std::mem::take(&mut self.pending));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let until_due = self
                .last_scan
                .map(|at| self.poll_interval.saturating_sub(at.elapsed()))
                .unwrap_or(Duration::ZERO);
            std::thread::sleep(until_due.min(deadline - now).min(Duration::from_millis(20)));
        }
    }

    fn is_native(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "poll"
    }
}
