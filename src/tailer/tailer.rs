// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bounded_channel::BoundedSender;
use crate::metrics::Cell;
use crate::watcher::{FileWatcher, PathEvent, PathEventKind};

use super::{FileId, LogHandle, LogLine, LogPattern, Result, SeekTo};

const DEFAULT_EVENT_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// Interval for the full re-read pass over every tracked path; zero
    /// disables the pass and relies on watcher events alone.
    pub poll_interval: Duration,
    /// Read files discovered at registration from offset 0 instead of
    /// seeking to the end; set in one-shot mode.
    pub read_from_start: bool,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::ZERO,
            read_from_start: false,
        }
    }
}

/// Cells for the engine's own metrics, owned by the store and shared with
/// the exposition endpoint.
#[derive(Clone)]
pub struct TailerStats {
    /// Number of files currently being tailed.
    pub log_count: Arc<Cell>,
    /// Total lines emitted.
    pub line_count: Arc<Cell>,
}

impl TailerStats {
    pub fn new(log_count: Arc<Cell>, line_count: Arc<Cell>) -> Self {
        Self {
            log_count,
            line_count,
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            log_count: Arc::new(Cell::new_number()),
            line_count: Arc::new(Cell::new_number()),
        }
    }
}

/// Tracks a set of open log handles and turns filesystem events into
/// [`LogLine`]s on the line channel.
///
/// Runs on a dedicated OS thread: reads are blocking, and a full line
/// channel blocks right here, which is the backpressure contract. Per-file
/// ordering is a consequence of the single thread plus the FIFO channel.
pub struct Tailer {
    config: TailerConfig,
    watcher: Box<dyn FileWatcher + Send>,
    patterns: Vec<LogPattern>,
    handles: HashMap<PathBuf, LogHandle>,
    /// Paths we could not open (permission denied) or that disappeared
    /// while still matching a pattern; re-attempted when they show up.
    retry_pending: HashSet<PathBuf>,
    watched_dirs: Vec<PathBuf>,
    lines_tx: BoundedSender<LogLine>,
    stats: TailerStats,
    last_poll: Instant,
}

/// Read a handle to EOF, pushing each framed line onto the channel.
/// Errors are logged and left for the next event; a send failure means the
/// dispatcher is gone and the lines have nowhere to go anyway.
fn read_handle(handle: &mut LogHandle, tx: &BoundedSender<LogLine>, stats: &TailerStats) -> u64 {
    let mut sent = 0u64;
    let result = handle.read_lines(&mut |line| {
        if tx.send_blocking(line).is_ok() {
            sent += 1;
        }
    });

    if let Err(e) = result {
        warn!(
            path = %handle.path().display(),
            "read error, retrying on next event: {}", e
        );
    }

    if sent > 0 {
        stats.line_count.inc(sent as f64);
    }
    sent
}

impl Tailer {
    pub fn new(
        config: TailerConfig,
        watcher: Box<dyn FileWatcher + Send>,
        lines_tx: BoundedSender<LogLine>,
        stats: TailerStats,
    ) -> Self {
        Self {
            config,
            watcher,
            patterns: Vec::new(),
            handles: HashMap::new(),
            retry_pending: HashSet::new(),
            watched_dirs: Vec::new(),
            lines_tx,
            stats,
            last_poll: Instant::now(),
        }
    }

    /// Register a glob: watch its base directory, tail every current
    /// match, and keep the pattern for discovering future matches.
    pub fn tail_pattern(&mut self, raw: &str) -> Result<()> {
        let pattern = LogPattern::new(raw)?;

        self.watch_dir(&pattern.base_dir());

        let matches = pattern.expand()?;
        self.patterns.push(pattern);

        let seek = self.initial_seek();
        for path in matches {
            self.open_path(&path, seek);
        }

        Ok(())
    }

    /// Tail one explicit path, attaching at the end of the file.
    pub fn tail_path(&mut self, path: &Path) {
        if let Some(parent) = path.parent() {
            self.watch_dir(&parent.to_path_buf());
        }
        self.open_path(path, self.initial_seek());
    }

    fn initial_seek(&self) -> SeekTo {
        if self.config.read_from_start {
            SeekTo::Start
        } else {
            SeekTo::End
        }
    }

    fn watch_dir(&mut self, dir: &PathBuf) {
        if self.watched_dirs.contains(dir) {
            return;
        }
        match self.watcher.watch(dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), "watching directory");
                self.watched_dirs.push(dir.clone());
            }
            Err(e) => warn!(dir = %dir.display(), "failed to watch directory: {}", e),
        }
    }

    fn path_matches(&self, path: &Path) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }

    /// Open a path and start tailing it. Already-tailed paths are left
    /// alone; permission failures park the path for retry.
    fn open_path(&mut self, path: &Path, seek: SeekTo) {
        if self.handles.contains_key(path) {
            return;
        }

        match LogHandle::open(path, seek) {
            Ok(mut handle) => {
                self.retry_pending.remove(path);
                // catch writes that raced the open
                read_handle(&mut handle, &self.lines_tx, &self.stats);
                info!(path = %path.display(), file_id = %handle.file_id(), "now tailing");
                self.handles.insert(path.to_path_buf(), handle);
                self.stats.log_count.set(self.handles.len() as f64);
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                if self.retry_pending.insert(path.to_path_buf()) {
                    warn!(path = %path.display(), "permission denied, will retry: {}", e);
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "file vanished before open");
            }
            Err(e) => {
                warn!(path = %path.display(), "open failed, will retry: {}", e);
            }
        }
    }

    /// Re-read a tracked path. A differing on-disk inode means the path
    /// was rotated: drain the old inode through its still-open handle,
    /// then reopen the path from the start.
    fn update_tracked(&mut self, path: &Path) {
        let rotated = match (self.handles.get(path), FileId::from_path(path)) {
            (Some(handle), Ok(disk_id)) => disk_id != handle.file_id(),
            _ => false,
        };

        if rotated {
            if let Some(mut old) = self.handles.remove(path) {
                debug!(path = %path.display(), "rotation detected, draining old inode");
                read_handle(&mut old, &self.lines_tx, &self.stats);
            }
            self.stats.log_count.set(self.handles.len() as f64);
            self.open_path(path, SeekTo::Start);
        } else if let Some(handle) = self.handles.get_mut(path) {
            read_handle(handle, &self.lines_tx, &self.stats);
        }
    }

    fn handle_event(&mut self, event: PathEvent) {
        match event.kind {
            PathEventKind::Create | PathEventKind::Update => {
                if self.handles.contains_key(&event.path) {
                    self.update_tracked(&event.path);
                } else if self.retry_pending.contains(&event.path)
                    || self.path_matches(&event.path)
                {
                    // new matching file: its whole content is new to us
                    self.open_path(&event.path, SeekTo::Start);
                }
            }
            PathEventKind::Remove => self.handle_remove(&event.path),
            PathEventKind::Rename => {
                self.drain_and_close(&event.path);
            }
            PathEventKind::Other => {}
        }
    }

    fn handle_remove(&mut self, path: &Path) {
        if self.drain_and_close(path) && self.path_matches(path) {
            // a matching path may come back (log roller re-creates it)
            self.retry_pending.insert(path.to_path_buf());
        }
    }

    /// Drain whatever the open descriptor still holds, then drop the
    /// handle. Returns whether a handle existed.
    fn drain_and_close(&mut self, path: &Path) -> bool {
        match self.handles.remove(path) {
            Some(mut handle) => {
                read_handle(&mut handle, &self.lines_tx, &self.stats);
                self.stats.log_count.set(self.handles.len() as f64);
                info!(path = %path.display(), "stopped tailing");
                true
            }
            None => false,
        }
    }

    /// Expand every registered pattern and start tailing new matches.
    /// Paths parked for permission retry are skipped here; they are only
    /// re-attempted from events or the poll pass, where the failure mode
    /// is logged once.
    fn expand_patterns(&mut self) {
        let mut discovered = Vec::new();
        for pattern in &self.patterns {
            match pattern.expand() {
                Ok(paths) => discovered.extend(paths),
                Err(e) => debug!(pattern = pattern.as_str(), "expansion failed: {}", e),
            }
        }

        for path in discovered {
            if !self.handles.contains_key(&path) && !self.retry_pending.contains(&path) {
                self.open_path(&path, SeekTo::Start);
            }
        }
    }

    /// Full pass: rescan every pattern, re-read every tracked path, and
    /// retry parked opens. Used on the poll tick and whenever the watcher
    /// may have dropped events.
    fn poll_all(&mut self) {
        self.expand_patterns();

        let tracked: Vec<PathBuf> = self.handles.keys().cloned().collect();
        for path in tracked {
            self.update_tracked(&path);
        }

        let pending: Vec<PathBuf> = self.retry_pending.iter().cloned().collect();
        for path in pending {
            if path.exists() {
                self.open_path(&path, SeekTo::Start);
            }
        }
    }

    /// One scheduler turn: wait for events, apply them, run the poll pass
    /// if due.
    fn step(&mut self, wait: Duration) {
        match self.watcher.recv_timeout(wait) {
            Ok(events) => {
                for event in events {
                    self.handle_event(event);
                }
                self.expand_patterns();
            }
            Err(e) => {
                // watcher trouble may mean lost events: rescan everything
                warn!("watcher error, rescanning all patterns: {}", e);
                self.poll_all();
                std::thread::sleep(Duration::from_millis(100));
            }
        }

        if self.config.poll_interval > Duration::ZERO
            && self.last_poll.elapsed() >= self.config.poll_interval
        {
            self.poll_all();
            self.last_poll = Instant::now();
        }
    }

    /// Event loop; returns after `cancel`, having drained every handle.
    /// Dropping the tailer drops its channel sender, which closes the
    /// line channel once the agent's other senders are gone.
    pub fn run(mut self, cancel: CancellationToken) {
        let wait = if self.config.poll_interval > Duration::ZERO {
            self.config.poll_interval
        } else {
            DEFAULT_EVENT_WAIT
        };

        while !cancel.is_cancelled() {
            self.step(wait);
        }

        self.close();
        info!("tailer stopped");
    }

    /// Single pass for one-shot mode: read every matched file to EOF and
    /// shut down.
    pub fn run_once(mut self) {
        self.poll_all();
        self.close();
    }

    /// Final read pass over all handles, then release them. Idempotent.
    pub fn close(&mut self) {
        let tracked: Vec<PathBuf> = self.handles.keys().cloned().collect();
        for path in tracked {
            if let Some(handle) = self.handles.get_mut(&path) {
                read_handle(handle, &self.lines_tx, &self.stats);
            }
        }
        self.handles.clear();
        self.retry_pending.clear();
        self.stats.log_count.set(0.0);
    }
}
