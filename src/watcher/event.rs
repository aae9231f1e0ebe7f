// SPDX-License-Identifier: Apache-2.0

//! Event and error types shared by the watcher backends.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("watcher initialization failed: {0}")]
    Init(String),

    #[error("watch failed: {0}")]
    Watch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),
}

/// Kind of filesystem change observed on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEventKind {
    /// Path appeared.
    Create,
    /// Path contents changed.
    Update,
    /// Path disappeared.
    Remove,
    /// Path was renamed away; the event carries the source path.
    Rename,
    /// Anything else the backend reports.
    Other,
}

/// A filesystem change on a single path.
///
/// Native backends cannot always distinguish Create from Update (debounced
/// notifications collapse them), so consumers must treat an Update on an
/// unknown path as a Create. The poll backend reports precise kinds.
#[derive(Debug, Clone)]
pub struct PathEvent {
    pub kind: PathEventKind,
    pub path: PathBuf,
}

impl PathEvent {
    pub fn new(kind: PathEventKind, path: PathBuf) -> Self {
        Self { kind, path }
    }

    pub fn create(path: PathBuf) -> Self {
        Self::new(PathEventKind::Create, path)
    }

    pub fn update(path: PathBuf) -> Self {
        Self::new(PathEventKind::Update, path)
    }

    pub fn remove(path: PathBuf) -> Self {
        Self::new(PathEventKind::Remove, path)
    }
}

/// Capability over OS file-change notification.
///
/// `watch` registers a directory (watching a directory covers the files
/// within it); events are pulled in batches. A polling implementation
/// satisfies the same capability with degraded latency.
pub trait FileWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatcherError>;

    fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError>;

    /// Return any pending events without blocking.
    fn try_recv(&mut self) -> Result<Vec<PathEvent>, WatcherError>;

    /// Block until events arrive or the timeout expires; an empty vector
    /// means the timeout passed quietly.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<PathEvent>, WatcherError>;

    /// True for OS-notification backends, false for polling.
    fn is_native(&self) -> bool;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}
