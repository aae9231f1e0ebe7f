// SPDX-License-Identifier: Apache-2.0

//! Native filesystem watcher using the `notify` crate with debouncing.
//!
//! Uses OS-level notifications (inotify on Linux, FSEvents on macOS,
//! ReadDirectoryChangesW on Windows). Rapid writes to a busy log file are
//! coalesced by notify-debouncer-mini into periodic batches, so a hot log
//! produces a handful of events per debounce window instead of one per
//! write.

use std::path::Path;
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::Mutex;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};

use super::event::{FileWatcher, PathEvent, PathEventKind, WatcherError};

pub struct NativeWatcher {
    debouncer: Debouncer<notify::RecommendedWatcher>,
    receiver: Mutex<Receiver<Result<Vec<DebouncedEvent>, notify::Error>>>,
}

impl NativeWatcher {
    pub fn new(debounce: Duration) -> Result<Self, WatcherError> {
        let (tx, rx) = channel();

        let debouncer = new_debouncer(debounce, move |res| {
            let _ = tx.send(res);
        })
        .map_err(|e| WatcherError::Init(e.to_string()))?;

        Ok(Self {
            debouncer,
            receiver: Mutex::new(rx),
        })
    }

    /// Debounced notifications do not say what changed, only that the path
    /// changed. Resolve the kind from the path's current existence: a path
    /// that is gone was removed, anything else is an update. The tailer
    /// promotes updates on unknown matching paths to creates.
    fn convert_event(event: DebouncedEvent) -> PathEvent {
        let kind = if event.path.exists() {
            PathEventKind::Update
        } else {
            PathEventKind::Remove
        };

        PathEvent::new(kind, event.path)
    }

    fn convert_events(events: Vec<DebouncedEvent>) -> Vec<PathEvent> {
        events.into_iter().map(Self::convert_event).collect()
    }
}

impl FileWatcher for NativeWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.debouncer
            .watcher()
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::Watch(e.to_string()))
    }

    fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.debouncer
            .watcher()
            .unwatch(path)
            .map_err(|e| WatcherError::Watch(e.to_string()))
    }

    fn try_recv(&mut self) -> Result<Vec<PathEvent>, WatcherError> {
        let mut all_events = Vec::new();

        let receiver = self
            .receiver
            .lock()
            .map_err(|e| WatcherError::Channel(format!("mutex poisoned: {}", e)))?;

        loop {
            match receiver.try_recv() {
                Ok(Ok(events)) => {
                    all_events.extend(Self::convert_events(events));
                }
                Ok(Err(e)) => {
                    tracing::warn!("file watcher error: {}", e);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(WatcherError::Channel("watcher channel disconnected".into()));
                }
            }
        }

        Ok(all_events)
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<PathEvent>, WatcherError> {
        let mut all_events = Vec::new();

        let receiver = self
            .receiver
            .lock()
            .map_err(|e| WatcherError::Channel(format!("mutex poisoned: {}", e)))?;

        match receiver.recv_timeout(timeout) {
            Ok(Ok(events)) => {
                all_events.extend(Self::convert_events(events));
            }
            Ok(Err(e)) => {
                tracing::warn!("file watcher error: {}", e);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                return Ok(all_events);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                return Err(WatcherError::Channel("watcher channel disconnected".into()));
            }
        }

        drop(receiver);

        // drain any further batches that queued behind the first
        all_events.extend(self.try_recv()?);

        Ok(all_events)
    }

    fn is_native(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        #[cfg(target_os = "linux")]
        {
            "inotify"
        }
        #[cfg(target_os = "macos")]
        {
            "FSEvents"
        }
        #[cfg(target_os = "windows")]
        {
            "ReadDirectoryChangesW"
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            "native"
        }
    }
}
