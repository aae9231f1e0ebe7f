// SPDX-License-Identifier: Apache-2.0

//! Filesystem watcher abstractions.
//!
//! Two backends satisfy the [`FileWatcher`] capability:
//! - **Native**: OS-level notifications (inotify on Linux, FSEvents on
//!   macOS, ReadDirectoryChangesW on Windows), debounced.
//! - **Poll**: periodic directory scans, for network filesystems or when
//!   native watching misbehaves.
//!
//! `Auto` mode tries native first and falls back to polling.

mod event;
mod native;
mod poll;

pub use event::{FileWatcher, PathEvent, PathEventKind, WatcherError};
pub use native::NativeWatcher;
pub use poll::PollWatcher;

use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WatchMode {
    /// Native first, poll on failure.
    #[default]
    Auto,
    /// Native only; fails where OS notification is unsupported.
    Native,
    /// Poll only.
    Poll,
}

impl std::str::FromStr for WatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(WatchMode::Auto),
            "native" => Ok(WatchMode::Native),
            "poll" | "polling" => Ok(WatchMode::Poll),
            _ => Err(format!(
                "invalid watch mode '{}'. valid options: auto, native, poll",
                s
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub mode: WatchMode,
    /// Scan interval for the poll backend.
    pub poll_interval: Duration,
    /// Debounce window for the native backend.
    pub debounce_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Auto,
            poll_interval: Duration::from_millis(250),
            debounce_interval: Duration::from_millis(100),
        }
    }
}

pub fn create_watcher(config: &WatcherConfig) -> Result<Box<dyn FileWatcher + Send>, WatcherError> {
    match config.mode {
        WatchMode::Native => {
            let watcher = NativeWatcher::new(config.debounce_interval)?;
            Ok(Box::new(watcher))
        }
        WatchMode::Poll => Ok(Box::new(PollWatcher::new(config.poll_interval))),
        WatchMode::Auto => match NativeWatcher::new(config.debounce_interval) {
            Ok(watcher) => {
                tracing::info!("using native filesystem watcher");
                Ok(Box::new(watcher))
            }
            Err(e) => {
                tracing::warn!("native file watching unavailable ({}), falling back to polling", e);
                Ok(Box::new(PollWatcher::new(config.poll_interval)))
            }
        },
    }
}
