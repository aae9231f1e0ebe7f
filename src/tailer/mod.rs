// SPDX-License-Identifier: Apache-2.0

//! Log file tailing.
//!
//! The tailer tracks a set of open log handles discovered through glob
//! patterns, reads appended bytes as watcher events arrive, frames them
//! into lines, and pushes [`LogLine`]s onto a bounded channel. It runs on
//! a dedicated OS thread so blocking reads and channel backpressure never
//! touch the async runtime.

mod file_id;
mod handle;
mod pattern;
#[allow(clippy::module_inception)]
mod tailer;

pub use file_id::FileId;
pub use handle::{LogHandle, SeekTo};
pub use pattern::LogPattern;
pub use tailer::{Tailer, TailerConfig, TailerStats};

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// One complete line observed on a tailed file. `text` carries no
/// terminating newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub path: Arc<PathBuf>,
    pub text: String,
}

impl LogLine {
    pub fn new(path: Arc<PathBuf>, text: String) -> Self {
        Self { path, text }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("watcher error: {0}")]
    Watcher(#[from] crate::watcher::WatcherError),
}

pub type Result<T> = std::result::Result<T, Error>;
