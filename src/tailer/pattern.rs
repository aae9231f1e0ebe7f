// SPDX-License-Identifier: Apache-2.0

use glob::Pattern;
use std::path::{Path, PathBuf};

use super::{Error, Result};

/// A registered log glob.
///
/// Holds the raw pattern string and its compiled matcher. Patterns are
/// re-expanded against the filesystem on every tailer wakeup so files that
/// appear after registration are discovered.
#[derive(Debug, Clone)]
pub struct LogPattern {
    raw: String,
    matcher: Pattern,
}

impl LogPattern {
    /// Compile a glob pattern, failing up front on malformed syntax.
    pub fn new(raw: &str) -> Result<Self> {
        let matcher = Pattern::new(raw)
            .map_err(|e| Error::InvalidGlob(format!("invalid pattern '{}': {}", raw, e)))?;

        Ok(Self {
            raw: raw.to_string(),
            matcher,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.matcher.matches_path(path)
    }

    /// Expand against the filesystem, returning currently matching files.
    /// Directories are skipped.
    pub fn expand(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();

        let matches = glob::glob(&self.raw).map_err(|e| Error::InvalidGlob(e.to_string()))?;
        for entry in matches {
            let path = entry.map_err(|e| Error::Io(e.into_error()))?;
            if path.is_dir() {
                continue;
            }
            paths.push(path);
        }

        Ok(paths)
    }

    /// The longest prefix of the pattern containing no glob metacharacters.
    /// This is the directory that must be watched for the pattern's matches
    /// to generate events.
    pub fn base_dir(&self) -> PathBuf {
        let pattern_path = Path::new(&self.raw);
        let mut dir = PathBuf::new();

        for component in pattern_path.components() {
            let comp = component.as_os_str().to_string_lossy();
            if comp.contains('*') || comp.contains('?') || comp.contains('[') {
                break;
            }
            dir.push(component);
        }

        // the last non-wild component may be a filename (e.g. /d/log*
        // keeps "/d", but /d/log keeps "/d/log"); watch its parent
        if !dir.is_dir() {
            if let Some(parent) = dir.parent() {
                return parent.to_path_buf();
            }
        }

        if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir
        }
    }
}
