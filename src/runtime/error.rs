// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use thiserror::Error;

/// A position in program source, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
}

impl Pos {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Errors surfaced while turning program source into bytecode. Every
/// variant carries the source position for diagnostics; the loader
/// reports these and keeps the previous program version running.
#[derive(Error, Debug, PartialEq)]
pub enum CompileError {
    #[error("{pos}: unexpected character '{ch}'")]
    UnexpectedChar { ch: char, pos: Pos },

    #[error("{pos}: unterminated string literal")]
    UnterminatedString { pos: Pos },

    #[error("{pos}: unterminated regex literal")]
    UnterminatedRegex { pos: Pos },

    #[error("{pos}: unterminated block comment")]
    UnterminatedComment { pos: Pos },

    #[error("{pos}: invalid number literal '{text}'")]
    InvalidNumber { text: String, pos: Pos },

    #[error("{pos}: {message}")]
    Syntax { message: String, pos: Pos },

    #[error("{pos}: invalid regex: {message}")]
    BadRegex { message: String, pos: Pos },

    #[error("{pos}: unknown metric '{name}'")]
    UnknownMetric { name: String, pos: Pos },

    #[error("{pos}: metric '{name}' declared twice")]
    Redeclared { name: String, pos: Pos },

    #[error("{pos}: metric '{name}' is declared with {want} label keys, indexed with {got}")]
    ArityMismatch {
        name: String,
        want: usize,
        got: usize,
        pos: Pos,
    },

    #[error("{pos}: {message}")]
    InvalidBuckets { message: String, pos: Pos },

    #[error("{pos}: unknown capture group '{name}'")]
    UnknownCapture { name: String, pos: Pos },

    #[error("{pos}: capture group {index} exceeds the pattern's group count")]
    CaptureOutOfRange { index: u32, pos: Pos },

    #[error("{pos}: capture reference outside a pattern block")]
    CaptureOutsidePattern { pos: Pos },

    #[error("{pos}: unknown function '{name}'")]
    UnknownFunction { name: String, pos: Pos },

    #[error("{pos}: function '{name}' takes {want} arguments, got {got}")]
    FunctionArity {
        name: String,
        want: usize,
        got: usize,
        pos: Pos,
    },

    #[error("{pos}: {message}")]
    InvalidOperation { message: String, pos: Pos },
}
