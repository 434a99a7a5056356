//! Parse errors with precise line information.

use thiserror::Error;

/// Errors raised while parsing an agent file. Every variant names the line
/// (1-based) where the problem starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: unknown block kind '{kind}'")]
    UnknownKind { line: usize, kind: String },

    #[error("line {line}: malformed block header: {reason}")]
    MalformedHeader { line: usize, reason: String },

    #[error("line {line}: invalid parameter: {reason}")]
    InvalidParam { line: usize, reason: String },

    #[error("lines {start}-{end}: block '{kind}' is not terminated by '@end'")]
    Unterminated {
        start: usize,
        end: usize,
        kind: String,
    },

    #[error("line {line}: '@end' without an open block")]
    StrayEnd { line: usize },

    #[error("line {line}: content outside of a block")]
    ContentOutsideBlock { line: usize },

    #[error("line {line}: invalid output variable '{name}'")]
    InvalidOutputVar { line: usize, name: String },
}
