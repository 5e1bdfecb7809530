use std::fmt;

use thiserror::Error;

use super::command::Keyword;

/// Errors raised by the queue engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    Empty,
}

impl std::error::Error for QueueError {}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Empty => write!(f, "queue is empty"),
        }
    }
}

/// Why a frame could not be turned into a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxError {
    #[error("invalid syntax")]
    Malformed,

    #[error("invalid syntax: unknown keyword")]
    UnknownKeyword,

    #[error("invalid syntax: {0} takes no args")]
    UnexpectedArgs(Keyword),

    #[error("invalid syntax: {0} requires exactly one arg")]
    WrongArgCount(Keyword),

    #[error("invalid syntax: frame exceeds {0} bytes")]
    FrameTooLarge(usize),
}

/// A failed decode, carrying the best-effort correlation id of the frame so
/// the error can still be addressed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}")]
pub struct DecodeError {
    pub id: String,
    pub kind: SyntaxError,
}

impl DecodeError {
    pub fn new(id: impl Into<String>, kind: SyntaxError) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}
