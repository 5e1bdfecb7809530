//! Response frames: `<id>::<message>` or `<id>::error::<error text>`.

use std::fmt;

use super::command::DELIMITER;

/// Message returned for a pop against an empty queue.
pub const NIL: &str = "nil";

/// Message acknowledging push, drain and the start of a consume stream.
pub const OK: &str = "ok";

const ERROR_MARKER: &str = "error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Message(String),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: String,
    pub outcome: Outcome,
}

impl Response {
    pub fn message(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Message(msg.into()),
        }
    }

    pub fn error(id: impl Into<String>, err: impl fmt::Display) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Error(err.to_string()),
        }
    }

    /// The success payload, if this is not an error response.
    pub fn as_message(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Message(m) => Some(m),
            Outcome::Error(_) => None,
        }
    }

    pub fn as_error(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Error(e) => Some(e),
            Outcome::Message(_) => None,
        }
    }

    /// Decodes a response frame. Returns `None` when the frame has no
    /// delimiter at all.
    pub fn parse(frame: &str) -> Option<Self> {
        let (id, rest) = frame.split_once(DELIMITER)?;
        let outcome = match rest.split_once(DELIMITER) {
            Some((ERROR_MARKER, err)) => Outcome::Error(err.to_string()),
            _ => Outcome::Message(rest.to_string()),
        };
        Some(Self {
            id: id.to_string(),
            outcome,
        })
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Message(m) => write!(f, "{}{DELIMITER}{m}", self.id),
            Outcome::Error(e) => write!(f, "{}{DELIMITER}{ERROR_MARKER}{DELIMITER}{e}", self.id),
        }
    }
}
