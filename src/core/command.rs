//! Text command frames: `<correlation-id>::<keyword>::<arg>...`

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use super::error::{DecodeError, SyntaxError};

/// Field separator shared by command and response frames.
pub const DELIMITER: &str = "::";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Len,
    Push,
    Pop,
    Drain,
    Consume,
    Stop,
}

impl Keyword {
    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Len => "len",
            Keyword::Push => "push",
            Keyword::Pop => "pop",
            Keyword::Drain => "drain",
            Keyword::Consume => "consume",
            Keyword::Stop => "stop",
        }
    }

    /// Number of arguments the keyword must carry.
    pub fn arity(self) -> usize {
        match self {
            Keyword::Push => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Keyword {
    type Err = SyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "len" => Ok(Keyword::Len),
            "push" => Ok(Keyword::Push),
            "pop" => Ok(Keyword::Pop),
            "drain" => Ok(Keyword::Drain),
            "consume" => Ok(Keyword::Consume),
            "stop" => Ok(Keyword::Stop),
            _ => Err(SyntaxError::UnknownKeyword),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: String,
    pub keyword: Keyword,
    pub args: Vec<String>,
}

impl Command {
    /// Builds a command under a freshly generated correlation id.
    pub fn build(keyword: Keyword, args: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            keyword,
            args,
        }
    }

    /// Builds a command reusing an existing correlation id (used to stop a
    /// consumer registered under that id).
    pub fn with_id(id: impl Into<String>, keyword: Keyword) -> Self {
        Self {
            id: id.into(),
            keyword,
            args: Vec::new(),
        }
    }

    /// Decodes a single frame.
    ///
    /// Fewer than two segments, an unknown keyword and an arity mismatch are
    /// all reported as [`SyntaxError`]s; the returned [`DecodeError`] keeps the
    /// first segment as the best-effort id.
    pub fn parse(input: &str) -> Result<Self, DecodeError> {
        let mut parts = input.split(DELIMITER);
        let id = parts.next().unwrap_or_default().to_string();

        let Some(raw_keyword) = parts.next() else {
            return Err(DecodeError::new(id, SyntaxError::Malformed));
        };

        let keyword: Keyword = raw_keyword
            .parse()
            .map_err(|kind| DecodeError::new(id.clone(), kind))?;

        let args: Vec<String> = parts.map(str::to_string).collect();

        if args.len() != keyword.arity() {
            let kind = if keyword.arity() == 0 {
                SyntaxError::UnexpectedArgs(keyword)
            } else {
                SyntaxError::WrongArgCount(keyword)
            };
            return Err(DecodeError::new(id, kind));
        }

        Ok(Self { id, keyword, args })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{DELIMITER}{}", self.id, self.keyword)?;
        for arg in &self.args {
            write!(f, "{DELIMITER}{arg}")?;
        }
        Ok(())
    }
}
