use thiserror::Error;
use tokio_util::codec::LinesCodecError;

use crate::core::Keyword;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid client config: {0}")]
    InvalidConfig(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("send timeout")]
    Timeout,

    #[error("queue is empty")]
    QueueEmpty,

    #[error("failed to {op}: {reason}")]
    Failed { op: Keyword, reason: String },

    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("client is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] LinesCodecError),
}
