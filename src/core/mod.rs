pub mod codec;
pub mod command;
pub mod error;
pub mod queue;
pub mod response;

pub use codec::{Frame, FrameCodec};
pub use command::{Command, Keyword, DELIMITER};
pub use error::{DecodeError, QueueError, SyntaxError};
pub use queue::Queue;
pub use response::{Outcome, Response, NIL, OK};
