//! Per-connection command dispatch.
//!
//! Each inbound frame is decoded and answered in order, except `consume`,
//! which runs as its own task so the connection keeps reading (and can see
//! the `stop` that ends it). Responses from every task share one writer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument, Span};

use crate::core::{
    Command, Frame, FrameCodec, Keyword, Queue, QueueError, Response, SyntaxError, NIL, OK,
};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<Mutex<FramedWrite<Writer, FrameCodec>>>;

struct ConsumerHandle {
    token: CancellationToken,
    /// Distinguishes a consumer from a later one reusing the same id.
    seq: u64,
}

#[derive(Clone)]
struct Session {
    queue: Arc<Queue>,
    writer: SharedWriter,
    consumers: Arc<DashMap<String, ConsumerHandle>>,
    next_seq: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// Serves one connection until the peer hangs up or `shutdown` fires.
///
/// Active consumers on the connection are cancelled on the way out.
pub async fn handle_connection<S>(
    stream: S,
    queue: Arc<Queue>,
    max_frame_bytes: usize,
    shutdown: CancellationToken,
) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut frames = FramedRead::new(read_half, FrameCodec::new(max_frame_bytes));
    let writer: Writer = Box::new(write_half);

    let session = Session {
        queue,
        writer: Arc::new(Mutex::new(FramedWrite::new(
            writer,
            FrameCodec::new(max_frame_bytes),
        ))),
        consumers: Arc::new(DashMap::new()),
        next_seq: Arc::new(AtomicU64::new(0)),
        cancel: shutdown.child_token(),
    };

    let result = loop {
        let frame = tokio::select! {
            _ = session.cancel.cancelled() => break Ok(()),
            frame = frames.next() => frame,
        };

        match frame {
            None => break Ok(()),
            Some(Ok(Frame::Line(line))) => session.dispatch(&line).await,
            Some(Ok(Frame::Oversized)) => {
                warn!(limit = max_frame_bytes, "dropping oversized frame");
                session
                    .reply(Response::error("", SyntaxError::FrameTooLarge(max_frame_bytes)))
                    .await;
            }
            Some(Ok(Frame::Invalid)) => {
                session
                    .reply(Response::error("", SyntaxError::Malformed))
                    .await;
            }
            Some(Err(e)) => break Err(e),
        }
    };

    session.cancel.cancel();
    info!(consumers = session.consumers.len(), "session closed");
    result
}

impl Session {
    async fn dispatch(&self, line: &str) {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                debug!(id = %e.id, error = %e, "rejecting frame");
                self.reply(Response::error(e.id, e.kind)).await;
                return;
            }
        };

        trace!(id = %command.id, keyword = %command.keyword, "dispatch");
        let Command { id, keyword, args } = command;

        let response = match keyword {
            Keyword::Len => Response::message(id, self.queue.len().to_string()),
            Keyword::Push => {
                self.queue.push(args.into_iter().next().unwrap_or_default());
                Response::message(id, OK)
            }
            Keyword::Pop => match self.queue.pop() {
                Ok(item) => Response::message(id, item),
                Err(QueueError::Empty) => Response::message(id, NIL),
            },
            Keyword::Drain => {
                self.queue.drain();
                Response::message(id, OK)
            }
            Keyword::Consume => return self.start_consumer(id).await,
            Keyword::Stop => return self.stop_consumer(&id),
        };

        self.reply(response).await;
    }

    async fn start_consumer(&self, id: String) {
        let token = self.cancel.child_token();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let registered = match self.consumers.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ConsumerHandle {
                    token: token.clone(),
                    seq,
                });
                true
            }
        };
        if !registered {
            self.reply(Response::error(id, "consumer already active"))
                .await;
            return;
        }

        let session = self.clone();
        tokio::spawn(
            async move { session.forward(id, token, seq).await }.instrument(Span::current()),
        );
    }

    /// Acknowledges the consume, then relays items until cancelled. An item
    /// still buffered when `stop` arrives is dropped, not written.
    async fn forward(self, id: String, token: CancellationToken, seq: u64) {
        let mut items = self.queue.consume(token.clone());
        debug!(%id, "consumer started");

        if self.send(Response::message(id.as_str(), OK)).await.is_ok() {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    item = items.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };
                if let Err(e) = self.send(Response::message(id.as_str(), item)).await {
                    warn!(%id, error = %e, "consumer write failed");
                    break;
                }
            }
        }

        token.cancel();
        self.consumers.remove_if(&id, |_, handle| handle.seq == seq);
        debug!(%id, "consumer stopped");
    }

    /// Cancels the consumer registered under `id`, if any. Never answered.
    fn stop_consumer(&self, id: &str) {
        match self.consumers.remove(id) {
            Some((_, handle)) => handle.token.cancel(),
            None => trace!(%id, "stop for unknown consumer"),
        }
    }

    async fn send(&self, response: Response) -> Result<(), LinesCodecError> {
        let mut writer = self.writer.lock().await;
        writer.send(response.to_string()).await
    }

    /// Like `send`, but a failure only affects this response.
    async fn reply(&self, response: Response) {
        if let Err(e) = self.send(response).await {
            warn!(error = %e, "failed to write response");
        }
    }
}
