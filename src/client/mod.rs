//! Client SDK.
//!
//! One [`Client`] owns one connection and multiplexes any number of
//! concurrent requests over it. Every request carries a fresh correlation id;
//! a receive loop reads frames off the socket into an inbound channel and a
//! dispatch loop routes each response to whichever caller registered its id.
//! Responses nobody is waiting for are dropped.

mod config;
mod error;

pub use config::{ClientConfig, DEFAULT_MAX_FRAME_BYTES, DEFAULT_SEND_TIMEOUT};
pub use error::ClientError;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::{SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::{Command, Frame, FrameCodec, Keyword, Outcome, Response, DELIMITER, NIL, OK};
use crate::metrics;

/// Items buffered between the forwarding task and a [`Consumer`].
const CONSUMER_BUFFER: usize = 16;
/// Responses buffered per registered id.
const PENDING_BUFFER: usize = 100;
/// Frames buffered between the receive and dispatch loops.
const INBOUND_BUFFER: usize = 100;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type PendingTable = Arc<RwLock<HashMap<String, mpsc::Sender<Response>>>>;

struct Inner {
    config: ClientConfig,
    writer: Mutex<FramedWrite<Writer, FrameCodec>>,
    pending: PendingTable,
    cancel: CancellationToken,
    writer_closed: AtomicBool,
}

impl Inner {
    fn register(self: &Arc<Self>, id: &str) -> PendingEntry {
        let (tx, rx) = mpsc::channel(PENDING_BUFFER);
        self.pending.write().insert(id.to_string(), tx);
        PendingEntry {
            inner: Arc::clone(self),
            id: id.to_string(),
            rx,
        }
    }

    async fn transmit(&self, command: &Command) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(command.to_string()).await.map_err(|e| {
            metrics::inc_client_transmit_errors();
            ClientError::from(e)
        })
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.cancel.cancel();
        if self.writer_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        writer.close().await?;
        debug!(endpoint = %self.config.endpoint, "client closed");
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A registered delivery channel; unregisters itself when dropped.
struct PendingEntry {
    inner: Arc<Inner>,
    id: String,
    rx: mpsc::Receiver<Response>,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        self.inner.pending.write().remove(&self.id);
    }
}

/// Handle to a broker connection. Cheap to clone; clones share the
/// connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let config = config.validate()?;
        let stream = TcpStream::connect(&config.endpoint).await?;
        stream.set_nodelay(true)?;
        Self::from_stream(stream, config)
    }

    /// Runs the client over an already established stream.
    pub fn from_stream<S>(stream: S, config: ClientConfig) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = config.validate()?;
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: Writer = Box::new(write_half);

        let cancel = CancellationToken::new();
        let pending: PendingTable = Arc::new(RwLock::new(HashMap::new()));
        let (inbound_tx, inbound_rx) = flume::bounded(INBOUND_BUFFER);

        tokio::spawn(receive_loop(
            FramedRead::new(read_half, FrameCodec::new(config.max_frame_bytes)),
            inbound_tx,
            cancel.clone(),
        ));
        tokio::spawn(dispatch_loop(inbound_rx, Arc::clone(&pending)));

        let max_frame_bytes = config.max_frame_bytes;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                writer: Mutex::new(FramedWrite::new(writer, FrameCodec::new(max_frame_bytes))),
                pending,
                cancel,
                writer_closed: AtomicBool::new(false),
            }),
        })
    }

    /// Sends one command and waits for the response carrying its id.
    pub async fn send(&self, command: Command) -> Result<Response, ClientError> {
        let method = command.keyword.as_str();
        let start = Instant::now();

        let result = self.send_inner(command).await;

        metrics::record_client_request(method, start.elapsed());
        if result.is_err() {
            metrics::inc_client_request_errors(method);
        }
        result
    }

    async fn send_inner(&self, command: Command) -> Result<Response, ClientError> {
        let mut entry = self.inner.register(&command.id);
        self.inner.transmit(&command).await?;

        match timeout(self.inner.config.send_timeout, entry.rx.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    async fn request(&self, keyword: Keyword, args: Vec<String>) -> Result<String, ClientError> {
        let response = self.send(Command::build(keyword, args)).await?;
        match response.outcome {
            Outcome::Message(message) => Ok(message),
            Outcome::Error(reason) => Err(ClientError::Server(reason)),
        }
    }

    pub async fn len(&self) -> Result<usize, ClientError> {
        let message = self.request(Keyword::Len, Vec::new()).await?;
        message
            .parse()
            .map_err(|_| ClientError::InvalidResponse(message))
    }

    pub async fn push(&self, item: impl Into<String>) -> Result<(), ClientError> {
        let item = item.into();
        validate_payload(&item)?;
        expect_ok(Keyword::Push, self.request(Keyword::Push, vec![item]).await?)
    }

    /// Takes the head item. An empty queue is [`ClientError::QueueEmpty`].
    pub async fn pop(&self) -> Result<String, ClientError> {
        let message = self.request(Keyword::Pop, Vec::new()).await?;
        if message == NIL {
            return Err(ClientError::QueueEmpty);
        }
        Ok(message)
    }

    pub async fn drain(&self) -> Result<(), ClientError> {
        expect_ok(Keyword::Drain, self.request(Keyword::Drain, Vec::new()).await?)
    }

    /// Starts a server-side consumer and returns the stream of items it
    /// delivers.
    ///
    /// Cancelling `cancel` (or dropping the [`Consumer`]) ends the stream and
    /// sends `stop` for the consumer id.
    pub async fn consume(&self, cancel: CancellationToken) -> Result<Consumer, ClientError> {
        let command = Command::build(Keyword::Consume, Vec::new());
        let id = command.id.clone();
        let mut entry = self.inner.register(&id);

        if let Err(e) = self.inner.transmit(&command).await {
            metrics::inc_client_request_errors(Keyword::Consume.as_str());
            return Err(e);
        }

        let ack = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                drop(entry);
                self.stop(&id).await;
                return Err(ClientError::Cancelled);
            }
            ack = timeout(self.inner.config.send_timeout, entry.rx.recv()) => ack,
        };

        let failure = match ack {
            Ok(Some(response)) => match response.outcome {
                Outcome::Message(m) if m == OK => None,
                Outcome::Message(m) => Some(ClientError::Failed {
                    op: Keyword::Consume,
                    reason: m,
                }),
                Outcome::Error(e) => Some(ClientError::Server(e)),
            },
            Ok(None) => Some(ClientError::Closed),
            Err(_) => Some(ClientError::Timeout),
        };
        if let Some(e) = failure {
            drop(entry);
            self.stop(&id).await;
            metrics::inc_client_request_errors(Keyword::Consume.as_str());
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        let client = self.clone();
        tokio::spawn(async move {
            client.forward(entry, tx, cancel).await;
        });

        debug!(%id, "consumer started");
        Ok(Consumer { id, items: rx })
    }

    async fn forward(
        &self,
        mut entry: PendingEntry,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) {
        loop {
            let response = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.cancel.cancelled() => break,
                _ = tx.closed() => break,
                response = entry.rx.recv() => match response {
                    Some(response) => response,
                    None => break,
                },
            };

            let item = match response.outcome {
                Outcome::Message(item) => item,
                Outcome::Error(e) => {
                    warn!(id = %entry.id, error = %e, "consumer failed on the server");
                    break;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tx.send(item) => if sent.is_err() { break },
            }
        }

        let id = entry.id.clone();
        drop(entry);
        self.stop(&id).await;
        debug!(%id, "consumer stopped");
    }

    /// Asks the server to stop the consumer registered under `id`.
    async fn stop(&self, id: &str) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.inner.transmit(&Command::with_id(id, Keyword::Stop)).await {
            debug!(%id, error = %e, "failed to send stop");
        }
    }

    /// Closes the connection. Safe to call more than once.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.inner.close().await
    }

    /// Resolves once the client has closed, either through [`Client::close`]
    /// or because the connection dropped.
    pub async fn done(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.read().len()
    }
}

fn validate_payload(item: &str) -> Result<(), ClientError> {
    if item.contains(DELIMITER) {
        return Err(ClientError::InvalidPayload(format!(
            "payload must not contain `{DELIMITER}`"
        )));
    }
    if item.contains('\n') || item.contains('\r') {
        return Err(ClientError::InvalidPayload(
            "payload must not contain line breaks".into(),
        ));
    }
    Ok(())
}

fn expect_ok(op: Keyword, message: String) -> Result<(), ClientError> {
    if message == OK {
        Ok(())
    } else {
        Err(ClientError::Failed {
            op,
            reason: message,
        })
    }
}

async fn receive_loop<R>(
    mut frames: FramedRead<R, FrameCodec>,
    inbound: flume::Sender<String>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(Frame::Line(line))) => {
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = inbound.send_async(line) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            Some(Ok(other)) => warn!(frame = ?other, "discarding unreadable frame"),
            Some(Err(e)) => {
                warn!(error = %e, "connection read failed");
                break;
            }
            None => {
                debug!("connection closed by broker");
                break;
            }
        }
    }

    // Outstanding requests are left to their own timeouts. Frames already
    // queued are still dispatched; the dispatch loop ends once `inbound` is
    // dropped and drained.
    cancel.cancel();
}

/// Routes inbound frames to their pending ids. A full delivery channel
/// blocks the loop, which in turn stops the receive loop from reading.
async fn dispatch_loop(inbound: flume::Receiver<String>, pending: PendingTable) {
    while let Ok(line) = inbound.recv_async().await {
        let Some(response) = Response::parse(&line) else {
            warn!(%line, "discarding undecodable response");
            continue;
        };

        let delivery = pending.read().get(&response.id).cloned();
        match delivery {
            Some(tx) => {
                if tx.send(response).await.is_err() {
                    trace!("pending request went away before delivery");
                }
            }
            None => trace!(id = %response.id, "no pending request for response"),
        }
    }
}

/// Items delivered to a consume stream, in the order the server sent them.
pub struct Consumer {
    id: String,
    items: mpsc::Receiver<String>,
}

impl Consumer {
    /// The correlation id the server knows this consumer by.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.items.recv().await
    }
}

impl Stream for Consumer {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.items.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::time::sleep;

    fn config() -> ClientConfig {
        ClientConfig::new("in-memory").with_send_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn timeout_unregisters_the_pending_request() {
        // The peer end stays open but never answers.
        let (local, _silent) = duplex(1024);
        let client =
            Client::from_stream(local, config().with_send_timeout(Duration::from_millis(1)))
                .unwrap();

        let err = client.len().await.unwrap_err();

        assert!(matches!(err, ClientError::Timeout));
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn rejects_payloads_that_would_break_framing() {
        let (local, _peer) = duplex(1024);
        let client = Client::from_stream(local, config()).unwrap();

        assert!(matches!(
            client.push("a::b").await,
            Err(ClientError::InvalidPayload(_))
        ));
        assert!(matches!(
            client.push("line\nbreak").await,
            Err(ClientError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn routes_out_of_order_responses_by_id() {
        let (local, remote) = duplex(4096);
        let client = Client::from_stream(local, config()).unwrap();

        // Answers two requests in reverse order.
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(remote);
            let mut lines = BufReader::new(read).lines();
            let first = lines.next_line().await.unwrap().unwrap();
            let second = lines.next_line().await.unwrap().unwrap();
            let first = Command::parse(&first).unwrap();
            let second = Command::parse(&second).unwrap();

            for cmd in [second, first] {
                let body = match cmd.keyword {
                    Keyword::Len => "7".to_string(),
                    _ => "item".to_string(),
                };
                let frame = format!("{}\n", Response::message(cmd.id, body));
                write.write_all(frame.as_bytes()).await.unwrap();
            }
        });

        let (len, pop) = tokio::join!(client.len(), client.pop());
        assert_eq!(len.unwrap(), 7);
        assert_eq!(pop.unwrap(), "item");
    }

    #[tokio::test]
    async fn response_written_right_before_hangup_is_delivered() {
        for _ in 0..20 {
            let (local, remote) = duplex(1024);
            let client = Client::from_stream(local, config()).unwrap();

            tokio::spawn(async move {
                let (read, mut write) = tokio::io::split(remote);
                let mut lines = BufReader::new(read).lines();
                let cmd = Command::parse(&lines.next_line().await.unwrap().unwrap()).unwrap();
                let frame = format!("{}\n", Response::message(cmd.id, "7"));
                write.write_all(frame.as_bytes()).await.unwrap();
                write.shutdown().await.unwrap();
            });

            assert_eq!(client.len().await.unwrap(), 7);
        }
    }

    #[tokio::test]
    async fn idle_consumer_stops_reading_from_the_connection() {
        const ITEMS: usize = 1000;
        let (local, remote) = duplex(1024);
        let client = Client::from_stream(local, config()).unwrap();
        let written = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&written);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(remote);
            let mut lines = BufReader::new(read).lines();
            let consume = Command::parse(&lines.next_line().await.unwrap().unwrap()).unwrap();
            let ack = format!("{}\n", Response::message(consume.id.as_str(), OK));
            write.write_all(ack.as_bytes()).await.unwrap();

            for i in 0..ITEMS {
                let item = Response::message(consume.id.as_str(), format!("item-{i}"));
                write.write_all(format!("{item}\n").as_bytes()).await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
            }
            // Keep both halves open.
            std::future::pending::<()>().await;
        });

        let mut consumer = client.consume(CancellationToken::new()).await.unwrap();
        sleep(Duration::from_millis(200)).await;

        let buffered = written.load(Ordering::SeqCst);
        assert!(buffered < ITEMS, "peer wrote {buffered} items unopposed");

        for i in 0..ITEMS {
            let item = timeout(Duration::from_secs(1), consumer.recv())
                .await
                .unwrap();
            assert_eq!(item, Some(format!("item-{i}")));
        }
    }

    #[tokio::test]
    async fn peer_hangup_closes_the_client() {
        let (local, remote) = duplex(1024);
        let client = Client::from_stream(local, config()).unwrap();

        drop(remote);

        timeout(Duration::from_secs(1), client.done()).await.unwrap();
        assert!(client.is_closed());
        assert!(matches!(client.len().await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (local, _peer) = duplex(1024);
        let client = Client::from_stream(local, config()).unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed());
    }
}
