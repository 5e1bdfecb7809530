use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::command::Keyword;
use super::error::QueueError;
use crate::metrics::{self, measure};

/// At most this many popped items wait in a consumer stream.
const CONSUMER_BUFFER: usize = 1;

/// The in-memory FIFO behind the broker.
///
/// Every mutation goes through the same write lock so len/push/pop/drain
/// observe one total order; `export` takes the read side of that lock.
/// Consumers are woken by pushes instead of polling.
#[derive(Debug, Default)]
pub struct Queue {
    items: RwLock<VecDeque<String>>,
    pushed: Notify,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        measure(Keyword::Len.as_str(), || self.items.read().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, item: impl Into<String>) {
        let item = item.into();
        measure(Keyword::Push.as_str(), || self.items.write().push_back(item));
        self.pushed.notify_waiters();
    }

    pub fn pop(&self) -> Result<String, QueueError> {
        measure(Keyword::Pop.as_str(), || {
            self.items.write().pop_front().ok_or(QueueError::Empty)
        })
    }

    pub fn drain(&self) {
        measure(Keyword::Drain.as_str(), || self.items.write().clear());
    }

    /// Point-in-time copy of every item, head first.
    pub fn export(&self) -> Vec<String> {
        measure("snapshot", || self.items.read().iter().cloned().collect())
    }

    /// Appends the non-empty items in order and returns how many were added.
    ///
    /// Existing items are kept: call [`Queue::drain`] first to replace the
    /// contents.
    pub fn import<I>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let added = measure("import", || {
            let mut guard = self.items.write();
            let before = guard.len();
            guard.extend(items.into_iter().filter(|item| !item.is_empty()));
            guard.len() - before
        });
        if added > 0 {
            self.pushed.notify_waiters();
        }
        added
    }

    /// Starts a consumer and returns the stream it feeds.
    ///
    /// Each popped item is handed to exactly one consumer. The stream closes
    /// once `cancel` fires; dropping the receiver also stops the consumer.
    pub fn consume(self: &Arc<Self>, cancel: CancellationToken) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        tokio::spawn(fan_out(Arc::clone(self), tx, cancel));
        rx
    }
}

async fn fan_out(queue: Arc<Queue>, tx: mpsc::Sender<String>, cancel: CancellationToken) {
    metrics::inc_consumers();

    'consume: loop {
        // Hold a slot before popping so an item is never taken without
        // somewhere to put it.
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let item = loop {
            let notified = queue.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Ok(item) = queue.pop() {
                break item;
            }

            tokio::select! {
                _ = cancel.cancelled() => break 'consume,
                _ = tx.closed() => break 'consume,
                _ = &mut notified => {}
            }
        };

        trace!("consumer picked up an item");
        permit.send(item);
    }

    metrics::dec_consumers();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn pops_in_push_order_then_reports_empty() {
        let queue = Queue::new();
        for item in ["a", "b", "c"] {
            queue.push(item);
        }

        assert_eq!(queue.pop().unwrap(), "a");
        assert_eq!(queue.pop().unwrap(), "b");
        assert_eq!(queue.pop().unwrap(), "c");
        assert_eq!(queue.pop(), Err(QueueError::Empty));
    }

    #[test]
    fn export_reflects_the_fifo_remainder() {
        let queue = Queue::new();
        assert!(queue.export().is_empty());

        for i in 0..10 {
            queue.push(format!("item-{i}"));
        }
        queue.pop().unwrap();
        queue.pop().unwrap();
        queue.push("tail");

        let mut expected: Vec<String> = (2..10).map(|i| format!("item-{i}")).collect();
        expected.push("tail".into());
        assert_eq!(queue.export(), expected);
        assert_eq!(queue.len(), expected.len());
    }

    #[test]
    fn drain_empties_everything() {
        let queue = Queue::new();
        queue.push("bongo");
        queue.push("bingo");
        queue.drain();

        assert_eq!(queue.len(), 0);
        assert!(queue.export().is_empty());
    }

    #[test]
    fn import_appends_and_skips_empty_items() {
        let queue = Queue::new();
        queue.push("existing");

        let added = queue.import(vec!["x".into(), String::new(), "y".into()]);

        assert_eq!(added, 2);
        assert_eq!(queue.export(), vec!["existing", "x", "y"]);
    }

    #[test]
    fn push_accepts_empty_strings() {
        let queue = Queue::new();
        queue.push("");
        assert_eq!(queue.pop().unwrap(), "");
    }

    #[tokio::test]
    async fn consumer_receives_items_pushed_later() {
        let queue = Arc::new(Queue::new());
        let cancel = CancellationToken::new();
        let mut stream = queue.consume(cancel.clone());

        queue.push("first");
        queue.push("second");

        let got = timeout(Duration::from_secs(1), stream.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("first"));
        let got = timeout(Duration::from_secs(1), stream.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("second"));

        assert_eq!(queue.pop(), Err(QueueError::Empty));
        cancel.cancel();
    }

    #[tokio::test]
    async fn consumer_drains_items_already_queued() {
        let queue = Arc::new(Queue::new());
        queue.import((0..5).map(|i| i.to_string()));

        let cancel = CancellationToken::new();
        let mut stream = queue.consume(cancel.clone());

        for i in 0..5 {
            let got = timeout(Duration::from_secs(1), stream.recv()).await.unwrap();
            assert_eq!(got, Some(i.to_string()));
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancelling_closes_the_stream() {
        let queue = Arc::new(Queue::new());
        let cancel = CancellationToken::new();
        let mut stream = queue.consume(cancel.clone());

        cancel.cancel();

        let closed = timeout(Duration::from_secs(1), stream.recv()).await.unwrap();
        assert_eq!(closed, None);

        queue.push("left behind");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_consumers_never_share_an_item() {
        let queue = Arc::new(Queue::new());
        let cancel = CancellationToken::new();
        let mut left = queue.consume(cancel.clone());
        let mut right = queue.consume(cancel.clone());

        const TOTAL: usize = 200;
        for i in 0..TOTAL {
            queue.push(format!("{i:04}"));
        }

        let mut seen_left = Vec::new();
        let mut seen_right = Vec::new();
        while seen_left.len() + seen_right.len() < TOTAL {
            tokio::select! {
                Some(item) = left.recv() => seen_left.push(item),
                Some(item) = right.recv() => seen_right.push(item),
                _ = tokio::time::sleep(Duration::from_secs(2)) => panic!("consumers stalled"),
            }
        }
        cancel.cancel();

        let mut all: Vec<String> = seen_left.iter().chain(&seen_right).cloned().collect();
        let unique: HashSet<&String> = all.iter().collect();
        assert_eq!(unique.len(), TOTAL);

        // Each consumer sees its share in queue order.
        assert!(seen_left.windows(2).all(|w| w[0] < w[1]));
        assert!(seen_right.windows(2).all(|w| w[0] < w[1]));

        all.sort();
        assert_eq!(all.first().map(String::as_str), Some("0000"));
        assert!(queue.is_empty());
    }
}
