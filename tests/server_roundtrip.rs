mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::TestBroker;
use futures::StreamExt;
use orderly::ClientError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn push_pop_len_drain() {
    let broker = TestBroker::start().await;
    let client = broker.client().await;

    assert_eq!(client.len().await.unwrap(), 0);
    client.push("bongo").await.unwrap();
    client.push("bingo").await.unwrap();
    assert_eq!(client.len().await.unwrap(), 2);

    assert_eq!(client.pop().await.unwrap(), "bongo");
    assert_eq!(client.pop().await.unwrap(), "bingo");
    assert!(matches!(client.pop().await, Err(ClientError::QueueEmpty)));

    client.push("x").await.unwrap();
    client.drain().await.unwrap();
    assert_eq!(client.len().await.unwrap(), 0);
    assert!(broker.queue.is_empty());

    client.close().await.unwrap();
}

#[tokio::test]
async fn fifo_holds_across_clients() {
    let broker = TestBroker::start().await;
    let producer = broker.client().await;
    let consumer = broker.client().await;

    for i in 0..20 {
        producer.push(format!("item-{i}")).await.unwrap();
    }
    for i in 0..20 {
        assert_eq!(consumer.pop().await.unwrap(), format!("item-{i}"));
    }
}

#[tokio::test]
async fn concurrent_requests_are_routed_to_their_callers() {
    let broker = TestBroker::start().await;
    let client = broker.client().await;

    let pushes: Vec<_> = (0..50)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.push(i.to_string()).await })
        })
        .collect();
    for push in pushes {
        push.await.unwrap().unwrap();
    }
    assert_eq!(client.len().await.unwrap(), 50);

    let pops: Vec<_> = (0..50)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.pop().await })
        })
        .collect();
    let mut seen = HashSet::new();
    for pop in pops {
        seen.insert(pop.await.unwrap().unwrap());
    }
    assert_eq!(seen.len(), 50);
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test]
async fn consume_streams_items_pushed_after_the_ack() {
    let broker = TestBroker::start().await;
    let client = broker.client().await;
    let producer = broker.client().await;

    let cancel = CancellationToken::new();
    let mut stream = client.consume(cancel.clone()).await.unwrap();

    producer.push("first").await.unwrap();
    producer.push("second").await.unwrap();

    let first = timeout(Duration::from_secs(2), stream.next()).await.unwrap();
    let second = timeout(Duration::from_secs(2), stream.recv()).await.unwrap();
    assert_eq!(first.as_deref(), Some("first"));
    assert_eq!(second.as_deref(), Some("second"));

    cancel.cancel();
    let end = timeout(Duration::from_secs(2), stream.recv()).await.unwrap();
    assert_eq!(end, None);

    // Once stopped, the consumer no longer competes for items.
    sleep(Duration::from_millis(50)).await;
    producer.push("after").await.unwrap();
    assert_eq!(producer.pop().await.unwrap(), "after");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_and_concurrent_pops_never_share_an_item() {
    const ITEMS: usize = 200;
    let broker = TestBroker::start().await;
    let consuming = broker.client().await;
    let popping = broker.client().await;
    let producer = broker.client().await;

    let mut stream = consuming.consume(CancellationToken::new()).await.unwrap();

    let done = CancellationToken::new();
    let poppers: Vec<_> = (0..4)
        .map(|_| {
            let client = popping.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let mut popped = Vec::new();
                while !done.is_cancelled() {
                    match client.pop().await {
                        Ok(item) => popped.push(item),
                        Err(ClientError::QueueEmpty) => sleep(Duration::from_millis(1)).await,
                        Err(e) => panic!("pop failed: {e}"),
                    }
                }
                popped
            })
        })
        .collect();

    for i in 0..ITEMS {
        producer.push(format!("item-{i}")).await.unwrap();
    }

    let mut streamed = Vec::new();
    while let Ok(Some(item)) = timeout(Duration::from_millis(300), stream.recv()).await {
        streamed.push(item);
    }
    done.cancel();

    let mut delivered = streamed.clone();
    for popper in poppers {
        delivered.extend(popper.await.unwrap());
    }

    assert!(!streamed.is_empty(), "consumer received nothing");
    assert_eq!(delivered.len(), ITEMS, "an item was delivered twice or lost");
    let unique: HashSet<_> = delivered.into_iter().collect();
    assert_eq!(unique.len(), ITEMS);
    assert!(broker.queue.is_empty());
}

#[tokio::test]
async fn dropping_the_stream_stops_the_server_consumer() {
    let broker = TestBroker::start().await;
    let client = broker.client().await;

    let stream = client.consume(CancellationToken::new()).await.unwrap();
    drop(stream);
    sleep(Duration::from_millis(50)).await;

    client.push("kept").await.unwrap();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(client.len().await.unwrap(), 1);
}

#[tokio::test]
async fn cancelled_before_ack_returns_cancelled() {
    let broker = TestBroker::start().await;
    let client = broker.client().await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = client.consume(cancel).await;

    assert!(matches!(result, Err(ClientError::Cancelled)));
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test]
async fn malformed_frames_get_error_responses() {
    let broker = TestBroker::start().await;
    let stream = TcpStream::connect(broker.addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(b"abc::bogus\n").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert_eq!(reply, "abc::error::invalid syntax: unknown keyword");

    write.write_all(b"def::push\n").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert!(reply.starts_with("def::error::"), "got {reply}");

    write.write_all(b"ghi::len\n").await.unwrap();
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "ghi::0");
}

#[tokio::test]
async fn oversized_frame_does_not_drop_the_connection() {
    let broker = TestBroker::with_max_frame(64).await;
    let client = broker.client().await;

    let result = client.push("x".repeat(256)).await;
    // The error carries no id, so the request only ends by timing out.
    assert!(matches!(result, Err(ClientError::Timeout)));

    client.push("small").await.unwrap();
    assert_eq!(client.pop().await.unwrap(), "small");
}

#[tokio::test]
async fn broker_shutdown_closes_clients() {
    let broker = TestBroker::start().await;
    let client = broker.client().await;
    client.push("x").await.unwrap();

    broker.stop();

    timeout(Duration::from_secs(2), client.done()).await.unwrap();
    assert!(matches!(client.len().await, Err(ClientError::Closed)));
}
