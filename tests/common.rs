#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use orderly::broker::Server;
use orderly::{Client, ClientConfig, Queue};
use tokio_util::sync::CancellationToken;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        orderly::logging::init_logging("debug");
    });
}

/// A broker on an ephemeral port, shut down when dropped.
pub struct TestBroker {
    pub addr: SocketAddr,
    pub queue: Arc<Queue>,
    shutdown: CancellationToken,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::with_max_frame(256_000).await
    }

    pub async fn with_max_frame(max_frame_bytes: usize) -> Self {
        init_logging();
        let queue = Arc::new(Queue::new());
        let server = Server::bind("127.0.0.1:0", Arc::clone(&queue), max_frame_bytes)
            .await
            .expect("bind ephemeral failed");
        let addr = server.local_addr().expect("no local addr");

        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(shutdown.clone()));

        Self {
            addr,
            queue,
            shutdown,
        }
    }

    pub async fn client(&self) -> Client {
        let config = ClientConfig::new(self.addr.to_string())
            .with_send_timeout(Duration::from_secs(2));
        Client::connect(config).await.expect("connect failed")
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
