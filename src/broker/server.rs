use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use super::session::handle_connection;
use crate::core::Queue;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts connections and runs one session per peer against a shared queue.
pub struct Server {
    listener: TcpListener,
    queue: Arc<Queue>,
    max_frame_bytes: usize,
}

impl Server {
    pub async fn bind(
        addr: &str,
        queue: Arc<Queue>,
        max_frame_bytes: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            queue,
            max_frame_bytes,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop until `shutdown` is cancelled. Sessions get a
    /// child token, so cancelling also closes every open connection.
    pub async fn serve(self, shutdown: CancellationToken) -> std::io::Result<()> {
        info!(addr = %self.local_addr()?, "broker listening");
        let mut next_conn: u64 = 0;

        let listener = &self.listener;
        while let Some((socket, peer)) = accept_next(|| listener.accept(), &shutdown).await {
            if let Err(e) = socket.set_nodelay(true) {
                error!(%peer, error = %e, "failed to set TCP_NODELAY");
            }

            next_conn += 1;
            let conn_id = next_conn;
            let span = info_span!("session", conn_id, %peer);
            let queue = Arc::clone(&self.queue);
            let max_frame_bytes = self.max_frame_bytes;
            let shutdown = shutdown.clone();

            task::spawn(
                async move {
                    info!("client connected");
                    if let Err(e) = handle_connection(socket, queue, max_frame_bytes, shutdown).await
                    {
                        error!(error = %e, "session ended with error");
                    }
                }
                .instrument(span),
            );
        }

        info!("broker stopped accepting connections");
        Ok(())
    }
}

/// Waits for the next connection, pausing after each failed accept. `None`
/// once `shutdown` fires.
async fn accept_next<T, F, Fut>(mut accept: F, shutdown: &CancellationToken) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return None,
            accepted = accept() => accepted,
        };
        match accepted {
            Ok(conn) => return Some(conn),
            Err(e) => {
                error!(error = %e, "accept failed");
                tokio::select! {
                    _ = shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
}
