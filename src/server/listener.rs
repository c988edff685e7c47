use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::protocol::HandlerKind;
use crate::query::QueryBackend;
use crate::server::connection::Connection;
use crate::tasks::WorkerPool;
use crate::transport::{Channel, TlsContext};

/// TCP server: accepts clients and hands each its own connection task.
pub struct Server {
    listener: TcpListener,
    backend: Arc<dyn QueryBackend>,
    pool: WorkerPool,
    tls: Option<TlsContext>,
    next_id: AtomicU64,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        backend: Arc<dyn QueryBackend>,
        pool: WorkerPool,
        tls: Option<TlsContext>,
    ) -> Self {
        Self {
            listener,
            backend,
            pool,
            tls,
            next_id: AtomicU64::new(1),
        }
    }

    /// Accepts connections forever. Individual accept failures are
    /// logged and tolerated; only losing the listener itself is fatal.
    pub async fn serve(self) -> Result<(), std::io::Error> {
        info!(addr = %self.listener.local_addr()?, "listening");
        loop {
            let (socket, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);

            // Responses are small and latency-bound; never batch them.
            if let Err(e) = socket.set_nodelay(true) {
                warn!(id, error = %e, "failed to disable nagle");
            }
            info!(id, peer = %peer_addr, "accepted connection");

            let connection = Connection::new(
                Channel::plain(socket),
                id,
                HandlerKind::Postgres,
                Arc::clone(&self.backend),
                self.pool.clone(),
                self.tls.clone(),
            );
            tokio::spawn(async move {
                match connection.run().await {
                    Ok(()) => info!(id, "connection closed"),
                    Err(e) => warn!(id, error = %e, "connection closed with error"),
                }
            });
        }
    }
}
