//! Accept loop: binds the configured address and hands each accepted socket
//! to its own [`session::run`] task. One task per connection, no pooling of
//! listener-side resources beyond the connection-count gate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::session::{self, SessionContext};

/// Binds `listen_addr` and accepts connections until the process exits.
/// Once `max_connections` sessions are live, new accepts are closed
/// immediately rather than queued; existing sessions keep running.
pub struct Listener {
    ctx: Arc<SessionContext>,
    listener: TcpListener,
    max_connections: usize,
    active: Arc<AtomicUsize>,
}

impl Listener {
    pub async fn bind(ctx: Arc<SessionContext>, listen_addr: std::net::SocketAddr, max_connections: usize) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        tracing::info!(%listen_addr, max_connections, "listening for client connections");
        Ok(Self { ctx, listener, max_connections, active: Arc::new(AtomicUsize::new(0)) })
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;

            if self.active.load(Ordering::Relaxed) >= self.max_connections {
                tracing::warn!(%peer_addr, "refusing connection, at max_connections capacity");
                drop(stream);
                continue;
            }

            if let Err(err) = stream.set_nodelay(true) {
                tracing::debug!(%peer_addr, %err, "failed to set TCP_NODELAY");
            }

            let ctx = self.ctx.clone();
            let active = self.active.clone();
            active.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                session::run(ctx, stream, peer_addr.to_string()).await;
                active.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}
