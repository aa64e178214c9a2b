use std::future::Future;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::Gateway;
use crate::connection::handle_connection;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept loop: one task per connection.
pub struct Server {
    gateway: Gateway,
    shutdown_grace: Duration,
}

impl Server {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Accept connections until `shutdown` resolves. Then stop accepting,
    /// tell every session to stop reading, give writers `shutdown_grace` to
    /// flush, and abort whatever is left.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        info!("Accepting connections on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("New connection from {}", addr);
                        sessions.spawn(handle_connection(
                            stream,
                            addr,
                            self.gateway.clone(),
                            stop_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Connection task panicked: {}", e);
                        }
                    }
                }
            }
        }

        drop(listener);
        info!("Shutting down, {} connections open", sessions.len());
        let _ = stop_tx.send(true);

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!("{} connections still open after grace period, aborting", sessions.len());
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        info!("Server stopped");
        Ok(())
    }
}
