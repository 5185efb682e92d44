use std::sync::Arc;

use chunkflow_core::ServerConfig;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::Routes;
use crate::connection::Connection;

/// HTTP/1.1 server that writes streaming response bodies as they are produced.
///
/// Every accepted connection runs on its own task, so a slow or endless
/// response never holds up other clients.
pub struct Server {
    config: Arc<ServerConfig>,
    routes: Arc<Routes>,
    runtime: Option<Handle>,
}

impl Server {
    pub fn new(config: ServerConfig, routes: Routes) -> Self {
        Self {
            config: Arc::new(config),
            routes: Arc::new(routes),
            runtime: None,
        }
    }

    /// Spawn connection tasks on `handle` instead of the current runtime.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind a listener on the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind).await
    }

    /// Accept connections until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Open connections are told to stop as well; a connection in the middle
    /// of a response is closed without finishing it.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current()?,
        };
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "chunkflow server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer_addr, error = %e, "failed to set TCP_NODELAY");
                    }
                    debug!(%peer_addr, "accepted connection");

                    let conn = Connection::new(
                        stream,
                        peer_addr,
                        Arc::clone(&self.routes),
                        Arc::clone(&self.config),
                    );
                    let conn_shutdown = shutdown.clone();
                    runtime.spawn(async move {
                        tokio::select! {
                            result = conn.run() => {
                                if let Err(e) = result {
                                    warn!(%peer_addr, error = %e, "connection error");
                                }
                            }
                            _ = stop_requested(conn_shutdown) => {
                                debug!(%peer_addr, "closing connection for shutdown");
                            }
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(%local_addr, "chunkflow server stopped");
        Ok(())
    }
}

/// Resolves once `true` is sent; never resolves if the sender goes away first.
async fn stop_requested(mut shutdown: watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
