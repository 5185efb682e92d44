//! Per-authority pool of keep-alive connections.
//!
//! ```text
//! checkout(authority)
//!   → acquire a permit (bounds open connections per authority)
//!     → idle connection still open → reuse it
//!     → none → connect
//! Checkout dropped
//!   → marked reusable and pool open → back to the idle list
//!   → otherwise → socket closed
//! ```

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chunkflow_core::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::ClientError;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections_per_host: usize,
    pub connect_timeout: Duration,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Duration,
}

impl From<&ClientConfig> for PoolConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_connections_per_host: config.max_connections_per_host,
            connect_timeout: config.connect_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Point-in-time pool counters, summed over all authorities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently checked out.
    pub active: usize,
    /// Open connections waiting for reuse.
    pub idle: usize,
    /// Checkouts served so far.
    pub checkouts: u64,
    /// Checkouts returned so far, whether reused or closed.
    pub releases: u64,
    /// Connections opened so far.
    pub connects: u64,
}

struct IdleConnection {
    stream: TcpStream,
    since: Instant,
}

struct Host {
    idle: Vec<IdleConnection>,
    semaphore: Arc<Semaphore>,
    active: usize,
}

#[derive(Default)]
struct Counters {
    checkouts: u64,
    releases: u64,
    connects: u64,
}

struct Shared {
    config: PoolConfig,
    hosts: Mutex<HashMap<String, Host>>,
    counters: Mutex<Counters>,
    closed: AtomicBool,
}

impl Shared {
    fn hosts(&self) -> MutexGuard<'_, HashMap<String, Host>> {
        self.hosts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, authority: &str, stream: Option<TcpStream>, reusable: bool) {
        self.counters().releases += 1;
        let mut hosts = self.hosts();
        let Some(host) = hosts.get_mut(authority) else {
            return;
        };
        host.active = host.active.saturating_sub(1);
        match stream {
            Some(stream) if reusable && !self.closed.load(Ordering::Acquire) => {
                host.idle.push(IdleConnection {
                    stream,
                    since: Instant::now(),
                });
                debug!(%authority, idle_count = host.idle.len(), "returned connection to pool");
            }
            _ => debug!(%authority, "closed connection on release"),
        }
    }

    /// Forget `authority` once nothing is idle, checked out or waiting.
    fn prune(&self, authority: &str) {
        let max = self.config.max_connections_per_host;
        let mut hosts = self.hosts();
        let unused = hosts.get(authority).is_some_and(|host| {
            host.idle.is_empty() && host.active == 0 && host.semaphore.available_permits() == max
        });
        if unused {
            hosts.remove(authority);
        }
    }
}

/// Bounded connection pool shared by every clone of a client.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                hosts: Mutex::new(HashMap::new()),
                counters: Mutex::new(Counters::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Check out a connection to `authority` (`host:port`) for one exchange.
    ///
    /// Waits up to the connect timeout for a free slot when the authority is
    /// at its connection limit.
    pub async fn checkout(&self, authority: &str) -> Result<Checkout, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Shutdown);
        }
        let config = &self.shared.config;
        let semaphore = {
            let mut hosts = self.shared.hosts();
            let host = hosts.entry(authority.to_string()).or_insert_with(|| Host {
                idle: Vec::new(),
                semaphore: Arc::new(Semaphore::new(config.max_connections_per_host)),
                active: 0,
            });
            Arc::clone(&host.semaphore)
        };

        let acquire = Arc::clone(&semaphore).acquire_owned();
        let permit = match tokio::time::timeout(config.connect_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ClientError::Shutdown),
            Err(_) => {
                return Err(ClientError::Timeout {
                    operation: "pool checkout",
                    after: config.connect_timeout,
                });
            }
        };

        if let Some(stream) = self.take_idle(authority) {
            debug!(%authority, "reused idle connection from pool");
            return Ok(self.lease(authority, stream, semaphore, permit));
        }

        let connected = tokio::time::timeout(config.connect_timeout, TcpStream::connect(authority)).await;
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            failed => {
                drop(permit);
                self.shared.prune(authority);
                return Err(match failed {
                    Ok(Err(source)) => ClientError::Connect {
                        authority: authority.to_string(),
                        source,
                    },
                    _ => ClientError::Timeout {
                        operation: "connect",
                        after: config.connect_timeout,
                    },
                });
            }
        };
        let _ = stream.set_nodelay(true);
        self.shared.counters().connects += 1;
        debug!(%authority, "opened new connection");
        Ok(self.lease(authority, stream, semaphore, permit))
    }

    /// Pop the freshest idle connection that is still open, closing stale ones.
    fn take_idle(&self, authority: &str) -> Option<TcpStream> {
        let idle_timeout = self.shared.config.idle_timeout;
        let mut hosts = self.shared.hosts();
        let host = hosts.get_mut(authority)?;
        while let Some(conn) = host.idle.pop() {
            if conn.since.elapsed() >= idle_timeout {
                debug!(%authority, "discarded expired idle connection");
                continue;
            }
            if !is_open(&conn.stream) {
                debug!(%authority, "discarded idle connection closed by peer");
                continue;
            }
            return Some(conn.stream);
        }
        None
    }

    fn lease(
        &self,
        authority: &str,
        stream: TcpStream,
        semaphore: Arc<Semaphore>,
        permit: OwnedSemaphorePermit,
    ) -> Checkout {
        self.shared.counters().checkouts += 1;
        // The entry may have been pruned while this checkout waited for its
        // permit; restore it around the same semaphore.
        let mut hosts = self.shared.hosts();
        let host = hosts.entry(authority.to_string()).or_insert_with(|| Host {
            idle: Vec::new(),
            semaphore,
            active: 0,
        });
        host.active += 1;
        drop(hosts);
        Checkout {
            shared: Arc::clone(&self.shared),
            authority: authority.to_string(),
            stream: Some(stream),
            reusable: Arc::new(AtomicBool::new(false)),
            permit: Some(permit),
        }
    }

    /// Close every idle connection and refuse further checkouts.
    ///
    /// Checked-out connections are closed when their checkout is dropped.
    /// Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut closed = 0;
        for host in self.shared.hosts().values_mut() {
            closed += host.idle.len();
            host.idle.clear();
            host.semaphore.close();
        }
        info!(closed, "connection pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let (active, idle) = self
            .shared
            .hosts()
            .values()
            .fold((0, 0), |(active, idle), host| (active + host.active, idle + host.idle.len()));
        let counters = self.shared.counters();
        PoolStats {
            active,
            idle,
            checkouts: counters.checkouts,
            releases: counters.releases,
            connects: counters.connects,
        }
    }
}

/// A peer that closed (or sent unsolicited bytes on) an idle connection
/// cannot carry another exchange.
fn is_open(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    matches!(stream.try_read(&mut probe), Err(e) if e.kind() == io::ErrorKind::WouldBlock)
}

/// Exclusive use of one pooled connection.
///
/// Dropping the checkout releases the connection exactly once: back to the
/// idle list if it was marked reusable, closed otherwise.
pub struct Checkout {
    shared: Arc<Shared>,
    authority: String,
    stream: Option<TcpStream>,
    reusable: Arc<AtomicBool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Checkout {
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Flag that, once set, returns the connection to the pool on release.
    ///
    /// Set it only after the response body has been read to its end.
    pub fn reuse_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reusable)
    }

    fn stream(&mut self) -> io::Result<Pin<&mut TcpStream>> {
        match self.stream.as_mut() {
            Some(stream) => Ok(Pin::new(stream)),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        let reusable = self.reusable.load(Ordering::Acquire);
        self.shared.release(&self.authority, self.stream.take(), reusable);
        drop(self.permit.take());
        self.shared.prune(&self.authority);
    }
}

impl AsyncRead for Checkout {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => stream.poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for Checkout {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut().stream() {
            Ok(stream) => stream.poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => stream.poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => stream.poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
