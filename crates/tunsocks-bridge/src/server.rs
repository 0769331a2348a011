//! SOCKS5 listener, bounded session pool and bridge lifecycle.
//!
//! # Lifecycle
//!
//! ```text
//! BridgeServer::new(config)          state: Stopped
//!       |
//!       v
//! BridgeServer::start() ---------->  Starting --bind ok--> Running
//!       |                                |
//!       |                                +--bind failed--> Stopped (BridgeError::Bind)
//!       v
//! accept loop: permit -> accept -> spawn Session
//!       |
//!       v
//! BridgeServer::stop() ----------->  Stopping --loop joined--> Stopped
//! ```
//!
//! The accept loop takes a pool permit before calling `accept()`, so once
//! `pool_capacity` sessions are live further clients wait in the kernel
//! backlog until one finishes.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::session::Session;
use crate::stats::{BridgeStats, StatsSnapshot};
use crate::{BridgeError, Result};

/// How long `stop` waits for the accept loop before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Pause after a failed `accept()` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Bridge configuration, fixed for the lifetime of a [`BridgeServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Loopback port to listen on.
    /// Default: `1080`. `0` lets the OS pick.
    pub socks_port: u16,

    /// Upstream HTTP proxy host.
    /// Default: `127.0.0.1`
    pub http_proxy_host: String,

    /// Upstream HTTP proxy port.
    /// Default: `8888`
    pub http_proxy_port: u16,

    /// Maximum number of concurrent sessions.
    /// Default: `50`
    pub pool_capacity: usize,

    /// Tunnel closed after this long without traffic in either direction.
    /// Default: 30 seconds
    pub idle_timeout: Duration,

    /// Bound on dialing the upstream and on reading its CONNECT response.
    /// Default: 10 seconds
    pub connect_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socks_port: 1080,
            http_proxy_host: "127.0.0.1".to_string(),
            http_proxy_port: 8888,
            pool_capacity: 50,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl BridgeConfig {
    /// Address the listener binds. Always loopback.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.socks_port))
    }

    /// `host:port` of the upstream proxy, with IPv6 hosts bracketed.
    pub fn upstream_authority(&self) -> String {
        if self.http_proxy_host.contains(':') {
            format!("[{}]:{}", self.http_proxy_host, self.http_proxy_port)
        } else {
            format!("{}:{}", self.http_proxy_host, self.http_proxy_port)
        }
    }

    /// # Errors
    /// * `BridgeError::InvalidConfig` - zero pool capacity, a zero timeout,
    ///   or an empty upstream host
    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(BridgeError::InvalidConfig(
                "pool_capacity must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "idle_timeout must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }
        if self.http_proxy_host.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                "http_proxy_host must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bridge lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Handles for the accept loop while the bridge is running.
struct RunningBridge {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

/// Local SOCKS5 server that tunnels every CONNECT through an HTTP proxy.
///
/// `start` and `stop` may be called repeatedly; each successful `start`
/// binds a fresh listener and each `stop` releases it together with every
/// in-flight session.
pub struct BridgeServer {
    config: Arc<BridgeConfig>,
    stats: Arc<BridgeStats>,
    state_tx: watch::Sender<BridgeState>,
    /// Serializes `start`/`stop`. `Some` exactly while Running.
    lifecycle: Mutex<Option<RunningBridge>>,
}

impl BridgeServer {
    /// Create a stopped bridge.
    ///
    /// # Errors
    /// * `BridgeError::InvalidConfig` - see [`BridgeConfig::validate`]
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(BridgeState::Stopped);
        Ok(Self {
            config: Arc::new(config),
            stats: Arc::new(BridgeStats::new()),
            state_tx,
            lifecycle: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> BridgeState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Bound listen address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Bind the listener and start accepting sessions.
    ///
    /// Returns the bound address. Calling `start` on a running bridge returns
    /// the existing address without rebinding.
    ///
    /// # Errors
    /// * `BridgeError::Bind` - the listen address could not be bound; the
    ///   bridge is back in `Stopped`
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(running) = lifecycle.as_ref() {
            return Ok(running.local_addr);
        }

        self.set_state(BridgeState::Starting);
        let bind_addr = self.config.listen_addr();
        let bound = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.set_state(BridgeState::Stopped);
                return Err(BridgeError::Bind {
                    addr: bind_addr,
                    source,
                });
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.config),
            Arc::clone(&self.stats),
            shutdown_rx,
        ));

        *lifecycle = Some(RunningBridge {
            local_addr,
            shutdown_tx,
            join_handle,
        });
        self.set_state(BridgeState::Running);
        info!(
            addr = %local_addr,
            upstream = %self.config.upstream_authority(),
            pool = self.config.pool_capacity,
            "SOCKS5 bridge started"
        );
        Ok(local_addr)
    }

    /// Close the listener and every in-flight session.
    ///
    /// No-op when the bridge is not running.
    ///
    /// # Errors
    /// * `BridgeError::Shutdown` - the accept loop panicked
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            return Ok(());
        };

        self.set_state(BridgeState::Stopping);
        let RunningBridge {
            shutdown_tx,
            mut join_handle,
            ..
        } = running;

        if shutdown_tx.send(()).is_err() {
            join_handle.abort();
        }

        let outcome = match tokio::time::timeout(SHUTDOWN_GRACE, &mut join_handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_cancelled() => Ok(()),
            Ok(Err(e)) => Err(BridgeError::Shutdown(e.to_string())),
            Err(_) => {
                warn!("Accept loop did not stop in time; aborting");
                join_handle.abort();
                Ok(())
            }
        };

        self.set_state(BridgeState::Stopped);
        info!("SOCKS5 bridge stopped");
        outcome
    }

    fn set_state(&self, next: BridgeState) {
        let previous = self.state_tx.send_replace(next);
        debug!(from = ?previous, to = ?next, "Bridge state");
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<BridgeConfig>,
    stats: Arc<BridgeStats>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let pool = Arc::new(Semaphore::new(config.pool_capacity));
    let mut sessions = JoinSet::new();
    let next_id = AtomicU64::new(1);

    loop {
        while sessions.try_join_next().is_some() {}

        let permit = tokio::select! {
            _ = &mut shutdown_rx => break,
            permit = Arc::clone(&pool).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    drop(permit);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            trace!(client = %peer, error = %e, "set_nodelay failed");
        }

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let guard = stats.session_opened();
        let session = Session::new(id, stream, Arc::clone(&config), Arc::clone(&stats));
        debug!(session = id, client = %peer, "Accepted SOCKS5 connection");

        sessions.spawn(async move {
            let _permit = permit;
            match session.run().await {
                Ok(report) => {
                    debug!(
                        session = id,
                        sent = report.client_to_upstream,
                        received = report.upstream_to_client,
                        "Session completed"
                    );
                    guard.finish(true);
                }
                Err(e) => {
                    debug!(session = id, error = %e, "Session failed");
                    guard.finish(false);
                }
            }
        });
    }

    drop(listener);
    let in_flight = sessions.len();
    sessions.shutdown().await;
    debug!(aborted = in_flight, "Accept loop exited");
}
