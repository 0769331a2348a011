//! Bidirectional byte pump between a SOCKS5 client and its upstream tunnel.
//!
//! Each direction runs its own copy loop. When a loop sees EOF or an I/O
//! error it half-closes the socket it was writing to and stops, leaving the
//! opposite direction free to drain. The relay finishes when both loops have
//! stopped, or when no byte has moved in either direction for the idle
//! timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Per-direction copy buffer.
pub const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Outcome of a finished relay.
#[derive(Debug, Default)]
pub struct RelayReport {
    /// Bytes copied from the client to the upstream proxy.
    pub client_to_upstream: u64,

    /// Bytes copied from the upstream proxy to the client.
    pub upstream_to_client: u64,

    /// True when the relay was cut short by the idle timeout.
    pub idle_timed_out: bool,

    /// First I/O error seen by either direction.
    pub error: Option<std::io::Error>,
}

impl RelayReport {
    /// Take the recorded error unless it is an ordinary peer close, which
    /// stays in the report.
    pub fn take_abnormal_error(&mut self) -> Option<std::io::Error> {
        match self.error.take() {
            Some(e) if is_normal_close(&e) => {
                self.error = Some(e);
                None
            }
            other => other,
        }
    }
}

/// Whether an I/O error is how a peer ordinarily tears a TCP stream down.
pub fn is_normal_close(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// Copy bytes both ways between `client` and `upstream` until both
/// directions end or the connection idles for `idle_timeout`.
///
/// Never fails; errors are reported in [`RelayReport::error`]. The caller
/// keeps ownership of the underlying sockets and is responsible for closing
/// them once this returns.
pub async fn relay<C, U>(client: C, upstream: U, idle_timeout: Duration) -> RelayReport
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let activity = Activity::new();
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let pumps = async {
        tokio::join!(
            pump(client_read, upstream_write, &activity, &sent, "client->upstream"),
            pump(upstream_read, client_write, &activity, &received, "upstream->client"),
        )
    };

    let mut report = RelayReport::default();
    tokio::select! {
        (outbound, inbound) = pumps => {
            report.error = outbound.err().or(inbound.err());
        }
        () = watchdog(&activity, idle_timeout) => {
            trace!(timeout = ?idle_timeout, "Relay idle timeout");
            report.idle_timed_out = true;
        }
    }

    report.client_to_upstream = sent.load(Ordering::Relaxed);
    report.upstream_to_client = received.load(Ordering::Relaxed);
    report
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    activity: &Activity,
    counter: &AtomicU64,
    direction: &'static str,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];

    let result = loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        activity.touch();

        if let Err(e) = writer.write_all(&buffer[..n]).await {
            break Err(e);
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    };

    if let Err(e) = writer.shutdown().await {
        trace!(direction, error = %e, "Half-close failed");
    }

    match &result {
        Ok(()) => trace!(direction, bytes = counter.load(Ordering::Relaxed), "EOF"),
        Err(e) => trace!(direction, error = %e, "Copy loop ended with error"),
    }
    result
}

async fn watchdog(activity: &Activity, idle_timeout: Duration) {
    loop {
        let idle = activity.idle_for();
        if idle >= idle_timeout {
            return;
        }
        tokio::time::sleep(idle_timeout - idle).await;
    }
}

/// Time of the last byte moved in either direction.
struct Activity {
    origin: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}
