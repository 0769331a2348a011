//! Per-connection SOCKS5 state machine.
//!
//! # Lifecycle
//!
//! ```text
//! AwaitingHandshake --greeting--> AwaitingRequest --request--> TunnelEstablishing
//!        |                              |                              |
//!        | no NO_AUTH: 05 FF            | bad request: 05 xx           | dial/CONNECT failed: 05 05
//!        v                              v                              v
//!      Closed <-----------------------Closed <----------------------- Closed
//!                                                                      |
//!                                               upstream 200: 05 00    |
//!                                                                      v
//!                                                   Relaying --both directions done / idle--> Closed
//! ```
//!
//! The handshake and request together must arrive within the idle timeout;
//! a client that stalls there is closed without a reply.
//!
//! A session owns its client socket and, once dialed, its upstream socket.
//! Both are shut down in [`Session::run`] on every exit path and closed when
//! the session is dropped, which also covers tasks aborted by
//! [`BridgeServer::stop`](crate::BridgeServer::stop).

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::codec::{self, CodecError, ConnectionRequest, Reply, METHOD_NO_AUTH};
use crate::relay::{self, RelayReport};
use crate::server::BridgeConfig;
use crate::stats::BridgeStats;

/// Upstream socket with the CONNECT response head already consumed.
type Upstream = BufReader<TcpStream>;

/// Where a session is in its lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    AwaitingHandshake,
    AwaitingRequest,
    TunnelEstablishing,
    Relaying,
    Closed,
}

/// Why a session ended early.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Client greeting did not offer NO_AUTH.
    #[error("Client offered no acceptable auth method: {offered:02x?}")]
    UnsupportedAuthMethod { offered: Vec<u8> },

    /// Client did not finish the SOCKS5 negotiation in time.
    #[error("Client negotiation timed out after {0:?}")]
    NegotiationTimedOut(std::time::Duration),

    /// Upstream proxy unreachable, or the CONNECT exchange failed or timed out.
    #[error("Upstream proxy {addr} unavailable: {source}")]
    UpstreamDial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Upstream answered the CONNECT with something other than 200.
    #[error("Upstream refused tunnel to {target}: {status}")]
    UpstreamRejected { target: String, status: String },

    /// Mid-stream I/O failure other than an ordinary peer close.
    #[error("Relay failed: {0}")]
    Relay(#[source] std::io::Error),

    /// Writing a negotiation frame to the client failed.
    #[error("Failed to write to client: {0}")]
    ClientWrite(#[source] std::io::Error),
}

/// One accepted SOCKS5 connection.
pub struct Session<S> {
    id: u64,
    client: S,
    config: Arc<BridgeConfig>,
    stats: Arc<BridgeStats>,
    state: SessionState,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(id: u64, client: S, config: Arc<BridgeConfig>, stats: Arc<BridgeStats>) -> Self {
        Self {
            id,
            client,
            config,
            stats,
            state: SessionState::AwaitingHandshake,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiate, tunnel and relay until the connection ends.
    ///
    /// Byte counts are added to the shared [`BridgeStats`] whether or not
    /// the relay ended cleanly.
    pub async fn run(mut self) -> Result<RelayReport, SessionError> {
        let mut upstream: Option<Upstream> = None;
        let result = self.drive(&mut upstream).await;
        self.teardown(upstream).await;
        result
    }

    async fn drive(&mut self, slot: &mut Option<Upstream>) -> Result<RelayReport, SessionError> {
        let idle = self.config.idle_timeout;
        let request = timeout(idle, self.negotiate())
            .await
            .map_err(|_| SessionError::NegotiationTimedOut(idle))??;
        self.advance(SessionState::TunnelEstablishing);
        debug!(session = self.id, target = %request.authority(), "CONNECT requested");

        let upstream = match self.open_tunnel(&request, slot).await {
            Ok(upstream) => upstream,
            Err(e) => {
                self.reply_best_effort(Reply::ConnectionRefused).await;
                return Err(e);
            }
        };

        self.send(&codec::encode_reply(Reply::Success)).await?;
        self.advance(SessionState::Relaying);

        let mut report = relay::relay(&mut self.client, upstream, self.config.idle_timeout).await;
        self.stats
            .record_bytes(report.client_to_upstream, report.upstream_to_client);
        debug!(
            session = self.id,
            target = %request.authority(),
            sent = report.client_to_upstream,
            received = report.upstream_to_client,
            idle_timed_out = report.idle_timed_out,
            "Tunnel finished"
        );

        match report.take_abnormal_error() {
            Some(e) => Err(SessionError::Relay(e)),
            None => Ok(report),
        }
    }

    /// Greeting, method selection and request. Bounded by the idle timeout
    /// so a silent client cannot hold a pool slot.
    async fn negotiate(&mut self) -> Result<ConnectionRequest, SessionError> {
        let offered = codec::decode_greeting(&mut self.client).await?;
        let method = codec::select_method(&offered);
        self.send(&codec::encode_method_selection(method)).await?;
        if method != METHOD_NO_AUTH {
            return Err(SessionError::UnsupportedAuthMethod { offered });
        }
        self.advance(SessionState::AwaitingRequest);

        match codec::decode_request(&mut self.client).await {
            Ok(request) => Ok(request),
            Err(e) => {
                self.reply_best_effort(e.reply()).await;
                Err(e.into())
            }
        }
    }

    /// Dial the upstream proxy and complete the CONNECT exchange.
    ///
    /// The socket lands in `slot` as soon as it is connected so teardown
    /// closes it even when the exchange fails.
    async fn open_tunnel<'a>(
        &self,
        request: &ConnectionRequest,
        slot: &'a mut Option<Upstream>,
    ) -> Result<&'a mut Upstream, SessionError> {
        let addr = self.config.upstream_authority();
        let dial_error = |source: std::io::Error| SessionError::UpstreamDial {
            addr: addr.clone(),
            source,
        };

        let stream = timeout(
            self.config.connect_timeout,
            TcpStream::connect((self.config.http_proxy_host.as_str(), self.config.http_proxy_port)),
        )
        .await
        .map_err(|_| dial_error(timed_out("connect")))?
        .map_err(dial_error)?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!(session = self.id, error = %e, "set_nodelay failed");
        }
        let upstream = slot.insert(BufReader::new(stream));

        let status = match timeout(self.config.connect_timeout, exchange_connect(upstream, request)).await {
            Err(_) => return Err(dial_error(timed_out("CONNECT response"))),
            Ok(Err(CodecError::Io(e))) => return Err(dial_error(e)),
            Ok(Err(e)) => {
                return Err(SessionError::UpstreamRejected {
                    target: request.authority(),
                    status: e.to_string(),
                })
            }
            Ok(Ok(status)) => status,
        };

        if !codec::parse_connect_status_line(&status) {
            return Err(SessionError::UpstreamRejected {
                target: request.authority(),
                status,
            });
        }
        trace!(session = self.id, status = %status, "Upstream accepted CONNECT");
        Ok(upstream)
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), SessionError> {
        self.client
            .write_all(frame)
            .await
            .map_err(SessionError::ClientWrite)
    }

    async fn reply_best_effort(&mut self, reply: Reply) {
        if let Err(e) = self.send(&codec::encode_reply(reply)).await {
            trace!(session = self.id, error = %e, "Could not deliver error reply");
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "session state moved backwards");
        trace!(session = self.id, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }

    async fn teardown(&mut self, upstream: Option<Upstream>) {
        if let Some(mut upstream) = upstream {
            let _ = upstream.get_mut().shutdown().await;
        }
        let _ = self.client.shutdown().await;
        self.advance(SessionState::Closed);
    }
}

async fn exchange_connect(
    upstream: &mut Upstream,
    request: &ConnectionRequest,
) -> Result<String, CodecError> {
    let head = codec::build_connect_request(&request.host, request.port);
    upstream
        .get_mut()
        .write_all(head.as_bytes())
        .await
        .map_err(CodecError::Io)?;
    codec::read_connect_response(upstream).await
}

fn timed_out(stage: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, format!("{stage} timed out"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::net::TcpListener;

    fn can_bind_localhost() -> bool {
        match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(_) => true,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
            Err(err) => panic!("Failed to bind TCP localhost for test: {err}"),
        }
    }

    macro_rules! skip_if_no_bind {
        () => {
            if !can_bind_localhost() {
                return;
            }
        };
    }

    fn config_for(port: u16) -> Arc<BridgeConfig> {
        Arc::new(BridgeConfig {
            http_proxy_host: "127.0.0.1".to_string(),
            http_proxy_port: port,
            connect_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(2),
            ..Default::default()
        })
    }

    fn spawn_session(
        config: Arc<BridgeConfig>,
    ) -> (DuplexStream, tokio::task::JoinHandle<Result<RelayReport, SessionError>>) {
        let (client, server_side) = duplex(64 * 1024);
        let session = Session::new(1, server_side, config, Arc::new(BridgeStats::new()));
        (client, tokio::spawn(session.run()))
    }

    /// Fake upstream that answers the first CONNECT with `response` and then
    /// echoes whatever the tunnel carries.
    async fn fake_upstream(response: &'static [u8]) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut head = String::new();
            loop {
                let mut line = String::new();
                tokio::io::AsyncBufReadExt::read_line(&mut stream, &mut line)
                    .await
                    .unwrap();
                head.push_str(&line);
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            stream.get_mut().write_all(response).await.unwrap();
            let (mut reader, mut writer) = stream.into_inner().into_split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            head
        });
        (port, handle)
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    // ========================================================================
    // State ordering
    // ========================================================================

    #[test]
    fn test_session_states_are_ordered_forward() {
        assert!(SessionState::AwaitingHandshake < SessionState::AwaitingRequest);
        assert!(SessionState::AwaitingRequest < SessionState::TunnelEstablishing);
        assert!(SessionState::TunnelEstablishing < SessionState::Relaying);
        assert!(SessionState::Relaying < SessionState::Closed);
    }

    #[test]
    fn test_new_session_awaits_handshake() {
        let (_client, server_side) = duplex(16);
        let session = Session::new(7, server_side, config_for(1), Arc::new(BridgeStats::new()));
        assert_eq!(session.state(), SessionState::AwaitingHandshake);
    }

    // ========================================================================
    // Negotiation failures
    // ========================================================================

    #[tokio::test]
    async fn test_no_acceptable_method_replies_ff_and_closes() {
        let (mut client, task) = spawn_session(config_for(1));
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![0x05, 0xFF]);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedAuthMethod { ref offered } if offered == &[0x02]));
    }

    #[tokio::test]
    async fn test_wrong_version_greeting_closes_silently() {
        let (mut client, task) = spawn_session(config_for(1));
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Codec(CodecError::ProtocolVersion(0x04))));
    }

    #[tokio::test]
    async fn test_bind_command_gets_command_not_supported() {
        let (mut client, task) = spawn_session(config_for(1));
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received[..2], [0x05, 0x00]);
        assert_eq!(received[2..], [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Codec(CodecError::UnsupportedCommand(0x02))));
    }

    #[tokio::test]
    async fn test_silent_client_is_closed_after_idle_timeout() {
        let config = Arc::new(BridgeConfig {
            idle_timeout: Duration::from_millis(200),
            ..(*config_for(1)).clone()
        });
        let (mut client, task) = spawn_session(config);

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut received))
            .await
            .expect("silent client must be closed")
            .unwrap();
        assert!(received.is_empty());

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::NegotiationTimedOut(d) if d == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_stalled_request_is_closed_after_idle_timeout() {
        let config = Arc::new(BridgeConfig {
            idle_timeout: Duration::from_millis(200),
            ..(*config_for(1)).clone()
        });
        let (mut client, task) = spawn_session(config);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        // Half a request, then nothing.
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut received))
            .await
            .expect("stalled client must be closed")
            .unwrap();
        assert_eq!(received, vec![0x05, 0x00]);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::NegotiationTimedOut(_)));
    }

    // ========================================================================
    // Upstream outcomes
    // ========================================================================

    #[tokio::test]
    async fn test_unreachable_upstream_gets_connection_refused() {
        skip_if_no_bind!();
        let (mut client, task) = spawn_session(config_for(unused_port().await));
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
            .await
            .unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![0x05, 0x00, 0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::UpstreamDial { .. }));
    }

    #[tokio::test]
    async fn test_domain_request_sends_connect_and_relays_leftover_bytes() {
        skip_if_no_bind!();
        let (port, upstream) =
            fake_upstream(b"HTTP/1.1 200 Connection established\r\nVia: test\r\n\r\nhello").await;
        let (mut client, task) = spawn_session(config_for(port));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut negotiation = [0u8; 12];
        client.read_exact(&mut negotiation).await.unwrap();
        assert_eq!(negotiation, [0x05, 0x00, 0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let mut leftover = [0u8; 5];
        client.read_exact(&mut leftover).await.unwrap();
        assert_eq!(&leftover, b"hello");

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        client.shutdown().await.unwrap();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.client_to_upstream, 4);
        assert_eq!(report.upstream_to_client, 9);

        let head = upstream.await.unwrap();
        assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.com:443\r\n"));
    }

    #[tokio::test]
    async fn test_rejected_connect_relays_nothing() {
        skip_if_no_bind!();
        let (port, _upstream) = fake_upstream(b"HTTP/1.1 403 Forbidden\r\n\r\nsecret").await;
        let (mut client, task) = spawn_session(config_for(port));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50])
            .await
            .unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![0x05, 0x00, 0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let err = task.await.unwrap().unwrap_err();
        match err {
            SessionError::UpstreamRejected { target, status } => {
                assert_eq!(target, "93.184.216.34:80");
                assert_eq!(status, "HTTP/1.1 403 Forbidden");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_silent_upstream_times_out_with_connection_refused() {
        skip_if_no_bind!();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accepts the CONNECT and never answers; returns once the bridge closes it.
        let upstream = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let _ = stream.read_to_end(&mut seen).await;
            seen
        });

        let config = Arc::new(BridgeConfig {
            connect_timeout: Duration::from_millis(200),
            ..(*config_for(port)).clone()
        });
        let (mut client, task) = spawn_session(config);
        let started = std::time::Instant::now();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![0x05, 0x00, 0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(started.elapsed() < Duration::from_secs(2));

        match task.await.unwrap().unwrap_err() {
            SessionError::UpstreamDial { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::TimedOut);
            }
            other => panic!("unexpected error: {other}"),
        }

        let seen = tokio::time::timeout(Duration::from_secs(3), upstream)
            .await
            .expect("upstream socket must be closed")
            .unwrap();
        assert!(String::from_utf8_lossy(&seen).starts_with("CONNECT 10.0.0.1:80 HTTP/1.1\r\n"));
    }
}
