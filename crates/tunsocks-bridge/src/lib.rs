//! Local SOCKS5 server that forwards every connection through an HTTP proxy.
//!
//! `tunsocks-bridge` accepts SOCKS5 clients on loopback (typically a
//! tun2socks-style IP stack reading a TUN device), opens an HTTP `CONNECT`
//! tunnel to the configured upstream proxy for each one, and relays bytes
//! both ways.
//!
//! # Architecture
//!
//! ```text
//! TUN device
//!       |
//!       v
//! IP stack (external, via IpStack)
//!       |
//!       | SOCKS5 (NO_AUTH, CONNECT)
//!       v
//! BridgeServer (127.0.0.1:SOCKS_PORT)
//!       |
//!       +-- Session per connection (bounded pool)
//!              |
//!              +-- greeting / request --> reply 05 xx
//!              +-- CONNECT host:port --> upstream HTTP proxy
//!              +-- 200? --> relay both directions
//! ```
//!
//! # Components
//!
//! - [`BridgeServer`]: listener, session pool and start/stop lifecycle
//! - [`Session`]: per-connection negotiation state machine
//! - [`relay()`]: bidirectional copy with half-close and idle timeout
//! - [`codec`]: SOCKS5 frames and the HTTP CONNECT exchange
//! - [`packet::parse`]: diagnostic decoder for raw IP datagrams
//! - [`IpStack`] / [`ProcessStack`]: boundary to the packet-level stack
//!
//! # Usage
//!
//! ```ignore
//! use tunsocks_bridge::{BridgeConfig, BridgeServer};
//!
//! let server = BridgeServer::new(BridgeConfig {
//!     http_proxy_host: "proxy.internal".to_string(),
//!     http_proxy_port: 3128,
//!     ..Default::default()
//! })?;
//! let addr = server.start().await?;
//! // ... point the IP stack at `addr` ...
//! server.stop().await?;
//! ```
//!
//! # Security Model
//!
//! - Binds to `127.0.0.1` only
//! - No SOCKS authentication; the loopback binding is the boundary

pub mod codec;
pub mod packet;
mod relay;
mod server;
mod session;
mod stack;
mod stats;

pub use codec::{CodecError, ConnectionRequest, Reply};
pub use packet::{ParsedPacket, Protocol, TcpFlags};
pub use relay::{relay, RelayReport, RELAY_BUFFER_SIZE};
pub use server::{BridgeConfig, BridgeServer, BridgeState};
pub use session::{Session, SessionError, SessionState};
pub use stack::{IpStack, ProcessStack, StackError, StackParams};
pub use stats::{BridgeStats, StatsSnapshot};

use std::net::SocketAddr;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced by [`BridgeServer`].
///
/// Per-connection failures never reach this type; they end their own
/// session and are logged as [`SessionError`].
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Failed to bind to address.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Configuration rejected at construction.
    #[error("Invalid bridge config: {0}")]
    InvalidConfig(String),

    /// Server shutdown error.
    #[error("Server shutdown error: {0}")]
    Shutdown(String),
}
