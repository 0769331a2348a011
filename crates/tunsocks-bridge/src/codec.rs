//! SOCKS5 and HTTP CONNECT wire formats.
//!
//! Decoders read from any [`AsyncRead`] and never read past the end of the
//! frame they decode, so a session can keep using the stream afterwards.
//! Encoders are pure and return fixed-size arrays or strings.
//!
//! # Frames
//!
//! ```text
//! greeting   VER(5) | NMETHODS | METHODS...
//! selection  VER(5) | METHOD
//! request    VER(5) | CMD | RSV | ATYP | DST.ADDR | DST.PORT
//! reply      VER(5) | REP | RSV | ATYP(1) | 0.0.0.0 | 0
//! ```

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};
use tracing::trace;

pub const SOCKS_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Upper bound on the CONNECT response head (status line plus headers).
pub const MAX_CONNECT_RESPONSE: usize = 16 * 1024;

/// SOCKS5 reply codes sent by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Success = 0x00,
    GeneralFailure = 0x01,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Errors produced while decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// VER byte was not 5.
    #[error("Unsupported SOCKS version: {0:#04x}")]
    ProtocolVersion(u8),

    /// Short read or invalid length field.
    #[error("Malformed frame: {0}")]
    Malformed(&'static str),

    /// Well-formed request for a command other than CONNECT.
    #[error("Unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// IPv6 or unknown address type.
    #[error("Unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Socket error other than a short read.
    #[error("I/O error while reading frame: {0}")]
    Io(#[source] std::io::Error),
}

impl CodecError {
    /// Reply code the client should receive for this failure.
    pub fn reply(&self) -> Reply {
        match self {
            CodecError::UnsupportedCommand(_) => Reply::CommandNotSupported,
            CodecError::UnsupportedAddressType(_) => Reply::AddressTypeNotSupported,
            CodecError::ProtocolVersion(_) | CodecError::Malformed(_) | CodecError::Io(_) => {
                Reply::GeneralFailure
            }
        }
    }
}

/// Destination parsed from a SOCKS5 request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub command: u8,
    /// Dotted quad, domain name, or hex-colon IPv6 literal.
    pub host: String,
    pub port: u16,
}

impl ConnectionRequest {
    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        authority(&self.host, self.port)
    }
}

/// Read a client greeting and return the offered auth methods.
///
/// # Errors
/// * `CodecError::ProtocolVersion` - VER is not 5
/// * `CodecError::Malformed` - NMETHODS is zero or the stream ended early
pub async fn decode_greeting<R>(reader: &mut R) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    read_frame(reader, &mut header, "greeting truncated").await?;

    let [version, count] = header;
    if version != SOCKS_VERSION {
        return Err(CodecError::ProtocolVersion(version));
    }
    if count == 0 {
        return Err(CodecError::Malformed("greeting offers no methods"));
    }

    let mut methods = vec![0u8; count as usize];
    read_frame(reader, &mut methods, "greeting methods truncated").await?;
    trace!(methods = ?methods, "SOCKS5 greeting");
    Ok(methods)
}

/// Pick NO_AUTH if offered, otherwise NO_ACCEPTABLE.
pub fn select_method(offered: &[u8]) -> u8 {
    if offered.contains(&METHOD_NO_AUTH) {
        METHOD_NO_AUTH
    } else {
        METHOD_NO_ACCEPTABLE
    }
}

pub fn encode_method_selection(method: u8) -> [u8; 2] {
    [SOCKS_VERSION, method]
}

/// Read a SOCKS5 request frame.
///
/// IPv6 destinations are consumed in full (16 address bytes and the port)
/// before being rejected, so the stream stays aligned for the error reply.
/// Commands other than CONNECT are rejected only after the whole frame has
/// been read.
///
/// # Errors
/// * `CodecError::ProtocolVersion` - VER is not 5
/// * `CodecError::Malformed` - short read, empty or non-UTF-8 domain
/// * `CodecError::UnsupportedAddressType` - ATYP is IPv6 or unknown
/// * `CodecError::UnsupportedCommand` - CMD is not CONNECT
pub async fn decode_request<R>(reader: &mut R) -> Result<ConnectionRequest, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    read_frame(reader, &mut header, "request header truncated").await?;

    let [version, command, _reserved, atyp] = header;
    if version != SOCKS_VERSION {
        return Err(CodecError::ProtocolVersion(version));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            read_frame(reader, &mut octets, "IPv4 address truncated").await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_frame(reader, &mut len, "domain length missing").await?;
            if len[0] == 0 {
                return Err(CodecError::Malformed("empty domain name"));
            }
            let mut name = vec![0u8; len[0] as usize];
            read_frame(reader, &mut name, "domain name truncated").await?;
            String::from_utf8(name).map_err(|_| CodecError::Malformed("domain name is not UTF-8"))?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            read_frame(reader, &mut octets, "IPv6 address truncated").await?;
            let mut port = [0u8; 2];
            read_frame(reader, &mut port, "port truncated").await?;
            trace!(
                host = %Ipv6Addr::from(octets),
                port = u16::from_be_bytes(port),
                "IPv6 destination rejected"
            );
            return Err(CodecError::UnsupportedAddressType(ATYP_IPV6));
        }
        other => return Err(CodecError::UnsupportedAddressType(other)),
    };

    let mut port = [0u8; 2];
    read_frame(reader, &mut port, "port truncated").await?;
    let port = u16::from_be_bytes(port);

    if command != CMD_CONNECT {
        return Err(CodecError::UnsupportedCommand(command));
    }

    Ok(ConnectionRequest {
        command,
        host,
        port,
    })
}

/// Reply frame with a zeroed IPv4 bound address; the bridge has no real
/// bind address to expose.
pub fn encode_reply(reply: Reply) -> [u8; 10] {
    [SOCKS_VERSION, reply.code(), 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

pub fn build_connect_request(host: &str, port: u16) -> String {
    let target = authority(host, port);
    format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: Keep-Alive\r\n\r\n")
}

/// True when the upstream accepted the tunnel.
///
/// Only the presence of `200` anywhere in the status line is checked.
pub fn parse_connect_status_line(line: &str) -> bool {
    line.contains("200")
}

/// Read the upstream's CONNECT response head and return its status line.
///
/// Consumes lines up to and including the blank line that ends the header
/// block. Bytes after it stay buffered in `reader`.
///
/// # Errors
/// * `CodecError::Malformed` - the stream ended before the blank line, the
///   head exceeded [`MAX_CONNECT_RESPONSE`], or it was not UTF-8
/// * `CodecError::Io` - socket error
pub async fn read_connect_response<R>(reader: &mut R) -> Result<String, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut status: Option<String> = None;
    let mut consumed = 0usize;
    let mut line = String::new();

    loop {
        line.clear();
        let remaining = (MAX_CONNECT_RESPONSE - consumed) as u64;
        let n = (&mut *reader)
            .take(remaining)
            .read_line(&mut line)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::InvalidData => {
                    CodecError::Malformed("CONNECT response is not UTF-8")
                }
                _ => CodecError::Io(e),
            })?;

        if n == 0 {
            return Err(if consumed >= MAX_CONNECT_RESPONSE {
                CodecError::Malformed("CONNECT response head too large")
            } else {
                CodecError::Malformed("upstream closed before end of CONNECT response")
            });
        }
        consumed += n;

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if status.is_none() {
            status = Some(trimmed.to_string());
            continue;
        }
        if trimmed.is_empty() {
            return Ok(status.unwrap_or_default());
        }
        trace!(header = trimmed, "CONNECT response header");
    }
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

async fn read_frame<R>(reader: &mut R, buf: &mut [u8], what: &'static str) -> Result<(), CodecError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CodecError::Malformed(what)),
        Err(e) => Err(CodecError::Io(e)),
    }
}
