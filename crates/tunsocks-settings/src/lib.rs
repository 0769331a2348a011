//! Layered TOML configuration for tunsocks.
//!
//! Loads from:
//! - Global config: `~/.config/tunsocks/tunsocks.toml`
//! - Project config: `<workspace>/.tunsocks/tunsocks.toml`
//!
//! Project values take precedence for scalar fields. The stack argument
//! list is taken whole from the project file when it sets one.
//!
//! # Example
//!
//! ```no_run
//! use tunsocks_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new("."));
//! println!("{:?}", config.bridge.socks_port);
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// TOML `[bridge]` section. Unset fields fall back to the bridge defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeSettings {
    /// Loopback port for the SOCKS5 listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks_port: Option<u16>,

    /// Upstream HTTP proxy host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy_host: Option<String>,

    /// Upstream HTTP proxy port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy_port: Option<u16>,

    /// Maximum concurrent sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_capacity: Option<usize>,

    /// Tunnel idle timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,

    /// Upstream dial and CONNECT response timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

/// TOML `[stack]` section: the external IP stack launched by `run --with-stack`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackSettings {
    /// Executable to launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Argument template; `{tun_fd}`, `{socks_port}` and friends are
    /// substituted at launch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// TUN device file descriptor handed to the stack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_fd: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_addr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_netmask: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_udp: Option<bool>,
}

/// Top-level tunsocks configuration, corresponding to `tunsocks.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunsocksConfig {
    /// Bridge configuration.
    #[serde(default)]
    pub bridge: BridgeSettings,

    /// IP stack configuration.
    #[serde(default)]
    pub stack: StackSettings,
}

impl TunsocksConfig {
    /// Parse a `TunsocksConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or
    /// contains unrecognised keys for this schema.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load a `TunsocksConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Config written by `tunsocks config init`: every bridge field spelled
    /// out with its default so the file documents itself.
    pub fn starter() -> Self {
        Self {
            bridge: BridgeSettings {
                socks_port: Some(1080),
                http_proxy_host: Some("127.0.0.1".to_string()),
                http_proxy_port: Some(8888),
                pool_capacity: Some(50),
                idle_timeout_ms: Some(30_000),
                connect_timeout_ms: Some(10_000),
            },
            stack: StackSettings::default(),
        }
    }

    /// Merge `other` (project-level) on top of `self` (global-level).
    ///
    /// - Scalar fields: `other` wins when explicitly set (`Some`).
    /// - `stack.args`: replaced by `other`'s list when it is non-empty, since
    ///   an argument template only makes sense as a whole.
    #[must_use]
    pub fn merge(mut self, other: TunsocksConfig) -> TunsocksConfig {
        let bridge = other.bridge;
        override_with(&mut self.bridge.socks_port, bridge.socks_port);
        override_with(&mut self.bridge.http_proxy_host, bridge.http_proxy_host);
        override_with(&mut self.bridge.http_proxy_port, bridge.http_proxy_port);
        override_with(&mut self.bridge.pool_capacity, bridge.pool_capacity);
        override_with(&mut self.bridge.idle_timeout_ms, bridge.idle_timeout_ms);
        override_with(&mut self.bridge.connect_timeout_ms, bridge.connect_timeout_ms);

        let stack = other.stack;
        override_with(&mut self.stack.command, stack.command);
        if !stack.args.is_empty() {
            self.stack.args = stack.args;
        }
        override_with(&mut self.stack.tun_fd, stack.tun_fd);
        override_with(&mut self.stack.mtu, stack.mtu);
        override_with(&mut self.stack.tun_addr, stack.tun_addr);
        override_with(&mut self.stack.tun_netmask, stack.tun_netmask);
        override_with(&mut self.stack.forward_udp, stack.forward_udp);
        self
    }
}

fn override_with<T>(base: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *base = value;
    }
}
