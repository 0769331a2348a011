//! Boundary to the userspace IP stack that turns TUN packets into SOCKS5
//! connections against the bridge.
//!
//! The stack itself is not part of this crate. [`IpStack`] is the seam, and
//! [`ProcessStack`] drives an external tun2socks-style executable through
//! it.

use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// How long [`ProcessStack::stop`] waits after SIGTERM before killing.
const STOP_GRACE: Duration = Duration::from_secs(3);
const STOP_POLL: Duration = Duration::from_millis(50);

/// Parameters handed to the IP stack at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackParams {
    /// Open TUN device descriptor, inherited by the stack.
    pub tun_fd: i32,
    pub mtu: u32,
    /// Bridge listen address, normally `127.0.0.1`.
    pub socks_addr: String,
    pub socks_port: u16,
    pub tun_addr: String,
    pub tun_netmask: String,
    pub forward_udp: bool,
}

/// A userspace IP stack feeding the bridge.
///
/// `start` reports success as a plain bool; implementations log the reason
/// for a failure themselves.
pub trait IpStack: Send {
    fn start(&mut self, params: &StackParams) -> bool;
    fn stop(&mut self);
}

/// Errors from launching an external stack.
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("Stack command is empty")]
    EmptyCommand,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs the IP stack as a child process.
///
/// Argument templates may contain `{tun_fd}`, `{mtu}`, `{socks_addr}`,
/// `{socks_port}`, `{tun_addr}`, `{tun_netmask}` and `{forward_udp}`, which
/// are replaced with the matching [`StackParams`] value at start. Unknown
/// placeholders pass through unchanged.
#[derive(Debug)]
pub struct ProcessStack {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
}

impl ProcessStack {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: None,
        }
    }

    /// Whether the child has been spawned and has not exited yet.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn render_args(&self, params: &StackParams) -> Vec<String> {
        self.args.iter().map(|arg| render(arg, params)).collect()
    }

    /// Spawn the stack process. No-op if it is already running.
    ///
    /// # Errors
    /// * `StackError::EmptyCommand` - no program configured
    /// * `StackError::Spawn` - the program could not be executed
    pub fn spawn(&mut self, params: &StackParams) -> Result<(), StackError> {
        if self.is_running() {
            return Ok(());
        }
        if self.program.trim().is_empty() {
            return Err(StackError::EmptyCommand);
        }

        let args = self.render_args(params);
        debug!(program = %self.program, args = ?args, "Spawning IP stack");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| StackError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        info!(program = %self.program, pid = child.id(), "IP stack started");
        self.child = Some(child);
        Ok(())
    }

    /// Terminate the child: SIGTERM first on unix, kill after a grace period.
    pub fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(program = %self.program, %status, "IP stack already exited");
            return;
        }

        #[cfg(unix)]
        {
            // SAFETY: kill() only sends a signal to the pid we spawned.
            unsafe {
                libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
            }
            let deadline = Instant::now() + STOP_GRACE;
            while Instant::now() < deadline {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        info!(program = %self.program, %status, "IP stack stopped");
                        return;
                    }
                    Ok(None) => std::thread::sleep(STOP_POLL),
                    Err(e) => {
                        warn!(program = %self.program, error = %e, "Failed to poll IP stack");
                        break;
                    }
                }
            }
        }

        if let Err(e) = child.kill() {
            warn!(program = %self.program, error = %e, "Failed to kill IP stack");
        }
        match child.wait() {
            Ok(status) => info!(program = %self.program, %status, "IP stack killed"),
            Err(e) => warn!(program = %self.program, error = %e, "Failed to reap IP stack"),
        }
    }
}

impl IpStack for ProcessStack {
    fn start(&mut self, params: &StackParams) -> bool {
        match self.spawn(params) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "IP stack failed to start");
                false
            }
        }
    }

    fn stop(&mut self) {
        self.terminate();
    }
}

impl Drop for ProcessStack {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn render(template: &str, params: &StackParams) -> String {
    template
        .replace("{tun_fd}", &params.tun_fd.to_string())
        .replace("{mtu}", &params.mtu.to_string())
        .replace("{socks_addr}", &params.socks_addr)
        .replace("{socks_port}", &params.socks_port.to_string())
        .replace("{tun_addr}", &params.tun_addr)
        .replace("{tun_netmask}", &params.tun_netmask)
        .replace("{forward_udp}", if params.forward_udp { "true" } else { "false" })
}
