use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tunsocks_bridge::{BridgeConfig, BridgeServer, IpStack, ProcessStack, StackParams};
use tunsocks_settings::{BridgeSettings, ConfigLoader, StackSettings, TunsocksConfig};

use crate::cli::RunArgs;
use crate::error::CliError;

const DEFAULT_MTU: u32 = 1500;
const DEFAULT_TUN_ADDR: &str = "10.0.0.2";
const DEFAULT_TUN_NETMASK: &str = "255.255.255.0";

pub async fn run(args: RunArgs, cwd: PathBuf) -> Result<(), CliError> {
    // 1. Load and merge config.
    // --no-config skips global/project config files but --config <extra> still applies.
    let mut config = if args.no_config {
        TunsocksConfig::default()
    } else {
        ConfigLoader::load(&cwd)
    };
    if let Some(ref extra) = args.extra_config {
        let extra_cfg = TunsocksConfig::load(extra)?;
        config = config.merge(extra_cfg);
    }

    // 2. CLI flags override file values.
    let bridge_config = build_bridge_config(&config.bridge, &args);

    // 3. Start the bridge.
    let server = BridgeServer::new(bridge_config)?;
    let addr = server.start().await?;
    eprintln!(
        "tunsocks: SOCKS5 bridge on {addr} -> http proxy {}",
        server.config().upstream_authority()
    );

    // 4. Start the IP stack if requested.
    let stack = if args.with_stack {
        match start_stack(&config.stack, addr) {
            Ok(stack) => Some(stack),
            Err(e) => {
                server.stop().await?;
                return Err(e);
            }
        }
    } else {
        None
    };

    // 5. Wait for Ctrl-C.
    let waited = tokio::signal::ctrl_c().await;
    if let Err(ref e) = waited {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C; shutting down");
    }

    // 6. Stop the stack first so it stops opening sessions, then the bridge.
    if let Some(mut stack) = stack {
        tokio::task::spawn_blocking(move || stack.stop())
            .await
            .map_err(|e| CliError::Other(format!("IP stack shutdown failed: {e}")))?;
    }
    server.stop().await?;

    let stats = server.stats();
    eprintln!(
        "tunsocks: {} sessions ({} completed, {} failed), {} bytes out, {} bytes in",
        stats.accepted,
        stats.completed,
        stats.failed,
        stats.bytes_client_to_upstream,
        stats.bytes_upstream_to_client
    );
    Ok(())
}

fn build_bridge_config(settings: &BridgeSettings, args: &RunArgs) -> BridgeConfig {
    let mut config = BridgeConfig::default();

    if let Some(port) = args.socks_port.or(settings.socks_port) {
        config.socks_port = port;
    }
    if let Some(host) = args.proxy_host.clone().or_else(|| settings.http_proxy_host.clone()) {
        config.http_proxy_host = host;
    }
    if let Some(port) = args.proxy_port.or(settings.http_proxy_port) {
        config.http_proxy_port = port;
    }
    if let Some(capacity) = args.pool_capacity.or(settings.pool_capacity) {
        config.pool_capacity = capacity;
    }
    if let Some(ms) = args.idle_timeout_ms.or(settings.idle_timeout_ms) {
        config.idle_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = args.connect_timeout_ms.or(settings.connect_timeout_ms) {
        config.connect_timeout = Duration::from_millis(ms);
    }

    config
}

fn build_stack_params(settings: &StackSettings, socks: SocketAddr) -> Result<StackParams, CliError> {
    let tun_fd = settings.tun_fd.ok_or_else(|| {
        CliError::Other("--with-stack requires `tun_fd` in the [stack] config section".to_string())
    })?;

    Ok(StackParams {
        tun_fd,
        mtu: settings.mtu.unwrap_or(DEFAULT_MTU),
        socks_addr: socks.ip().to_string(),
        socks_port: socks.port(),
        tun_addr: settings
            .tun_addr
            .clone()
            .unwrap_or_else(|| DEFAULT_TUN_ADDR.to_string()),
        tun_netmask: settings
            .tun_netmask
            .clone()
            .unwrap_or_else(|| DEFAULT_TUN_NETMASK.to_string()),
        forward_udp: settings.forward_udp.unwrap_or(false),
    })
}

fn start_stack(settings: &StackSettings, socks: SocketAddr) -> Result<Box<dyn IpStack>, CliError> {
    let command = settings.command.clone().ok_or_else(|| {
        CliError::Other("--with-stack requires `command` in the [stack] config section".to_string())
    })?;
    let params = build_stack_params(settings, socks)?;

    let mut stack: Box<dyn IpStack> = Box::new(ProcessStack::new(command.clone(), settings.args.clone()));
    if !stack.start(&params) {
        return Err(CliError::Other(format!(
            "IP stack `{command}` failed to start"
        )));
    }
    tracing::info!(command = %command, tun_fd = params.tun_fd, "IP stack started");
    Ok(stack)
}
