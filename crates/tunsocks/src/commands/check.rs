use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpStream;
use tunsocks_bridge::{BridgeConfig, BridgeServer};
use tunsocks_settings::{ConfigLoader, TunsocksConfig};

use crate::error::CliError;

/// Upper bound on the upstream reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn check(cwd: PathBuf) -> Result<(), CliError> {
    let mut all_ok = true;

    // 1. Platform info
    println!("Platform: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);

    // 2. Bridge smoke-test on an OS-assigned port
    print!("Bridge: ");
    let smoke_config = BridgeConfig {
        socks_port: 0,
        ..Default::default()
    };
    match BridgeServer::new(smoke_config) {
        Ok(server) => match server.start().await {
            Ok(addr) => match server.stop().await {
                Ok(()) => println!("OK (bound {addr})"),
                Err(e) => {
                    println!("FAIL (stop) - {e}");
                    all_ok = false;
                }
            },
            Err(e) => {
                println!("FAIL (start) - {e}");
                all_ok = false;
            }
        },
        Err(e) => {
            println!("FAIL (init) - {e}");
            all_ok = false;
        }
    }

    // 3. Config
    let global_path = ConfigLoader::global_config_path();
    let project_path = ConfigLoader::project_config_path(&cwd);

    println!("\nConfig files:");
    for path in [&global_path, &project_path] {
        let status = if !path.exists() {
            "not found"
        } else if TunsocksConfig::load(path).is_ok() {
            "found"
        } else {
            all_ok = false;
            "INVALID"
        };
        println!("  {} ({})", path.display(), status);
    }
    let config = ConfigLoader::load(&cwd);

    // 4. Upstream proxy reachability; warning only, it may simply not be up yet.
    let host = config
        .bridge
        .http_proxy_host
        .unwrap_or_else(|| BridgeConfig::default().http_proxy_host);
    let port = config
        .bridge
        .http_proxy_port
        .unwrap_or(BridgeConfig::default().http_proxy_port);
    print!("\nUpstream proxy {host}:{port}: ");
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(_)) => println!("reachable"),
        Ok(Err(e)) => println!("WARN - {e}"),
        Err(_) => println!("WARN - timed out after {}s", PROBE_TIMEOUT.as_secs()),
    }

    if !all_ok {
        return Err(CliError::Other("One or more checks failed".to_string()));
    }

    Ok(())
}
