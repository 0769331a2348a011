use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "tunsocks",
    about = "Bridge a local SOCKS5 listener to an upstream HTTP CONNECT proxy"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the bridge until interrupted
    Run(RunArgs),
    /// Check that the bridge can bind and the upstream proxy is reachable
    Check,
    /// Manage tunsocks configuration
    Config(ConfigArgs),
    /// Decode a hex-encoded IP packet
    Decode(DecodeArgs),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Run(_) => "run",
            Command::Check => "check",
            Command::Config(_) => "config",
            Command::Decode(_) => "decode",
        }
    }
}

#[derive(Args, Default)]
pub struct RunArgs {
    /// Loopback port for the SOCKS5 listener (0 picks a free port)
    #[arg(long, value_name = "PORT")]
    pub socks_port: Option<u16>,

    /// Upstream HTTP proxy host
    #[arg(long, value_name = "HOST")]
    pub proxy_host: Option<String>,

    /// Upstream HTTP proxy port
    #[arg(long, value_name = "PORT")]
    pub proxy_port: Option<u16>,

    /// Maximum concurrent sessions
    #[arg(long, value_name = "N")]
    pub pool_capacity: Option<usize>,

    /// Close tunnels idle for this many milliseconds
    #[arg(long, value_name = "MS")]
    pub idle_timeout_ms: Option<u64>,

    /// Bound on reaching the upstream proxy, in milliseconds
    #[arg(long, value_name = "MS")]
    pub connect_timeout_ms: Option<u64>,

    /// Load an additional config file on top of global and project config
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore global and project config files
    #[arg(long)]
    pub no_config: bool,

    /// Also launch the IP stack configured in `[stack]`
    #[arg(long)]
    pub with_stack: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config file
    Init {
        #[arg(long)]
        global: bool,
    },
    /// Print the effective merged configuration
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },
    /// Open config in $EDITOR
    Edit {
        #[arg(long)]
        global: bool,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}

#[derive(Args)]
pub struct DecodeArgs {
    /// Packet bytes as hex; whitespace and a leading 0x are ignored
    #[arg(value_name = "HEX")]
    pub hex: String,

    /// Print the decoded packet as JSON
    #[arg(long)]
    pub json: bool,
}
