use clap::{Parser, ValueEnum};
use log::LevelFilter;
use std::path::PathBuf;

#[derive(Debug, Clone, ValueEnum)]
pub enum Level {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Level::Off => "off",
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };
        write!(f, "{}", name)
    }
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> Self {
        match level {
            Level::Off => LevelFilter::Off,
            Level::Error => LevelFilter::Error,
            Level::Warn => LevelFilter::Warn,
            Level::Info => LevelFilter::Info,
            Level::Debug => LevelFilter::Debug,
            Level::Trace => LevelFilter::Trace,
        }
    }
}

/// Supervise an openvpn tunnel through its management channel.
#[derive(Debug, Parser)]
#[command(name = "ovpnmgr", version, about)]
pub struct Args {
    /// Path to the openvpn configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// VPN username; prompted for interactively when the server asks and
    /// none is given
    #[arg(short, long, default_value = "")]
    pub username: String,

    /// VPN password; prompted for interactively when the server asks and
    /// none is given
    #[arg(short, long, default_value = "")]
    pub password: String,

    /// HTTP proxy as host:port
    #[arg(long, conflicts_with = "socks_proxy")]
    pub http_proxy: Option<String>,

    /// HTTP proxy username
    #[arg(long, default_value = "")]
    pub proxy_user: String,

    /// HTTP proxy password
    #[arg(long, default_value = "")]
    pub proxy_pass: String,

    /// SOCKS proxy as host:port
    #[arg(long)]
    pub socks_proxy: Option<String>,

    /// Path or name of the openvpn binary
    #[arg(long, default_value = "openvpn")]
    pub openvpn_path: String,

    /// Log verbosity
    #[arg(short, long, value_enum, default_value_t = Level::Info)]
    pub level: Level,
}
