use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "modelswapd", version, about = "Reverse-proxying model multiplexer")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Address to bind the HTTP surface to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: String,

    /// Log level filter, passed straight through to `tracing_subscriber`'s
    /// `EnvFilter` (e.g. "info", "modelswap=debug,tower_http=warn").
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
