use std::path::PathBuf;

use clap::Parser;

/// Switchyard LLM gateway
#[derive(Debug, Parser)]
#[command(name = "switchyard", about = "OpenAI-compatible gateway with fallback and stateful backends")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "switchyard.toml", env = "SWITCHYARD_CONFIG")]
    pub config: PathBuf,

    /// Override the listen address
    #[arg(long, env = "SWITCHYARD_LISTEN")]
    pub listen: Option<std::net::SocketAddr>,

    /// Override the configured log filter
    #[arg(long)]
    pub log: Option<String>,
}
