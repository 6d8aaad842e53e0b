use std::path::PathBuf;

use clap::Parser;

/// Regenerates configuration files from running containers and restarts
/// the services that depend on them.
#[derive(Debug, Parser)]
#[command(name = "dockgen", version)]
pub struct Cli {
    /// Template mapping `<source>[:<destination>[:<service>]]`. Repeatable.
    #[arg(short = 't', long = "template")]
    pub templates: Vec<String>,

    /// Additional TOML configuration file, merged last.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Docker daemon socket. Defaults to the platform's local socket.
    #[arg(short, long)]
    pub socket_path: Option<String>,
}
