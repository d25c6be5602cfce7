use clap::{Parser, Subcommand};
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(name = "vmforge", about = "Multi-tenant VM provisioning over libvirt")]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the provisioning service
    Serve {
        /// Bind address (overrides LISTEN_ADDR)
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
}
