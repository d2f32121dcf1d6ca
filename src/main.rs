use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tftpd_rs::{FsHandler, Server, ServerConfig};

/// A TFTP server serving a directory tree.
#[derive(Parser, Debug)]
#[command(name = "tftpd-rs", version, about)]
struct Cli {
    /// Address to bind the well-known UDP port on.
    #[arg(long, default_value = "0.0.0.0")]
    ip: IpAddr,

    /// UDP port to listen on.
    #[arg(short, long, default_value_t = 69)]
    port: u16,

    /// Directory to serve / receive files.
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Retransmissions per outstanding packet before giving up.
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Seconds to wait for a reply before retransmitting.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Maximum number of concurrent transfers (unbounded by default).
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Reject all write requests.
    #[arg(long)]
    read_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dir = std::fs::canonicalize(&cli.dir)?;
    let handler = FsHandler::new(dir).read_only(cli.read_only);

    let config = ServerConfig {
        bind_addr: (cli.ip, cli.port).into(),
        retries: cli.retries,
        timeout: Duration::from_secs(cli.timeout),
        max_sessions: cli.max_sessions,
    };

    let server = Server::bind(config, handler).await?;
    server.run().await?;
    Ok(())
}
