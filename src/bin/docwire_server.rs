use std::{error::Error, net::SocketAddr};

use clap::Parser;
use docwire::protocol::MemoryServer;
use log::info;

#[derive(Debug, Parser)]
#[command(version, about = "In-memory document server for development", long_about = None)]
struct Cli {
    /// Listen for new connection at address
    #[arg(default_value = "127.0.0.1:27017")]
    address: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = MemoryServer::bind(cli.address).await?;

    tokio::select! {
        result = server.listen() => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }
    Ok(())
}
