#![warn(missing_docs)]

//! netvfs FTP client

use anyhow::Result;
use clap::Parser;
use netvfs_ftp::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "netvfs FTP client starting...");
    cli.run().await
}
