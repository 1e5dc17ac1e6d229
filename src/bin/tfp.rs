//! `tfp` - command-line front end for the TF Protocol client.
//!
//! Connection parameters come from a TOML config file; the subcommand picks
//! the operation to run against the server.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::fs::File;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tfproto::client::{Client, ClientConfig};
use tfproto::transfer::{TransferAction, TransferEvent};

#[derive(Parser, Debug)]
#[command(author, version, about = "TF Protocol client")]
struct Args {
    /// Path to the TOML connection config
    #[arg(short, long, default_value = "tfp.toml")]
    config: PathBuf,

    /// Per-chunk buffer size proposed to the server
    #[arg(long, default_value_t = 64 * 1024)]
    buffer_size: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Round-trip a line of text through the server
    Echo { text: String },
    /// Upload a local file to a server path
    Put {
        local: PathBuf,
        remote: String,
        /// Server-file position to start writing at
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Download a server path into a local file
    Get {
        remote: String,
        local: PathBuf,
        /// Server-file position to start reading at
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
}

fn progress(event: &TransferEvent) -> TransferAction {
    if let TransferEvent::Chunk(state) = event {
        tracing::debug!(bytes = state.last_chunk, "chunk");
    }
    TransferAction::Continue
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config {}", args.config.display()))?;
    let config: ClientConfig = toml::from_str(&raw)
        .with_context(|| format!("parsing config {}", args.config.display()))?;

    let mut client = Client::connect(config)
        .await
        .context("connecting to the server")?;

    match args.command {
        Command::Echo { text } => {
            let status = client.echo(&text).await?;
            println!("{status}");
        }
        Command::Put { local, remote, offset } => {
            let file = File::open(&local)
                .await
                .with_context(|| format!("opening {}", local.display()))?;
            let state = client
                .put(file, &remote, offset, args.buffer_size, progress)
                .await?;
            info!(?state, "upload complete");
        }
        Command::Get { remote, local, offset } => {
            let file = File::create(&local)
                .await
                .with_context(|| format!("creating {}", local.display()))?;
            let state = client
                .get(file, &remote, offset, args.buffer_size, progress)
                .await?;
            info!(?state, "download complete");
        }
    }

    client.end().await.ok();
    Ok(())
}
