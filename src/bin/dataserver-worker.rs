//! Data server worker process.
//!
//! Spawned by the filesystem backend's coordinator. Serves a persistent store
//! on a Unix domain socket and prints `ready` on stdout once it accepts
//! connections. Logs go to stderr (`RUST_LOG` overrides the default `info`).

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dataserver::cache::DataServerConfig;
use dataserver::filesystem::{READY_LINE, SOCKET_FILE, Worker};

#[derive(Parser)]
#[command(name = "dataserver-worker")]
#[command(about = "Serve a persistent data server over a Unix domain socket")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Socket to listen on (default: <folder>/dataserver.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Caching folder holding the snapshot file; overrides the config's persistPath
    #[arg(long)]
    folder: Option<PathBuf>,

    /// Data server options as a JSON object
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(json) => serde_json::from_str::<DataServerConfig>(json)?,
        None => DataServerConfig::new(),
    };
    if let Some(folder) = cli.folder {
        config = config.persist_path(folder);
    }
    let socket = cli
        .socket
        .unwrap_or_else(|| config.path().join(SOCKET_FILE));

    let worker = Worker::bind(&socket, config).await?;
    info!(pid = std::process::id(), socket = %socket.display(), "worker ready");

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{READY_LINE}")?;
    stdout.flush()?;
    drop(stdout);

    worker.serve().await?;
    Ok(())
}
