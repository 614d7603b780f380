//! Command-line tool for running and probing a raft stream endpoint.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use futures_util::stream::StreamExt as _;
use raftline_stream::config::NodeConfig;
use raftline_stream::hostport::{self, HostPort};
use raftline_stream::metrics::{self, PrometheusMetrics};
use raftline_stream::security::{ClusterCa, Identity};
use raftline_stream::server::HttpServer;
use raftline_stream::utils::logging;
use raftline_stream::{Connection, StreamListener};
use signal_hook_tokio::Signals;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::sync::broadcast;

/// Run or probe the raft stream endpoint of a node.
///
/// By default, outputs errors and warnings to stderr. To configure
/// the output, set the env variable RUST_LOG. Set the env variable
/// RUST_LOG_FORMAT=SYSTEMD to a systemd-friendly log output.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about, verbatim_doc_comment)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for raft streams and echo back whatever peers send.
    ///
    /// Stop it with SIGTERM or SIGINT.
    Serve {
        /// Path to the TOML configuration file
        #[arg(long)]
        config: PathBuf,
    },

    /// Open a raft stream to a peer, send a line and print the reply.
    Dial {
        /// Path to the TOML configuration file
        #[arg(long)]
        config: PathBuf,

        /// Line to send
        #[arg(long, default_value = "ping")]
        message: String,

        /// Time allowed to connect
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        timeout: Duration,

        /// Address of the peer (host[:port])
        address: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(&["raftline"]);

    let result = match cli.command {
        Command::Serve { config } => serve(&config).await,
        Command::Dial {
            config,
            message,
            timeout,
            address,
        } => dial(&config, &address, &message, timeout).await,
    };
    if let Err(err) = result {
        eprintln!("ERROR: {err:#}");
        process::exit(1);
    }
}

/// Build a listener from the configuration file at `path`.
fn load(path: &Path) -> anyhow::Result<(NodeConfig, Identity, Arc<StreamListener>)> {
    let config = NodeConfig::load(path)?;
    let identity = Identity::from_pem_files(&config.tls.certificate, &config.tls.private_key)
        .context("Failed to load node certificate")?;
    let ca = ClusterCa::from_pem_file(&config.tls.ca).context("Failed to load cluster CA")?;
    let listener = StreamListener::new(
        &config.stream,
        &identity,
        Arc::new(ca),
        Arc::new(PrometheusMetrics),
    )?;

    Ok((config, identity, Arc::new(listener)))
}

async fn serve(path: &Path) -> anyhow::Result<()> {
    let (config, identity, listener) = load(path)?;

    if let Some(addr) = &config.metrics_addr {
        metrics::export_metrics(addr)
            .await
            .with_context(|| format!("Failed to export metrics on {addr}"))?;
        log::info!("Metrics available on http://{addr}/metrics");
    }

    let address = hostport::with_default_port(&config.stream.address);
    let hostport = HostPort::parse(&address)
        .await
        .with_context(|| format!("Failed to parse address {address}"))?;
    let (shutdown, _) = broadcast::channel(1);
    let (addr, server) = HttpServer::new(&identity, listener.roots(), &config.stream)?
        .route(listener.path(), listener.clone())
        .start(&hostport, &shutdown)
        .await
        .with_context(|| format!("Failed to start server on {hostport}"))?;

    let accept_loop = tokio::spawn({
        let listener = Arc::clone(&listener);
        async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        tokio::spawn(echo(conn));
                    }
                    Err(err) if err.is_closed() => break,
                    Err(err) => log::warn!("Failed to accept raft stream: {err}"),
                }
            }
        }
    });

    let mut signals = Signals::new([
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGQUIT,
    ])?;

    log::info!("Raft streams served on {addr}{}", listener.path());
    println!("Listening on {addr}");

    let _ = signals.next().await;

    log::info!("Interrupted. Shutting down..");
    signals.handle().close(); // A 2nd signal kills the process
    listener.close();
    let _ = shutdown.send(());
    server.join().await?;
    accept_loop.await?;

    Ok(())
}

/// Send back everything received on the connection.
async fn echo(conn: Connection) {
    let peer = conn.peer_addr();
    let (mut reader, mut writer) = tokio::io::split(conn);
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(n) => log::info!("Stream from {peer:?} closed after {n} bytes"),
        Err(err) => log::info!("Stream from {peer:?} failed: {err}"),
    }
}

async fn dial(path: &Path, address: &str, message: &str, timeout: Duration) -> anyhow::Result<()> {
    let (_, _, listener) = load(path)?;

    let mut conn = listener.dial(address, timeout).await?;
    conn.write_all(format!("{message}\n").as_bytes()).await?;
    conn.flush().await?;

    let mut reply = String::new();
    tokio::time::timeout(timeout, BufReader::new(conn).read_line(&mut reply))
        .await
        .context("No reply")??;
    if reply.is_empty() {
        anyhow::bail!("{address}: connection closed without a reply");
    }
    print!("{reply}");

    Ok(())
}
