//! Filedrop - Point-to-point file transfer
//!
//! A server that persists uploaded files and a client that uploads one file
//! per invocation over a minimal length-prefixed TCP protocol.

mod config;
mod network;
mod protocol;
mod storage;

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use network::{Client, Progress, Server, TransferEvent};

/// Filedrop - send a file to a filedrop server
#[derive(Parser)]
#[command(name = "filedrop")]
#[command(author = "Filedrop Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Point-to-point file transfer over TCP", long_about = None)]
struct Cli {
    /// Port to accept connections on / connect to [default: 8080]
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Host to bind to / connect to [default: 127.0.0.1]
    #[arg(long, global = true)]
    host: Option<String>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as server, storing uploads in the server storage directory
    Server,

    /// Send one file from the client storage directory
    Client {
        /// File to send, relative to the client storage directory
        filename: String,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };
    let config = config.with_overrides(cli.host, cli.port);

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Server => {
            run_server(config).await.context("Server failed")?;
        }
        Commands::Client { filename } => {
            run_client(config, filename).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::sample_config();
                if let Some(path) = output {
                    sample.save(&path)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", toml::to_string_pretty(&sample)?);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run the server until Ctrl+C
async fn run_server(config: Config) -> anyhow::Result<()> {
    let storage = config.server_storage();
    let mut server = Server::new(config.network_config(), storage.clone());
    let mut event_rx = server
        .take_event_receiver()
        .context("Server event receiver already taken")?;

    server.start().await?;
    let bind_addr = server
        .local_addr()
        .context("Server started without a local address")?;

    println!("\n========================================");
    println!("  Filedrop Server Running");
    println!("========================================");
    println!("  Address: {}", bind_addr);
    println!("  Storage: {}", storage.path().display());
    println!("========================================");
    println!("\nWaiting for uploads...");
    println!("Press Ctrl+C to stop.\n");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    TransferEvent::Connected { peer } => {
                        println!("New connection from {}", peer);
                    }
                    TransferEvent::Started { peer, filename, total } => {
                        println!("Receiving file: {} ({} bytes) from {}", filename, total, peer);
                    }
                    TransferEvent::Progress { peer, filename, progress } => {
                        tracing::trace!("{} from {}: {}/{}", filename, peer, progress.transferred, progress.total);
                        print_progress(progress);
                    }
                    TransferEvent::Completed { peer, filename, bytes, path } => {
                        println!("File received successfully: {}", path.display());
                        tracing::debug!("{} ({} bytes) from {} complete", filename, bytes, peer);
                    }
                    TransferEvent::Failed { peer, reason } => {
                        println!("\nTransfer from {} failed: {}", peer, reason);
                    }
                    TransferEvent::Listening { bind_addr } => {
                        tracing::debug!("Accept loop running on {}", bind_addr);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    if server.is_running().await {
        server.stop().await?;
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Send one file and return once it completes or fails
async fn run_client(config: Config, filename: String) -> anyhow::Result<()> {
    let path = storage::source_path(&config.storage.client_dir, &filename);

    let mut client = Client::new(config.network_config());
    let event_rx = client
        .take_event_receiver()
        .context("Client event receiver already taken")?;
    let printer = tokio::spawn(print_client_events(event_rx));

    let result = client.send(&path).await;

    // Closing the channel lets the printer drain and exit
    drop(client);
    join_printer(printer).await;

    let report = result.with_context(|| format!("Failed to send {}", path.display()))?;
    tracing::debug!("Declared {} bytes, sent {}", report.declared, report.sent);
    println!(
        "File sent successfully: {} ({} bytes to {})",
        report.filename, report.sent, report.server_addr
    );

    Ok(())
}

async fn print_client_events(mut event_rx: mpsc::Receiver<TransferEvent>) {
    while let Some(event) = event_rx.recv().await {
        match event {
            TransferEvent::Connected { peer } => {
                println!("Connected to {}", peer);
            }
            TransferEvent::Started { filename, total, .. } => {
                println!("Sending file: {} ({} bytes)", filename, total);
            }
            TransferEvent::Progress { progress, .. } => {
                print_progress(progress);
            }
            _ => {}
        }
    }
}

/// Wait for the event printer; a panic there is reported, not fatal
async fn join_printer(printer: JoinHandle<()>) -> bool {
    match printer.await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Event printer stopped abnormally: {}", e);
            false
        }
    }
}

fn print_progress(progress: Progress) {
    print!("\rProgress: {:.2}%", progress.percent());
    if progress.is_complete() {
        println!();
    }
    let _ = std::io::stdout().flush();
}
