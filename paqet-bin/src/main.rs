use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paqet_core::config::Role;
use paqet_core::{logging, Client, Config, Server};
use rand::RngCore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// paqet - a packet-level tunneling proxy disguised as ordinary TCP
#[derive(Parser, Debug)]
#[command(name = "paqet", version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a client or server from a YAML config
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: String,
    },
    /// Print a fresh 64-hex shared secret
    Secret,
    /// Print the version string
    Version,
}

#[cfg(unix)]
async fn wait_for_signal(cancel: CancellationToken) {
    use futures::StreamExt;
    if let Ok(mut signals) = signal_hook_tokio::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ]) {
        if signals.next().await.is_some() {
            tracing::info!("shutdown signal received, initiating graceful shutdown...");
            cancel.cancel();
        }
    }
}

#[cfg(windows)]
async fn wait_for_signal(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown signal received, initiating graceful shutdown...");
        cancel.cancel();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Run { config } => run(&config),
        Command::Secret => {
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            println!("{}", hex::encode(key));
            Ok(())
        }
        Command::Version => {
            println!("paqet {}", paqet_core::VERSION);
            Ok(())
        }
    }
}

fn run(config_path: &str) -> Result<()> {
    let config =
        Config::load_from_file(config_path).context("configuration validation failed")?;
    logging::init_logging(config.log.level).context("failed to initialize logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async move {
        let cancel = CancellationToken::new();
        tokio::spawn(wait_for_signal(cancel.clone()));

        match config.role {
            Role::Server => run_server(config, cancel).await,
            Role::Client => run_client(config, cancel).await,
        }
    })
}

async fn run_server(config: Config, cancel: CancellationToken) -> Result<()> {
    tracing::info!("starting server...");
    let server = Server::new(config, cancel).context("could not create server")?;
    server.run().await.context("server failed")?;
    Ok(())
}

async fn run_client(config: Config, cancel: CancellationToken) -> Result<()> {
    tracing::info!("starting client...");
    let client = Client::connect(config.clone(), cancel.clone())
        .await
        .context("failed to initialize client")?;

    for socks_cfg in &config.socks5 {
        let front = paqet_core::socks::Socks5Server::new(client.clone(), socks_cfg.clone());
        front
            .start(cancel.clone())
            .await
            .context("SOCKS5 front-end failed to start")?;
    }
    for http_cfg in &config.http {
        let front = paqet_core::http::HttpProxy::new(client.clone(), http_cfg.clone());
        front
            .start(cancel.clone())
            .await
            .context("HTTP front-end failed to start")?;
    }
    for forward_cfg in &config.forward {
        let front = paqet_core::forward::Forwarder::new(client.clone(), forward_cfg.clone());
        front
            .start(cancel.clone())
            .await
            .context("forwarder failed to start")?;
    }

    cancel.cancelled().await;
    client.close().await;
    tracing::info!("client shutdown completed");
    Ok(())
}
