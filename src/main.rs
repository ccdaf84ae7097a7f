// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fetchq::config::{self, AppConfig};
use fetchq::download::{DirectoryIngestor, DownloadManager};
use fetchq::server::Server;

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

#[derive(Parser)]
#[command(name = "fetchq")]
#[command(author, version, about = "Background download queue with live progress")]
struct Cli {
    /// Config file (defaults to ~/.fetchq/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the download server
    ///
    /// Examples:
    ///   fetchq serve
    ///   fetchq serve --port 9000 --workers 5
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind to (127.0.0.1 keeps the API local)
        #[arg(long)]
        bind: Option<String>,
        /// Where downloads are stored
        #[arg(long)]
        storage_dir: Option<PathBuf>,
        /// Maximum concurrent downloads
        #[arg(long)]
        workers: Option<usize>,
        /// Maximum jobs kept in the queue
        #[arg(long)]
        capacity: Option<usize>,
    },

    /// Print the effective configuration
    Config,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fetchq=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load(cli: &Cli) -> Result<AppConfig> {
    match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
}

async fn serve(
    mut app: AppConfig,
    port: Option<u16>,
    bind: Option<String>,
    storage_dir: Option<PathBuf>,
    workers: Option<usize>,
    capacity: Option<usize>,
) -> Result<()> {
    if let Some(port) = port {
        app.server.port = port;
    }
    if let Some(bind) = bind {
        app.server.bind_address = bind;
    }
    if let Some(dir) = storage_dir {
        app.server.storage_dir = Some(dir);
    }
    if let Some(workers) = workers {
        app.queue.workers = workers;
    }
    if let Some(capacity) = capacity {
        app.queue.capacity = capacity;
    }

    let storage = app.server.storage_dir();
    tokio::fs::create_dir_all(&storage)
        .await
        .with_context(|| format!("Failed to create storage directory {:?}", storage))?;
    tracing::info!(storage = %storage.display(), "Storing downloads");

    let manager = DownloadManager::new(app.queue.clone(), Arc::new(DirectoryIngestor::new(storage)))
        .context("Failed to start download manager")?;

    Server::new(manager)
        .with_port(app.server.port)
        .with_bind_address(app.server.bind_address)
        .start()
        .await
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let app = match load(&cli) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("[X] {:#}", e);
            std::process::exit(exit_codes::CONFIG);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Serve {
        port: None,
        bind: None,
        storage_dir: None,
        workers: None,
        capacity: None,
    }) {
        Commands::Serve {
            port,
            bind,
            storage_dir,
            workers,
            capacity,
        } => serve(app, port, bind, storage_dir, workers, capacity).await,
        Commands::Config => serde_json::to_string_pretty(&app)
            .map(|json| println!("{}", json))
            .map_err(Into::into),
    };

    if let Err(e) = result {
        tracing::error!("{:#}", e);
        eprintln!("[X] {:#}", e);
        std::process::exit(exit_codes::ERROR);
    }
}
