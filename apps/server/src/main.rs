//! `spire-server`: HTTP API, worker pool and ticket sweeper in one process.

mod config;
mod demo;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use spire_engine::Engine;
use spire_ports::Store;
use spire_store_memory::MemoryStore;
use spire_store_sqlite::SqliteStore;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Overrides, ServerConfig, StoreKind};

/// Durable workflow execution server.
#[derive(Parser, Debug)]
#[command(name = "spire-server", version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, env = "SPIRE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, e.g. `0.0.0.0:8080`.
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,

    /// `memory` or a SQLite URL such as `sqlite://spire.db`.
    #[arg(long)]
    database_url: Option<String>,
}

async fn open_store(kind: &StoreKind) -> anyhow::Result<Arc<dyn Store>> {
    Ok(match kind {
        StoreKind::Memory => {
            warn!("using the in-memory store; runs are lost on exit");
            Arc::new(MemoryStore::new())
        }
        StoreKind::Sqlite(url) => Arc::new(
            SqliteStore::connect(url)
                .await
                .with_context(|| format!("opening {url}"))?,
        ),
    })
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(err) => warn!(error = %err, "cannot listen for ctrl-c; shutting down"),
        }
        shutdown.cancel();
    });
}

fn spawn_notification_log(engine: &Engine, shutdown: CancellationToken) {
    let mut notifications = engine.telemetry().bus().subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                next = notifications.recv() => match next {
                    Some(notification) => debug!(?notification, "run notification"),
                    None => break,
                },
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let overrides = Overrides {
        bind: args.bind,
        database_url: args.database_url,
    };
    let config = ServerConfig::load(args.config.as_deref(), &overrides)?;
    logging::init(&config.logging)?;
    info!(
        bind = %config.bind,
        database_url = %config.database_url,
        workers = config.engine.workers,
        "starting spire-server"
    );

    let store = open_store(&config.store_kind()?).await?;
    let engine = Engine::new(store, config.engine.clone())?;
    if config.demo_workflows {
        demo::register(&engine)?;
        info!(workflows = ?engine.workflows().ids(), "demo workflows registered");
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());
    spawn_notification_log(&engine, shutdown.clone());

    let workers = engine.dispatcher().start(shutdown.clone())?;
    let sweeper = engine.sweeper().spawn(shutdown.clone());

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    let served = spire_api::serve(listener, spire_api::app(&engine), shutdown.clone()).await;
    // Stop the workers even if the server exited on its own.
    shutdown.cancel();

    workers.join().await;
    if let Err(err) = sweeper.await {
        warn!(error = %err, "sweeper task ended abnormally");
    }
    served.context("http server failed")?;
    info!("spire-server stopped");
    Ok(())
}
