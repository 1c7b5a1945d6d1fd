//! flashmdb server entry point.
//!
//! Parses the configuration, opens the MDB layer, starts accepting clients,
//! loads the persistence file, starts the expiry cron and serves until
//! Ctrl+C.

use anyhow::Context as _;
use flashmdb::commands::CommandHandler;
use flashmdb::config::Config;
use flashmdb::connection::{handle_connection, ConnectionStats};
use flashmdb::server::{self, ServerState, SharedState};
use flashmdb::storage::{ExpirySweeper, MdbStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &Config) {
    println!(
        r#"
flashmdb v{} - Redis-compatible server on an LMDB keyspace
──────────────────────────────────────────────────────────────
Server started on {}
Data directory: {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        flashmdb::VERSION,
        config.bind_address(),
        config.dir.display(),
    );
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.loglevel))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner(&config);

    let backend = config.mdb.backend(&config.dir);
    let store = MdbStore::open(config.mdb.clone(), backend)
        .context("failed to open the MDB environment")?;
    info!(
        enabled = store.is_enabled(),
        backend = store.backend().name(),
        map_size = config.mdb.map_size,
        "MDB layer initialized"
    );

    let stats = Arc::new(ConnectionStats::new());
    let state = server::shared(ServerState::new(config.clone(), store, Arc::clone(&stats)));

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    info!("Listening on {}", config.bind_address());
    let accept = tokio::spawn(accept_loop(listener, Arc::clone(&state), stats));

    // Clients connected during the load get LOADING for keyspace commands.
    server::load_rdb(&state)
        .await
        .with_context(|| format!("failed to load {}", config.rdb_path().display()))?;

    let _sweeper = (config.active_expire && config.mdb.enabled).then(|| {
        let cron_state = Arc::clone(&state);
        ExpirySweeper::start_hz(config.hz, move || {
            server::lock(&cron_state).cron();
        })
    });

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    tokio::select! {
        _ = accept => {}
        _ = shutdown => {}
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Main loop that accepts incoming connections
async fn accept_loop(listener: TcpListener, state: SharedState, stats: Arc<ConnectionStats>) {
    let handler = CommandHandler::new(state);
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let handler = handler.clone();
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    handle_connection(stream, addr, handler, stats).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
