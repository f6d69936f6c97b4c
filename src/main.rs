//! spool server binary.
//!
//! Subcommands: `serve` (daemon), `fetch` (single pass), `expire`
//! (maintenance), and `rebuild-history` (index reconstruction). Exit code
//! 0 on success, 1 on fatal configuration or I/O problems. SIGINT and
//! SIGTERM trigger a graceful shutdown in the fixed order processor ->
//! background workers -> history -> group stores -> main store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use spool::config::{
    AppConfig, CONNECT_TIMEOUT_SECS, DEFAULT_CONFIG_PATH, FETCH_PASS_INTERVAL_SECS,
    READ_TIMEOUT_SECS,
};
use spool::error::Result;
use spool::expire::ExpireOptions;
use spool::fetch::Fetcher;
use spool::history::{rebuild, History};
use spool::nntp::BackendPool;
use spool::processor::Processor;
use spool::server::{NntpServer, SessionContext};
use spool::spam::AcceptAll;
use spool::store::{GroupStores, MainDb};
use spool::transfer::Transfer;
use spool::{active, bridge::BridgeHub};

#[derive(Parser)]
#[command(name = "spool", about = "Usenet news server and peering gateway")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server, fetcher, and transfer queue (default).
    Serve,
    /// Run one fetch pass over all providers and exit.
    Fetch,
    /// Expire and prune stored articles. Dry-run unless --force.
    Expire {
        /// Group selector: $all, an exact name, or a wildmat.
        #[arg(long, default_value = "$all")]
        group: String,
        /// Delete articles older than this many days (0 = off).
        #[arg(long, default_value_t = 0)]
        days: i64,
        /// Use each group's own expiry setting instead of --days.
        #[arg(long)]
        respect_expiry: bool,
        /// Also prune groups above their article-count cap.
        #[arg(long)]
        prune: bool,
        /// Actually delete; without this the pass only reports.
        #[arg(long)]
        force: bool,
    },
    /// Rebuild the history shard index from history.dat.
    RebuildHistory,
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.filter.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("spool: {}", e);
            std::process::exit(1);
        }
    };
    init_tracing(&config);

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Fetch => fetch_once(config).await,
        Command::Expire {
            group,
            days,
            respect_expiry,
            prune,
            force,
        } => {
            expire(
                config,
                ExpireOptions {
                    pattern: group,
                    days,
                    respect_expiry,
                    prune,
                    force,
                },
            )
            .await
        }
        Command::RebuildHistory => rebuild_history(config).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

/// Shared bring-up: main store, locked hash length, history, group stores.
async fn open_stores(
    config: &AppConfig,
) -> Result<(Arc<MainDb>, Arc<History>, Arc<GroupStores>)> {
    let main = Arc::new(MainDb::open(&config.data_dir.join("spool.db")).await?);
    let hash_len = main.locked_short_hash_len(config.short_hash_len).await?;
    let history = Arc::new(History::open(&config.data_dir.join("history"), hash_len).await?);
    let stores = GroupStores::new(config.data_dir.join("groups"));
    Ok((main, history, stores))
}

async fn bootstrap_registry(config: &AppConfig, main: &Arc<MainDb>) -> Result<()> {
    if let Some(path) = &config.active_file {
        active::load_active_file(main, path).await?;
    }
    if let Some(path) = &config.descriptions_file {
        active::load_descriptions_file(main, path).await?;
    }
    for provider in &config.provider {
        main.upsert_provider(provider).await?;
    }
    Ok(())
}

/// Flip the shutdown signal on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received Ctrl+C, initiating graceful shutdown");
            }
            _ = terminate => {
                tracing::info!("received SIGTERM, initiating graceful shutdown");
            }
        }
        let _ = shutdown_tx.send(true);
    });
}

async fn serve(config: AppConfig) -> Result<()> {
    tracing::info!(hostname = %config.hostname, "starting spool");
    let config = Arc::new(config);
    let (main, history, stores) = open_stores(&config).await?;
    bootstrap_registry(&config, &main).await?;
    let reaper = stores.clone().start_reaper();

    let bridges = Arc::new(BridgeHub::new());
    let processor = Processor::new(
        config.hostname.clone(),
        main.clone(),
        stores.clone(),
        history.clone(),
        Arc::new(AcceptAll),
        bridges,
        !config.peer.is_empty(),
    );

    let ingest_workers = config
        .provider
        .iter()
        .map(|p| p.max_conns)
        .sum::<usize>()
        .clamp(2, 8);
    let (ingest_tx, ingest_handles) = processor.clone().spawn_ingest_workers(ingest_workers);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx.clone());

    // Upstream pools and the fetch loop.
    let connect_timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);
    let read_timeout = Duration::from_secs(READ_TIMEOUT_SECS);
    let mut pools = Vec::new();
    for provider in config.provider.iter().filter(|p| p.enabled()) {
        let pool = BackendPool::new(provider.clone(), connect_timeout, read_timeout);
        pool.clone().start_reaper().await;
        pools.push(pool);
    }
    let fetcher = Fetcher::new(main.clone(), history.clone(), ingest_tx.clone(), pools.clone());
    let fetch_handle = {
        let shutdown = shutdown_rx.clone();
        let fetcher = fetcher.clone();
        tokio::spawn(async move {
            let mut shutdown_watch = shutdown.clone();
            loop {
                if let Err(e) = fetcher.clone().run_once(shutdown.clone()).await {
                    tracing::warn!(error = %e, "fetch pass ended early");
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(FETCH_PASS_INTERVAL_SECS)) => {}
                    _ = shutdown_watch.changed() => {}
                }
                if *shutdown_watch.borrow() {
                    break;
                }
            }
        })
    };

    // Transfer queue toward peers.
    let transfer = Transfer::new(
        main.clone(),
        stores.clone(),
        config.peer.clone(),
        connect_timeout,
        read_timeout,
    );
    let transfer_handle = if transfer.has_peers() {
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(transfer.run(shutdown)))
    } else {
        None
    };

    // Reader/peer listener.
    let ctx = Arc::new(SessionContext {
        config: config.clone(),
        main: main.clone(),
        stores: stores.clone(),
        history: history.clone(),
        processor: processor.clone(),
    });
    let server = NntpServer::new(ctx);
    let server_result = server.run(shutdown_rx.clone()).await;
    if let Err(e) = &server_result {
        tracing::error!(error = %e, "server stopped");
        let _ = shutdown_tx.send(true);
    }

    // Fixed shutdown order: processor first so no history write is lost.
    tracing::info!("draining processor");
    drop(ingest_tx);
    drop(fetcher);
    let _ = futures::future::join_all(ingest_handles).await;

    tracing::info!("stopping background workers");
    let _ = fetch_handle.await;
    if let Some(handle) = transfer_handle {
        let _ = handle.await;
    }
    for pool in pools {
        pool.close_all().await;
    }
    reaper.abort();

    tracing::info!("closing history");
    history.close().await;
    tracing::info!("closing group stores");
    stores.close_all().await;
    main.close().await;
    tracing::info!("shutdown complete");
    server_result
}

async fn fetch_once(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);
    let (main, history, stores) = open_stores(&config).await?;
    bootstrap_registry(&config, &main).await?;

    let processor = Processor::new(
        config.hostname.clone(),
        main.clone(),
        stores.clone(),
        history.clone(),
        Arc::new(AcceptAll),
        Arc::new(BridgeHub::new()),
        !config.peer.is_empty(),
    );
    let (ingest_tx, ingest_handles) = processor.clone().spawn_ingest_workers(4);

    let connect_timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);
    let read_timeout = Duration::from_secs(READ_TIMEOUT_SECS);
    let pools: Vec<_> = config
        .provider
        .iter()
        .filter(|p| p.enabled())
        .map(|p| BackendPool::new(p.clone(), connect_timeout, read_timeout))
        .collect();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let fetcher = Fetcher::new(main.clone(), history.clone(), ingest_tx.clone(), pools.clone());
    let result = fetcher.clone().run_once(shutdown_rx).await;

    drop(ingest_tx);
    drop(fetcher);
    let _ = futures::future::join_all(ingest_handles).await;
    for pool in pools {
        pool.close_all().await;
    }
    history.close().await;
    stores.close_all().await;
    main.close().await;
    result
}

async fn expire(config: AppConfig, opts: ExpireOptions) -> Result<()> {
    let main = Arc::new(MainDb::open(&config.data_dir.join("spool.db")).await?);
    let stores = GroupStores::new(config.data_dir.join("groups"));

    let report = spool::expire::run(&main, &stores, &opts).await?;
    if !opts.force {
        tracing::info!(
            aged_out = report.aged_out,
            pruned = report.pruned,
            "dry run, pass --force to delete"
        );
    }
    stores.close_all().await;
    main.close().await;
    Ok(())
}

async fn rebuild_history(config: AppConfig) -> Result<()> {
    let main = Arc::new(MainDb::open(&config.data_dir.join("spool.db")).await?);
    let hash_len = main.locked_short_hash_len(config.short_hash_len).await?;
    main.close().await;

    let stats = rebuild::rebuild(&config.data_dir.join("history"), hash_len).await?;
    tracing::info!(records = stats.records, corrupt = stats.corrupt, "rebuild complete");
    Ok(())
}
