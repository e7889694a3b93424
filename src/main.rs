use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use quorum_withdrawal::api::routes::{create_router, AppState};
use quorum_withdrawal::config::{load_config, AppConfig};
use quorum_withdrawal::db::{DBClient, MemoryStore, WithdrawalStore};
use quorum_withdrawal::ledger::{EthereumLedger, LedgerClient};
use quorum_withdrawal::service::WithdrawalService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("Quorum Withdrawal")
        .version("0.1")
        .about("Approves withdrawals by quorum and pays them out on an Ethereum ledger")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("CONFIG_FILE")
                .help("Path to configuration file")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("memory_store")
                .long("memory-store")
                .help("Keep withdrawals in memory instead of Postgres")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<PathBuf>("config");
    let config = load_config(config_path.map(PathBuf::as_path))?;

    init_tracing(&config);
    info!("Starting quorum withdrawal service");

    let store: Arc<dyn WithdrawalStore> = if matches.get_flag("memory_store") {
        info!("Using in-memory store, withdrawals are lost on shutdown");
        Arc::new(MemoryStore::new())
    } else {
        let db = DBClient::new(&config)
            .await
            .context("Failed to connect to database")?;
        info!("Running database migrations");
        db.run_migrations().await?;
        Arc::new(db)
    };

    let ledger: Arc<dyn LedgerClient> = Arc::new(
        EthereumLedger::new(
            &config.ledger.get_rpc_url()?,
            &config.ledger.get_signer_key()?,
            &config.ledger,
        )
        .await
        .context("Failed to connect to ledger")?,
    );

    let state = Arc::new(AppState {
        service: WithdrawalService::new(store, ledger, &config),
        config: config.clone(),
    });
    let app = create_router(state);

    let address = config.server.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    info!("Listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down quorum withdrawal service");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=debug", config.logging.level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
