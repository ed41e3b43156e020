use custodian::adapters::EsploraClient;
use custodian::config::{AppConfig, LoggingConfig};
use custodian::domain::BTC;
use custodian::error::Result;
use custodian::ledger::Ledger;
use custodian::persistence::Storage;
use custodian::services::{DepositReconciler, WithdrawalReconciler, WithdrawalService};
use custodian::signing::KeyDerivation;
use custodian::transaction::TransactionBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// The returned guard flushes the file writer and must live as long as the process.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},custodian=debug,sqlx=warn", config.level))
    });

    // `tracing_appender::rolling::daily` panics if it cannot create the initial
    // log file, so writability is checked first.
    let (file_layer, guard) = match config.dir.as_deref() {
        Some(log_dir) => match preflight_log_dir(log_dir) {
            Ok(()) => {
                let file_appender = tracing_appender::rolling::daily(log_dir, "custodian.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let json_layer = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let console_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .with(file_layer)
        .init();

    if let Some(dir) = config.dir.as_deref().filter(|_| guard.is_some()) {
        eprintln!("Logging to: {}/custodian.log", dir);
    }
    guard
}

fn preflight_log_dir(log_dir: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let test_path = std::path::Path::new(log_dir).join(".custodian_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&test_path)?;
    let _ = std::fs::remove_file(&test_path);
    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Wire the ledger, chain provider, reconcilers and API over `store`; runs until a shutdown signal.
pub async fn serve<S: Storage + 'static>(
    config: &AppConfig,
    keys: KeyDerivation,
    store: Arc<S>,
    port: u16,
) -> Result<()> {
    let call_timeout = Duration::from_millis(config.bitcoin.request_timeout_ms);
    let esplora = Arc::new(EsploraClient::new(
        &config.bitcoin.esplora_url,
        call_timeout,
        config.reconciler.max_address_pages,
    )?);
    info!(
        "Chain provider: {} ({})",
        esplora.base_url(),
        config.bitcoin.network.name()
    );

    let ledger = Arc::new(Ledger::new(store, keys.clone()));
    let withdrawals = Arc::new(WithdrawalService::new(
        ledger.clone(),
        keys,
        TransactionBuilder::from_config(&config.withdrawal),
        esplora.clone(),
        esplora.clone(),
        call_timeout,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = Vec::new();

    if config.reconciler.enabled {
        let deposits = Arc::new(DepositReconciler::new(
            ledger.clone(),
            esplora.clone(),
            BTC,
            Duration::from_secs(config.reconciler.deposit_interval_secs),
            call_timeout,
        ));
        let confirmations = Arc::new(WithdrawalReconciler::new(
            ledger.clone(),
            esplora.clone(),
            Duration::from_secs(config.reconciler.withdrawal_interval_secs),
            call_timeout,
            config.reconciler.pending_batch_size,
        ));
        loops.push(tokio::spawn(deposits.run(shutdown_rx.clone())));
        loops.push(tokio::spawn(confirmations.run(shutdown_rx)));
    } else {
        warn!("Reconciliation loops disabled by config");
    }

    #[cfg(feature = "api")]
    {
        use custodian::api::{create_router, AppState};
        use std::net::SocketAddr;
        use tokio::net::TcpListener;

        let app = create_router(AppState::new(
            ledger,
            withdrawals,
            config.release.default_reward_rate,
        ));

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        info!("API server listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    #[cfg(not(feature = "api"))]
    {
        let _ = (withdrawals, port);
        info!("API feature disabled; running reconcilers only");
        shutdown_signal().await;
    }

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    for handle in loops {
        if let Err(e) = handle.await {
            error!("Reconciler task ended abnormally: {}", e);
        }
    }
    Ok(())
}
