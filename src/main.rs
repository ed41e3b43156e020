use clap::Parser;
use custodian::adapters::PostgresStore;
use custodian::cli::{Cli, Commands};
use custodian::config::AppConfig;
use custodian::error::{CustodyError, Result};
use custodian::persistence::MemoryStore;
use custodian::signing::KeyDerivation;
use std::sync::Arc;
use tracing::{info, warn};

mod main_runtime;

use main_runtime::{init_logging, serve};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config: {e}");
        }
        return Err(CustodyError::InvalidInput(format!(
            "invalid configuration: {}",
            errors.join("; ")
        )));
    }

    let _log_guard = init_logging(&config.logging);
    let network = config.bitcoin.network.to_bitcoin_network();

    match cli.command {
        Commands::Serve { memory, port } => {
            let keys = KeyDerivation::from_env(network)?;
            let port = port.unwrap_or(config.api.port);

            if memory {
                warn!("Running with in-memory storage; all state is lost on exit");
                serve(&config, keys, Arc::new(MemoryStore::new()), port).await?;
            } else {
                let store =
                    PostgresStore::new(&config.database.url, config.database.max_connections)
                        .await?;
                store.migrate().await?;
                serve(&config, keys, Arc::new(store), port).await?;
            }
        }
        Commands::Migrate => {
            let store =
                PostgresStore::new(&config.database.url, config.database.max_connections).await?;
            store.migrate().await?;
            info!("Migrations applied");
        }
        Commands::DeriveAddress { index } => {
            let keys = KeyDerivation::from_env(network)?;
            let path = keys.path(index)?;
            println!("{} {}", path, keys.address(index)?);
        }
    }

    Ok(())
}
