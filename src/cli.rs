use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "custodian")]
#[command(version = "0.1.0")]
#[command(about = "Custodial Bitcoin wallet backend", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml plus optional <CUSTODIAN_ENV>.toml)
    #[arg(short, long, default_value = "config", env = "CUSTODIAN_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API and both reconciliation loops
    Serve {
        /// Keep all state in memory instead of PostgreSQL (local testing only)
        #[arg(long)]
        memory: bool,
        /// Override the API port from config
        #[arg(long)]
        port: Option<u16>,
    },
    /// Apply database migrations and exit
    Migrate,
    /// Print the deposit address for a derivation index
    DeriveAddress {
        #[arg(short, long)]
        index: u32,
    },
}
