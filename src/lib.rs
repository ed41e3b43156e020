pub mod adapters;
#[cfg(feature = "api")]
pub mod api;
pub mod chain;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod persistence;
pub mod services;
pub mod signing;
pub mod transaction;

pub use config::AppConfig;
pub use error::{CustodyError, ErrorKind, Result};
pub use ledger::{IndexAllocator, Ledger, Release, WithdrawReservation};
pub use persistence::{MemoryStore, Storage};
pub use services::{DepositReconciler, WithdrawalReconciler, WithdrawalService};
pub use signing::{DerivedKey, KeyDerivation};
pub use transaction::{TransactionBuilder, UtxoSelector};
