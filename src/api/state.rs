use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::ledger::Ledger;
use crate::services::WithdrawalService;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,

    pub withdrawals: Arc<WithdrawalService>,

    /// Applied when a release request carries no rate
    pub default_reward_rate: Decimal,

    /// Application start time
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        ledger: Arc<Ledger>,
        withdrawals: Arc<WithdrawalService>,
        default_reward_rate: Decimal,
    ) -> Self {
        Self {
            ledger,
            withdrawals,
            default_reward_rate,
            start_time: Utc::now(),
        }
    }
}
