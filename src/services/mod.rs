//! Request orchestration and background reconciliation loops.

pub mod deposit_reconciler;
pub mod withdrawal;
pub mod withdrawal_reconciler;

pub use deposit_reconciler::{DepositReconciler, DepositTickSummary};
pub use withdrawal::{WithdrawalReceipt, WithdrawalService};
pub use withdrawal_reconciler::{WithdrawalReconciler, WithdrawalTickSummary};

use std::future::Future;
use std::time::Duration;

use crate::error::{CustodyError, Result};

/// Run an external call with an upper time bound; expiry is an `ExternalService` failure
pub async fn bounded<T, F>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CustodyError::ExternalService(format!(
            "{} timed out after {}ms",
            what,
            limit.as_millis()
        ))),
    }
}

/// Log one failed reconciliation item.
///
/// Returns `true` when the failure is permanent: a later tick will hit it again.
pub(crate) fn report_item_failure(item: &str, err: &CustodyError) -> bool {
    if err.is_retryable() {
        tracing::warn!("{} failed, retrying next tick: {}", item, err);
        false
    } else {
        tracing::error!("{} failed and needs attention: {}", item, err);
        true
    }
}
