use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{CustodyError, ErrorKind};

// ============================================================================
// Requests (camelCase, as existing clients send them)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWalletRequest {
    pub trader_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    pub trader_id: String,
    pub amount: Decimal,
    pub tx_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreezeRequest {
    pub trader_id: String,
    pub amount: Decimal,
    pub order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub trader_id: String,
    pub order_id: String,
    #[serde(default, alias = "rewardPercent")]
    pub reward_rate: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRequest {
    pub trader_id: String,
    pub to_address: String,
    pub amount: Decimal,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWalletResponse {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreezeResponse {
    pub frozen: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub released: Decimal,
    pub reward: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawResponse {
    pub txid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletResponse {
    pub trader_id: String,
    pub currency: String,
    pub address: String,
    pub balance: Decimal,
    pub frozen: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: i64,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub details: String,
}

/// Handler error: a [`CustodyError`] rendered with its stable kind
#[derive(Debug)]
pub struct ApiError(pub CustodyError);

impl From<CustodyError> for ApiError {
    fn from(err: CustodyError) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidInput | ErrorKind::InsufficientFunds | ErrorKind::InsufficientUtxo => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::DuplicateEvent | ErrorKind::AlreadyReleased => StatusCode::CONFLICT,
        ErrorKind::ExternalService | ErrorKind::KeyDerivation | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }

        let body = ErrorBody {
            error: kind.as_str().to_string(),
            details: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
