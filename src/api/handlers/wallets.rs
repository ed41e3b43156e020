use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::{state::AppState, types::*};
use crate::domain::BTC;

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// POST /wallets/create
pub async fn create_wallet(
    State(state): State<AppState>,
    Json(req): Json<CreateWalletRequest>,
) -> ApiResult<CreateWalletResponse> {
    let wallet = state.ledger.create_wallet(&req.trader_id, BTC).await?;
    Ok(Json(CreateWalletResponse {
        address: wallet.address,
    }))
}

/// POST /wallets/deposit
pub async fn confirm_deposit(
    State(state): State<AppState>,
    Json(req): Json<DepositRequest>,
) -> ApiResult<DepositResponse> {
    state
        .ledger
        .credit_deposit(&req.trader_id, BTC, req.amount, &req.tx_hash)
        .await?;
    Ok(Json(DepositResponse { success: true }))
}

/// POST /wallets/freeze
pub async fn freeze(
    State(state): State<AppState>,
    Json(req): Json<FreezeRequest>,
) -> ApiResult<FreezeResponse> {
    let entry = state
        .ledger
        .freeze(&req.trader_id, BTC, req.amount, &req.order_id)
        .await?;
    Ok(Json(FreezeResponse {
        frozen: entry.amount,
    }))
}

/// POST /wallets/release
pub async fn release(
    State(state): State<AppState>,
    Json(req): Json<ReleaseRequest>,
) -> ApiResult<ReleaseResponse> {
    let rate = req.reward_rate.unwrap_or(state.default_reward_rate);
    let release = state
        .ledger
        .release(&req.trader_id, BTC, &req.order_id, rate)
        .await?;
    Ok(Json(ReleaseResponse {
        released: release.release.amount,
        reward: release.reward.amount,
    }))
}

/// POST /wallets/withdraw
pub async fn withdraw(
    State(state): State<AppState>,
    Json(req): Json<WithdrawRequest>,
) -> ApiResult<WithdrawResponse> {
    let receipt = state
        .withdrawals
        .withdraw(&req.trader_id, &req.to_address, req.amount)
        .await?;
    Ok(Json(WithdrawResponse { txid: receipt.txid }))
}

/// GET /wallets/:trader_id
pub async fn get_wallet(
    State(state): State<AppState>,
    Path(trader_id): Path<String>,
) -> ApiResult<WalletResponse> {
    let wallet = state.ledger.wallet(&trader_id, BTC).await?;
    Ok(Json(WalletResponse {
        trader_id: wallet.trader_id,
        currency: wallet.currency,
        address: wallet.address,
        balance: wallet.balance,
        frozen: wallet.frozen,
    }))
}
