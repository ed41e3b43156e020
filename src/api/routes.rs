use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::{handlers, state::AppState};

pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Wallet lifecycle
        .route("/wallets/create", post(handlers::create_wallet))
        .route("/wallets/deposit", post(handlers::confirm_deposit))
        .route("/wallets/freeze", post(handlers::freeze))
        .route("/wallets/release", post(handlers::release))
        .route("/wallets/withdraw", post(handlers::withdraw))
        .route("/wallets/:trader_id", get(handlers::get_wallet))
        // System endpoints
        .route("/health", get(handlers::health))
        // Add state and CORS
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
