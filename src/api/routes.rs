use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::handlers::{
    handle_approve_withdrawal, handle_create_withdrawal, handle_execute_withdrawal,
    handle_withdrawal_approvals, handle_withdrawal_status, health_check,
};
use crate::config::AppConfig;
use crate::service::WithdrawalService;

pub struct AppState {
    pub service: WithdrawalService,
    pub config: AppConfig,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/withdrawal/create", post(handle_create_withdrawal))
        .route("/withdrawal/approve/{id}", post(handle_approve_withdrawal))
        .route("/withdrawal/execute/{id}", post(handle_execute_withdrawal))
        .route("/withdrawal/status/{id}", get(handle_withdrawal_status))
        .route("/withdrawal/approvals/{id}", get(handle_withdrawal_approvals))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
