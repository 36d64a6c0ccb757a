use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use crate::handler::{clean_columns, clean_rows, heartbeat, merge_table_versions, AppState};

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/heartbeat", get(heartbeat))
        .route("/clean_columns", post(clean_columns))
        .route("/clean_rows", post(clean_rows))
        .route("/merge_table_versions", post(merge_table_versions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
