use axum::{
    extract::{rejection::JsonRejection, State},
    response::Json,
};
use std::sync::Arc;
use crate::{
    error::ServiceError,
    report::{Heartbeat, TransformationReport},
    transformation_engine::TransformationEngine,
    validation::TransformationRequest,
};

/// Shared by every handler; read-only after startup
pub struct AppState {
    pub engine: TransformationEngine,
}

type RequestBody = Result<Json<TransformationRequest>, JsonRejection>;

fn request_from(body: RequestBody) -> Result<TransformationRequest, ServiceError> {
    body.map(|Json(request)| request)
        .map_err(|rejection| ServiceError::MalformedBody(rejection.body_text()))
}

/// Liveness only; touches neither the warehouse nor the archive
pub async fn heartbeat(State(state): State<Arc<AppState>>) -> Json<Heartbeat> {
    Json(state.engine.reporter().heartbeat())
}

pub async fn clean_columns(
    State(state): State<Arc<AppState>>,
    body: RequestBody,
) -> Result<Json<TransformationReport>, ServiceError> {
    let request = request_from(body)?;
    let report = state.engine.clean_columns(&request).await?;
    Ok(Json(report))
}

pub async fn clean_rows(
    State(state): State<Arc<AppState>>,
    body: RequestBody,
) -> Result<Json<TransformationReport>, ServiceError> {
    let request = request_from(body)?;
    let report = state.engine.clean_rows(&request).await?;
    Ok(Json(report))
}

pub async fn merge_table_versions(
    State(state): State<Arc<AppState>>,
    body: RequestBody,
) -> Result<Json<TransformationReport>, ServiceError> {
    let request = request_from(body)?;
    let report = state.engine.merge_table_versions(&request).await?;
    Ok(Json(report))
}
