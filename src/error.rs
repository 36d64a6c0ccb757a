use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use crate::{
    merge_planner::MergeError,
    sql_renderer::TemplateError,
    validation::ValidationReport,
    warehouse::WarehouseError,
};

/// Everything a request can fail with, mapped onto an HTTP status
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid request: {}", .0.summary())]
    InvalidRequest(ValidationReport),

    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    #[error("Source table {0} was not found")]
    SourceNotFound(String),

    #[error("Cannot plan transformation: {0}")]
    Plan(String),

    #[error("Warehouse error: {0}")]
    Warehouse(WarehouseError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Body of every error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::InvalidRequest(_) | ServiceError::MalformedBody(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::SourceNotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Plan(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Warehouse(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::InvalidRequest(_) => "invalid_request",
            ServiceError::MalformedBody(_) => "malformed_body",
            ServiceError::SourceNotFound(_) => "source_not_found",
            ServiceError::Plan(_) => "plan_error",
            ServiceError::Warehouse(_) => "warehouse_error",
            ServiceError::Config(_) => "configuration_error",
        }
    }

    pub fn to_response_body(&self) -> ErrorResponse {
        let details = match self {
            ServiceError::InvalidRequest(report) => serde_json::to_value(&report.errors).ok(),
            _ => None,
        };
        ErrorResponse {
            error: self.kind().to_string(),
            message: self.to_string(),
            details,
        }
    }
}

impl From<WarehouseError> for ServiceError {
    fn from(err: WarehouseError) -> Self {
        match err {
            WarehouseError::NotFound(table) => ServiceError::SourceNotFound(table.to_string()),
            other => ServiceError::Warehouse(other),
        }
    }
}

impl From<MergeError> for ServiceError {
    fn from(err: MergeError) -> Self {
        ServiceError::Plan(err.to_string())
    }
}

impl From<TemplateError> for ServiceError {
    fn from(err: TemplateError) -> Self {
        ServiceError::Config(err.to_string())
    }
}

impl From<ValidationReport> for ServiceError {
    fn from(report: ValidationReport) -> Self {
        ServiceError::InvalidRequest(report)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("{}", self);
        } else {
            tracing::warn!("{}", self);
        }
        (status, Json(self.to_response_body())).into_response()
    }
}
