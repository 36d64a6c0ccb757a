use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use crate::{
    auth::{AccessTokenSource, AuthError},
    table_id::TableId,
};

const BIGQUERY_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
/// Server-side wait per `queries` / `getQueryResults` call
const POLL_TIMEOUT_MS: u64 = 10_000;
const MAX_POLLS: usize = 360;

/// A column as reported by table metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    pub name: String,
    pub data_type: String,
}

impl TableColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }

    pub fn is_string(&self) -> bool {
        self.data_type.eq_ignore_ascii_case("STRING")
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("Table {0} was not found")]
    NotFound(TableId),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Warehouse request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Warehouse returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Query did not finish after {0} polls")]
    Timeout(usize),

    #[error("Unexpected warehouse response: {0}")]
    UnexpectedResponse(String),
}

/// Metadata reads and statement execution against BigQuery
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Column names and types of a table, in table order
    async fn table_columns(&self, table: &TableId) -> Result<Vec<TableColumn>, WarehouseError>;

    /// Run a statement that writes `destination`; returns the job ID
    async fn execute(&self, sql: &str, destination: &TableId) -> Result<String, WarehouseError>;

    /// Run a query expected to return a single row, keyed by column name
    async fn query_row(&self, sql: &str) -> Result<BTreeMap<String, Value>, WarehouseError>;
}

/// BigQuery over its v2 REST API
pub struct BigQueryClient {
    client: Client,
    tokens: AccessTokenSource,
    project: String,
    location: Option<String>,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TableResource {
    schema: Option<TableSchema>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type", default)]
    field_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: bool,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<ResultRow>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultRow {
    #[serde(default)]
    f: Vec<ResultCell>,
}

#[derive(Debug, Deserialize)]
struct ResultCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

impl BigQueryClient {
    pub fn new(client: Client, tokens: AccessTokenSource, project: impl Into<String>) -> Self {
        Self {
            client,
            tokens,
            project: project.into(),
            location: None,
            base_url: BIGQUERY_BASE_URL.to_string(),
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Run a query to completion, polling until the job reports done
    async fn run_query(&self, sql: &str) -> Result<QueryResponse, WarehouseError> {
        let token = self.tokens.token().await?;
        let url = format!("{}/projects/{}/queries", self.base_url, self.project);
        let body = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            timeout_ms: POLL_TIMEOUT_MS,
            location: self.location.as_deref(),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        let mut result: QueryResponse = read_json(response).await?;

        let mut polls = 0;
        while !result.job_complete {
            polls += 1;
            if polls > MAX_POLLS {
                return Err(WarehouseError::Timeout(MAX_POLLS));
            }
            let job = result.job_reference.clone().ok_or_else(|| {
                WarehouseError::UnexpectedResponse("incomplete job without a reference".to_string())
            })?;
            tracing::debug!("Waiting on job {} (poll {})", job.job_id, polls);
            result = self.poll(&token, &job).await?;
        }

        // fatal errors arrive as HTTP failures; these are informational
        for error in &result.errors {
            tracing::warn!("Query reported: {}", error.message);
        }
        Ok(result)
    }

    async fn poll(&self, token: &str, job: &JobReference) -> Result<QueryResponse, WarehouseError> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.base_url, job.project_id, job.job_id
        );
        let mut query: Vec<(&str, String)> = vec![("timeoutMs", POLL_TIMEOUT_MS.to_string())];
        if let Some(location) = job.location.as_ref().or(self.location.as_ref()) {
            query.push(("location", location.clone()));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&query)
            .send()
            .await?;
        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, WarehouseError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(WarehouseError::Api {
            status: status.as_u16(),
            message: error_message(&text),
        });
    }
    Ok(response.json().await?)
}

/// The `error.message` of a Google API error body, or the body itself
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| body.to_string())
}

fn first_row(response: QueryResponse) -> Result<BTreeMap<String, Value>, WarehouseError> {
    let fields = response
        .schema
        .map(|schema| schema.fields)
        .ok_or_else(|| WarehouseError::UnexpectedResponse("query result has no schema".to_string()))?;
    let row = response.rows.into_iter().next().ok_or_else(|| {
        WarehouseError::UnexpectedResponse("query returned no rows".to_string())
    })?;

    Ok(fields
        .into_iter()
        .zip(row.f)
        .map(|(field, cell)| (field.name, cell.v))
        .collect())
}

#[async_trait]
impl Warehouse for BigQueryClient {
    async fn table_columns(&self, table: &TableId) -> Result<Vec<TableColumn>, WarehouseError> {
        let token = self.tokens.token().await?;
        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            self.base_url, table.project, table.dataset, table.table
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .query(&[("fields", "schema")])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(WarehouseError::NotFound(table.clone()));
        }

        let resource: TableResource = read_json(response).await?;
        let fields = resource.schema.map(|schema| schema.fields).unwrap_or_default();
        tracing::debug!("{} has {} columns", table, fields.len());
        Ok(fields
            .into_iter()
            .map(|field| TableColumn::new(field.name, field.field_type))
            .collect())
    }

    async fn execute(&self, sql: &str, destination: &TableId) -> Result<String, WarehouseError> {
        tracing::info!("Executing {} byte statement for {}", sql.len(), destination);
        let result = self.run_query(sql).await?;
        let job_id = result
            .job_reference
            .map(|job| job.job_id)
            .unwrap_or_default();
        tracing::info!("Job {} finished for {}", job_id, destination);
        Ok(job_id)
    }

    async fn query_row(&self, sql: &str) -> Result<BTreeMap<String, Value>, WarehouseError> {
        let result = self.run_query(sql).await?;
        first_row(result)
    }
}

impl std::fmt::Debug for BigQueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryClient")
            .field("project", &self.project)
            .field("location", &self.location)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Default per-request timeout for the shared HTTP client
pub fn http_timeout() -> Duration {
    Duration::from_millis(POLL_TIMEOUT_MS * 3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_row_zips_schema_and_cells() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobReference": {"projectId": "p", "jobId": "job_1", "location": "US"},
            "jobComplete": true,
            "schema": {"fields": [
                {"name": "d_111111111", "type": "BOOLEAN"},
                {"name": "d_222222222", "type": "BOOLEAN"}
            ]},
            "rows": [{"f": [{"v": "true"}, {"v": "false"}]}]
        }))
        .unwrap();

        let row = first_row(response).unwrap();
        assert_eq!(row["d_111111111"], json!("true"));
        assert_eq!(row["d_222222222"], json!("false"));
    }

    #[test]
    fn test_first_row_requires_rows() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "schema": {"fields": [{"name": "a", "type": "STRING"}]}
        }))
        .unwrap();
        assert!(matches!(
            first_row(response),
            Err(WarehouseError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_error_message_prefers_api_message() {
        let body = r#"{"error": {"code": 400, "message": "Syntax error: Unexpected keyword", "status": "INVALID_ARGUMENT"}}"#;
        assert_eq!(error_message(body), "Syntax error: Unexpected keyword");
        assert_eq!(error_message("bad gateway"), "bad gateway");
    }

    #[test]
    fn test_query_request_body() {
        let body = serde_json::to_value(QueryRequest {
            query: "SELECT 1",
            use_legacy_sql: false,
            timeout_ms: POLL_TIMEOUT_MS,
            location: None,
        })
        .unwrap();
        assert_eq!(
            body,
            json!({"query": "SELECT 1", "useLegacySql": false, "timeoutMs": 10000})
        );
    }

    #[test]
    fn test_table_schema_columns() {
        let resource: TableResource = serde_json::from_value(json!({
            "schema": {"fields": [
                {"name": "Connect_ID", "type": "STRING", "mode": "NULLABLE"},
                {"name": "d_111111111", "type": "INTEGER"}
            ]}
        }))
        .unwrap();
        let fields = resource.schema.unwrap().fields;
        assert_eq!(fields[0].name, "Connect_ID");
        assert_eq!(fields[1].field_type, "INTEGER");
        assert!(TableColumn::new("x", "string").is_string());
    }
}
