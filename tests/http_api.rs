use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use connect_transform::{
    archive::{ArchiveError, ArchiveStore, LocalArchive},
    handler::AppState,
    report::TransformationReporter,
    router::create_router,
    rule_registry::RuleRegistry,
    table_id::TableId,
    transformation_engine::TransformationEngine,
    warehouse::{TableColumn, Warehouse, WarehouseError},
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

#[derive(Default)]
struct InMemoryWarehouse {
    tables: HashMap<TableId, Vec<TableColumn>>,
    executed: Mutex<Vec<String>>,
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn table_columns(&self, table: &TableId) -> Result<Vec<TableColumn>, WarehouseError> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| WarehouseError::NotFound(table.clone()))
    }

    async fn execute(&self, sql: &str, _destination: &TableId) -> Result<String, WarehouseError> {
        self.executed.lock().unwrap().push(sql.to_string());
        Ok("job_test".to_string())
    }

    async fn query_row(&self, _sql: &str) -> Result<BTreeMap<String, Value>, WarehouseError> {
        Ok(BTreeMap::new())
    }
}

/// Warehouse that fails every call, for checking the heartbeat stays independent
struct UnreachableWarehouse;

#[async_trait]
impl Warehouse for UnreachableWarehouse {
    async fn table_columns(&self, _table: &TableId) -> Result<Vec<TableColumn>, WarehouseError> {
        Err(WarehouseError::Timeout(0))
    }

    async fn execute(&self, _sql: &str, _destination: &TableId) -> Result<String, WarehouseError> {
        Err(WarehouseError::Timeout(0))
    }

    async fn query_row(&self, _sql: &str) -> Result<BTreeMap<String, Value>, WarehouseError> {
        Err(WarehouseError::Timeout(0))
    }
}

struct UnreachableArchive;

#[async_trait]
impl ArchiveStore for UnreachableArchive {
    async fn store(&self, name: &str, _content: &str) -> Result<String, ArchiveError> {
        Err(ArchiveError::InvalidLocation(name.to_string()))
    }

    fn location(&self) -> String {
        "nowhere".to_string()
    }
}

fn app(warehouse: Arc<dyn Warehouse>, archive: Arc<dyn ArchiveStore>) -> Router {
    let engine = TransformationEngine::new(
        Arc::new(RuleRegistry::embedded().unwrap()),
        warehouse,
        archive,
        TransformationReporter::new("connect-transform-test"),
    );
    create_router(Arc::new(AppState { engine }))
}

fn module1_warehouse() -> Arc<InMemoryWarehouse> {
    let columns = ["Connect_ID", "D_111111111_V2", "D_222222222_1_1", "D_222222222_1_1_1"]
        .iter()
        .map(|name| TableColumn::new(*name, "STRING"))
        .collect();
    Arc::new(InMemoryWarehouse {
        tables: HashMap::from([(TableId::new("p", "FlatConnect", "module1"), columns)]),
        ..InMemoryWarehouse::default()
    })
}

async fn post(app: Router, uri: &str, body: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn heartbeat_is_independent_of_backends() {
    let app = app(Arc::new(UnreachableWarehouse), Arc::new(UnreachableArchive));
    let response = app
        .oneshot(Request::builder().uri("/heartbeat").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "connect-transform-test");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn source_equal_to_destination_is_a_client_error() {
    let warehouse = module1_warehouse();
    let archive = Arc::new(UnreachableArchive);
    let (status, body) = post(
        app(warehouse.clone(), archive),
        "/clean_columns",
        r#"{"source": "p.FlatConnect.module1", "destination": "p.FlatConnect.module1"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
    assert_eq!(body["details"][0]["field_path"], "destination");
    assert!(warehouse.executed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_json_is_a_client_error() {
    let (status, body) = post(
        app(module1_warehouse(), Arc::new(UnreachableArchive)),
        "/clean_rows",
        r#"{"source": "p.FlatConnect.module1", "destination": "#,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "malformed_body");
}

#[tokio::test]
async fn clean_columns_runs_and_archives() {
    let dir = tempfile::tempdir().unwrap();
    let warehouse = module1_warehouse();
    let archive = Arc::new(LocalArchive::new(dir.path()));

    let (status, body) = post(
        app(warehouse.clone(), archive),
        "/clean_columns",
        r#"{"source": "p.FlatConnect.module1", "destination": "p.CleanConnect.module1"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["destination"], "p.CleanConnect.module1");
    assert_eq!(body["service"], "connect-transform-test");
    assert_eq!(body["summary"]["operation"], "clean_columns");
    assert_eq!(body["summary"]["loop_groups"], 1);

    let executed = warehouse.executed.lock().unwrap().clone();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("D_111111111_V2 AS d_111111111_v2"));
    assert!(executed[0].contains("COALESCE(D_222222222_1_1, D_222222222_1_1_1) AS d_222222222_1"));

    let path = body["submitted_sql_path"].as_str().unwrap();
    assert_eq!(std::fs::read_to_string(path).unwrap(), executed[0]);
}

#[tokio::test]
async fn archive_failure_still_succeeds() {
    let (status, body) = post(
        app(module1_warehouse(), Arc::new(UnreachableArchive)),
        "/clean_columns",
        r#"{"source": "p.FlatConnect.module1", "destination": "p.CleanConnect.module1"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["submitted_sql_path"], Value::Null);
}

#[tokio::test]
async fn merge_requires_two_sources() {
    let (status, body) = post(
        app(module1_warehouse(), Arc::new(UnreachableArchive)),
        "/merge_table_versions",
        &json!({"source": ["p.FlatConnect.module1"], "destination": "p.FlatConnect.merged"})
            .to_string(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["field_path"], "source");
}

#[tokio::test]
async fn unknown_source_is_not_found() {
    let (status, body) = post(
        app(module1_warehouse(), Arc::new(UnreachableArchive)),
        "/clean_rows",
        r#"{"source": "p.FlatConnect.module9", "destination": "p.CleanConnect.module9"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "source_not_found");
}

#[tokio::test]
async fn warehouse_outage_is_a_bad_gateway() {
    let (status, body) = post(
        app(Arc::new(UnreachableWarehouse), Arc::new(UnreachableArchive)),
        "/clean_columns",
        r#"{"source": "p.FlatConnect.module1", "destination": "p.CleanConnect.module1"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "warehouse_error");
}
