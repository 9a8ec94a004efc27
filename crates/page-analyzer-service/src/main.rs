use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use page_analyzer_api::{
    AddUrlOutcome, CheckOutcome, FetchConfig, MigrateResult, PageAnalyzerApi, PageFetcher,
    UrlDetail, UrlListing, API_CONTRACT_VERSION, DEFAULT_PAGE_SIZE,
};
use page_analyzer_core::{AddUrlError, CheckError, Notice, StorageError, Url, UrlId};
use page_analyzer_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: PageAnalyzerApi,
    page_size: u32,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    notice: Option<Notice>,
}

#[derive(Debug, Clone, Deserialize)]
struct AddUrlRequest {
    url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ListQuery {
    page: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    schema_version: i64,
}

#[derive(Debug, Clone, Serialize)]
struct AddUrlResponse {
    url: Url,
    notice: Notice,
}

#[derive(Debug, Parser)]
#[command(name = "page-analyzer-service")]
#[command(about = "HTTP service for submitting and checking web pages")]
struct Args {
    #[arg(long, env = "PAGE_ANALYZER_DB", default_value = "./page_analyzer.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "PAGE_ANALYZER_BIND", default_value = "127.0.0.1:7070")]
    bind: SocketAddr,
    #[arg(long, env = "PAGE_ANALYZER_FETCH_TIMEOUT_MS")]
    fetch_timeout_ms: Option<u64>,
    #[arg(long, env = "PAGE_ANALYZER_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u32,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>, notice: Option<Notice>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            notice,
        }
    }

    fn not_found(url_id: UrlId) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("url {url_id} not found"), Some(Notice::url_not_found()))
    }

    fn storage(err: &StorageError) -> Self {
        error!(operation = err.operation, kind = err.kind.as_str(), error = %err, "storage failure");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), Some(Notice::storage_failed()))
    }

    /// Malformed request caught by an extractor; carries no user notice.
    fn rejected(status: StatusCode, message: String) -> Self {
        info!(status_code = status.as_u16(), error = %message, "request rejected");
        Self::new(status, message, None)
    }
}

impl From<AddUrlError> for ServiceError {
    fn from(err: AddUrlError) -> Self {
        match &err {
            AddUrlError::Validation(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string(), Some(err.notice()))
            }
            AddUrlError::Storage(storage) => Self::storage(storage),
        }
    }
}

impl From<CheckError> for ServiceError {
    fn from(err: CheckError) -> Self {
        match &err {
            CheckError::NotFound(url_id) => Self::not_found(*url_id),
            CheckError::Fetch(_) => {
                Self::new(StatusCode::BAD_GATEWAY, err.to_string(), Some(err.notice()))
            }
            CheckError::Storage(storage) => Self::storage(storage),
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        Self::storage(&err)
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::rejected(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(rejection: QueryRejection) -> Self {
        Self::rejected(rejection.status(), rejection.body_text())
    }
}

impl From<PathRejection> for ServiceError {
    fn from(rejection: PathRejection) -> Self {
        Self::rejected(rejection.status(), rejection.body_text())
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run synchronous store work off the async runtime.
async fn blocking<T, F>(state: &ServiceState, work: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&PageAnalyzerApi) -> T + Send + 'static,
{
    let api = state.api.clone();
    tokio::task::spawn_blocking(move || work(&api)).await.map_err(|err| {
        ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("worker task failed: {err}"),
            None,
        )
    })
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/db/schema-version", get(db_schema_version))
        .route("/db/migrate", post(db_migrate))
        .route("/urls", get(urls_index).post(urls_create))
        .route("/urls/:id", get(urls_show).delete(urls_delete))
        .route("/urls/:id/checks", post(checks_create))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let fetcher = PageFetcher::new(&FetchConfig {
        timeout: args.fetch_timeout_ms.map(Duration::from_millis),
        ..FetchConfig::default()
    })?;
    let api = PageAnalyzerApi::new(args.db.clone(), fetcher);

    let migrated = api.migrate(false)?;
    info!(
        db = %args.db.display(),
        schema_version = migrated.after_version.unwrap_or(migrated.current_version),
        "database ready"
    );

    let state = ServiceState { api, page_size: args.page_size };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "page analyzer listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<HealthResponse>>, ServiceError> {
    let status = blocking(&state, PageAnalyzerApi::health).await?.map_err(|err| {
        warn!(error = %err, "health probe failed");
        ServiceError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string(), None)
    })?;
    info!(schema_version = status.current_version, "GET /health");
    Ok(Json(envelope(HealthResponse { status: "ok", schema_version: status.current_version })))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = blocking(&state, PageAnalyzerApi::schema_status).await??;
    info!(
        current_version = status.current_version,
        target_version = status.target_version,
        "GET /db/schema-version"
    );
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    request: Result<Json<MigrateRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let Json(request) = request?;
    let result = blocking(&state, move |api| api.migrate(request.dry_run)).await??;
    info!(
        dry_run = result.dry_run,
        current_version = result.current_version,
        after_version = ?result.after_version,
        "POST /db/migrate"
    );
    Ok(Json(envelope(result)))
}

async fn urls_create(
    State(state): State<ServiceState>,
    request: Result<Json<AddUrlRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<AddUrlResponse>>), ServiceError> {
    let Json(request) = request?;
    let outcome = blocking(&state, move |api| api.add_url(&request.url)).await??;
    let status = if outcome.is_created() { StatusCode::CREATED } else { StatusCode::OK };
    let notice = outcome.notice();
    let url = match outcome {
        AddUrlOutcome::Created { url } | AddUrlOutcome::AlreadyExists { url } => url,
    };
    info!(url_id = %url.id, name = %url.name, status_code = status.as_u16(), "POST /urls");
    Ok((status, Json(envelope(AddUrlResponse { url, notice }))))
}

async fn urls_index(
    State(state): State<ServiceState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<UrlListing>>, ServiceError> {
    let Query(query) = query?;
    let page = query.page.unwrap_or(1);
    let per_page = state.page_size;
    let listing = blocking(&state, move |api| api.list_urls(page, per_page)).await??;
    info!(
        page = listing.pagination.page,
        returned = listing.urls.len(),
        total_items = listing.pagination.total_items,
        "GET /urls"
    );
    Ok(Json(envelope(listing)))
}

async fn urls_show(
    State(state): State<ServiceState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<ServiceEnvelope<UrlDetail>>, ServiceError> {
    let Path(id) = id?;
    let url_id = UrlId(id);
    let Some(detail) = blocking(&state, move |api| api.url_detail(url_id)).await?? else {
        info!(url_id = %url_id, status_code = 404_u16, "GET /urls/:id");
        return Err(ServiceError::not_found(url_id));
    };
    info!(url_id = %url_id, checks = detail.checks.len(), "GET /urls/:id");
    Ok(Json(envelope(detail)))
}

async fn urls_delete(
    State(state): State<ServiceState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<StatusCode, ServiceError> {
    let Path(id) = id?;
    let url_id = UrlId(id);
    let removed = blocking(&state, move |api| api.delete_url(url_id)).await??;
    info!(url_id = %url_id, removed, "DELETE /urls/:id");
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServiceError::not_found(url_id))
    }
}

async fn checks_create(
    State(state): State<ServiceState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<CheckOutcome>>), ServiceError> {
    let Path(id) = id?;
    let url_id = UrlId(id);
    let outcome = state.api.perform_check(url_id).await.map_err(|err| {
        warn!(url_id = %url_id, error = %err, "POST /urls/:id/checks failed");
        ServiceError::from(err)
    })?;
    info!(
        url_id = %url_id,
        status_code = outcome.check.status_code,
        "POST /urls/:id/checks"
    );
    Ok((StatusCode::CREATED, Json(envelope(outcome))))
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("page-analyzer-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state(db_path: PathBuf) -> ServiceState {
        let fetcher = PageFetcher::new(&FetchConfig {
            timeout: Some(Duration::from_secs(5)),
            ..FetchConfig::default()
        })
        .unwrap_or_else(|err| panic!("failed to build fetcher: {err}"));
        ServiceState { api: PageAnalyzerApi::new(db_path, fetcher), page_size: 2 }
    }

    fn remove_db(path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.as_os_str().to_owned();
            file.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(file));
        }
    }

    /// Answer a single GET with a fixed HTML page.
    fn serve_once(status_line: &'static str, body: &'static str) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .unwrap_or_else(|err| panic!("failed to bind test server: {err}"));
        let addr =
            listener.local_addr().unwrap_or_else(|err| panic!("failed to read local addr: {err}"));
        let handle = thread::spawn(move || {
            let (mut stream, _) =
                listener.accept().unwrap_or_else(|err| panic!("failed to accept connection: {err}"));
            let mut buffer = [0_u8; 8192];
            let _ = stream.read(&mut buffer);
            let payload = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(payload.as_bytes());
        });
        (format!("http://{addr}"), handle)
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn send_raw(router: &Router, method: &str, uri: &str, body: &'static str) -> Response {
        let request = Request::builder()
            .uri(uri)
            .method(method)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn assert_error_envelope(value: &serde_json::Value) {
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
        assert!(value["error"].as_str().is_some_and(|error| !error.is_empty()), "{value}");
        assert!(value["notice"].is_null(), "{value}");
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    async fn create_url(router: &Router, raw: &str) -> serde_json::Value {
        let response = send(router, "POST", "/urls", Some(serde_json::json!({ "url": raw }))).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        response_json(response).await
    }

    fn url_id_of(value: &serde_json::Value) -> i64 {
        value["data"]["url"]["id"]
            .as_i64()
            .unwrap_or_else(|| panic!("missing data.url.id in response: {value}"))
    }

    #[tokio::test]
    async fn health_endpoint_probes_database() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let response = send(&router, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
        assert_eq!(value["api_contract_version"], API_CONTRACT_VERSION);
        assert_eq!(value["data"]["status"], "ok");

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn create_url_deduplicates_and_rejects_invalid_input() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let created = create_url(&router, "https://Example.com/path").await;
        assert_eq!(created["data"]["url"]["name"], "https://example.com");
        assert_eq!(created["data"]["notice"]["message"], "Page added successfully");

        let again =
            send(&router, "POST", "/urls", Some(serde_json::json!({ "url": "https://example.com" })))
                .await;
        assert_eq!(again.status(), StatusCode::OK);
        let again = response_json(again).await;
        assert_eq!(again["data"]["notice"]["message"], "Page already exists");
        assert_eq!(url_id_of(&again), url_id_of(&created));

        let invalid =
            send(&router, "POST", "/urls", Some(serde_json::json!({ "url": "not-a-url" }))).await;
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let invalid = response_json(invalid).await;
        assert_eq!(invalid["notice"]["message"], "Incorrect URL");
        assert_eq!(invalid["notice"]["level"], "danger");

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn index_is_paged_most_recent_first() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));
        for host in ["a", "b", "c"] {
            let _ = create_url(&router, &format!("https://{host}.example")).await;
        }

        let first = response_json(send(&router, "GET", "/urls", None).await).await;
        let names = first["data"]["urls"]
            .as_array()
            .unwrap_or_else(|| panic!("missing data.urls: {first}"))
            .iter()
            .filter_map(|item| item["url"]["name"].as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["https://c.example", "https://b.example"]);
        assert_eq!(first["data"]["pagination"]["last_page"], 2);

        let second = response_json(send(&router, "GET", "/urls?page=2", None).await).await;
        assert_eq!(second["data"]["urls"][0]["url"]["name"], "https://a.example");
        assert!(second["data"]["urls"][0]["latest_check"].is_null());

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn check_route_records_fixture_page() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));
        let (base_url, handle) = serve_once(
            "200 OK",
            "<html><head><title>Test page</title><meta name=\"description\" content=\"all right\"></head><body><h1>Test page.</h1></body></html>",
        );

        let id = url_id_of(&create_url(&router, &base_url).await);
        let response = send(&router, "POST", &format!("/urls/{id}/checks"), None).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let value = response_json(response).await;
        assert_eq!(value["data"]["check"]["status_code"], 200);
        assert_eq!(value["data"]["check"]["title"], "Test page");
        assert_eq!(value["data"]["check"]["h1"], "Test page.");
        assert_eq!(value["data"]["check"]["description"], "all right");
        assert_eq!(value["data"]["notice"]["message"], "Page checked successfully");

        let detail = response_json(send(&router, "GET", &format!("/urls/{id}"), None).await).await;
        assert_eq!(detail["data"]["checks"].as_array().map(Vec::len), Some(1));

        handle.join().unwrap_or_else(|_| panic!("test server panicked"));
        remove_db(&db_path);
    }

    #[tokio::test]
    async fn check_route_maps_fetch_failure_and_missing_url() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let unused = TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .unwrap_or_else(|err| panic!("failed to reserve port: {err}"));
        let id = url_id_of(&create_url(&router, &format!("http://{unused}")).await);

        let failed = send(&router, "POST", &format!("/urls/{id}/checks"), None).await;
        assert_eq!(failed.status(), StatusCode::BAD_GATEWAY);
        let failed = response_json(failed).await;
        assert_eq!(failed["notice"]["message"], "Invalid address");

        let detail = response_json(send(&router, "GET", &format!("/urls/{id}"), None).await).await;
        assert_eq!(detail["data"]["checks"].as_array().map(Vec::len), Some(0));

        let missing = send(&router, "POST", "/urls/9999/checks", None).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn show_and_delete_report_missing_urls() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let missing = send(&router, "GET", "/urls/42", None).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(response_json(missing).await["notice"]["message"], "Page not found");

        let id = url_id_of(&create_url(&router, "https://delete.example").await);
        let deleted = send(&router, "DELETE", &format!("/urls/{id}"), None).await;
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
        let again = send(&router, "DELETE", &format!("/urls/{id}"), None).await;
        assert_eq!(again.status(), StatusCode::NOT_FOUND);

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn malformed_requests_use_error_envelope() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let broken_json = send_raw(&router, "POST", "/urls", "{\"url\": ").await;
        assert_eq!(broken_json.status(), StatusCode::BAD_REQUEST);
        assert_error_envelope(&response_json(broken_json).await);

        let missing_field = send_raw(&router, "POST", "/db/migrate", "{}").await;
        assert_eq!(missing_field.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_error_envelope(&response_json(missing_field).await);

        let bad_page = send(&router, "GET", "/urls?page=abc", None).await;
        assert_eq!(bad_page.status(), StatusCode::BAD_REQUEST);
        assert_error_envelope(&response_json(bad_page).await);

        for (method, uri) in [("GET", "/urls/abc"), ("DELETE", "/urls/abc"), ("POST", "/urls/abc/checks")] {
            let bad_id = send(&router, method, uri, None).await;
            assert_eq!(bad_id.status(), StatusCode::BAD_REQUEST, "{method} {uri}");
            assert_error_envelope(&response_json(bad_id).await);
        }

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn schema_routes_report_and_apply_migrations() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let planned = response_json(
            send(&router, "POST", "/db/migrate", Some(serde_json::json!({ "dry_run": true }))).await,
        )
        .await;
        assert_eq!(planned["data"]["dry_run"], true);
        assert_eq!(planned["data"]["would_apply_versions"], serde_json::json!([1, 2]));

        let applied = response_json(
            send(&router, "POST", "/db/migrate", Some(serde_json::json!({ "dry_run": false }))).await,
        )
        .await;
        assert_eq!(applied["data"]["up_to_date"], true);

        let status = response_json(send(&router, "GET", "/db/schema-version", None).await).await;
        assert_eq!(status["data"]["current_version"], 2);
        assert_eq!(status["data"]["pending_versions"], serde_json::json!([]));

        remove_db(&db_path);
    }
}
