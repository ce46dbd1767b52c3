//! HTTP query surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/healthz` | Health check (returns version) |
//! | `GET`  | `/search` | Ranked search; `q`/`query`, `dataset`/`table`, `topk`, repeated `filter=field=value` |
//! | `POST` | `/search` | Ranked search; JSON body `{query, dataset, topk, filters, filter}` |
//!
//! A missing dataset uses the server's default namespace and a `topk` of
//! zero or less uses the server's default limit. Every search runs under
//! the configured request timeout.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `timeout` (504), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use csv_search_core::search::{Filter, SearchHit};
use csv_search_core::Error;

use crate::config::Config;
use crate::service::{SearchQuery, Service};

/// Settings of one running server, resolved from config and CLI flags.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub bind: String,
    /// Namespace used when a request names no dataset.
    pub namespace: String,
    pub top_k: usize,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl ServeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind: config.server.bind.clone(),
            namespace: config.select_dataset(None, None).namespace,
            top_k: config.search.default_top_k,
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
            shutdown_timeout: Duration::from_secs(config.server.shutdown_timeout_secs),
        }
    }
}

#[derive(Clone)]
struct AppState {
    service: Service,
    options: Arc<ServeOptions>,
}

/// Build the router without binding it.
pub fn router(service: Service, options: ServeOptions) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let state = AppState {
        service,
        options: Arc::new(options),
    };

    Router::new()
        .route("/healthz", get(handle_health))
        .route("/search", get(handle_search_get).post(handle_search_post))
        .layer(cors)
        .with_state(state)
}

/// Bind `options.bind` and serve until Ctrl-C.
pub async fn run_server(service: Service, options: ServeOptions) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&options.bind).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        namespace = %options.namespace,
        top_k = options.top_k,
        "csv-search server listening"
    );
    serve(listener, service, options, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// In-flight requests get `options.shutdown_timeout` to finish; after that
/// the server future is dropped.
pub async fn serve<F>(
    listener: TcpListener,
    service: Service,
    options: ServeOptions,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let grace = options.shutdown_timeout;
    let (stopping_tx, stopping_rx) = tokio::sync::oneshot::channel::<()>();

    let server = axum::serve(listener, router(service, options))
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("shutdown requested, draining in-flight requests");
            let _ = stopping_tx.send(());
        })
        .into_future();

    let drain_deadline = async move {
        match stopping_rx.await {
            Ok(()) => tokio::time::sleep(grace).await,
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = server => result?,
        _ = drain_deadline => {
            tracing::warn!(grace_secs = grace.as_secs(), "shutdown timeout elapsed, dropping open connections");
        }
    }
    tracing::info!("server stopped");
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::InvalidRequest(_) | Error::Configuration(_) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "search request failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

// ============ GET /healthz ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ /search ============

/// A decoded search request before server defaults are applied.
#[derive(Debug, Default, PartialEq)]
struct RawSearch {
    query: String,
    dataset: String,
    top_k: i64,
    filters: Vec<Filter>,
}

/// Parse `field=value` strings, skipping blank entries.
fn parse_filters<'a>(raw: impl IntoIterator<Item = &'a str>) -> Result<Vec<Filter>, Error> {
    raw.into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Filter::parse)
        .collect()
}

fn decode_query_string(params: &[(String, String)]) -> Result<RawSearch, Error> {
    let first = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| {
                params
                    .iter()
                    .filter(|(k, _)| k == key)
                    .map(|(_, v)| v.trim())
                    .find(|v| !v.is_empty())
            })
            .unwrap_or_default()
            .to_string()
    };

    let raw_top_k = first(&["topk"]);
    let top_k = if raw_top_k.is_empty() {
        0
    } else {
        raw_top_k
            .parse()
            .map_err(|_| Error::invalid_request(format!("invalid topk value {:?}", raw_top_k)))?
    };

    Ok(RawSearch {
        query: first(&["q", "query"]),
        dataset: first(&["dataset", "table"]),
        top_k,
        filters: parse_filters(
            params
                .iter()
                .filter(|(k, _)| k == "filter")
                .map(|(_, v)| v.as_str()),
        )?,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchBody {
    #[serde(default)]
    query: String,
    #[serde(default)]
    dataset: String,
    #[serde(default)]
    topk: i64,
    #[serde(default)]
    filters: BTreeMap<String, String>,
    #[serde(default)]
    filter: Vec<String>,
}

fn decode_body(body: &[u8]) -> Result<RawSearch, Error> {
    let payload: SearchBody = serde_json::from_slice(body)
        .map_err(|e| Error::invalid_request(format!("decode request: {}", e)))?;

    let mut filters = Vec::with_capacity(payload.filters.len() + payload.filter.len());
    for (key, value) in payload.filters {
        let field = key.trim();
        if field.is_empty() {
            return Err(Error::invalid_request("filter key must not be empty"));
        }
        filters.push(Filter::new(field, value));
    }
    filters.extend(parse_filters(payload.filter.iter().map(String::as_str))?);

    Ok(RawSearch {
        query: payload.query.trim().to_string(),
        dataset: payload.dataset.trim().to_string(),
        top_k: payload.topk,
        filters,
    })
}

async fn run_search(state: &AppState, raw: RawSearch) -> Result<Json<Vec<SearchHit>>, AppError> {
    let options = &state.options;
    let query = SearchQuery {
        namespace: if raw.dataset.is_empty() {
            options.namespace.clone()
        } else {
            raw.dataset
        },
        text: raw.query,
        top_k: usize::try_from(raw.top_k)
            .ok()
            .filter(|k| *k > 0)
            .unwrap_or(options.top_k),
        filters: raw.filters,
    };

    let started = Instant::now();
    let hits = state
        .service
        .search(&query, Some(options.request_timeout))
        .await?;
    tracing::info!(
        namespace = %query.namespace,
        top_k = query.top_k,
        filters = query.filters.len(),
        hits = hits.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "search served"
    );
    Ok(Json(hits))
}

/// Decode the query string of `uri`; a malformed one is a bad request.
fn decode_uri(uri: &Uri) -> Result<RawSearch, Error> {
    let Query(params) = Query::<Vec<(String, String)>>::try_from_uri(uri)
        .map_err(|e| Error::invalid_request(format!("decode query string: {}", e)))?;
    decode_query_string(&params)
}

async fn handle_search_get(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Json<Vec<SearchHit>>, AppError> {
    let raw = decode_uri(&uri)?;
    run_search(&state, raw).await
}

async fn handle_search_post(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Vec<SearchHit>>, AppError> {
    let raw = decode_body(&body)?;
    run_search(&state, raw).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::sqlite_store::SqliteStore;
    use csv_search_core::columns::ColumnConfig;
    use csv_search_core::ingest::IngestOptions;
    use std::fs;
    use tempfile::TempDir;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_query_string_aliases_and_filters() {
        let raw = decode_query_string(&pairs(&[
            ("query", "bike"),
            ("table", "items"),
            ("topk", "3"),
            ("filter", "color=red"),
            ("filter", ""),
            ("filter", " size =L=XL"),
        ]))
        .unwrap();
        assert_eq!(raw.query, "bike");
        assert_eq!(raw.dataset, "items");
        assert_eq!(raw.top_k, 3);
        assert_eq!(
            raw.filters,
            vec![Filter::new("color", "red"), Filter::new("size", "L=XL")]
        );

        let raw = decode_query_string(&pairs(&[("q", "a"), ("query", "b")])).unwrap();
        assert_eq!(raw.query, "a");
    }

    #[test]
    fn test_query_string_rejects_bad_topk_and_filter() {
        let err = decode_query_string(&pairs(&[("q", "a"), ("topk", "many")])).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        let err = decode_query_string(&pairs(&[("q", "a"), ("filter", "novalue")])).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_uri_decoding() {
        let uri: Uri = "/search?q=red%20bike&filter=color%3Dred".parse().unwrap();
        let raw = decode_uri(&uri).unwrap();
        assert_eq!(raw.query, "red bike");
        assert_eq!(raw.filters, vec![Filter::new("color", "red")]);

        let raw = decode_uri(&"/search".parse().unwrap()).unwrap();
        assert!(raw.query.is_empty());

        let err = decode_uri(&"/search?q=a&topk=1.5".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_body_decoding() {
        let raw = decode_body(
            br#"{"query":" bike ","dataset":"items","topk":2,"filters":{"color":"red"},"filter":["size=L"]}"#,
        )
        .unwrap();
        assert_eq!(raw.query, "bike");
        assert_eq!(raw.top_k, 2);
        assert_eq!(
            raw.filters,
            vec![Filter::new("color", "red"), Filter::new("size", "L")]
        );

        assert!(decode_body(br#"{"query":"a","limit":3}"#).is_err());
        assert!(decode_body(br#"{"query":"a","filters":{" ":"x"}}"#).is_err());
        assert!(decode_body(b"").is_err());
    }

    async fn start() -> (TempDir, String, tokio::sync::oneshot::Sender<()>) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("app.db")).await.unwrap();
        let service = Service::new(store, Box::new(HashProvider::new(64).unwrap()));

        let csv = tmp.path().join("items.csv");
        fs::write(
            &csv,
            "id,title,color\n1,red bicycle,red\n2,blue bicycle,blue\n3,green car,green\n",
        )
        .unwrap();
        let columns = ColumnConfig {
            id: "id".to_string(),
            text: vec!["title".to_string()],
            ..Default::default()
        };
        service
            .ingest(&IngestOptions::new("items", columns), &csv)
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let options = ServeOptions {
            bind: base.clone(),
            namespace: "items".to_string(),
            top_k: 2,
            request_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(1),
        };
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve(listener, service, options, async {
            let _ = rx.await;
        }));
        (tmp, base, tx)
    }

    #[tokio::test]
    async fn test_http_endpoints() {
        let (_tmp, base, stop) = start().await;
        let client = reqwest::Client::new();

        let health: serde_json::Value = client
            .get(format!("{}/healthz", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let resp = client
            .get(format!("{}/search?q=red+bicycle", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let hits: Vec<serde_json::Value> = resp.json().await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0]["id"], "1");
        assert_eq!(hits[0]["dataset"], "items");

        let resp = client
            .post(format!("{}/search", base))
            .json(&serde_json::json!({"query": "bicycle", "topk": 5, "filters": {"color": "blue"}}))
            .send()
            .await
            .unwrap();
        let hits: Vec<serde_json::Value> = resp.json().await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["id"], "2");

        let resp = client
            .get(format!("{}/search?q=+", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");

        for bad in ["topk=lots&q=a", "q=a&filter=novalue", ""] {
            let resp = client
                .get(format!("{}/search?{}", base, bad))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 400, "query {:?}", bad);
            let body: serde_json::Value = resp.json().await.unwrap();
            assert_eq!(body["error"]["code"], "bad_request", "query {:?}", bad);
            assert!(body["error"]["message"].is_string());
        }

        let resp = client
            .post(format!("{}/search", base))
            .json(&serde_json::json!({"query": "a", "unknown": 1}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let _ = stop.send(());
    }

    #[test]
    fn test_error_status_mapping() {
        let status = |e: Error| AppError::from(e).status;
        assert_eq!(status(Error::invalid_request("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status(Error::configuration("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status(Error::Timeout("x".into())), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status(Error::storage("x")), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status(Error::encoding("x")), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
