use crate::broker::BatchProducer;
use crate::constants::{DRY_RUN_NOTE, SCHEMA_VERSION};
use crate::envelope::{BatchMessage, ErrorDetail};
use crate::error::IngestError;
use crate::validator::{validate_envelope, RequestKind};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use chrono::Utc;
use flate2::read::GzDecoder;
use hyper::Server;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub producer: Arc<dyn BatchProducer>,
    pub max_body_size: usize,
}

/// Body of a successful ingest call.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: String,
    pub schema_version: u32,
    pub request_id: String,
    pub client_request_id: Option<String>,
    pub mb_ip: String,
    pub received: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub errors: Vec<ErrorDetail>,
}

/// Body of a dry-run call: the ingest result plus what was observed about
/// the request itself.
#[derive(Debug, Serialize)]
pub struct TestResponse {
    #[serde(flatten)]
    pub result: IngestResponse,
    pub mode: String,
    pub content_length: usize,
    pub content_encoding: String,
    pub note: String,
}

/// A caller-visible failure; everything carries a machine code and detail.
struct ApiError {
    status: StatusCode,
    code: &'static str,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": "error",
            "code": self.code,
            "detail": self.detail,
        });
        (self.status, Json(body)).into_response()
    }
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "time": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ingest(
    Extension(state): Extension<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match process_request(&state, &headers, caller_ip(&headers, connect), body, RequestKind::Ingest)
        .await
    {
        Ok(outcome) => (StatusCode::ACCEPTED, Json(outcome.result)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn ingest_test(
    Extension(state): Extension<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match process_request(&state, &headers, caller_ip(&headers, connect), body, RequestKind::Test)
        .await
    {
        Ok(outcome) => {
            let mode = if outcome.result.received == 0 {
                "ping"
            } else {
                "validate"
            };
            let response = TestResponse {
                result: outcome.result,
                mode: mode.to_string(),
                content_length: outcome.content_length,
                content_encoding: outcome.content_encoding,
                note: DRY_RUN_NOTE.to_string(),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

struct ProcessOutcome {
    result: IngestResponse,
    content_length: usize,
    content_encoding: String,
}

/// Shared body pipeline for the real and dry-run endpoints. The only policy
/// differences live in `RequestKind` and the final enqueue decision.
async fn process_request(
    state: &AppState,
    headers: &HeaderMap,
    mb_ip: String,
    body: Bytes,
    kind: RequestKind,
) -> Result<ProcessOutcome, ApiError> {
    let content_encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("identity")
        .to_ascii_lowercase();
    let content_length = body.len();

    // Reject oversized payloads before touching the body. The declared
    // length catches them before full decompression.
    let declared: usize = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if declared > state.max_body_size || body.len() > state.max_body_size {
        return Err(ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            "Payload Too Large",
        ));
    }

    let raw_body = if content_encoding == "gzip" {
        match decompress_gzip(&body, state.max_body_size) {
            Ok(bytes) => bytes,
            Err(IngestError::PayloadTooLarge(size)) => {
                return Err(ApiError::new(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "payload_too_large",
                    format!("decompressed payload too large: {} bytes", size),
                ));
            }
            Err(e) => {
                return Err(ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "invalid_gzip",
                    e.to_string(),
                ));
            }
        }
    } else {
        body.to_vec()
    };

    // An empty dry-run body is a connectivity ping; an empty ingest body is
    // just a broken call. Either way it is distinct from envelope validation.
    let document: serde_json::Value = if raw_body.is_empty() {
        match kind {
            RequestKind::Test => serde_json::json!({}),
            RequestKind::Ingest => {
                return Err(ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "empty_body",
                    "request body is empty",
                ));
            }
        }
    } else {
        serde_json::from_slice(&raw_body).map_err(|e| {
            ApiError::new(StatusCode::BAD_REQUEST, "invalid_json", format!("Invalid JSON: {}", e))
        })?
    };

    let validated = validate_envelope(&document, kind).map_err(|e| {
        crate::metrics::ingest::envelope_rejected();
        ApiError::new(StatusCode::BAD_REQUEST, "invalid_envelope", e.to_string())
    })?;

    let request_id = Uuid::new_v4().to_string();
    if kind == RequestKind::Ingest && !validated.items.is_empty() {
        let sent_at = validated.sent_at.ok_or_else(|| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "validated envelope missing sent_at",
            )
        })?;
        let message = BatchMessage {
            request_id: request_id.clone(),
            client_request_id: validated.client_request_id.clone().unwrap_or_default(),
            mb_ip: mb_ip.clone(),
            sent_at,
            items: validated.items.clone(),
        };
        if let Err(e) = state.producer.enqueue(&message).await {
            error!(request_id = %request_id, "Failed to enqueue batch: {}", e);
            crate::metrics::broker::enqueue_failed();
            return Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "enqueue_failed",
                "Internal Server Error",
            ));
        }
    }

    crate::metrics::ingest::envelope_accepted(validated.accepted() as u64);
    crate::metrics::ingest::items_rejected(validated.rejected() as u64);
    info!(
        request_id = %request_id,
        mb_ip = %mb_ip,
        received = validated.received,
        accepted = validated.accepted(),
        rejected = validated.rejected(),
        "Processed request"
    );

    Ok(ProcessOutcome {
        result: IngestResponse {
            status: "ok".to_string(),
            schema_version: validated.schema_version.unwrap_or(SCHEMA_VERSION),
            request_id,
            client_request_id: validated.client_request_id.clone(),
            mb_ip,
            received: validated.received,
            accepted: validated.accepted(),
            rejected: validated.rejected(),
            errors: validated.errors,
        },
        content_length,
        content_encoding,
    })
}

/// Caller address: proxy header first, socket peer as fallback.
fn caller_ip(headers: &HeaderMap, connect: Option<ConnectInfo<SocketAddr>>) -> String {
    if let Some(ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return ip.to_string();
    }
    match connect {
        Some(ConnectInfo(addr)) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Single-layer gzip decompression with a hard cap on the inflated size.
fn decompress_gzip(data: &[u8], cap: usize) -> crate::error::Result<Vec<u8>> {
    use std::io::Read;
    let decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .take(cap as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| IngestError::Decompress(e.to_string()))?;
    if out.len() > cap {
        return Err(IngestError::PayloadTooLarge(out.len()));
    }
    Ok(out)
}

async fn log_requests(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next<axum::body::Body>,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = std::time::Instant::now();
    let response = next.run(req).await;
    info!(
        method = %method,
        path = %path,
        status_code = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );
    response
}

/// Create the HTTP server with all routes
pub fn create_server(producer: Arc<dyn BatchProducer>, max_body_size: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let state = AppState {
        producer,
        max_body_size,
    };

    Router::new()
        .route("/health", get(health))
        .route("/v1/ingest", post(ingest))
        .route("/v1/ingest/test", post(ingest_test))
        .layer(Extension(state))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(axum::middleware::from_fn(log_requests))
        .layer(ServiceBuilder::new().layer(cors))
}

/// Start the HTTP server on the specified address
pub async fn start_server(
    producer: Arc<dyn BatchProducer>,
    max_body_size: usize,
    host: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_server(producer, max_body_size);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    println!("🚀 Ingest API running on http://{}", addr);
    println!("💚 Health check: http://{}/health", addr);
    println!("📥 Ingest:       POST http://{}/v1/ingest", addr);
    println!("🧪 Dry-run:      POST http://{}/v1/ingest/test", addr);

    Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn gzip_roundtrip_respects_cap() {
        let payload = b"{\"items\": []}".repeat(10);
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let out = decompress_gzip(&compressed, 10_000).unwrap();
        assert_eq!(out, payload);

        let err = decompress_gzip(&compressed, 16).unwrap_err();
        assert!(matches!(err, IngestError::PayloadTooLarge(_)));
    }

    #[test]
    fn garbage_gzip_is_rejected() {
        let err = decompress_gzip(b"not gzip at all", 1024).unwrap_err();
        assert!(matches!(err, IngestError::Decompress(_)));
    }
}
