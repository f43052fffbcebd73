//! HTTP front end for the job orchestrator.

use std::future::IntoFuture;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::rejection::{FormRejection, QueryRejection};
use axum::extract::{Form, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::PoolError;
use crate::job::{JobOutput, JobRequest, JobRunner};

const OPENAPI: &str = include_str!("openapi.json");
const LINK: &str = "</openapi.json>; rel=\"service-desc\"";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const MIN_API_KEY_LEN: usize = 16;

#[derive(Clone)]
struct AppState {
    runner: JobRunner,
    api_key: Option<String>,
}

/// Build the application router.
pub fn router(config: &ServerConfig, runner: JobRunner) -> Router {
    let state = AppState {
        runner,
        api_key: config.api_key().map(str::to_string),
    };

    let jobs = Router::new()
        .route(&format!("{}/MaximaPool", config.base_path()), post(create_job))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/openapi.json", get(openapi))
        .merge(jobs)
        .layer(middleware::map_response(add_link_header))
        .with_state(state)
}

/// Serve until SIGINT/SIGTERM, then let in-flight requests finish for at most
/// the configured grace period.
pub async fn serve(config: &ServerConfig, runner: JobRunner) -> Result<()> {
    match config.api_key() {
        None => warn!("server:no API key configured, job route is unauthenticated"),
        Some(key) if key.len() < MIN_API_KEY_LEN => warn!("server:API key is very short"),
        Some(_) => {}
    }

    let addr = format!("{}:{}", config.host(), config.port());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, base_path = %config.base_path(), "server:listening");

    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, router(config, runner))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(());
        })
        .into_future();

    let grace = config.shutdown_grace();
    let deadline = async move {
        match signalled_rx.await {
            Ok(()) => tokio::time::sleep(grace).await,
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = server => result.context("HTTP server failed")?,
        _ = deadline => {
            warn!(grace_ms = grace.as_millis() as u64, "server:grace period elapsed, abandoning in-flight requests");
        }
    }
    info!("server:stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "server:failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "server:failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("server:received Ctrl+C, shutting down"),
        _ = terminate => info!("server:received SIGTERM, shutting down"),
    }
}

/// Job parameters, from the query string and/or an urlencoded body.
#[derive(Debug, Default, Deserialize)]
struct JobParams {
    input: Option<String>,
    timeout: Option<String>,
    ploturlbase: Option<String>,
    version: Option<String>,
}

impl JobParams {
    /// Fields set in `self` win over those in `fallback`.
    fn or(self, fallback: JobParams) -> JobParams {
        JobParams {
            input: self.input.or(fallback.input),
            timeout: self.timeout.or(fallback.timeout),
            ploturlbase: self.ploturlbase.or(fallback.ploturlbase),
            version: self.version.or(fallback.version),
        }
    }

    fn into_request(self) -> Result<JobRequest, PoolError> {
        let input = self
            .input
            .ok_or_else(|| PoolError::InvalidInput("input is required".to_string()))?;
        let timeout_ms = match self.timeout.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_TIMEOUT_MS,
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| PoolError::InvalidInput(format!("malformed timeout '{raw}'")))?,
        };
        Ok(JobRequest {
            input,
            timeout: Some(Duration::from_millis(timeout_ms)),
            plot_url_base: self.ploturlbase.filter(|p| !p.is_empty()),
            version: self.version.filter(|v| !v.is_empty()),
        })
    }
}

async fn create_job(
    State(state): State<AppState>,
    query: Result<Query<JobParams>, QueryRejection>,
    form: Result<Form<JobParams>, FormRejection>,
) -> Response {
    let query = match query {
        Ok(Query(query)) => query,
        Err(e) => return malformed(e.body_text()),
    };
    let params = match form {
        Ok(Form(body)) => body.or(query),
        // No urlencoded body: the query string carries the parameters.
        Err(FormRejection::InvalidFormContentType(_)) => query,
        Err(e) => return malformed(e.body_text()),
    };
    let request = match params.into_request() {
        Ok(request) => request,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let runner = state.runner.clone();
    let outcome = tokio::task::spawn_blocking(move || runner.create_job(&request)).await;
    match outcome {
        Ok(Ok(JobOutput::Text(bytes))) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            bytes,
        )
            .into_response(),
        Ok(Ok(JobOutput::Archive(bytes))) => (
            [
                (header::CONTENT_TYPE, "application/zip"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"output.zip\""),
            ],
            bytes,
        )
            .into_response(),
        Ok(Err(e)) => ApiError::from(e).into_response(),
        Err(e) => {
            warn!(error = %e, "server:job task failed");
            ApiError::internal().into_response()
        }
    }
}

fn malformed(details: String) -> Response {
    ApiError::from(PoolError::InvalidInput(details)).into_response()
}

async fn openapi() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], OPENAPI)
}

async fn add_link_header(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::LINK, HeaderValue::from_static(LINK));
    response
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match state.api_key.as_deref() {
        Some(key) if !is_authorized(request.headers(), key) => {
            warn!(path = %request.uri().path(), "server:rejected unauthenticated request");
            ApiError::unauthorized().into_response()
        }
        _ => next.run(request).await,
    }
}

/// Accepts `X-API-Key: <key>` or HTTP Basic with the key as password.
fn is_authorized(headers: &HeaderMap, key: &str) -> bool {
    if headers
        .get("x-api-key")
        .is_some_and(|v| v.as_bytes() == key.as_bytes())
    {
        return true;
    }

    let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some((scheme, payload)) = auth.split_once(' ') else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return false;
    }
    let Ok(decoded) = STANDARD.decode(payload.trim()) else {
        return false;
    };
    String::from_utf8(decoded)
        .ok()
        .and_then(|pair| pair.split_once(':').map(|(_, password)| password == key))
        .unwrap_or(false)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    errors: Vec<ApiError>,
}

#[derive(Debug, Serialize)]
struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    status: u16,
    code: &'static str,
    title: &'static str,
    details: String,
}

impl ApiError {
    fn new(status_code: StatusCode, code: &'static str, title: &'static str, details: String) -> Self {
        Self {
            status_code,
            status: status_code.as_u16(),
            code,
            title,
            details,
        }
    }

    fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Unauthorized",
            "The request misses a valid API key.".to_string(),
        )
    }

    fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal error",
            "The request could not be processed.".to_string(),
        )
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        let (status, title) = match &err {
            PoolError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "Invalid input"),
            PoolError::NoSnapshotsFound => (StatusCode::RANGE_NOT_SATISFIABLE, "No snapshots"),
            PoolError::VersionNotFound(_) => {
                (StatusCode::RANGE_NOT_SATISFIABLE, "Version not found")
            }
            PoolError::Timeout(_) => (StatusCode::RANGE_NOT_SATISFIABLE, "Timeout"),
            PoolError::ExecutionFailure(_) => {
                (StatusCode::RANGE_NOT_SATISFIABLE, "Execution failed")
            }
            PoolError::Io(_) | PoolError::Persistence(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
            }
        };
        Self::new(status, err.code(), title, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code;
        (status, axum::Json(ErrorBody { errors: vec![self] })).into_response()
    }
}
