// Frontend API: the public verification endpoint in front of the mixer
//
// `anoverif serve` accepts `POST /verify {"idval": ...}` and answers with an
// envelope once the mixer resolves the request. `anoverif verify` is the
// matching client.

use anoverif_core::{MetricsSnapshot, Mixer, VerifyError};
use anyhow::{Context, Result};
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, CONTENT_TYPE,
};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub idval: String,
}

/// Response envelope for every frontend route except health and stats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
}

impl VerifyResponse {
    pub fn ok(result: bool) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            timestamp: unix_timestamp(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
            timestamp: unix_timestamp(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub pending: usize,
}

/// Counters plus table sizes; never table contents
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub pending: usize,
    pub queued: usize,
    pub cache_entries: usize,
    pub uptime_seconds: u64,
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// Client functions for CLI commands

pub async fn verify_via_api(server: &str, idval: &str) -> Result<VerifyResponse> {
    let client = hyper::Client::new();
    let json = serde_json::to_string(&VerifyRequest {
        idval: idval.to_string(),
    })?;

    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("{}/verify", server.trim_end_matches('/')))
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(json))?;

    let resp = client
        .request(req)
        .await
        .with_context(|| format!("Failed to reach {}", server))?;
    let body_bytes = hyper::body::to_bytes(resp.into_body()).await?;
    let response: VerifyResponse =
        serde_json::from_slice(&body_bytes).context("Failed to parse verify response")?;

    Ok(response)
}

// Server implementation

/// Shared state handed to every connection
pub struct FrontendState {
    pub mixer: Arc<Mixer>,
    pub started_at: Instant,
}

impl FrontendState {
    pub fn new(mixer: Arc<Mixer>) -> Self {
        Self {
            mixer,
            started_at: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Connection admission settings
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub connection_timeout: Duration,
}

/// HTTP status for a failed verification
pub fn status_for(err: &VerifyError) -> StatusCode {
    match err {
        VerifyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
        VerifyError::BackendUnavailable(_) | VerifyError::BackendInvalidResponse(_) => {
            StatusCode::BAD_GATEWAY
        }
        VerifyError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        VerifyError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        VerifyError::CorrelationCollision => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Pull the identifier out of a `/verify` body
pub fn parse_verify_body(body: &[u8]) -> Result<String, VerifyError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|_| VerifyError::MalformedRequest("Invalid JSON".to_string()))?;

    let idval = value
        .get("idval")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            VerifyError::MalformedRequest("Missing or invalid 'idval' parameter".to_string())
        })?;

    if idval.is_empty() {
        return Err(VerifyError::MalformedRequest(
            "Empty 'idval' parameter".to_string(),
        ));
    }
    Ok(idval.to_string())
}

fn with_cors(mut response: Response<Body>) -> Response<Body> {
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    with_cors(response)
}

fn error_response(err: &VerifyError) -> Response<Body> {
    json_response(status_for(err), &VerifyResponse::failed(err.public_message()))
}

pub async fn handle_request(
    req: Request<Body>,
    state: Arc<FrontendState>,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::OPTIONS, _) => with_cors(Response::new(Body::empty())),
        (&Method::POST, "/verify") => handle_verify(req, &state).await,
        (&Method::GET, "/health") => handle_health(&state),
        (&Method::GET, "/stats") => handle_stats(&state),
        _ => json_response(StatusCode::NOT_FOUND, &VerifyResponse::failed("Not Found")),
    };
    Ok(response)
}

async fn handle_verify(req: Request<Body>, state: &FrontendState) -> Response<Body> {
    let body_bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("failed to read request body: {}", e);
            return error_response(&VerifyError::MalformedRequest(
                "Invalid JSON".to_string(),
            ));
        }
    };

    let idval = match parse_verify_body(&body_bytes) {
        Ok(idval) => idval,
        Err(err) => return error_response(&err),
    };

    match state.mixer.verify(&idval).await {
        Ok(verification) => json_response(StatusCode::OK, &VerifyResponse::ok(verification.result)),
        Err(err) => {
            debug!(kind = err.kind(), "verification failed");
            error_response(&err)
        }
    }
}

fn handle_health(state: &FrontendState) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &HealthResponse {
            status: "healthy".to_string(),
            uptime_seconds: state.uptime_seconds(),
            pending: state.mixer.pending_len(),
        },
    )
}

fn handle_stats(state: &FrontendState) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &StatsResponse {
            metrics: state.mixer.metrics().snapshot(),
            pending: state.mixer.pending_len(),
            queued: state.mixer.queue_len(),
            cache_entries: state.mixer.cache_len(),
            uptime_seconds: state.uptime_seconds(),
        },
    )
}

/// Accept connections until `shutdown` resolves, one task per connection.
///
/// At most `max_connections` connections are served at once; further
/// clients wait in the listen backlog.
pub async fn run_frontend(
    listener: TcpListener,
    state: Arc<FrontendState>,
    limits: ConnectionLimits,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let slots = Arc::new(Semaphore::new(limits.max_connections));
    tokio::pin!(shutdown);

    info!(
        "Frontend listening on {}",
        listener.local_addr().context("listener has no local address")?
    );

    loop {
        let permit = tokio::select! {
            _ = &mut shutdown => break,
            permit = slots.clone().acquire_owned() => {
                permit.context("connection limiter closed")?
            }
        };

        let stream = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _peer)) => stream,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            },
        };

        let state = state.clone();
        let connection_timeout = limits.connection_timeout;
        tokio::spawn(async move {
            let _permit = permit;
            let service = service_fn(move |req| handle_request(req, state.clone()));
            let connection = Http::new().serve_connection(stream, service);
            match tokio::time::timeout(connection_timeout, connection).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("connection error: {}", e),
                Err(_) => debug!("connection closed after {:?}", connection_timeout),
            }
        });
    }

    info!("Frontend stopped accepting connections");
    Ok(())
}
