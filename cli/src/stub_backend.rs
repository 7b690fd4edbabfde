// Stub verification backend for local testing
//
// Answers `POST /verify {"idval": ...}` the way a real verification service
// would, after a short simulated processing delay. A seeded set of
// identifiers always verifies; anything else verifies at random.

use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Identifiers that always verify
pub const KNOWN_VALID: &[&str] = &[
    "user123",
    "admin456",
    "test_user",
    "valid_id_001",
    "authorized_user",
    "premium_member",
    "verified_account",
];

/// Extra random `user_xxxxxxxx` identifiers seeded at startup
const RANDOM_VALID_COUNT: usize = 50;

/// Chance that an unknown identifier verifies
const DEFAULT_ACCEPT_RATE: f64 = 0.3;

#[derive(Debug, Serialize, Deserialize)]
pub struct StubVerifyResponse {
    pub result: bool,
    pub verified: bool,
    pub timestamp: u64,
    pub processing_time_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StubStats {
    pub total_requests: u64,
    pub verified_true: u64,
    pub verified_false: u64,
    pub true_percentage: f64,
    pub valid_ids: usize,
    pub uptime_seconds: u64,
}

pub struct StubBackend {
    valid: HashSet<String>,
    accept_rate: f64,
    delay_range_ms: (u64, u64),
    total: AtomicU64,
    verified_true: AtomicU64,
    started_at: Instant,
}

impl StubBackend {
    /// Known identifiers plus fresh random ones
    pub fn seeded() -> Self {
        let mut rng = rand::thread_rng();
        let mut valid: HashSet<String> = KNOWN_VALID.iter().map(|id| id.to_string()).collect();
        while valid.len() < KNOWN_VALID.len() + RANDOM_VALID_COUNT {
            valid.insert(format!("user_{:08x}", rng.gen::<u32>()));
        }
        Self::new(valid, DEFAULT_ACCEPT_RATE, (1, 10))
    }

    pub fn new(valid: HashSet<String>, accept_rate: f64, delay_range_ms: (u64, u64)) -> Self {
        Self {
            valid,
            accept_rate: accept_rate.clamp(0.0, 1.0),
            delay_range_ms,
            total: AtomicU64::new(0),
            verified_true: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn valid_count(&self) -> usize {
        self.valid.len()
    }

    /// Decide and count one verification
    pub fn decide(&self, idval: &str) -> bool {
        let verified =
            self.valid.contains(idval) || rand::thread_rng().gen_bool(self.accept_rate);
        self.total.fetch_add(1, Ordering::Release);
        if verified {
            self.verified_true.fetch_add(1, Ordering::Release);
        }
        verified
    }

    pub fn stats(&self) -> StubStats {
        // decide() bumps total first, so reading verified_true first keeps it <= total
        let verified_true = self.verified_true.load(Ordering::Acquire);
        let total = self.total.load(Ordering::Acquire);
        let true_percentage = if total == 0 {
            0.0
        } else {
            verified_true as f64 * 100.0 / total as f64
        };
        StubStats {
            total_requests: total,
            verified_true,
            verified_false: total.saturating_sub(verified_true),
            true_percentage,
            valid_ids: self.valid.len(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    fn sample_delay(&self) -> Duration {
        let (low, high) = self.delay_range_ms;
        Duration::from_millis(rand::thread_rng().gen_range(low..=high.max(low)))
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_json(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &serde_json::json!({ "error": message }))
}

pub async fn handle_stub_request(
    req: Request<Body>,
    backend: Arc<StubBackend>,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/verify") => handle_verify(req, &backend).await,
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "status": "healthy",
                "valid_ids": backend.valid_count(),
            }),
        ),
        (&Method::GET, "/stats") => json_response(StatusCode::OK, &backend.stats()),
        _ => error_json(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

async fn handle_verify(req: Request<Body>, backend: &StubBackend) -> Response<Body> {
    let started = Instant::now();
    let body_bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(_) => return error_json(StatusCode::BAD_REQUEST, "Invalid JSON"),
    };
    let value: serde_json::Value = match serde_json::from_slice(&body_bytes) {
        Ok(value) => value,
        Err(_) => return error_json(StatusCode::BAD_REQUEST, "Invalid JSON"),
    };
    let idval = match value.get("idval").and_then(|v| v.as_str()) {
        Some(idval) => idval,
        None => return error_json(StatusCode::BAD_REQUEST, "Missing 'idval' parameter"),
    };

    tokio::time::sleep(backend.sample_delay()).await;
    let verified = backend.decide(idval);
    debug!(verified, "stub verification");

    json_response(
        StatusCode::OK,
        &StubVerifyResponse {
            result: verified,
            verified,
            timestamp: crate::api::unix_timestamp(),
            processing_time_ms: started.elapsed().as_millis() as u64,
        },
    )
}

/// Serve the stub on an already-bound listener until `shutdown` resolves
pub async fn run_stub_backend(
    listener: std::net::TcpListener,
    backend: Arc<StubBackend>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    listener
        .set_nonblocking(true)
        .context("Failed to configure listener")?;
    let addr = listener.local_addr().context("listener has no local address")?;

    let make_svc = make_service_fn(move |_conn| {
        let backend = backend.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_stub_request(req, backend.clone())))
        }
    });

    let server = Server::from_tcp(listener)
        .context("Failed to start stub backend")?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown);

    info!("Stub backend listening on {}", addr);

    server.await.context("Stub backend error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anoverif_core::{BackendClient, HttpBackendClient, Verification};

    fn strict_backend() -> Arc<StubBackend> {
        let valid = ["user123".to_string()].into_iter().collect();
        Arc::new(StubBackend::new(valid, 0.0, (1, 2)))
    }

    #[test]
    fn test_seeded_set_contains_known_and_random_ids() {
        let backend = StubBackend::seeded();
        assert_eq!(backend.valid_count(), KNOWN_VALID.len() + RANDOM_VALID_COUNT);
        assert!(KNOWN_VALID.iter().all(|id| backend.decide(id)));
    }

    #[test]
    fn test_decide_and_stats() {
        let backend = strict_backend();
        assert!(backend.decide("user123"));
        assert!(!backend.decide("nobody"));
        assert!(!backend.decide("nobody-else"));

        let stats = backend.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.verified_true, 1);
        assert_eq!(stats.verified_false, 2);
        assert!((stats.true_percentage - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_consistent_under_concurrent_decisions() {
        let backend = Arc::new(StubBackend::new(HashSet::new(), 1.0, (1, 1)));
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let backend = backend.clone();
                std::thread::spawn(move || {
                    for i in 0..2000 {
                        backend.decide(&format!("id-{}-{}", t, i));
                    }
                })
            })
            .collect();

        while writers.iter().any(|w| !w.is_finished()) {
            let stats = backend.stats();
            assert!(stats.verified_true <= stats.total_requests);
            assert_eq!(stats.verified_false, stats.total_requests - stats.verified_true);
        }
        for writer in writers {
            writer.join().unwrap();
        }

        let stats = backend.stats();
        assert_eq!(stats.total_requests, 8000);
        assert_eq!(stats.verified_true, 8000);
        assert_eq!(stats.verified_false, 0);
    }

    #[test]
    fn test_accept_rate_one_accepts_everything() {
        let backend = StubBackend::new(HashSet::new(), 1.0, (1, 1));
        assert!((0..20).all(|i| backend.decide(&format!("anyone-{}", i))));
    }

    #[tokio::test]
    async fn test_verify_handler_response_shape() {
        let backend = strict_backend();
        let req = Request::post("/verify")
            .body(Body::from(r#"{"idval":"user123"}"#))
            .unwrap();
        let response = handle_stub_request(req, backend.clone()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body: StubVerifyResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(body.result);
        assert!(body.verified);
        assert!(body.processing_time_ms >= 1);

        let req = Request::post("/verify").body(Body::from("{}")).unwrap();
        let response = handle_stub_request(req, backend).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_http_backend_client_against_stub() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/verify", listener.local_addr().unwrap());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(run_stub_backend(listener, strict_backend(), async move {
            stop_rx.await.ok();
        }));

        let client = HttpBackendClient::new(&url).unwrap();
        assert_eq!(client.verify("user123").await, Ok(Verification::new(true)));
        assert_eq!(client.verify("stranger").await, Ok(Verification::new(false)));
        drop(client);

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
