// Integration test: HTTP backend client against a local hyper server

use anoverif_core::{BackendClient, BackendError, HttpBackendClient, Verification};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;

/// Serves a canned reply for every request on an ephemeral port.
/// With the `ECHO_IS_USER123` body, the reply's `result` is true only when
/// the posted idval is `user123`.
async fn spawn_backend(status: StatusCode, body: &'static str) -> SocketAddr {
    let make_svc = make_service_fn(move |_conn| async move {
        Ok::<_, Infallible>(service_fn(move |req: Request<Body>| async move {
            let bytes = hyper::body::to_bytes(req.into_body())
                .await
                .unwrap_or_default();
            let posted: serde_json::Value =
                serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
            let reply = if body == "ECHO_IS_USER123" {
                let verified = posted["idval"] == "user123";
                format!(r#"{{"result": {}, "verified": {}}}"#, verified, verified)
            } else {
                body.to_string()
            };
            Ok::<_, Infallible>(
                Response::builder()
                    .status(status)
                    .header("Content-Type", "application/json")
                    .body(Body::from(reply))
                    .unwrap(),
            )
        }))
    });

    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

fn client_for(addr: SocketAddr) -> HttpBackendClient {
    HttpBackendClient::new(&format!("http://{}/verify", addr)).unwrap()
}

#[tokio::test]
async fn test_backend_receives_original_identifier() {
    let addr = spawn_backend(StatusCode::OK, "ECHO_IS_USER123").await;
    let client = client_for(addr);

    assert_eq!(client.verify("user123").await, Ok(Verification::new(true)));
    assert_eq!(client.verify("someone_else").await, Ok(Verification::new(false)));
}

#[tokio::test]
async fn test_missing_result_reads_false() {
    let addr = spawn_backend(StatusCode::OK, r#"{"timestamp": 1700000000}"#).await;
    let client = client_for(addr);

    assert_eq!(client.verify("user123").await, Ok(Verification::new(false)));
}

#[tokio::test]
async fn test_non_json_body_is_invalid_response() {
    let addr = spawn_backend(StatusCode::OK, "<html>maintenance</html>").await;
    let client = client_for(addr);

    assert!(matches!(
        client.verify("user123").await,
        Err(BackendError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let addr = spawn_backend(StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"boom"}"#).await;
    let client = client_for(addr);

    match client.verify("user123").await {
        Err(BackendError::Unavailable(msg)) => assert!(msg.contains("500"), "{}", msg),
        other => panic!("expected Unavailable, got {:?}", other),
    }
}

#[tokio::test]
async fn test_connection_refused_is_unavailable() {
    // Bind then drop to get a port nothing listens on
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let client = client_for(addr);

    assert!(matches!(
        client.verify("user123").await,
        Err(BackendError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_client_is_reused_across_calls() {
    let addr = spawn_backend(StatusCode::OK, r#"{"result": true}"#).await;
    let client = std::sync::Arc::new(client_for(addr));

    let calls = (0..10).map(|_| {
        let client = client.clone();
        async move { client.verify("user123").await }
    });
    let outcomes = futures::future::join_all(calls).await;
    assert!(outcomes
        .into_iter()
        .all(|o| o == Ok(Verification::new(true))));
}
