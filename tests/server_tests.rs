//! Tests against a real listener, so client addresses come from the socket.
//!
//! Run with: `cargo test --test server_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::{Client, StatusCode, redirect};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use request_guard::rate_limit::RateLimitRules;
use request_guard::{AppState, Config, Quota, build_router};

/// Running server plus a client that never follows redirects.
struct TestServer {
    base_url: String,
    client: Client,
    state: AppState,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let state = AppState::in_memory(config).expect("Failed to build state");
        let app = build_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to ephemeral port");
        let addr = listener.local_addr().expect("Failed to get local address");

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("Server error");
        });

        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build client");

        Self {
            base_url: format!("http://{addr}"),
            client,
            state,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn limited(max: u32) -> Config {
    Config {
        rate_limit_rules: RateLimitRules::new(Quota::new(max, Duration::from_secs(60))),
        ..Config::default()
    }
}

#[tokio::test]
async fn test_health_over_socket() {
    let server = TestServer::start(Config::default()).await;

    let response = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-frame-options"], "DENY");
    assert!(response.headers().contains_key("x-request-id"));

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["rate_limit_store"], "memory");

    let ready = server.client.get(server.url("/ready")).send().await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_forwarded_header_from_untrusted_peer_is_ignored() {
    let server = TestServer::start(limited(2)).await;

    // Each request claims a different origin; the socket peer is what counts
    for i in 0..2 {
        let response = server
            .client
            .get(server.url("/api/posts"))
            .header("x-forwarded-for", format!("203.0.113.{i}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = server
        .client
        .get(server.url("/api/posts"))
        .header("x-forwarded-for", "203.0.113.99")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let records = server
        .state
        .audit
        .search(&request_guard::audit::AuditQuery {
            event: Some(request_guard::AuditEventType::RateLimitExceeded),
            ..Default::default()
        })
        .await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].actor.ip.as_deref(), Some("127.0.0.1"));
}

#[tokio::test]
async fn test_redirect_is_not_followed() {
    let server = TestServer::start(Config::default()).await;

    let response = server
        .client
        .get(server.url("/api/posts?q=%3Cimg%20src%3Dx%20onerror%3Dalert(1)%3E&page=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let location = response.headers()["location"].to_str().unwrap();
    assert!(location.starts_with("/api/posts"));
    assert!(location.contains("page=1"));
    assert!(!location.contains("onerror"));
}

#[tokio::test]
async fn test_form_post_with_body_token() {
    let server = TestServer::start(Config::default()).await;

    let issued = server.client.get(server.url("/api/csrf")).send().await.unwrap();
    assert_eq!(issued.status(), StatusCode::OK);
    let cookie = issued
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap().split(';').next().unwrap().to_string())
        .collect::<Vec<_>>()
        .join("; ");
    let token = issued.json::<Value>().await.unwrap()["token"]
        .as_str()
        .unwrap()
        .to_string();

    // Token only in the JSON body, no header
    let response = server
        .client
        .post(server.url("/api/posts"))
        .header("cookie", &cookie)
        .json(&json!({ "title": "hello", "csrfToken": token }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["post"]["title"], "hello");
    assert!(body["post"].get("csrfToken").is_none());

    // Same request without cookies
    let response = server
        .client
        .post(server.url("/api/posts"))
        .json(&json!({ "title": "hello", "csrfToken": token }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let server = TestServer::start(Config {
        max_request_body_size: 1024,
        ..Config::default()
    })
    .await;

    let response = server
        .client
        .post(server.url("/api/posts"))
        .header("content-type", "application/json")
        .body(format!("{{\"title\":\"{}\"}}", "a".repeat(4096)))
        .send()
        .await
        .unwrap();
    // No token can be read from the oversized body
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
