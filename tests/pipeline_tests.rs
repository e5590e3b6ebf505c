//! End-to-end tests of the full router driven in-process with `oneshot`.
//!
//! Requests carry no peer address, so the client IP comes from
//! `X-Forwarded-For`. Time is driven by a `ManualClock`.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use request_guard::audit::{AlertError, AuditRecord, FnAlert};
use request_guard::clock::ManualClock;
use request_guard::identity::Identity;
use request_guard::rate_limit::{
    MemoryRateLimitStore, RateLimitEntry, RateLimitRules, RateLimitStore,
};
use request_guard::{AppState, Config, Environment, Quota, SecurityError, build_router};

const START_MS: u64 = 1_700_000_000_000;

struct TestApp {
    state: AppState,
    router: Router,
    clock: Arc<ManualClock>,
}

impl TestApp {
    fn new(config: Config) -> Self {
        Self::with_store(config, Arc::new(MemoryRateLimitStore::new()))
    }

    fn with_store(config: Config, store: Arc<dyn RateLimitStore>) -> Self {
        let clock = ManualClock::new(START_MS);
        let state = AppState::new(config, clock.clone(), store).unwrap();
        let router = build_router(state.clone());
        Self {
            state,
            router,
            clock,
        }
    }

    async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(req).await.unwrap()
    }

    /// Fetch a token and return (cookie header, token).
    async fn csrf_session(&self, extra_cookie: Option<&str>) -> (String, String) {
        let mut builder = get("/api/csrf");
        if let Some(cookie) = extra_cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        let response = self.send(builder.body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let mut cookies = set_cookie_pairs(&response);
        if let Some(cookie) = extra_cookie {
            cookies.push(cookie.to_string());
        }
        let body = body_json(response).await;
        (cookies.join("; "), body["token"].as_str().unwrap().to_string())
    }
}

fn config_with_limit(max: u32, window: Duration) -> Config {
    Config {
        rate_limit_rules: RateLimitRules::new(Quota::new(max, window)),
        ..Config::default()
    }
}

fn get(uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("x-forwarded-for", "198.51.100.20")
}

fn post_json(uri: &str, cookie: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("x-forwarded-for", "198.51.100.20")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, cookie);
    if let Some(token) = token {
        builder = builder.header("x-csrf-token", token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

/// `name=value` parts of every Set-Cookie header.
fn set_cookie_pairs(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().split(';').next().unwrap().to_string())
        .collect()
}

async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn assert_security_headers(response: &Response<Body>) {
    let headers = response.headers();
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-xss-protection"], "1; mode=block");
    assert_eq!(headers["referrer-policy"], "strict-origin-when-cross-origin");
    assert!(headers.contains_key("permissions-policy"));
    assert!(headers.contains_key("content-security-policy"));
    let response_time = headers["x-response-time"].to_str().unwrap();
    assert!(response_time.ends_with("ms"));
    assert!(response_time.trim_end_matches("ms").parse::<u64>().is_ok());
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test]
async fn test_sixth_request_is_rate_limited() {
    let app = TestApp::new(config_with_limit(5, Duration::from_secs(60)));

    for _ in 0..5 {
        let response = app.send(get("/api/posts").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.send(get("/api/posts").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    assert_eq!(response.headers()["retry-after"], "60");
    assert_security_headers(&response);

    let request_id = response.headers()["x-request-id"].to_str().unwrap().to_string();
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("Too many requests"));
    assert_eq!(body["retryAfter"], 60);
    assert_eq!(body["correlationId"], request_id.as_str());
}

#[tokio::test]
async fn test_window_resets() {
    let app = TestApp::new(config_with_limit(2, Duration::from_secs(1)));
    let request = || get("/api/posts").body(Body::empty()).unwrap();

    assert_eq!(app.send(request()).await.status(), StatusCode::OK);
    assert_eq!(app.send(request()).await.status(), StatusCode::OK);
    let limited = app.send(request()).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.headers()["retry-after"], "1");

    app.clock.advance(Duration::from_millis(1001));
    assert_eq!(app.send(request()).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_clients_and_routes_do_not_share_counters() {
    let config = Config {
        rate_limit_rules: RateLimitRules::new(Quota::new(1, Duration::from_secs(60)))
            .with_rule("/health", Quota::new(1, Duration::from_secs(60))),
        ..Config::default()
    };
    let app = TestApp::new(config);

    let from = |ip: &str, uri: &str| {
        Request::builder()
            .uri(uri)
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(app.send(from("10.1.1.1", "/api/posts")).await.status(), StatusCode::OK);
    assert_eq!(app.send(from("10.2.2.2", "/api/posts")).await.status(), StatusCode::OK);
    assert_eq!(app.send(from("10.1.1.1", "/health")).await.status(), StatusCode::OK);
    assert_eq!(
        app.send(from("10.1.1.1", "/api/posts")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_verified_user_keyed_by_id_across_addresses() {
    let app = TestApp::new(config_with_limit(2, Duration::from_secs(60)));
    app.state.identity.login("sess-verified", Identity::user("u1", true));
    app.state.identity.login("sess-unverified", Identity::user("u2", false));

    let from = |ip: &str, session: &str| {
        Request::builder()
            .uri("/api/posts")
            .header("x-forwarded-for", ip)
            .header(header::COOKIE, format!("session={session}"))
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(app.send(from("10.0.0.1", "sess-verified")).await.status(), StatusCode::OK);
    assert_eq!(app.send(from("10.0.0.2", "sess-verified")).await.status(), StatusCode::OK);
    assert_eq!(
        app.send(from("10.0.0.3", "sess-verified")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    // Unverified e-mail falls back to the client address
    for ip in ["10.0.1.1", "10.0.1.2", "10.0.1.3"] {
        assert_eq!(app.send(from(ip, "sess-unverified")).await.status(), StatusCode::OK);
    }
}

struct FailingStore;

#[async_trait]
impl RateLimitStore for FailingStore {
    async fn hit(
        &self,
        _identifier: &str,
        _limit: u32,
        _window_ms: u64,
        _now: u64,
    ) -> Result<RateLimitEntry, SecurityError> {
        Err(SecurityError::Store {
            store: "failing",
            message: "connection refused".to_string(),
        })
    }

    async fn sweep(&self, _now: u64) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

#[tokio::test]
async fn test_counter_store_outage_fails_open() {
    let app = TestApp::with_store(
        config_with_limit(1, Duration::from_secs(60)),
        Arc::new(FailingStore),
    );

    for _ in 0..3 {
        let response = app.send(get("/api/posts").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .send(get("/api/audit/recent?event=STORE_UNAVAILABLE").body(Body::empty()).unwrap())
        .await;
    let body = body_json(response).await;
    assert!(body["count"].as_u64().unwrap() >= 3);
    assert_eq!(body["records"][0]["context"]["policy"], "fail_open");

    let ready = app.send(get("/ready").body(Body::empty()).unwrap()).await;
    assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// =============================================================================
// CSRF
// =============================================================================

#[tokio::test]
async fn test_post_without_token_is_forbidden_and_audited() {
    let app = TestApp::new(Config::default());

    let response = app
        .send(post_json("/api/posts", "", None, &json!({"title": "hi"})))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_security_headers(&response);

    let request_id = response.headers()["x-request-id"].to_str().unwrap().to_string();
    let body = body_json(response).await;
    assert_eq!(body["code"], "CSRF_VALIDATION_FAILED");
    assert_eq!(body["correlationId"], request_id.as_str());

    let audit = app
        .send(get("/api/audit/recent?event=CSRF_VIOLATION").body(Body::empty()).unwrap())
        .await;
    let audit = body_json(audit).await;
    assert_eq!(audit["count"], 1);
    assert_eq!(audit["records"][0]["context"]["reason"], "missing_session_cookie");
    assert_eq!(audit["records"][0]["context"]["correlationId"], request_id.as_str());
    assert_eq!(audit["records"][0]["actor"]["ip"], "198.51.100.20");
}

#[tokio::test]
async fn test_token_flow_and_json_sanitization() {
    let app = TestApp::new(Config::default());
    let (cookie, token) = app.csrf_session(None).await;
    assert_eq!(token.len(), 64);

    let response = app
        .send(post_json(
            "/api/posts",
            &cookie,
            Some(&token),
            &json!({
                "title": "<script>alert(1)</script>Hello",
                "link": "javascript:alert(1)",
                "views": 3,
                "_csrf": token,
            }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_security_headers(&response);

    let body = body_json(response).await;
    assert_eq!(body["post"]["title"], "Hello");
    assert_eq!(body["post"]["link"], "");
    assert_eq!(body["post"]["views"], 3);
    assert!(body["post"].get("_csrf").is_none());
}

#[tokio::test]
async fn test_token_is_reused_within_session() {
    let app = TestApp::new(Config::default());
    let (cookie, token) = app.csrf_session(None).await;
    let (_, again) = app.csrf_session(Some(&cookie)).await;
    assert_eq!(token, again);
}

#[tokio::test]
async fn test_token_from_other_session_is_rejected() {
    let app = TestApp::new(Config::default());
    let (cookie_a, _token_a) = app.csrf_session(None).await;
    let (_cookie_b, token_b) = app.csrf_session(None).await;

    // Session A's cookies with session B's token in both cookie and header
    let session_a = cookie_a
        .split("; ")
        .find(|c| c.starts_with("csrf-session="))
        .unwrap();
    let forged = format!("{session_a}; csrf-token={token_b}");

    let response = app
        .send(post_json("/api/posts", &forged, Some(&token_b), &json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_rotation_invalidates_previous_token() {
    let app = TestApp::new(Config::default());
    let (cookie, token) = app.csrf_session(None).await;

    let rotated = app
        .send(
            Request::builder()
                .method(Method::DELETE)
                .uri("/api/csrf")
                .header("x-forwarded-for", "198.51.100.20")
                .header(header::COOKIE, &cookie)
                .header("x-csrf-token", &token)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(rotated.status(), StatusCode::OK);
    let new_cookie = set_cookie_pairs(&rotated).join("; ");
    let new_token = body_json(rotated).await["token"].as_str().unwrap().to_string();
    assert_ne!(new_token, token);

    let stale = app
        .send(post_json("/api/posts", &cookie, Some(&token), &json!({})))
        .await;
    assert_eq!(stale.status(), StatusCode::FORBIDDEN);

    let fresh = app
        .send(post_json("/api/posts", &new_cookie, Some(&new_token), &json!({})))
        .await;
    assert_eq!(fresh.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_login_requires_new_token() {
    let app = TestApp::new(Config::default());
    let (cookie, token) = app.csrf_session(None).await;

    app.state.identity.login("app-session", Identity::user("u9", true));
    let logged_in = format!("{cookie}; session=app-session");

    let response = app
        .send(post_json("/api/posts", &logged_in, Some(&token), &json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let (cookie, new_token) = app.csrf_session(Some("session=app-session")).await;
    assert_ne!(new_token, token);
    let response = app
        .send(post_json("/api/posts", &cookie, Some(&new_token), &json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let config = Config {
        csrf_token_ttl: Duration::from_secs(60),
        ..Config::default()
    };
    let app = TestApp::new(config);
    let (cookie, token) = app.csrf_session(None).await;

    app.clock.advance(Duration::from_secs(61));
    let response = app
        .send(post_json("/api/posts", &cookie, Some(&token), &json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_exempt_paths_skip_csrf() {
    let app = TestApp::new(Config::default());
    let response = app
        .send(post_json("/api/auth/signin", "", None, &json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_security_headers(&response);
}

// =============================================================================
// Query sanitization and alerts
// =============================================================================

#[tokio::test]
async fn test_script_in_query_redirects_to_clean_url() {
    let app = TestApp::new(Config::default());
    let alerts = Arc::new(AtomicUsize::new(0));
    let counter = alerts.clone();
    app.state
        .audit
        .register_alert_callback(Arc::new(FnAlert::new(
            "count",
            move |_record: Arc<AuditRecord>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), AlertError>(())
                }
            },
        )));

    let response = app
        .send(
            get("/api/posts?search=%3Cscript%3Ealert(1)%3C%2Fscript%3E")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_security_headers(&response);
    // CRITICAL alerts are delivered before the response is produced
    assert_eq!(alerts.load(Ordering::SeqCst), 1);

    let location = response.headers()[header::LOCATION].to_str().unwrap().to_string();
    assert!(location.starts_with("/api/posts"));
    assert!(!location.to_lowercase().contains("script"));
    assert!(!location.contains("alert"));

    let followed = app.send(get(&location).body(Body::empty()).unwrap()).await;
    assert_eq!(followed.status(), StatusCode::OK);
    let body = body_json(followed).await;
    let search = body["query"]["search"].as_str().unwrap_or_default();
    assert!(!search.contains('<'));
    assert!(!search.contains("alert"));
}

#[tokio::test]
async fn test_clean_query_passes_through() {
    let app = TestApp::new(Config::default());
    let response = app
        .send(get("/api/posts?search=rust%20axum&page=2").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["query"]["search"], "rust axum");
    assert_eq!(body["query"]["page"], "2");
}

// =============================================================================
// Route classification and headers
// =============================================================================

#[tokio::test]
async fn test_static_assets_bypass_pipeline() {
    let app = TestApp::new(config_with_limit(1, Duration::from_secs(60)));
    for _ in 0..3 {
        let response = app
            .send(get("/_next/static/chunks/main.js").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("x-frame-options").is_none());
        assert!(response.headers().get("x-response-time").is_none());
    }
}

#[tokio::test]
async fn test_csp_follows_environment() {
    let dev = TestApp::new(Config::default());
    let response = dev.send(get("/health").body(Body::empty()).unwrap()).await;
    let csp = response.headers()["content-security-policy"].to_str().unwrap().to_string();
    assert!(csp.contains("unsafe-eval"));
    assert!(csp.contains("unsafe-inline"));

    let prod = TestApp::new(Config {
        environment: Environment::Production,
        ..Config::default()
    });
    let response = prod.send(get("/health").body(Body::empty()).unwrap()).await;
    let csp = response.headers()["content-security-policy"].to_str().unwrap().to_string();
    assert!(!csp.contains("unsafe-eval"));
    assert!(!csp.contains("unsafe-inline"));
    assert!(csp.contains("upgrade-insecure-requests"));
}

#[tokio::test]
async fn test_production_cookies_are_secure() {
    let app = TestApp::new(Config {
        environment: Environment::Production,
        ..Config::default()
    });
    let response = app.send(get("/api/csrf").body(Body::empty()).unwrap()).await;
    let cookies: Vec<_> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(cookies.len(), 2);
    assert!(cookies.iter().all(|c| c.contains("Secure") && c.contains("SameSite=Strict")));
    assert!(cookies.iter().any(|c| c.starts_with("csrf-session=") && c.contains("HttpOnly")));
    assert!(
        cookies
            .iter()
            .any(|c| c.starts_with("csrf-token=") && !c.contains("HttpOnly"))
    );
    assert_eq!(response.headers()["x-csrf-token"].len(), 64);
}

#[tokio::test]
async fn test_audit_api_can_be_disabled() {
    let app = TestApp::new(Config {
        audit_api_enabled: false,
        ..Config::default()
    });
    let response = app
        .send(get("/api/audit/recent").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
