use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tower::ServiceExt;
use uuid::Uuid;

use slotbook_api::middleware::Claims;
use slotbook_api::webhooks::SIGNATURE_HEADER;
use slotbook_api::{app, AppState, Ports};
use slotbook_booking::{InMemoryBookingStore, MockPaymentGateway, NotificationDispatcher, WebhookVerifier};
use slotbook_core::{InMemoryCache, SystemClock};
use slotbook_shared::models::events::NotificationRequest;
use slotbook_store::app_config::Config;

const JWT_SECRET: &str = "test-jwt-secret";
const WEBHOOK_SECRET: &str = "whsec_test";

fn test_config(checkout_per_ip: i64) -> Config {
    let generous = json!({ "per_user": 100, "per_ip": 100, "global": 1000, "window_seconds": 60 });
    serde_json::from_value(json!({
        "server": { "port": 0 },
        "database": { "url": "postgres://unused" },
        "redis": { "url": "redis://unused" },
        "cache": { "max_retries": 0, "retry_backoff_ms": 0 },
        "kafka": { "brokers": "unused", "notification_topic": "unused" },
        "auth": { "jwt_secret": JWT_SECRET },
        "gateway": {
            "webhook_secret": WEBHOOK_SECRET,
            "signature_tolerance_seconds": 300,
            "checkout_base_url": "https://pay.test/checkout"
        },
        "business_rules": {
            "hold_ttl_seconds": 600,
            "idempotency_ttl_seconds": 900,
            "webhook_dedup_ttl_seconds": 3600
        },
        "rate_limits": {
            "checkout": { "per_user": 100, "per_ip": checkout_per_ip, "global": 1000, "window_seconds": 60 },
            "approval": generous,
            "release": generous
        },
        "refunds": { "base_backoff_seconds": 30, "max_backoff_seconds": 3600, "poll_interval_seconds": 15 }
    }))
    .expect("valid test config")
}

struct TestApp {
    router: Router,
    gateway: Arc<MockPaymentGateway>,
    _notifications: UnboundedReceiver<NotificationRequest>,
}

impl TestApp {
    fn new() -> Self {
        Self::with_config(test_config(100))
    }

    fn with_config(config: Config) -> Self {
        let store = Arc::new(InMemoryBookingStore::new());
        let gateway = Arc::new(MockPaymentGateway::new("https://pay.test/checkout"));
        let (dispatcher, rx) = NotificationDispatcher::channel();
        let ports = Ports {
            reservations: store.clone(),
            meetings: store.clone(),
            sessions: store.clone(),
            refunds: store,
            cache: Arc::new(InMemoryCache::new()),
            gateway: gateway.clone(),
            clock: Arc::new(SystemClock),
        };
        let state = AppState::build(ports, &config, dispatcher);
        Self {
            router: app(state),
            gateway,
            _notifications: rx,
        }
    }

    async fn send(&self, req: Request<Body>) -> Response {
        self.router.clone().oneshot(req).await.unwrap()
    }
}

async fn json_body(resp: Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn checkout_body(provider_id: Uuid, start: &str, key: &str) -> Value {
    json!({
        "provider_id": provider_id,
        "start_time": start,
        "duration_minutes": 30,
        "client_contact": "client@example.com",
        "idempotency_key": key,
        "amount": { "amount_minor": 5000, "currency": "USD" }
    })
}

fn post_checkout(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/checkout")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn token(role: &str) -> String {
    let claims = Claims {
        sub: format!("{}-user", role.to_lowercase()),
        role: role.to_string(),
        exp: (Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap()
}

fn paid_event(event_id: &str, session_id: &str, reservation_id: &str) -> Vec<u8> {
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": {
            "object": {
                "id": session_id,
                "payment_status": "paid",
                "amount_total": 5000,
                "currency": "usd",
                "metadata": { "reservation_id": reservation_id }
            }
        }
    })
    .to_string()
    .into_bytes()
}

fn post_webhook(body: Vec<u8>, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/webhooks/payments")
        .header(header::CONTENT_TYPE, "application/json")
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(body))
        .unwrap()
}

fn sign(body: &[u8]) -> String {
    WebhookVerifier::new(WEBHOOK_SECRET, 300).sign(body, Utc::now().timestamp())
}

async fn checkout(app: &TestApp, provider_id: Uuid, key: &str) -> Value {
    let resp = app
        .send(post_checkout(&checkout_body(provider_id, "2031-03-04T10:00:00Z", key)))
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    json_body(resp).await
}

#[tokio::test]
async fn test_checkout_replay_and_conflict() {
    let app = TestApp::new();
    let provider = Uuid::new_v4();

    let first = checkout(&app, provider, "key-1").await;
    assert!(first["gateway_checkout_url"]
        .as_str()
        .unwrap()
        .starts_with("https://pay.test/checkout"));

    let replay = checkout(&app, provider, "key-1").await;
    assert_eq!(replay["reservation_id"], first["reservation_id"]);
    assert_eq!(replay["gateway_session_id"], first["gateway_session_id"]);

    let resp = app
        .send(post_checkout(&checkout_body(provider, "2031-03-04T10:15:00Z", "key-2")))
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert!(json_body(resp).await["error"].is_string());
}

#[tokio::test]
async fn test_checkout_rejects_non_positive_duration() {
    let app = TestApp::new();
    let mut body = checkout_body(Uuid::new_v4(), "2031-03-04T10:00:00Z", "key-1");
    body["duration_minutes"] = json!(0);

    let resp = app.send(post_checkout(&body)).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_paid_webhook_confirms_booking_once() {
    let app = TestApp::new();
    let receipt = checkout(&app, Uuid::new_v4(), "key-1").await;
    let session = receipt["gateway_session_id"].as_str().unwrap();
    let reservation = receipt["reservation_id"].as_str().unwrap();

    let body = paid_event("evt_1", session, reservation);
    let resp = app.send(post_webhook(body.clone(), &sign(&body))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let ack = json_body(resp).await;
    assert_eq!(ack["outcome"], "confirmed");
    assert!(ack["meeting_id"].is_string());

    let resp = app.send(post_webhook(body.clone(), &sign(&body))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["outcome"], "duplicate");

    let resp = app
        .send(
            Request::builder()
                .uri(format!("/v1/reservations/{}", reservation))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let view = json_body(resp).await;
    assert_eq!(view["status"], "CONSUMED");
    assert!(view.get("client_contact").is_none());
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature_and_malformed_body() {
    let app = TestApp::new();
    let body = paid_event("evt_1", "cs_1", &Uuid::new_v4().to_string());

    let forged = WebhookVerifier::new("whsec_other", 300).sign(&body, Utc::now().timestamp());
    let resp = app.send(post_webhook(body.clone(), &forged)).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app.send(post_webhook(body, "")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let garbage = b"{not json".to_vec();
    let resp = app.send(post_webhook(garbage.clone(), &sign(&garbage))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_release_reservation() {
    let app = TestApp::new();
    let receipt = checkout(&app, Uuid::new_v4(), "key-1").await;
    let uri = format!("/v1/reservations/{}", receipt["reservation_id"].as_str().unwrap());
    let delete = || Request::builder().method("DELETE").uri(uri.as_str()).body(Body::empty()).unwrap();

    assert_eq!(app.send(delete()).await.status(), StatusCode::NO_CONTENT);
    assert_eq!(app.send(delete()).await.status(), StatusCode::CONFLICT);

    let unknown = Request::builder()
        .method("DELETE")
        .uri(format!("/v1/reservations/{}", Uuid::new_v4()))
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.send(unknown).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_checkout_rate_limited_per_ip() {
    let app = TestApp::with_config(test_config(2));
    let body = checkout_body(Uuid::new_v4(), "2031-03-04T10:00:00Z", "key-1");

    assert_eq!(app.send(post_checkout(&body)).await.status(), StatusCode::CREATED);
    assert_eq!(app.send(post_checkout(&body)).await.status(), StatusCode::CREATED);

    let resp = app.send(post_checkout(&body)).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = resp
        .headers()
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let app = TestApp::new();
    let list = |auth: Option<String>| {
        let mut builder = Request::builder().uri("/v1/admin/refunds/pending");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::empty()).unwrap()
    };

    assert_eq!(app.send(list(None)).await.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        app.send(list(Some("Bearer not-a-jwt".to_string()))).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        app.send(list(Some(format!("Bearer {}", token("CUSTOMER"))))).await.status(),
        StatusCode::FORBIDDEN
    );

    let resp = app.send(list(Some(format!("Bearer {}", token("ADMIN"))))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["count"], 0);
}

#[tokio::test]
async fn test_late_payment_refund_backlog_and_manual_retry() {
    let app = TestApp::new();
    let receipt = checkout(&app, Uuid::new_v4(), "key-1").await;
    let session = receipt["gateway_session_id"].as_str().unwrap().to_string();
    let reservation = receipt["reservation_id"].as_str().unwrap().to_string();

    let release = Request::builder()
        .method("DELETE")
        .uri(format!("/v1/reservations/{}", reservation))
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.send(release).await.status(), StatusCode::NO_CONTENT);

    app.gateway.fail_next_refunds(1);
    let body = paid_event("evt_late", &session, &reservation);
    let resp = app.send(post_webhook(body.clone(), &sign(&body))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["outcome"], "compensated");

    let admin = format!("Bearer {}", token("ADMIN"));
    let resp = app
        .send(
            Request::builder()
                .uri("/v1/admin/refunds/pending")
                .header(header::AUTHORIZATION, &admin)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let backlog = json_body(resp).await;
    assert_eq!(backlog["count"], 1);
    assert_eq!(backlog["refunds"][0]["gateway_session_id"], session.as_str());
    assert_eq!(backlog["refunds"][0]["status"], "PENDING");

    let resp = app
        .send(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/admin/refunds/{}/retry", session))
                .header(header::AUTHORIZATION, &admin)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["status"], "ISSUED");
    assert_eq!(app.gateway.refunds_issued(), 1);
}

#[tokio::test]
async fn test_gateway_outage_trips_checkout_breaker() {
    let app = TestApp::new();
    app.gateway.fail_checkouts(true);

    for i in 0..5 {
        let body = checkout_body(Uuid::new_v4(), "2031-03-04T10:00:00Z", &format!("key-{}", i));
        assert_eq!(app.send(post_checkout(&body)).await.status(), StatusCode::BAD_GATEWAY);
    }

    app.gateway.fail_checkouts(false);
    let body = checkout_body(Uuid::new_v4(), "2031-03-04T10:00:00Z", "key-after");
    assert_eq!(
        app.send(post_checkout(&body)).await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
}
