use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use seatmap_api::{app, metrics::SeatMetrics, AppState};
use seatmap_core::{
    EventBroadcaster, ExpiredPage, ExpiryReclaimer, InMemorySeatStore, ManualClock, NewSeat,
    ReservationManager, ReservationPolicy, ScanCursor, SeatInventoryStore, StoreError, StoreResult,
};
use seatmap_shared::{EventId, HolderToken, SeatId, SeatRecord, SeatState, SeatStatus};
use seatmap_store::app_config::{GatewayConfig, ReservationConfig};
use serde_json::{json, Value};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    state: AppState,
    clock: Arc<ManualClock>,
}

fn test_app_with_store(store: Arc<dyn SeatInventoryStore>) -> TestApp {
    test_app_with(store, &GatewayConfig::default())
}

fn test_app_with(store: Arc<dyn SeatInventoryStore>, gateway: &GatewayConfig) -> TestApp {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let manager = Arc::new(ReservationManager::new(
        store,
        Arc::new(EventBroadcaster::new()),
        clock.clone(),
        ReservationPolicy::default(),
    ));
    let metrics = Arc::new(SeatMetrics::new().unwrap());
    let state = AppState::new(manager, metrics, &ReservationConfig::default(), gateway);
    TestApp {
        router: app(state.clone()),
        state,
        clock,
    }
}

fn test_app() -> TestApp {
    test_app_with_store(Arc::new(InMemorySeatStore::new()))
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

async fn provision(app: &TestApp, event: &str, seats: &[&str]) {
    let seats: Vec<Value> = seats.iter().map(|id| json!({ "seat_id": id, "section": "Floor" })).collect();
    let (status, _) = send(
        &app.router,
        "POST",
        &format!("/v1/events/{}/seats", event),
        Some(json!({ "seats": seats })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_health_check() {
    let app = test_app();
    let (status, body) = send(&app.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_provision_grid_and_snapshot() {
    let app = test_app();
    let (status, body) = send(
        &app.router,
        "POST",
        "/v1/events/concert-1/seats",
        Some(json!({ "grids": [{ "section": "Balcony", "rows": 2, "seats_per_row": 3 }] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["inserted"], 6);

    // Provisioning again changes nothing.
    let (status, body) = send(
        &app.router,
        "POST",
        "/v1/events/concert-1/seats",
        Some(json!({ "grids": [{ "section": "Balcony", "rows": 2, "seats_per_row": 3 }] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["inserted"], 0);

    let (status, map) = send(&app.router, "GET", "/v1/events/concert-1/seats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(map["total_seats"], 6);
    assert_eq!(map["available_seats"], 6);
    assert_eq!(map["sections"]["Balcony"]["available_seats"], 6);
    assert_eq!(map["seats"][0]["seat_id"], "A1");
    assert_eq!(map["seats"][0]["status"], "AVAILABLE");
}

#[tokio::test]
async fn test_unknown_event_snapshot_is_404() {
    let app = test_app();
    let (status, body) = send(&app.router, "GET", "/v1/events/nope/seats", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_second_holder_gets_conflict() {
    let app = test_app();
    provision(&app, "evt-a", &["A201"]).await;

    let (status, body) = send(
        &app.router,
        "POST",
        "/v1/events/evt-a/seats/reserve",
        Some(json!({ "seat_ids": ["A201"], "holder_token": "holder-x" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["event_id"], "evt-a");
    assert_eq!(body["results"][0]["outcome"], "OK");
    assert_eq!(body["results"][0]["status"], "RESERVED");
    assert_eq!(body["results"][0]["version"], 1);
    assert!(body["results"][0]["expires_at"].is_string());

    let (status, body) = send(
        &app.router,
        "POST",
        "/v1/events/evt-a/seats/reserve",
        Some(json!({ "seat_ids": ["A201"], "holder_token": "holder-y" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["outcome"], "CONFLICT");
    assert_eq!(body["results"][0]["status"], "RESERVED");
}

#[tokio::test]
async fn test_full_checkout_flow() {
    let app = test_app();
    provision(&app, "evt-b", &["C1", "C2"]).await;
    let hold = json!({ "seat_ids": ["C1", "C2"], "holder_token": "buyer" });

    for (path, expected) in [
        ("reserve", "RESERVED"),
        ("extend", "RESERVED"),
        ("lock", "LOCKED"),
        ("confirm", "SOLD"),
    ] {
        let (status, body) = send(
            &app.router,
            "POST",
            &format!("/v1/events/evt-b/seats/{}", path),
            Some(hold.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", path);
        for result in body["results"].as_array().unwrap() {
            assert_eq!(result["outcome"], "OK", "{}", path);
            assert_eq!(result["status"], expected, "{}", path);
        }
    }

    let (_, body) = send(&app.router, "POST", "/v1/events/evt-b/seats/release", Some(hold)).await;
    assert_eq!(body["results"][0]["outcome"], "INVALID_STATE");

    let (_, map) = send(&app.router, "GET", "/v1/events/evt-b/seats", None).await;
    assert_eq!(map["available_seats"], 0);
    assert_eq!(map["seats"][1]["status"], "SOLD");
}

#[tokio::test]
async fn test_request_validation() {
    let app = test_app();
    provision(&app, "evt-c", &["A1"]).await;

    let bad_requests = [
        json!({ "seat_ids": [], "holder_token": "x" }),
        json!({ "seat_ids": ["A1"], "holder_token": "   " }),
        json!({ "seat_ids": ["A1"], "holder_token": "x", "ttl_seconds": 0 }),
        json!({ "seat_ids": ["A1"], "holder_token": "x", "ttl_seconds": 86_400 }),
        json!({ "seat_ids": ["A1"], "holder_token": "x", "ttl_seconds": -5 }),
        json!({ "seat_ids": ["A1"], "holder_token": "x", "ttl_seconds": 1.5 }),
        json!({ "seat_ids": ["A1"], "holder_token": "x", "ttl_seconds": "60" }),
        json!({ "seat_ids": ["A1"] }),
        json!({ "holder_token": "x" }),
        json!({ "seat_ids": ["A\u{1f}1"], "holder_token": "x" }),
    ];
    for body in bad_requests {
        for path in ["reserve", "extend", "lock"] {
            let uri = format!("/v1/events/evt-c/seats/{}", path);
            let (status, response) = send(&app.router, "POST", &uri, Some(body.clone())).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{} {}", path, body);
            assert!(response["error"].is_string(), "{} {}", path, body);
        }
    }

    let request = Request::builder()
        .method("POST")
        .uri("/v1/events/evt-c/seats/release")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"seat_ids\": [\"A1\""))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["error"].is_string());

    // Control characters in the event id are rejected too.
    let (status, _) = send(
        &app.router,
        "POST",
        "/v1/events/evt%1Fc/seats/reserve",
        Some(json!({ "seat_ids": ["A1"], "holder_token": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Nothing was reserved along the way.
    let (_, map) = send(&app.router, "GET", "/v1/events/evt-c/seats", None).await;
    assert_eq!(map["available_seats"], 1);
}

#[tokio::test]
async fn test_expired_hold_is_released_by_reclaimer() {
    let app = test_app();
    provision(&app, "evt-d", &["B7"]).await;
    send(
        &app.router,
        "POST",
        "/v1/events/evt-d/seats/reserve",
        Some(json!({ "seat_ids": ["B7"], "holder_token": "holder-z", "ttl_seconds": 30 })),
    )
    .await;

    app.clock.advance(chrono::Duration::seconds(31));

    // Buyers already see the seat as free...
    let (_, map) = send(&app.router, "GET", "/v1/events/evt-d/seats", None).await;
    assert_eq!(map["seats"][0]["status"], "AVAILABLE");

    // ...and the reclaimer makes it so in the store.
    let report = ExpiryReclaimer::new(app.state.manager.clone(), 10).sweep().await;
    assert_eq!(report.reclaimed, 1);
    let record = app
        .state
        .manager
        .store()
        .get(&EventId::new("evt-d"), &SeatId::new("B7"))
        .await
        .unwrap();
    assert_eq!(record.status(), SeatStatus::Available);
    assert_eq!(record.version, 2);
}

struct DownStore;

#[async_trait]
impl SeatInventoryStore for DownStore {
    async fn get(&self, _: &EventId, _: &SeatId) -> StoreResult<SeatRecord> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn compare_and_set(&self, _: &EventId, _: &SeatId, _: u64, _: SeatState) -> StoreResult<u64> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn scan_expired_page(&self, _: DateTime<Utc>, _: Option<&ScanCursor>, _: usize) -> StoreResult<ExpiredPage> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn list(&self, _: &EventId) -> StoreResult<Vec<SeatRecord>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn provision(&self, _: &EventId, _: &[NewSeat]) -> StoreResult<usize> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn test_store_outage_is_503() {
    let app = test_app_with_store(Arc::new(DownStore));

    let (status, body) = send(
        &app.router,
        "POST",
        "/v1/events/evt-e/seats/reserve",
        Some(json!({ "seat_ids": ["A1"], "holder_token": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["results"][0]["outcome"], "STORE_UNAVAILABLE");

    let (status, _) = send(&app.router, "GET", "/v1/events/evt-e/seats", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_count_outcomes() {
    let app = test_app();
    provision(&app, "evt-f", &["A1"]).await;
    for holder in ["x", "y"] {
        send(
            &app.router,
            "POST",
            "/v1/events/evt-f/seats/reserve",
            Some(json!({ "seat_ids": ["A1"], "holder_token": holder })),
        )
        .await;
    }

    let (status, body) = send(&app.router, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains(r#"seatmap_seat_operations_total{operation="reserve",outcome="OK"} 1"#));
    assert!(text.contains(r#"seatmap_seat_operations_total{operation="reserve",outcome="CONFLICT"} 1"#));
    assert!(text.contains("seatmap_live_subscribers 0"));
}

/// Reads SSE frames until the accumulated text contains `needle`.
async fn read_until(body: &mut Body, seen: &mut String, needle: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !seen.contains(needle) {
            let frame = body.frame().await.expect("stream ended").unwrap();
            if let Ok(data) = frame.into_data() {
                seen.push_str(&String::from_utf8_lossy(&data));
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never saw {:?} in {:?}", needle, seen));
}

#[tokio::test]
async fn test_live_stream_relays_changes_and_cleans_up() {
    let app = test_app();
    provision(&app, "evt-g", &["A201"]).await;
    let event = EventId::new("evt-g");

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/v1/events/evt-g/stream").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

    let mut body = response.into_body();
    let mut seen = String::new();
    read_until(&mut body, &mut seen, "event: connected").await;
    assert!(seen.contains("\"event_id\":\"evt-g\""));
    assert_eq!(app.state.broadcaster().subscriber_count(&event), 1);

    let outcomes = app
        .state
        .manager
        .reserve(&event, &[SeatId::new("A201")], &HolderToken::new("holder-x"), chrono::Duration::seconds(600))
        .await;
    assert!(outcomes[0].is_ok());

    read_until(&mut body, &mut seen, "event: seat").await;
    read_until(&mut body, &mut seen, "\"version\":1").await;
    assert!(seen.contains("\"status\":\"RESERVED\""));
    assert!(seen.contains("\"seat_id\":\"A201\""));
    assert!(!seen.contains("holder-x"));

    drop(body);
    assert_eq!(app.state.broadcaster().subscriber_count(&event), 0);
    assert_eq!(app.state.broadcaster().total_subscribers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_stream_sends_keepalive_pings() {
    let app = test_app_with(
        Arc::new(InMemorySeatStore::new()),
        &GatewayConfig { keepalive_seconds: 2 },
    );

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/v1/events/evt-h/stream").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let mut body = response.into_body();
    let mut seen = String::new();
    read_until(&mut body, &mut seen, "event: connected").await;
    assert!(!seen.contains("ping"));

    // No seat changes; only the keepalive can produce more output.
    tokio::time::advance(Duration::from_secs(3)).await;
    read_until(&mut body, &mut seen, "ping").await;
    let after_greeting = &seen[seen.find("event: connected").unwrap()..];
    assert!(after_greeting.contains("\n\n:"), "{:?}", seen);
    assert!(!seen.contains("event: seat"));
}
