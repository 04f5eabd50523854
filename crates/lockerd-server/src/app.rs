//! Application wiring: construct every subsystem once, inject explicitly.

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use lockerd_core::bus::{BusPort, BusSettings, BusTransport};
use lockerd_core::config::ConfigManager;
use lockerd_core::events::EventLogger;
use lockerd_core::heartbeat::HeartbeatManager;
use lockerd_core::pipeline::{Pipeline, PipelineSettings};
use lockerd_core::queue::{CommandQueue, QueueSettings};
use lockerd_core::state::StateManager;
use lockerd_core::vip::VipService;
use lockerd_store::Store;

use crate::routes;
use crate::state::AppState;

/// Build the shared application state over an already-loaded config
/// manager and a bus port (real serial or the simulator).
///
/// # Errors
///
/// Returns an error if the audit salt cannot be initialized.
pub async fn build_state(
    store: Store,
    config: Arc<ConfigManager>,
    port: impl BusPort,
) -> anyhow::Result<Arc<AppState>> {
    let events = Arc::new(EventLogger::init(store.clone()).await?);

    let bus = BusTransport::start(port, BusSettings::default());
    let pipeline = Arc::new(Pipeline::new(
        bus,
        Arc::clone(&config),
        PipelineSettings::default(),
    ));

    let state_manager = Arc::new(StateManager::new(store.clone(), Arc::clone(&events)));
    let heartbeat = Arc::new(HeartbeatManager::new(store.clone(), Arc::clone(&events)));
    let queue = Arc::new(CommandQueue::new(store.clone(), QueueSettings::default()));
    let vip = Arc::new(VipService::new(
        store.clone(),
        Arc::clone(&state_manager),
        Arc::clone(&events),
    ));

    Ok(Arc::new(AppState {
        store,
        config,
        pipeline,
        state: state_manager,
        heartbeat,
        queue,
        vip,
        events,
    }))
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Hardware-touching staff opens are concurrency-limited; the bus is
    // serialized anyway, so queueing more than a handful only adds latency.
    let hardware_routes = Router::new()
        .nest("/api/locker", routes::lockers::locker_router())
        .layer(tower::limit::ConcurrencyLimitLayer::new(4));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .merge(hardware_routes)
        .nest("/api/lockers", routes::lockers::list_router())
        .nest("/api/kiosk", routes::kiosk::router())
        .nest("/api/admin", routes::admin::router())
        .merge(routes::health::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use lockerd_core::bus::MockPort;
    use lockerd_core::frame::Request as BusRequest;
    use tower::util::ServiceExt;

    async fn test_app() -> (Router, Arc<AppState>, MockPort) {
        let store = Store::open_in_memory().await.unwrap();
        let config = Arc::new(ConfigManager::load(store.clone()).await.unwrap());

        let doc: lockerd_core::config::ConfigDocument = serde_json::from_str(
            r#"{
                "features": { "zones_enabled": true },
                "zones": [
                    { "id": "mens",   "ranges": [[1,32]],  "relay_cards": [1,2] },
                    { "id": "womens", "ranges": [[33,64]], "relay_cards": [3,4] }
                ]
            }"#,
        )
        .unwrap();
        config.deploy(doc).await.unwrap();

        let port = MockPort::new();
        let state = build_state(store, config, port.clone()).await.unwrap();
        state.state.sync_lockers("K1", 32).await.unwrap();
        (build_router(Arc::clone(&state)), state, port)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn fresh_card_gets_a_locker_and_the_relay_clicks() {
        let (app, state, port) = test_app().await;

        // Scan: no ownership yet, free lockers offered.
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/kiosk/scan",
                serde_json::json!({ "card_id": "ABC", "kiosk_id": "K1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["action"], "show_lockers");
        assert_eq!(body["lockers"].as_array().unwrap().len(), 32);

        // Select locker 5: reserve, pulse (1,5), confirm.
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/kiosk/select",
                serde_json::json!({ "card_id": "ABC", "kiosk_id": "K1", "locker_id": 5 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let frames = port.requests().await;
        assert_eq!(
            frames,
            vec![
                BusRequest::WriteSingleCoil { slave: 1, coil: 5, on: true },
                BusRequest::WriteSingleCoil { slave: 1, coil: 5, on: false },
            ]
        );

        let row = state.state.locker("K1", 5).await.unwrap();
        assert_eq!(row.status, lockerd_store::LockerStatus::Owned);
        assert_eq!(row.version, 3);
        assert_eq!(
            row.owner_key.as_deref(),
            Some(state.events.hash_card("ABC").as_str())
        );
    }

    #[tokio::test]
    async fn returning_card_opens_and_releases() {
        let (app, state, _port) = test_app().await;

        app.clone()
            .oneshot(post_json(
                "/api/kiosk/select",
                serde_json::json!({ "card_id": "ABC", "kiosk_id": "K1", "locker_id": 5 }),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/kiosk/scan",
                serde_json::json!({ "card_id": "ABC", "kiosk_id": "K1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["action"], "open_locker");
        assert_eq!(body["locker_id"], 5);
        assert_eq!(body["vip"], false);

        let row = state.state.locker("K1", 5).await.unwrap();
        assert_eq!(row.status, lockerd_store::LockerStatus::Free);
        assert!(row.owner_key.is_none());

        // The release is audited with the hashed owner.
        let events = state
            .events
            .query(&lockerd_store::EventFilter {
                event_type: Some("locker_released".to_owned()),
                ..lockerd_store::EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].details.contains("ABC"));
    }

    #[tokio::test]
    async fn failed_pulse_reverts_the_reservation() {
        let (app, state, port) = test_app().await;
        port.kill_slave(1).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/kiosk/select",
                serde_json::json!({ "card_id": "ABC", "kiosk_id": "K1", "locker_id": 5 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"], "HARDWARE_ERROR");
        assert!(body["trace_id"].is_string());

        let row = state.state.locker("K1", 5).await.unwrap();
        assert_eq!(row.status, lockerd_store::LockerStatus::Free);
    }

    #[tokio::test]
    async fn unknown_zone_is_rejected_with_the_known_list() {
        let (app, _state, _port) = test_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/lockers/available?kiosk_id=K1&zone=xxx")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "UNKNOWN_ZONE");
        assert_eq!(
            body["available_zones"],
            serde_json::json!(["mens", "womens"])
        );
        assert!(body["trace_id"].is_string());
    }

    #[tokio::test]
    async fn staff_open_rejects_out_of_zone_lockers() {
        let (app, _state, _port) = test_app().await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/locker/open",
                serde_json::json!({ "locker_id": 49, "zone": "mens" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "LOCKER_OUT_OF_ZONE");

        // The same locker in its own zone opens fine.
        let response = app
            .oneshot(post_json(
                "/api/locker/open",
                serde_json::json!({ "locker_id": 49, "zone": "womens", "staff_user": "ana" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_zones_and_bus_state() {
        let (app, _state, _port) = test_app().await;

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["zones_enabled"], true);
        assert_eq!(body["total_lockers"], 64);
        assert_eq!(body["zones"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn heartbeat_hands_back_polling_config_and_hash() {
        let (app, state, _port) = test_app().await;

        let response = app
            .oneshot(post_json(
                "/api/kiosk/heartbeat",
                serde_json::json!({ "kiosk_id": "K1", "version": "2.0.1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["heartbeat_sec"], 10);
        assert_eq!(body["poll_sec"], 5);
        assert_eq!(body["config_hash"], state.config.snapshot().await.hash);
    }

    #[tokio::test]
    async fn end_of_day_returns_csv() {
        let (app, _state, _port) = test_app().await;

        app.clone()
            .oneshot(post_json(
                "/api/kiosk/select",
                serde_json::json!({ "card_id": "ABC", "kiosk_id": "K1", "locker_id": 5 }),
            ))
            .await
            .unwrap();

        let response = app
            .oneshot(post_json(
                "/api/admin/release/end-of-day",
                serde_json::json!({ "kiosk_id": "K1", "staff_user": "ana" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/csv"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let csv = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(csv.starts_with("kiosk_id,locker_id,timestamp,"));
        // 32 lockers: 1 released, 31 already free.
        assert_eq!(csv.lines().count(), 33);
    }
}
