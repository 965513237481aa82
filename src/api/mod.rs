pub mod error;
mod handlers;
pub mod principal;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::bus::DirtyTagBus;
use crate::executor::MainThreadExecutor;
use crate::session::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::sim::World;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub bus: DirtyTagBus,
    pub executor: MainThreadExecutor<World>,
    pub shutdown: ShutdownCoordinator,
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a minimal same-origin setup.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub cors_origins: Vec<String>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let session_routes = Router::new()
        .route("/sessions", get(session_list).post(session_create))
        .route("/updates/{id}", get(updates_poll).delete(updates_end))
        .route("/ws/updates/{id}", get(ws_updates))
        .route("/events/{id}", get(sse_updates));

    let sim_routes = Router::new()
        .route("/car", get(car_list))
        .route("/car/{guid}", get(car_get).delete(car_remove))
        .route("/car/{guid}/control", post(car_control))
        .route("/trainset/{id}", get(trainset_get))
        .route("/job", get(job_list))
        .route("/job/{id}/take", post(job_take))
        .route("/junction", get(junction_list))
        .route("/junction/{id}/toggle", post(junction_toggle))
        .route("/junctionState", get(junction_state))
        .route("/player", get(player_get))
        .route("/track", get(track_get));

    let router = Router::new()
        .route("/health", get(health))
        .merge(session_routes)
        .merge(sim_routes)
        .fallback(not_found)
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationSection;
    use crate::resolve::ResolverTable;
    use crate::session::SessionConfig;
    use crate::sim::{self, SimulationThread};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt; // for oneshot()

    /// A router over a small running world. The simulation thread must be
    /// kept alive for the duration of the test.
    fn create_test_app() -> (Router, AppState, SimulationThread) {
        let (executor, queue) = MainThreadExecutor::new();
        let sessions = SessionRegistry::new(
            SessionConfig {
                session_timeout: Duration::from_secs(60),
                long_poll_timeout: Duration::from_millis(100),
            },
            sim::resolvers(executor.clone()),
        );
        let bus = DirtyTagBus::new(sessions.clone());
        let mut world = World::generate(
            &SimulationSection {
                tick_ms: 20,
                trainsets: 2,
                cars_per_trainset: 3,
                junctions: 4,
            },
            11,
        );
        world.register_change_listener(bus.listener());
        let sim = SimulationThread::spawn(world, queue, Duration::from_millis(20)).unwrap();

        let state = AppState {
            sessions,
            bus,
            executor,
            shutdown: ShutdownCoordinator::new(),
        };
        (router(state.clone(), RouterConfig::default()), state, sim)
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_ok() {
        let (app, _state, _sim) = create_test_app();
        let (status, json) = send(&app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn responses_are_not_cached() {
        let (app, _state, _sim) = create_test_app();
        let response = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let (app, _state, _sim) = create_test_app();
        let (status, json) = send(&app, get_req("/signals")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn session_create_returns_fresh_ids() {
        let (app, _state, _sim) = create_test_app();
        let (status, a) = send(&app, post_req("/sessions")).await;
        assert_eq!(status, StatusCode::CREATED);
        let (_, b) = send(&app, post_req("/sessions")).await;
        assert_ne!(a["id"], b["id"]);
        assert_eq!(a["id"].as_str().unwrap().len(), 36);
    }

    #[tokio::test]
    async fn first_poll_returns_every_global() {
        let (app, state, _sim) = create_test_app();
        let (status, json) = send(&app, get_req("/updates/s1")).await;
        assert_eq!(status, StatusCode::OK);
        let obj = json.as_object().unwrap();
        for key in ["cars", "jobs", "junctions", "player"] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert_eq!(obj["junctions"], serde_json::json!([0, 0, 0, 0]));
        assert!(state.sessions.contains("s1"));
    }

    #[tokio::test]
    async fn principal_comes_from_basic_auth() {
        let (app, state, _sim) = create_test_app();
        let req = Request::builder()
            .uri("/updates/s1")
            .header("authorization", "Basic YWxpY2U6cHc=")
            .body(Body::empty())
            .unwrap();
        send(&app, req).await;
        assert_eq!(state.sessions.list()[0].principal, "alice");

        let (_, list) = send(&app, get_req("/sessions")).await;
        assert_eq!(list[0]["principal"], "alice");
        assert_eq!(list[0]["id"], "s1");
    }

    #[tokio::test]
    async fn toggle_is_seen_by_next_poll() {
        let (app, _state, _sim) = create_test_app();
        send(&app, get_req("/updates/s1")).await;

        let (status, json) = send(&app, post_req("/junction/2/toggle")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!(1));

        let (_, updates) = send(&app, get_req("/updates/s1")).await;
        assert_eq!(updates["junctions"], serde_json::json!([0, 0, 1, 0]));
    }

    #[tokio::test]
    async fn toggle_unknown_junction_is_404() {
        let (app, _state, _sim) = create_test_app();
        let (status, _) = send(&app, post_req("/junction/99/toggle")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, post_req("/junction/x/toggle")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn end_session_is_always_204() {
        let (app, state, _sim) = create_test_app();
        send(&app, get_req("/updates/s1")).await;
        let del = |uri: &str| {
            Request::builder()
                .method("DELETE")
                .uri(uri)
                .body(Body::empty())
                .unwrap()
        };
        let (status, _) = send(&app, del("/updates/s1")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!state.sessions.contains("s1"));
        let (status, _) = send(&app, del("/updates/nobody")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn invalid_session_id_is_400() {
        let (app, _state, _sim) = create_test_app();
        let (status, json) = send(&app, get_req("/updates/bad%20id")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_session_id");
    }

    #[tokio::test]
    async fn car_endpoints() {
        let (app, state, _sim) = create_test_app();
        let guid = state
            .executor
            .submit(|w: &mut World| w.loco_guids()[0].clone())
            .await
            .unwrap();

        let (status, all) = send(&app, get_req("/car")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(all.as_object().unwrap().len(), 6);

        let (status, car) = send(&app, get_req(&format!("/car/{guid}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(car["guid"], guid.as_str());
        assert!(car["id"].as_str().unwrap().starts_with("L-"));

        let (status, _) = send(&app, get_req("/car/not-a-car")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn car_control_status_codes() {
        let (app, state, _sim) = create_test_app();
        let guid = state
            .executor
            .submit(|w: &mut World| w.loco_guids()[0].clone())
            .await
            .unwrap();

        let (status, _) = send(&app, post_req(&format!("/car/{guid}/control?throttle=0.3&reverser=1"))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, json) = send(&app, post_req(&format!("/car/{guid}/control?warp=9"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_command");

        let (status, _) = send(&app, post_req("/car/missing/control?throttle=1")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let throttle = state
            .executor
            .submit(move |w: &mut World| w.car(&guid).and_then(|c| c.loco).map(|l| l.throttle))
            .await
            .unwrap();
        assert_eq!(throttle, Some(0.3));
    }

    #[tokio::test]
    async fn trainset_and_static_reads() {
        let (app, _state, _sim) = create_test_app();
        let (status, ts) = send(&app, get_req("/trainset/1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ts.as_object().unwrap().len(), 3);

        let (_, ts) = send(&app, get_req("/trainset/77")).await;
        assert_eq!(ts, serde_json::json!({}));

        let (status, _) = send(&app, get_req("/trainset/abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, junctions) = send(&app, get_req("/junction")).await;
        assert_eq!(junctions.as_array().unwrap().len(), 4);
        assert_eq!(junctions[0]["branches"].as_array().unwrap().len(), 2);

        let (_, player) = send(&app, get_req("/player")).await;
        assert_eq!(player["type"], "playerUpdate");

        let (_, jobs) = send(&app, get_req("/job")).await;
        assert_eq!(jobs.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn track_lists_branch_polylines() {
        let (app, _state, _sim) = create_test_app();
        let (status, tracks) = send(&app, get_req("/track")).await;
        assert_eq!(status, StatusCode::OK);
        let (_, junctions) = send(&app, get_req("/junction")).await;
        for branch in junctions[1]["branches"].as_array().unwrap() {
            let line = tracks[branch.as_str().unwrap()].as_array().unwrap();
            assert!(line.len() > 1);
            assert_eq!(line[0], junctions[1]["position"]);
        }
    }

    #[tokio::test]
    async fn job_take_status_codes() {
        let (app, state, _sim) = create_test_app();
        let (_, jobs) = send(&app, get_req("/job")).await;
        let id = jobs.as_object().unwrap().keys().next().unwrap().clone();

        let (status, _) = send(&app, post_req(&format!("/job/{id}/take"))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let lookup = id.clone();
        let active = state
            .executor
            .submit(move |w: &mut World| w.job(&lookup).map(|j| j.is_active))
            .await
            .unwrap();
        assert_eq!(active, Some(true));

        let (status, json) = send(&app, post_req("/job/XX-YY-99/take")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "job_not_found");
    }

    #[tokio::test]
    async fn car_delete_status_codes() {
        let (app, _state, _sim) = create_test_app();
        let (_, cars) = send(&app, get_req("/trainset/1")).await;
        let guid = cars.as_object().unwrap().values().next().unwrap()["guid"]
            .as_str()
            .unwrap()
            .to_string();
        let delete = |uri: String| {
            Request::builder()
                .method("DELETE")
                .uri(uri)
                .body(Body::empty())
                .unwrap()
        };

        let (status, _) = send(&app, delete(format!("/car/{guid}"))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, get_req(&format!("/car/{guid}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, json) = send(&app, delete(format!("/car/{guid}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "car_not_found");
    }

    #[tokio::test]
    async fn stopped_simulation_is_503() {
        let (app, _state, sim) = create_test_app();
        sim.stop().unwrap();
        let (status, json) = send(&app, get_req("/car")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["code"], "simulation_unavailable");
    }

    #[tokio::test]
    async fn unresolvable_tag_is_500() {
        let (_app, mut state, _sim) = create_test_app();
        state.sessions = SessionRegistry::new(SessionConfig::default(), ResolverTable::new());
        let app = router(state, RouterConfig::default());
        let (status, json) = send(&app, get_req("/updates/s1")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"]["code"], "unresolvable_tag");
    }
}
