use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::clock::parse_ts;
use crate::diagnostics::{self, Diagnostics};
use crate::engine::Evaluation;
use crate::guards::is_fresh;
use crate::ingest::Ingest;
use crate::pump::WaterResult;
use crate::scheduler::{PlantScheduler, Plants};
use crate::settings::{validate_patch, ResolvedSettings, KEY_HEARTBEAT_TOPIC};
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub plants: Plants,
    pub ingest: Arc<Ingest>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::Internal(e) => {
                warn!("web: request failed: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/plants", get(list_plants))
        .route("/api/plants/{id}/diagnostics", get(plant_diagnostics))
        .route("/api/plants/{id}/settings", get(get_settings).patch(patch_settings))
        .route("/api/plants/{id}/settings/reset", post(reset_settings))
        .route("/api/plants/{id}/settings/{key}", delete(remove_setting))
        .route("/api/plants/{id}/evaluate", post(evaluate))
        .route("/api/plants/{id}/water", post(water))
        .with_state(state)
}

fn plant(state: &AppState, id: &str) -> Result<Arc<PlantScheduler>, ApiError> {
    state
        .plants
        .get(id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("unknown plant '{id}'")))
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

#[derive(Serialize)]
struct PlantSummary {
    plant_id: String,
    plant_name: String,
    auto_water: bool,
    scheduler_running: bool,
    /// Last reading is older than the staleness window, or missing.
    stale: bool,
    last_decision: Option<String>,
    last_evaluated: Option<String>,
    last_watered: Option<String>,
    last_seen: Option<String>,
}

async fn list_plants(State(state): State<AppState>) -> Json<Vec<PlantSummary>> {
    let out = state
        .plants
        .values()
        .map(|sched| {
            let s = sched.engine().settings().resolved();
            let now = sched.engine().host().clock.now();
            let last_seen = s.last_seen.as_deref().and_then(parse_ts);
            PlantSummary {
                plant_id: sched.plant_id().to_string(),
                plant_name: s.plant_name,
                auto_water: s.auto_water,
                scheduler_running: sched.is_running(),
                stale: !is_fresh(last_seen, s.stale_after_min, now),
                last_decision: s.last_decision,
                last_evaluated: s.last_evaluated,
                last_watered: s.last_watered,
                last_seen: s.last_seen,
            }
        })
        .collect();
    Json(out)
}

async fn plant_diagnostics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Diagnostics> {
    let sched = plant(&state, &id)?;
    Ok(Json(diagnostics::snapshot(sched.engine())))
}

async fn get_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ResolvedSettings> {
    let sched = plant(&state, &id)?;
    Ok(Json(sched.engine().settings().resolved()))
}

async fn patch_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<Map<String, Value>>,
) -> ApiResult<ResolvedSettings> {
    let sched = plant(&state, &id)?;
    validate_patch(&patch).map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;

    let keys: Vec<&str> = patch.keys().map(String::as_str).collect();
    info!(plant = %id, keys = ?keys, "web: settings patched");
    let heartbeat_changed = patch.contains_key(KEY_HEARTBEAT_TOPIC);
    let settings = sched.engine().settings();
    settings.update(patch).await.map_err(ApiError::Internal)?;

    let resolved = settings.resolved();
    if heartbeat_changed {
        if let Some(topic) = &resolved.heartbeat_topic {
            state.ingest.subscribe_topic(topic);
        }
    }
    Ok(Json(resolved))
}

async fn remove_setting(
    State(state): State<AppState>,
    Path((id, key)): Path<(String, String)>,
) -> ApiResult<ResolvedSettings> {
    let sched = plant(&state, &id)?;
    let settings = sched.engine().settings();
    settings.remove(&key).await.map_err(ApiError::Internal)?;
    info!(plant = %id, key = %key, "web: setting removed");
    Ok(Json(settings.resolved()))
}

async fn reset_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ResolvedSettings> {
    let sched = plant(&state, &id)?;
    let settings = sched.engine().settings();
    settings.reset().await.map_err(ApiError::Internal)?;
    state
        .shared
        .write()
        .await
        .record_system(format!("{id}: settings reset"));
    Ok(Json(settings.resolved()))
}

async fn evaluate(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Evaluation> {
    let sched = plant(&state, &id)?;
    let eval = sched.evaluate_now().await.map_err(ApiError::Internal)?;
    Ok(Json(eval))
}

async fn water(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<WaterResult> {
    let sched = plant(&state, &id)?;
    let result = sched.water_now().await.map_err(ApiError::Internal)?;
    Ok(Json(result))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{fake_engine, FakeHost};
    use crate::mqtt::MqttBridge;
    use crate::settings::KEY_LAST_SEEN;
    use crate::state::SystemState;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use rumqttc::{AsyncClient, EventLoop, MqttOptions};
    use std::collections::BTreeMap;
    use tower::ServiceExt;

    /// The event loop must outlive the test so MQTT requests can queue.
    fn app(overlay: Value) -> (Router, AppState, Arc<FakeHost>, EventLoop) {
        let (engine, host, clock) = fake_engine(overlay);
        let shared = SystemState::shared(&["switch.fern_pump".to_string()]);
        let sched = PlantScheduler::new(engine, shared.clone());
        let plants: Plants = Arc::new(BTreeMap::from([("fern".to_string(), sched)]));

        let (client, el) = AsyncClient::new(MqttOptions::new("test-web", "127.0.0.1", 1883), 10);
        let bridge = Arc::new(MqttBridge::new(client, clock.clone()));
        let ingest = Arc::new(Ingest::new(bridge, plants.clone(), shared.clone(), clock));

        let state = AppState {
            shared,
            plants,
            ingest,
        };
        (router(state.clone()), state, host, el)
    }

    async fn call(router: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => req
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn status_reports_events_and_pumps() {
        let (router, state, _host, _el) = app(json!({}));
        state
            .shared
            .write()
            .await
            .record_system("hub started".to_string());

        let (status, body) = call(router, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mqtt_connected"], json!(false));
        assert_eq!(body["events"][0]["detail"], "hub started");
        assert_eq!(body["pumps"]["switch.fern_pump"]["on"], json!(false));
    }

    #[tokio::test]
    async fn list_plants_summarises_each_plant() {
        let (router, _state, _host, _el) = app(json!({ "auto_water": true }));
        let (status, body) = call(router, Method::GET, "/api/plants", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["plant_id"], "fern");
        assert_eq!(body[0]["plant_name"], "Fern");
        assert_eq!(body[0]["auto_water"], json!(true));
        assert_eq!(body[0]["scheduler_running"], json!(false));
        assert_eq!(body[0]["stale"], json!(true));
    }

    #[tokio::test]
    async fn list_plants_reports_fresh_sensor() {
        let (router, state, _host, _el) = app(json!({ "stale_after_min": 30 }));
        let engine = state.plants["fern"].engine().clone();
        let now = engine.host().clock.now();
        engine
            .settings()
            .set_ts(KEY_LAST_SEEN, now - time::Duration::minutes(10))
            .await
            .unwrap();

        let (_, body) = call(router.clone(), Method::GET, "/api/plants", None).await;
        assert_eq!(body[0]["stale"], json!(false));

        engine
            .settings()
            .set_ts(KEY_LAST_SEEN, now - time::Duration::minutes(31))
            .await
            .unwrap();
        let (_, body) = call(router, Method::GET, "/api/plants", None).await;
        assert_eq!(body[0]["stale"], json!(true));
    }

    #[tokio::test]
    async fn unknown_plant_is_404() {
        let (router, _state, _host, _el) = app(json!({}));
        let (status, body) = call(router, Method::GET, "/api/plants/cactus/diagnostics", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown plant 'cactus'");
    }

    #[tokio::test]
    async fn diagnostics_include_live_state() {
        let (router, _state, host, _el) = app(json!({}));
        host.set_state("sensor.fern_moisture", "44");

        let (status, body) = call(router, Method::GET, "/api/plants/fern/diagnostics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resolved"]["moisture_entity"], "sensor.fern_moisture");
        assert_eq!(body["current_state"]["moisture"]["state"]["state"], "44");
        assert_eq!(body["current_state"]["pump"]["state"], Value::Null);
    }

    #[tokio::test]
    async fn patch_settings_merges_valid_patch() {
        let (router, state, _host, _el) = app(json!({ "auto_water": true }));
        let (status, body) = call(
            router,
            Method::PATCH,
            "/api/plants/fern/settings",
            Some(json!({ "threshold": 28.5, "cooldown_min": 60 })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["threshold"], json!(28.5));
        assert_eq!(body["cooldown_min"], json!(60));
        assert_eq!(body["auto_water"], json!(true));
        let settings = state.plants["fern"].engine().settings().clone();
        assert_eq!(settings.get_f64("threshold", 0.0), 28.5);
    }

    #[tokio::test]
    async fn patch_heartbeat_topic_subscribes_it() {
        let (router, state, _host, _el) = app(json!({}));
        assert!(!state.ingest.is_subscribed("ecowitt/fern/alive"));

        let (status, body) = call(
            router,
            Method::PATCH,
            "/api/plants/fern/settings",
            Some(json!({ "heartbeat_topic": "ecowitt/fern/alive" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["heartbeat_topic"], "ecowitt/fern/alive");
        assert!(state.ingest.is_subscribed("ecowitt/fern/alive"));
    }

    #[tokio::test]
    async fn patch_settings_rejects_invalid_values() {
        let (router, state, _host, _el) = app(json!({}));
        let (status, body) = call(
            router,
            Method::PATCH,
            "/api/plants/fern/settings",
            Some(json!({ "threshold": 250, "pump_duration_s": 0 })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("2 errors"));
        assert!(state.plants["fern"].engine().settings().overlay().is_empty());
    }

    #[tokio::test]
    async fn delete_setting_reveals_setup_value() {
        let (router, _state, _host, _el) = app(json!({ "pump_switch": "switch.spare" }));
        let (status, body) = call(
            router,
            Method::DELETE,
            "/api/plants/fern/settings/pump_switch",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pump_switch"], "switch.fern_pump");
    }

    #[tokio::test]
    async fn reset_clears_overlay() {
        let (router, state, _host, _el) = app(json!({ "threshold": 10, "last_decision": "watered" }));
        let (status, body) = call(router, Method::POST, "/api/plants/fern/settings/reset", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["threshold"], json!(35.0));
        assert_eq!(body["last_decision"], Value::Null);
        assert!(state.plants["fern"].engine().settings().overlay().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn evaluate_returns_decision() {
        let (router, state, host, _el) = app(json!({ "auto_water": false }));
        let (status, body) = call(router, Method::POST, "/api/plants/fern/evaluate", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["decision"], "skipped_stale_or_unavailable");
        assert_eq!(body["result"]["ran"], json!(false));
        assert!(host.switch_calls().is_empty());
        assert!(state.shared.read().await.plants.contains_key("fern"));
    }

    #[tokio::test(start_paused = true)]
    async fn water_runs_pump_cycle() {
        let (router, _state, host, _el) = app(json!({}));
        let (status, body) = call(router, Method::POST, "/api/plants/fern/water", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ran": true, "confirmed_on": true }));
        assert_eq!(host.on_calls("switch.fern_pump"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_pump_is_500() {
        let (router, _state, host, _el) = app(json!({}));
        host.reject_on("switch.fern_pump");
        let (status, body) = call(router, Method::POST, "/api/plants/fern/water", None).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("turn on switch.fern_pump"));
    }
}
