//! REST control plane shared by every device.
//!
//! `?device_id=D` selects the target when several PDUs are registered; with
//! exactly one it is auto-selected, and ambiguous requests get HTTP 400 with
//! the list of available devices. Errors are `{error}` bodies with
//! 400/404/409/503. CORS allows all origins so the static UI can be served
//! from anywhere on the private network.

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::automation::RuleError;
use crate::history::HistoryStore;
use crate::model::{ats_source_label, OutletAction, Snapshot};
use crate::mqtt::MqttHandler;
use crate::pdu_config::PduConfig;
use crate::state::SharedState;
use crate::transport::DeviceField;

/// Snapshot age after which a device counts as stale for health checks.
const STALE_AFTER_SECS: f64 = 30.0;

/// Explicit start/end ranges are clamped to this span.
const MAX_QUERY_SPAN_SECS: i64 = 90 * 86_400;

/// Triggers a subnet scan for unconfigured PDUs. Injected by the manager;
/// absent when no scanner is available.
#[async_trait]
pub trait PduDiscoverer: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<serde_json::Value>>;
}

#[derive(Clone)]
pub struct AppState {
    pub state: SharedState,
    pub history: HistoryStore,
    pub mqtt: MqttHandler,
    pub discovery: Option<Arc<dyn PduDiscoverer>>,
}

#[derive(Deserialize, Default)]
struct DeviceQuery {
    device_id: Option<String>,
    range: Option<String>,
    start: Option<i64>,
    end: Option<i64>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/status", get(api_status))
        .route("/api/pdus", get(api_list_pdus).post(api_add_pdu))
        .route("/api/pdus/discover", post(api_discover_pdus))
        .route("/api/pdus/{device_id}", put(api_update_pdu).delete(api_delete_pdu))
        .route("/api/config", get(api_get_config).put(api_update_config))
        .route("/api/device/name", put(api_set_device_name))
        .route("/api/device/location", put(api_set_device_location))
        .route("/api/rules", get(api_list_rules).post(api_create_rule))
        .route("/api/rules/{name}", put(api_update_rule).delete(api_delete_rule))
        .route("/api/events", get(api_events))
        .route("/api/outlets/{n}/command", post(api_outlet_command))
        .route(
            "/api/outlets/{n}/name",
            get(api_get_outlet_name).put(api_rename_outlet),
        )
        .route("/api/outlet-names", get(api_outlet_names))
        .route("/api/history/banks", get(api_history_banks))
        .route("/api/history/outlets", get(api_history_outlets))
        .route("/api/history/banks.csv", get(api_history_banks_csv))
        .route("/api/history/outlets.csv", get(api_history_outlets_csv))
        .route("/api/reports", get(api_list_reports))
        .route("/api/reports/latest", get(api_latest_report))
        .route("/api/reports/{id}", get(api_get_report))
        .layer(middleware::from_fn(cors))
        .with_state(app)
}

pub async fn serve(app: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("web api listening on http://{addr}");
    axum::serve(listener, router(app)).await?;
    Ok(())
}

async fn cors(request: axum::extract::Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        header::HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        header::HeaderValue::from_static("Content-Type"),
    );
    response
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn resolve_device(app: &AppState, query: Option<&str>) -> Result<String, Response> {
    match app.state.resolve_device_id(query).await {
        Some(device_id) => Ok(device_id),
        None => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "device_id required (multiple PDUs registered)",
                "available_devices": app.state.registered_devices().await,
            })),
        )
            .into_response()),
    }
}

/// Parse `range=1h|6h|24h|7d|30d` or explicit `start=&end=` (clamped to 90
/// days) into a timestamp window.
fn parse_time_range(query: &DeviceQuery) -> (i64, i64) {
    let now = chrono::Utc::now().timestamp();
    if let (Some(start), Some(end)) = (query.start, query.end) {
        let end = end.min(start + MAX_QUERY_SPAN_SECS);
        return (start, end);
    }
    let seconds = match query.range.as_deref() {
        Some("6h") => 6 * 3600,
        Some("24h") => 24 * 3600,
        Some("7d") => 7 * 86_400,
        Some("30d") => 30 * 86_400,
        _ => 3600,
    };
    (now - seconds, now)
}

fn csv_response(filename: &str, header_fields: &[&str], rows: Vec<Vec<String>>) -> Response {
    let mut csv = header_fields.join(",");
    csv.push('\n');
    for row in rows {
        csv.push_str(&row.join(","));
        csv.push('\n');
    }
    (
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        csv,
    )
        .into_response()
}

fn csv_opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Health and status
// ---------------------------------------------------------------------------

async fn api_health(State(app): State<AppState>) -> Response {
    let mut issues: Vec<String> = Vec::new();
    let mut any_data = false;

    for device_id in app.state.registered_devices().await {
        match app.state.snapshot_age(&device_id).await {
            None => issues.push(format!("[{device_id}] No data received yet")),
            Some(age) if age > STALE_AFTER_SECS => {
                any_data = true;
                issues.push(format!("[{device_id}] Data is {age:.0}s stale"));
            }
            Some(_) => any_data = true,
        }
    }

    let mqtt_status = app.mqtt.get_status().await;
    if mqtt_status["connected"] != json!(true) {
        issues.push("MQTT disconnected".to_string());
    }

    let history_health = app.history.get_health().await;
    if history_health["healthy"] != json!(true) {
        issues.push("History write errors detected".to_string());
    }

    let healthy = issues.is_empty() && any_data;
    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "issues": issues,
        "pdu_count": app.state.registered_devices().await.len(),
        "subsystems": {
            "mqtt": mqtt_status,
            "history": history_health,
        },
        "uptime_seconds": app.state.uptime_seconds(),
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn api_status(State(app): State<AppState>, Query(query): Query<DeviceQuery>) -> Response {
    let device_id = match resolve_device(&app, query.device_id.as_deref()).await {
        Ok(id) => id,
        Err(response) => return response,
    };

    let Some((snapshot, age)) = app.state.snapshot(&device_id).await else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "no data yet");
    };

    let body = status_body(&device_id, &snapshot, age, app.mqtt.get_status().await);
    Json(body).into_response()
}

fn status_body(
    device_id: &str,
    data: &Snapshot,
    age: f64,
    mqtt_status: serde_json::Value,
) -> serde_json::Value {
    let mut inputs = serde_json::Map::new();
    for (idx, bank) in &data.banks {
        inputs.insert(
            idx.to_string(),
            json!({
                "number": bank.number,
                "voltage": bank.voltage,
                "current": bank.current,
                "power": bank.power,
                "apparent_power": bank.apparent_power,
                "power_factor": bank.power_factor,
                "load_state": bank.load_state.as_str(),
            }),
        );
    }

    let mut outlets = serde_json::Map::new();
    for (n, outlet) in &data.outlets {
        outlets.insert(
            n.to_string(),
            json!({
                "number": outlet.number,
                "name": outlet.name,
                "state": outlet.state.as_str(),
                "current": outlet.current,
                "power": outlet.power,
                "energy": outlet.energy,
            }),
        );
    }

    let preferred = data.ats_preferred_source;
    let current = data.ats_current_source;
    let transferred = matches!((preferred, current), (Some(p), Some(c)) if p != c);

    let source_json = |source: &Option<crate::model::SourceData>| match source {
        Some(s) => json!({
            "voltage": s.voltage,
            "frequency": s.frequency,
            "voltage_status": s.voltage_status.as_str(),
        }),
        None => json!({
            "voltage": null,
            "frequency": null,
            "voltage_status": "unknown",
        }),
    };

    let mut body = json!({
        "device": {
            "name": data.device_name,
            "id": device_id,
            "outlet_count": data.outlet_count,
            "phase_count": data.phase_count,
        },
        "ats": {
            "preferred_source": preferred,
            "preferred_label": ats_source_label(preferred),
            "current_source": current,
            "current_label": ats_source_label(current),
            "auto_transfer": data.ats_auto_transfer,
            "transferred": transferred,
            "redundancy_ok": data.redundancy_ok,
            "source_a": source_json(&data.source_a),
            "source_b": source_json(&data.source_b),
        },
        "inputs": inputs,
        "outlets": outlets,
        "summary": {
            "total_power": (data.total_power() * 10.0).round() / 10.0,
            "input_voltage": data.input_voltage,
            "input_frequency": data.input_frequency,
            "active_outlets": data.active_outlets(),
            "total_outlets": data.outlet_count,
        },
        "mqtt": mqtt_status,
        "data_age_seconds": (age * 10.0).round() / 10.0,
        "ts": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
    });
    if let Some(identity) = &data.identity {
        body["identity"] = serde_json::to_value(identity).unwrap_or_default();
    }
    body
}

// ---------------------------------------------------------------------------
// PDU management
// ---------------------------------------------------------------------------

async fn api_list_pdus(State(app): State<AppState>) -> Response {
    let mut pdus = Vec::new();
    for config in app.state.configs().await {
        let device_id = config.device_id.clone();
        let snapshot = app.state.snapshot(&device_id).await;
        let age = snapshot.as_ref().map(|(_, age)| (age * 10.0).round() / 10.0);

        let status = match age {
            None => "no_data",
            Some(age) if age > STALE_AFTER_SECS => "degraded",
            Some(_) => "healthy",
        };

        let identity = snapshot
            .as_ref()
            .and_then(|(snap, _)| snap.identity.as_ref())
            .map(|identity| serde_json::to_value(identity).unwrap_or_default());

        pdus.push(json!({
            "device_id": device_id,
            "config": serde_json::to_value(&config).unwrap_or_default(),
            "identity": identity,
            "status": status,
            "data_age_seconds": age,
            "has_data": snapshot.is_some(),
        }));
    }
    Json(json!({ "count": pdus.len(), "pdus": pdus })).into_response()
}

async fn api_add_pdu(State(app): State<AppState>, body: Json<serde_json::Value>) -> Response {
    let config: PduConfig = match serde_json::from_value(body.0) {
        Ok(config) => config,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid PDU config: {e}")),
    };
    if let Err(e) = config.validate() {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let device_id = config.device_id.clone();
    if app.state.registered_devices().await.contains(&device_id) {
        return error_response(
            StatusCode::CONFLICT,
            format!("PDU '{device_id}' already registered"),
        );
    }

    if let Err(e) = app.state.update_configs(move |configs| configs.push(config)).await {
        error!("failed to persist PDU config: {e:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("config save failed: {e}"),
        );
    }
    (StatusCode::CREATED, Json(json!({ "device_id": device_id, "ok": true }))).into_response()
}

async fn api_update_pdu(
    State(app): State<AppState>,
    Path(device_id): Path<String>,
    body: Json<serde_json::Value>,
) -> Response {
    if !app.state.registered_devices().await.contains(&device_id) {
        return error_response(StatusCode::NOT_FOUND, format!("PDU '{device_id}' not found"));
    }

    let mut value = body.0;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("device_id".into(), json!(device_id));
    }
    let config: PduConfig = match serde_json::from_value(value) {
        Ok(config) => config,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid PDU config: {e}")),
    };
    if let Err(e) = config.validate() {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let target = device_id.clone();
    if let Err(e) = app
        .state
        .update_configs(move |configs| {
            if let Some(slot) = configs.iter_mut().find(|c| c.device_id == target) {
                *slot = config;
            }
        })
        .await
    {
        error!("failed to persist PDU config: {e:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("config save failed: {e}"),
        );
    }
    Json(json!({ "device_id": device_id, "ok": true })).into_response()
}

async fn api_delete_pdu(State(app): State<AppState>, Path(device_id): Path<String>) -> Response {
    if !app.state.registered_devices().await.contains(&device_id) {
        return error_response(StatusCode::NOT_FOUND, format!("PDU '{device_id}' not found"));
    }

    let target = device_id.clone();
    if let Err(e) = app
        .state
        .update_configs(move |configs| configs.retain(|c| c.device_id != target))
        .await
    {
        error!("failed to persist PDU config: {e:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("config save failed: {e}"),
        );
    }
    app.state.unregister_device(&device_id).await;
    Json(json!({ "device_id": device_id, "deleted": true })).into_response()
}

async fn api_discover_pdus(State(app): State<AppState>) -> Response {
    let Some(discovery) = app.discovery.clone() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "discovery not available");
    };
    match discovery.discover().await {
        Ok(results) => Json(json!({ "discovered": results })).into_response(),
        Err(e) => {
            error!("pdu discovery failed: {e:#}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("discovery failed: {e}"),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge config
// ---------------------------------------------------------------------------

async fn api_get_config(State(app): State<AppState>) -> Response {
    Json(json!({
        "poll_interval": app.state.poll_interval(),
        "pdu_count": app.state.registered_devices().await.len(),
    }))
    .into_response()
}

async fn api_update_config(
    State(app): State<AppState>,
    body: Json<serde_json::Value>,
) -> Response {
    let Some(interval) = body.get("poll_interval") else {
        return error_response(StatusCode::BAD_REQUEST, "no valid config fields provided");
    };
    let Some(interval) = interval.as_f64().filter(|v| *v >= 1.0) else {
        return error_response(StatusCode::BAD_REQUEST, "poll_interval must be >= 1");
    };
    app.state.set_poll_interval(interval);
    Json(json!({ "updated": { "poll_interval": interval }, "ok": true })).into_response()
}

// ---------------------------------------------------------------------------
// Device field setters
// ---------------------------------------------------------------------------

async fn api_set_device_name(
    State(app): State<AppState>,
    Query(query): Query<DeviceQuery>,
    body: Json<serde_json::Value>,
) -> Response {
    set_device_field(&app, query, body.0, DeviceField::Name, "name").await
}

async fn api_set_device_location(
    State(app): State<AppState>,
    Query(query): Query<DeviceQuery>,
    body: Json<serde_json::Value>,
) -> Response {
    set_device_field(&app, query, body.0, DeviceField::Location, "location").await
}

async fn set_device_field(
    app: &AppState,
    query: DeviceQuery,
    body: serde_json::Value,
    field: DeviceField,
    key: &str,
) -> Response {
    let device_id = match resolve_device(app, query.device_id.as_deref()).await {
        Ok(id) => id,
        Err(response) => return response,
    };

    let value = body
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if value.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, format!("{key} is required"));
    }

    let Some(commander) = app.state.commander_for(&device_id).await else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "device not available");
    };
    match commander.set_field(field, value.clone()).await {
        Some(true) => {
            let mut body = serde_json::Map::new();
            body.insert("device_id".into(), json!(device_id));
            body.insert(key.to_string(), json!(value));
            body.insert("ok".into(), json!(true));
            Json(serde_json::Value::Object(body)).into_response()
        }
        Some(false) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "device set failed"),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "device not available"),
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

async fn engine_or_unavailable(
    app: &AppState,
    query: &DeviceQuery,
) -> Result<(String, Arc<tokio::sync::Mutex<crate::automation::RuleEngine>>), Response> {
    let device_id = match resolve_device(app, query.device_id.as_deref()).await {
        Ok(id) => id,
        Err(response) => return Err(response),
    };
    match app.state.engine_for(&device_id).await {
        Some(engine) => Ok((device_id, engine)),
        None => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "automation engine not available",
        )),
    }
}

async fn api_list_rules(State(app): State<AppState>, Query(query): Query<DeviceQuery>) -> Response {
    match engine_or_unavailable(&app, &query).await {
        Ok((_, engine)) => Json(engine.lock().await.list_rules()).into_response(),
        Err(response) => response,
    }
}

async fn api_create_rule(
    State(app): State<AppState>,
    Query(query): Query<DeviceQuery>,
    body: Json<serde_json::Value>,
) -> Response {
    let (_, engine) = match engine_or_unavailable(&app, &query).await {
        Ok(found) => found,
        Err(response) => return response,
    };
    let result = engine.lock().await.create_rule(&body.0);
    match result {
        Ok(rule) => (StatusCode::CREATED, Json(serde_json::to_value(&rule).unwrap_or_default()))
            .into_response(),
        Err(e @ RuleError::Duplicate(_)) => error_response(StatusCode::CONFLICT, e.to_string()),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn api_update_rule(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<DeviceQuery>,
    body: Json<serde_json::Value>,
) -> Response {
    let (_, engine) = match engine_or_unavailable(&app, &query).await {
        Ok(found) => found,
        Err(response) => return response,
    };
    let result = engine.lock().await.update_rule(&name, &body.0);
    match result {
        Ok(rule) => Json(serde_json::to_value(&rule).unwrap_or_default()).into_response(),
        Err(e @ RuleError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn api_delete_rule(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let (_, engine) = match engine_or_unavailable(&app, &query).await {
        Ok(found) => found,
        Err(response) => return response,
    };
    let result = engine.lock().await.delete_rule(&name);
    match result {
        Ok(()) => Json(json!({ "deleted": name })).into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e.to_string()),
    }
}

async fn api_events(State(app): State<AppState>, Query(query): Query<DeviceQuery>) -> Response {
    match engine_or_unavailable(&app, &query).await {
        Ok((_, engine)) => Json(engine.lock().await.get_events()).into_response(),
        Err(response) => response,
    }
}

// ---------------------------------------------------------------------------
// Outlet commands and names
// ---------------------------------------------------------------------------

async fn api_outlet_command(
    State(app): State<AppState>,
    Path(n): Path<String>,
    Query(query): Query<DeviceQuery>,
    body: Json<serde_json::Value>,
) -> Response {
    let Ok(n) = n.parse::<u16>() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid outlet number");
    };
    let device_id = match resolve_device(&app, query.device_id.as_deref()).await {
        Ok(id) => id,
        Err(response) => return response,
    };

    let action_str = body
        .get("action")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_lowercase();
    let action = match OutletAction::parse(&action_str) {
        Some(action @ (OutletAction::On | OutletAction::Off | OutletAction::Reboot)) => action,
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid action: {action_str}"),
            )
        }
    };

    let Some(commander) = app.state.commander_for(&device_id).await else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "command handler not available");
    };

    match commander.execute(n, action).await {
        Some(true) => Json(json!({
            "outlet": n,
            "action": action.as_str(),
            "device_id": device_id,
            "ok": true,
        }))
        .into_response(),
        Some(false) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "outlet": n,
                "action": action.as_str(),
                "ok": false,
                "error": "command failed",
            })),
        )
            .into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "command handler not available"),
    }
}

async fn api_get_outlet_name(
    State(app): State<AppState>,
    Path(n): Path<String>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let Ok(n) = n.parse::<u16>() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid outlet number");
    };
    let device_id = match resolve_device(&app, query.device_id.as_deref()).await {
        Ok(id) => id,
        Err(response) => return response,
    };
    let Some(handles) = app.state.device_handles(&device_id).await else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "device not available");
    };
    let name = handles.outlet_names.read().await.names().get(&n).cloned();
    Json(json!({ "outlet": n, "name": name })).into_response()
}

async fn api_rename_outlet(
    State(app): State<AppState>,
    Path(n): Path<String>,
    Query(query): Query<DeviceQuery>,
    body: Json<serde_json::Value>,
) -> Response {
    let Ok(n) = n.parse::<u16>() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid outlet number");
    };
    let device_id = match resolve_device(&app, query.device_id.as_deref()).await {
        Ok(id) => id,
        Err(response) => return response,
    };
    let Some(handles) = app.state.device_handles(&device_id).await else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "device not available");
    };

    let name = body
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    // Empty name deletes the override.
    let override_value = if name.is_empty() { None } else { Some(name.clone()) };
    if let Err(e) = handles.outlet_names.write().await.set(n, override_value) {
        error!("failed to save outlet names: {e:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("save failed: {e}"),
        );
    }
    Json(json!({ "outlet": n, "name": name, "ok": true })).into_response()
}

async fn api_outlet_names(State(app): State<AppState>, Query(query): Query<DeviceQuery>) -> Response {
    let device_id = match resolve_device(&app, query.device_id.as_deref()).await {
        Ok(id) => id,
        Err(response) => return response,
    };
    let Some(handles) = app.state.device_handles(&device_id).await else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "device not available");
    };
    let names = handles.outlet_names.read().await.names().clone();
    Json(serde_json::to_value(names).unwrap_or_default()).into_response()
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

async fn api_history_banks(
    State(app): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let device_id = app.state.resolve_device_id(query.device_id.as_deref()).await;
    let (start, end) = parse_time_range(&query);
    match app
        .history
        .query_banks(start, end, None, device_id.as_deref())
        .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("history query failed: {e}")),
    }
}

async fn api_history_outlets(
    State(app): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let device_id = app.state.resolve_device_id(query.device_id.as_deref()).await;
    let (start, end) = parse_time_range(&query);
    match app
        .history
        .query_outlets(start, end, None, device_id.as_deref())
        .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("history query failed: {e}")),
    }
}

async fn api_history_banks_csv(
    State(app): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let device_id = app.state.resolve_device_id(query.device_id.as_deref()).await;
    let (start, end) = parse_time_range(&query);
    match app
        .history
        .query_banks(start, end, None, device_id.as_deref())
        .await
    {
        Ok(rows) => csv_response(
            "bank_history.csv",
            &["bucket", "bank", "voltage", "current", "power", "apparent", "pf"],
            rows.into_iter()
                .map(|r| {
                    vec![
                        r.bucket.to_string(),
                        r.bank.to_string(),
                        csv_opt(r.voltage),
                        csv_opt(r.current),
                        csv_opt(r.power),
                        csv_opt(r.apparent),
                        csv_opt(r.pf),
                    ]
                })
                .collect(),
        ),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("history query failed: {e}")),
    }
}

async fn api_history_outlets_csv(
    State(app): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let device_id = app.state.resolve_device_id(query.device_id.as_deref()).await;
    let (start, end) = parse_time_range(&query);
    match app
        .history
        .query_outlets(start, end, None, device_id.as_deref())
        .await
    {
        Ok(rows) => csv_response(
            "outlet_history.csv",
            &["bucket", "outlet", "current", "power", "energy"],
            rows.into_iter()
                .map(|r| {
                    vec![
                        r.bucket.to_string(),
                        r.outlet.to_string(),
                        csv_opt(r.current),
                        csv_opt(r.power),
                        csv_opt(r.energy),
                    ]
                })
                .collect(),
        ),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("history query failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

async fn api_list_reports(
    State(app): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let device_id = app.state.resolve_device_id(query.device_id.as_deref()).await;
    match app.history.list_reports(device_id.as_deref()).await {
        Ok(reports) => Json(reports).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("report query failed: {e}")),
    }
}

async fn api_latest_report(
    State(app): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let device_id = app.state.resolve_device_id(query.device_id.as_deref()).await;
    match app.history.get_latest_report(device_id.as_deref()).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no reports yet"),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("report query failed: {e}")),
    }
}

async fn api_get_report(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(report_id) = id.parse::<i64>() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid report id");
    };
    match app.history.get_report(report_id).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "report not found"),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("report query failed: {e}")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
