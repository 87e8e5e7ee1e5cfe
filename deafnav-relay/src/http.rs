/**
 * QUERY & PUSH SURFACE - HTTP API of the relay
 *
 * ROLE :
 * Read-only queries for the rider UI, the SSE push stream, and the two
 * client-originated broadcasts (support chat, SOS).
 *
 * ROUTES :
 * - /health, /system/health
 * - /devices, /devices/{id}
 * - /announcements : active alert board, or one all-clear
 * - /vehicles/{route_id}, /elevators/{line_id} : refresh through the poll
 *   aggregator, fall back to the last snapshot (stale) on failure, 502 if none
 * - /events?room= : server-sent push events
 * - POST /rooms/{room}/messages, POST /sos
 *
 * SHUTDOWN :
 * Open event streams end when the shutdown token fires, so the graceful
 * drain can finish. The drain is not awaited past the grace period.
 */

use crate::alerts::{equipment_flags, vehicle_list};
use crate::board::{AlertBoard, Announcement};
use crate::broadcast::{Broadcaster, ChatMessage, PushEvent, SubscriberId};
use crate::health::{HealthTracker, RelayHealth};
use crate::models::{ELEVATORS_PROVIDER, ProviderKey, ProviderSnapshot, VEHICLES_PROVIDER};
use crate::pipeline::{DeviceStatus, TelemetryPipeline};
use crate::poller::PollAggregator;
use crate::state::SharedClock;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<TelemetryPipeline>,
    pub aggregator: Arc<PollAggregator>,
    pub board: Arc<AlertBoard>,
    pub broadcaster: Arc<Broadcaster>,
    pub health_tracker: HealthTracker,
    pub clock: SharedClock,
    pub shutdown: CancellationToken,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(code: StatusCode, msg: impl Into<String>) -> ApiError {
    (code, Json(json!({ "error": msg.into() })))
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/devices", get(get_devices))
        .route("/devices/{id}", get(get_device))
        .route("/announcements", get(get_announcements))
        .route("/vehicles/{route_id}", get(get_vehicles))
        .route("/elevators/{line_id}", get(get_elevators))
        .route("/events", get(events))
        .route("/rooms/{room}/messages", post(post_room_message))
        .route("/sos", post(post_sos))
        .with_state(app_state)
}

/// Serves until `shutdown` fires, then drains for at most `grace`.
pub async fn serve_with_shutdown(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
    grace: Duration,
) -> std::io::Result<()> {
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();
    let drain_deadline = async {
        shutdown.cancelled().await;
        tokio::time::sleep(grace).await;
    };
    tokio::select! {
        res = server => res,
        _ = drain_deadline => {
            warn!("[http] connections still open after {grace:?}, not waiting any longer");
            Ok(())
        }
    }
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<RelayHealth> {
    Json(app.health_tracker.get_health(&app))
}

// GET /devices
async fn get_devices(State(app): State<AppState>) -> Json<Vec<DeviceStatus>> {
    Json(app.pipeline.devices())
}

// GET /devices/{id}
async fn get_device(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<DeviceStatus>, StatusCode> {
    app.pipeline.device(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

// GET /announcements
async fn get_announcements(State(app): State<AppState>) -> Json<Vec<Announcement>> {
    Json(app.board.announcements(app.clock.now()))
}

/// Fresh snapshot if the refresh works, otherwise the last known one.
async fn snapshot_or_stale(
    app: &AppState,
    provider_id: &str,
    resource_id: &str,
) -> Result<(Arc<ProviderSnapshot>, bool), ApiError> {
    if !app.aggregator.has_provider(provider_id) {
        return Err(api_error(StatusCode::NOT_FOUND, format!("provider {provider_id} not configured")));
    }
    match app.aggregator.refresh(provider_id, resource_id).await {
        Ok(snapshot) => Ok((snapshot, false)),
        Err(e) => {
            let key = ProviderKey::new(provider_id, resource_id);
            match app.aggregator.cache().get(&key) {
                Some(snapshot) => {
                    warn!("[http] serving stale {key}: {e}");
                    Ok((snapshot, true))
                }
                None => Err(api_error(StatusCode::BAD_GATEWAY, e.to_string())),
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VehiclesView {
    route_id: String,
    active_count: usize,
    vehicles: Vec<Value>,
    #[serde(with = "time::serde::rfc3339")]
    fetched_at: OffsetDateTime,
    stale: bool,
}

// GET /vehicles/{route_id}
async fn get_vehicles(State(app): State<AppState>, Path(route_id): Path<String>) -> Result<Json<VehiclesView>, ApiError> {
    let (snapshot, stale) = snapshot_or_stale(&app, VEHICLES_PROVIDER, &route_id).await?;
    let vehicles = vehicle_list(&snapshot.payload).to_vec();
    Ok(Json(VehiclesView {
        route_id,
        active_count: vehicles.len(),
        vehicles,
        fetched_at: snapshot.fetched_at,
        stale,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ElevatorsView {
    line_id: String,
    stations: Value,
    out_of_service: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    fetched_at: OffsetDateTime,
    stale: bool,
}

// GET /elevators/{line_id}
async fn get_elevators(State(app): State<AppState>, Path(line_id): Path<String>) -> Result<Json<ElevatorsView>, ApiError> {
    let (snapshot, stale) = snapshot_or_stale(&app, ELEVATORS_PROVIDER, &line_id).await?;
    let out_of_service = equipment_flags(&line_id, &snapshot.payload)
        .into_iter()
        .filter(|(_, flag)| !flag.working)
        .map(|(subject, _)| subject)
        .collect();
    Ok(Json(ElevatorsView {
        line_id,
        stations: snapshot.payload.clone(),
        out_of_service,
        fetched_at: snapshot.fetched_at,
        stale,
    }))
}

#[derive(Debug, Deserialize)]
struct EventsParams {
    room: Option<String>,
}

/// Unregisters the subscriber when the SSE stream is dropped.
struct SubscriptionGuard {
    id: SubscriberId,
    broadcaster: Arc<Broadcaster>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

fn to_sse(event: &PushEvent) -> Result<SseEvent, axum::Error> {
    let payload = event.payload().map_err(axum::Error::new)?;
    SseEvent::default().event(event.name()).json_data(payload)
}

// GET /events?room=
async fn events(
    State(app): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Sse<impl Stream<Item = Result<SseEvent, axum::Error>>> {
    let (id, rx) = app.broadcaster.open_channel(params.room);
    let guard = SubscriptionGuard {
        id,
        broadcaster: app.broadcaster.clone(),
    };
    let stream = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((to_sse(&event), (rx, guard)))
    })
    .take_until(app.shutdown.clone().cancelled_owned());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomMessageIn {
    sender_id: String,
    message: String,
}

// POST /rooms/{room}/messages
async fn post_room_message(
    State(app): State<AppState>,
    Path(room): Path<String>,
    Json(body): Json<RoomMessageIn>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.message.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "empty message"));
    }
    let msg = ChatMessage {
        room: room.clone(),
        content: body.message,
        sender_id: body.sender_id,
        timestamp: app.clock.now(),
    };
    let delivered = app.broadcaster.emit(PushEvent::ReceiveMessage(msg), Some(&room));
    Ok((StatusCode::ACCEPTED, Json(json!({ "room": room, "delivered": delivered }))))
}

// POST /sos
async fn post_sos(State(app): State<AppState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    info!("[sos] emergency broadcast: {body}");
    let delivered = app.broadcaster.emit(PushEvent::EmergencyBroadcast(body), None);
    (StatusCode::ACCEPTED, Json(json!({ "delivered": delivered })))
}
