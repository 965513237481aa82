use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};

use super::error::ApiError;
use super::principal::Principal;
use super::AppState;
use crate::session::{validate_session_id, PollError, SessionInfo, SessionRegistry, Updates};
use crate::sim::{SimError, World};

/// Upper bound on a single read or write routed through the simulation thread.
const SIM_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `f` on the simulation thread and wait for its result.
async fn on_sim<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&mut World) -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(SIM_CALL_TIMEOUT, state.executor.submit(f)).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            tracing::warn!("simulation call timed out");
            Err(ApiError::SimulationUnavailable)
        }
    }
}

pub(super) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ── sessions ───────────────────────────────────────────────────────

pub(super) async fn session_create() -> (StatusCode, Json<Value>) {
    let id = uuid::Uuid::new_v4().to_string();
    (StatusCode::CREATED, Json(json!({ "id": id })))
}

pub(super) async fn session_list(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list())
}

pub(super) async fn updates_poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Principal(principal): Principal,
) -> Result<Json<Updates>, ApiError> {
    let updates = state.sessions.poll(&id, &principal).await?;
    Ok(Json(updates))
}

pub(super) async fn updates_end(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    state.sessions.end_session(&id);
    StatusCode::NO_CONTENT
}

/// One poll cycle with owned arguments, so the future can outlive a
/// `select!` iteration.
async fn poll_owned(
    sessions: SessionRegistry,
    id: String,
    principal: String,
) -> Result<Updates, PollError> {
    sessions.poll(&id, &principal).await
}

pub(super) async fn ws_updates(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Principal(principal): Principal,
) -> Result<Response, ApiError> {
    validate_session_id(&id).map_err(ApiError::InvalidSessionId)?;
    Ok(ws.on_upgrade(move |socket| handle_ws_updates(socket, state, id, principal)))
}

async fn handle_ws_updates(socket: WebSocket, state: AppState, id: String, principal: String) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    if *shutdown_rx.borrow() {
        let _ = ws_tx.send(close_message("server shutting down")).await;
        return;
    }

    // The poll future lives across loop iterations: dropping it mid-resolve
    // would lose tags it already drained.
    let mut next = Box::pin(poll_owned(
        state.sessions.clone(),
        id.clone(),
        principal.clone(),
    ));

    loop {
        tokio::select! {
            result = &mut next => {
                match result {
                    Ok(updates) => {
                        let text = Value::Object(updates).to_string();
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(session = %id, error = %e, "push poll failed");
                        let _ = ws_tx.send(close_message("failed to resolve updates")).await;
                        break;
                    }
                }
                next = Box::pin(poll_owned(state.sessions.clone(), id.clone(), principal.clone()));
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(session = %id, "WebSocket received shutdown signal, closing");
                    let _ = ws_tx.send(close_message("server shutting down")).await;
                    let _ = ws_tx.flush().await;
                    break;
                }
            }
        }
    }
}

fn close_message(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: axum::extract::ws::close_code::NORMAL,
        reason: reason.into(),
    }))
}

pub(super) async fn sse_updates(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Principal(principal): Principal,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    validate_session_id(&id).map_err(ApiError::InvalidSessionId)?;

    let (guard, mut shutdown_rx) = state.shutdown.register();
    let shutting_down = async move {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                return;
            }
        }
    };

    let sessions = state.sessions.clone();
    // `None` once a poll has failed: the error event is the last one.
    let stream = futures::stream::unfold(Some((sessions, guard)), move |st| {
        let id = id.clone();
        let principal = principal.clone();
        async move {
            let (sessions, guard) = st?;
            match sessions.poll(&id, &principal).await {
                Ok(updates) => {
                    let event = Event::default()
                        .event("updates")
                        .data(Value::Object(updates).to_string());
                    Some((Ok::<_, Infallible>(event), Some((sessions, guard))))
                }
                Err(e) => {
                    tracing::warn!(session = %id, error = %e, "push poll failed");
                    let err = ApiError::from(e);
                    let event = Event::default().event("error").data(
                        json!({ "error": { "code": err.code(), "message": err.message() } })
                            .to_string(),
                    );
                    Some((Ok::<_, Infallible>(event), None))
                }
            }
        }
    })
    .take_until(Box::pin(shutting_down));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ── simulation reads ───────────────────────────────────────────────

pub(super) async fn car_list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(on_sim(&state, |w| w.cars_json()).await?))
}

pub(super) async fn car_get(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let lookup = guid.clone();
    on_sim(&state, move |w| w.car_json(&lookup))
        .await?
        .map(Json)
        .ok_or(ApiError::CarNotFound(guid))
}

pub(super) async fn trainset_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id: u32 = id
        .parse()
        .map_err(|_| ApiError::InvalidRequest(format!("trainset id '{id}' is not a number")))?;
    Ok(Json(on_sim(&state, move |w| w.trainset_json(id)).await?))
}

pub(super) async fn job_list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(on_sim(&state, |w| w.jobs_json()).await?))
}

pub(super) async fn junction_list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(on_sim(&state, |w| w.junctions_json()).await?))
}

pub(super) async fn junction_state(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(on_sim(&state, |w| w.junction_state_json()).await?))
}

pub(super) async fn player_get(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(on_sim(&state, |w| w.player_json()).await?))
}

pub(super) async fn track_get(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(on_sim(&state, |w| w.track_json()).await?))
}

// ── simulation writes ──────────────────────────────────────────────

pub(super) async fn junction_toggle(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Principal(principal): Principal,
) -> Result<Json<usize>, ApiError> {
    let index: usize = id.parse().map_err(|_| ApiError::JunctionNotFound(id.clone()))?;
    tracing::debug!(junction = index, principal = %principal, "toggle requested");
    let selected = on_sim(&state, move |w| w.toggle_junction(index)).await??;
    Ok(Json(selected))
}

pub(super) async fn job_take(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Principal(principal): Principal,
) -> Result<StatusCode, ApiError> {
    tracing::debug!(job = %id, principal = %principal, "take requested");
    on_sim(&state, move |w| w.take_job(&id)).await??;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn car_remove(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    Principal(principal): Principal,
) -> Result<StatusCode, ApiError> {
    tracing::debug!(car = %guid, principal = %principal, "removal requested");
    on_sim(&state, move |w| w.remove_car(&guid).map(|_| ())).await??;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn car_control(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    Principal(principal): Principal,
    Query(commands): Query<Vec<(String, String)>>,
) -> Result<StatusCode, ApiError> {
    tracing::debug!(car = %guid, principal = %principal, commands = commands.len(), "control requested");
    let applied: Result<bool, SimError> =
        on_sim(&state, move |w| w.control_loco(&guid, &commands)).await?;
    if applied? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::InvalidCommand)
    }
}

pub(super) async fn not_found() -> impl IntoResponse {
    ApiError::NotFound
}
