use std::net::SocketAddr;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tower_http::cors::CorsLayer;

use crate::api::BackendClient;
use crate::config::Settings;
use crate::dispatch::TargetMode;
use crate::filter::FilterState;
use crate::history::NameFilter;
use crate::roster::EntryId;
use crate::session::{SessionError, SharedSession};

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub session: SharedSession,
    pub backend: BackendClient,
}

pub async fn serve(settings: Settings, session: SharedSession, backend: BackendClient) -> Result<()> {
    let cors_permissive = settings.cors_permissive;
    let state = AppState {
        settings: settings.clone(),
        session,
        backend,
    };

    let mut app = Router::new()
        .route("/", get(index))
        .route("/api/summary", get(api_summary))
        .route("/api/cards", get(api_cards))
        .route("/api/history", get(api_history))
        .route("/api/history/day/{date}", get(api_history_day))
        .route("/api/history/trend", get(api_history_trend))
        .route("/api/roster/swap", post(api_roster_swap))
        .route("/api/roster/placeholder", post(api_placeholder_add))
        .route("/api/roster/placeholder/{id}", delete(api_placeholder_remove))
        .route("/api/roster/bands/delete", post(api_bands_delete))
        .route("/api/roster/note", put(api_note_set))
        .route("/api/selection/toggle", post(api_selection_toggle))
        .route("/api/selection/clear", post(api_selection_clear))
        .route("/api/selection/all", post(api_selection_all))
        .route("/api/selection/band", post(api_selection_band))
        .route("/api/filter", put(api_filter_set))
        .route("/api/condensed", put(api_condensed_set))
        .route("/api/refresh", put(api_refresh_set))
        .route("/api/banner/dismiss", post(api_banner_dismiss))
        .route("/api/templates", get(api_templates_list).put(api_templates_put))
        .route("/api/templates/{name}", delete(api_templates_delete))
        .route("/api/dispatch", post(api_dispatch))
        .route("/api/dispatch/targets", get(api_dispatch_targets))
        .route("/api/backend/status", get(api_backend_status))
        .route("/api/backend/start-server", post(api_backend_start))
        .with_state(state);

    if cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }

    let addr: SocketAddr = format!("{}:{}", settings.listen_host, settings.listen_port)
        .parse()
        .expect("listen addr parse");

    log::info!("http.start url=http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn session_err(e: SessionError) -> Response {
    let code = if e.is_validation() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        log::error!("http.storage_error {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

fn backend_err(e: anyhow::Error) -> Response {
    log::warn!("http.backend_error {e:#}");
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({ "error": format!("{e:#}") })),
    )
        .into_response()
}

async fn index(State(st): State<AppState>) -> impl IntoResponse {
    Html(format!(
        r#"<!doctype html>
<html lang="en">
  <head><meta charset="utf-8" /><title>fleetboard</title></head>
  <body style="font-family: ui-monospace, monospace; padding: 2rem;">
    <h1>fleetboard</h1>
    <p>backend: <code>{}</code> • sqlite: <code>{}</code></p>
    <p>JSON API under <code>/api/</code>; start at <a href="/api/summary">/api/summary</a>
       and <a href="/api/cards">/api/cards</a>.</p>
  </body>
</html>"#,
        st.settings.backend_base_url,
        st.settings.sqlite_path,
    ))
}

async fn api_summary(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.session.lock().summary())
}

async fn api_cards(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.session.lock().cards())
}

#[derive(Deserialize)]
struct HistoryQ {
    days: Option<usize>,
}

async fn api_history(State(st): State<AppState>, Query(q): Query<HistoryQ>) -> impl IntoResponse {
    let days = q.days.unwrap_or(st.settings.history_days as usize);
    Json(st.session.lock().history().last_days(days))
}

#[derive(Deserialize)]
struct DayQ {
    server: Option<String>,
    name: Option<String>,
    /// "exact" or "substring" (default).
    r#match: Option<String>,
}

async fn api_history_day(
    State(st): State<AppState>,
    Path(date): Path<String>,
    Query(q): Query<DayQ>,
) -> impl IntoResponse {
    let name_filter = q.name.map(|n| match q.r#match.as_deref() {
        Some("exact") => NameFilter::Exact(n),
        _ => NameFilter::Substring(n),
    });
    Json(
        st.session
            .lock()
            .day_view(&date, q.server.as_deref(), name_filter.as_ref()),
    )
}

async fn api_history_trend(State(st): State<AppState>) -> impl IntoResponse {
    let s = st.session.lock();
    let history = s.history();
    Json(serde_json::json!({
        "total": history.total_series(),
        "servers": history.server_series(),
    }))
}

#[derive(Deserialize)]
struct SwapBody {
    i: usize,
    j: usize,
}

async fn api_roster_swap(State(st): State<AppState>, Json(b): Json<SwapBody>) -> Response {
    match st.session.lock().swap(b.i, b.j) {
        Ok(swapped) => Json(serde_json::json!({ "swapped": swapped })).into_response(),
        Err(e) => session_err(e),
    }
}

#[derive(Deserialize, Default)]
struct PlaceholderBody {
    note: Option<String>,
}

async fn api_placeholder_add(
    State(st): State<AppState>,
    body: Option<Json<PlaceholderBody>>,
) -> Response {
    let note = body.and_then(|Json(b)| b.note);
    match st.session.lock().add_placeholder(note.as_deref()) {
        Ok(id) => Json(serde_json::json!({ "id": id })).into_response(),
        Err(e) => session_err(e),
    }
}

async fn api_placeholder_remove(State(st): State<AppState>, Path(id): Path<String>) -> Response {
    match st.session.lock().remove_placeholder(&EntryId::parse(&id)) {
        Ok(()) => Json(serde_json::json!({ "removed": id })).into_response(),
        Err(e) => session_err(e),
    }
}

#[derive(Deserialize)]
struct BandsBody {
    bands: Vec<usize>,
}

async fn api_bands_delete(State(st): State<AppState>, Json(b): Json<BandsBody>) -> Response {
    match st.session.lock().bulk_remove_bands(&b.bands) {
        Ok(removed) => Json(serde_json::json!({ "removed": removed })).into_response(),
        Err(e) => session_err(e),
    }
}

#[derive(Deserialize)]
struct NoteBody {
    id: String,
    note: String,
}

async fn api_note_set(State(st): State<AppState>, Json(b): Json<NoteBody>) -> Response {
    match st.session.lock().set_note(&EntryId::parse(&b.id), &b.note) {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => session_err(e),
    }
}

#[derive(Deserialize)]
struct ToggleBody {
    id: String,
}

async fn api_selection_toggle(State(st): State<AppState>, Json(b): Json<ToggleBody>) -> impl IntoResponse {
    let mut s = st.session.lock();
    let selected = s.selection.toggle(EntryId::parse(&b.id));
    Json(serde_json::json!({ "selected": selected, "count": s.selection.len() }))
}

async fn api_selection_clear(State(st): State<AppState>) -> impl IntoResponse {
    let mut s = st.session.lock();
    s.selection.clear();
    Json(serde_json::json!({ "count": 0 }))
}

async fn api_selection_all(State(st): State<AppState>) -> impl IntoResponse {
    let mut s = st.session.lock();
    let cards = s.cards();
    let entries: Vec<_> = cards.into_iter().map(|c| c.entry).collect();
    let filter = s.filter.clone();
    s.selection.select_all_visible(&entries, &filter);
    Json(serde_json::json!({ "count": s.selection.len() }))
}

#[derive(Deserialize)]
struct BandSelBody {
    band: usize,
    checked: bool,
}

async fn api_selection_band(State(st): State<AppState>, Json(b): Json<BandSelBody>) -> impl IntoResponse {
    let mut s = st.session.lock();
    let cards = s.cards();
    let entries: Vec<_> = cards.into_iter().map(|c| c.entry).collect();
    s.selection.toggle_row_band(b.band, b.checked, &entries);
    Json(serde_json::json!({ "count": s.selection.len() }))
}

async fn api_filter_set(State(st): State<AppState>, Json(f): Json<FilterState>) -> Response {
    let mut s = st.session.lock();
    match s.set_filter(f) {
        Ok(()) => Json(s.summary()).into_response(),
        Err(e) => session_err(e),
    }
}

#[derive(Deserialize)]
struct CondensedBody {
    condensed: bool,
}

async fn api_condensed_set(State(st): State<AppState>, Json(b): Json<CondensedBody>) -> Response {
    let mut s = st.session.lock();
    match s.set_condensed(b.condensed) {
        Ok(()) => Json(serde_json::json!({ "condensed": b.condensed })).into_response(),
        Err(e) => session_err(e),
    }
}

#[derive(Deserialize)]
struct RefreshBody {
    secs: u64,
}

async fn api_refresh_set(State(st): State<AppState>, Json(b): Json<RefreshBody>) -> Response {
    match st.session.lock().set_refresh_secs(b.secs) {
        Ok(()) => Json(serde_json::json!({ "secs": b.secs, "paused": b.secs == 0 })).into_response(),
        Err(e) => session_err(e),
    }
}

async fn api_banner_dismiss(State(st): State<AppState>) -> impl IntoResponse {
    st.session.lock().dismiss_error();
    Json(serde_json::json!({ "ok": true }))
}

async fn api_templates_list(State(st): State<AppState>) -> Response {
    let store = st.session.lock().store().clone();
    match store.list_templates() {
        Ok(rows) => {
            let out: Vec<JsonValue> = rows
                .into_iter()
                .map(|(name, body)| serde_json::json!({ "name": name, "body": body }))
                .collect();
            Json(JsonValue::Array(out)).into_response()
        }
        Err(e) => session_err(SessionError::Storage(e)),
    }
}

#[derive(Deserialize)]
struct TemplateBody {
    name: String,
    body: String,
}

async fn api_templates_put(State(st): State<AppState>, Json(b): Json<TemplateBody>) -> Response {
    if b.name.trim().is_empty() || b.body.trim().is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": "template name and body must be non-empty" })),
        )
            .into_response();
    }
    let store = st.session.lock().store().clone();
    match store.upsert_template(b.name.trim(), &b.body) {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => session_err(SessionError::Storage(e)),
    }
}

async fn api_templates_delete(State(st): State<AppState>, Path(name): Path<String>) -> Response {
    let store = st.session.lock().store().clone();
    match store.delete_template(&name) {
        Ok(deleted) => Json(serde_json::json!({ "deleted": deleted })).into_response(),
        Err(e) => session_err(SessionError::Storage(e)),
    }
}

#[derive(Deserialize)]
struct DispatchBody {
    mode: TargetMode,
    payload: String,
}

#[derive(Deserialize)]
struct TargetsQ {
    mode: TargetMode,
}

/// Preview of who a send would reach, without sending anything.
async fn api_dispatch_targets(
    State(st): State<AppState>,
    Query(q): Query<TargetsQ>,
) -> impl IntoResponse {
    let targets = st.session.lock().resolve_targets(q.mode);
    Json(serde_json::json!({ "count": targets.len(), "targets": targets }))
}

async fn api_dispatch(State(st): State<AppState>, Json(b): Json<DispatchBody>) -> Response {
    // Validate and snapshot the target list under the lock, then release it
    // for the backend round-trip.
    let plan = match st.session.lock().plan_dispatch(b.mode, &b.payload) {
        Ok(plan) => plan,
        Err(e) => return session_err(e),
    };

    log::info!("dispatch.send targets={} bytes={}", plan.targets.len(), plan.payload.len());
    match st.backend.send_ini(&plan.targets, &plan.payload).await {
        Ok(res) => Json(serde_json::json!({
            "targets": plan.targets.len(),
            "result": res,
        }))
        .into_response(),
        Err(e) => backend_err(e),
    }
}

async fn api_backend_status(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.session.lock().summary().backend)
}

#[derive(Deserialize)]
struct StartBody {
    #[serde(rename = "type")]
    kind: String,
}

async fn api_backend_start(State(st): State<AppState>, Json(b): Json<StartBody>) -> Response {
    match st.backend.start_server(&b.kind).await {
        Ok(res) => Json(res).into_response(),
        Err(e) => backend_err(e),
    }
}
