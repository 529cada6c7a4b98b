use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::aggregate::{aggregate, is_active, AggregateError};
use crate::cache::{decode_url_param, Clock};
use crate::resolve::{resolve_content, ContentKind};
use crate::session::{self, Session, SessionStore};
use crate::upstream::{CachedTaskStore, EmbedFetcher, OauthProvider, RedirectResolver, UpstreamError};

const TZ_OFFSET_MINUTES_MIN: i32 = -14 * 60;
const TZ_OFFSET_MINUTES_MAX: i32 = 14 * 60;

#[derive(Clone)]
pub struct AppState {
    pub tasks: Arc<CachedTaskStore>,
    pub embeds: Arc<dyn EmbedFetcher>,
    pub redirects: Arc<dyn RedirectResolver>,
    pub oauth: Option<Arc<dyn OauthProvider>>,
    pub sessions: Arc<SessionStore>,
    pub clock: Arc<dyn Clock>,
    pub tz_offset_minutes: i32,
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct SessionInfo {
    logged_in: bool,
}

#[derive(Serialize)]
struct ItemContent {
    id: i64,
    kind: ContentKind,
    html: String,
}

#[derive(Deserialize)]
struct TasksQuery {
    /// Client local offset minutes, e.g. 480 for UTC+8.
    tz_offset_minutes: Option<i32>,
}

#[derive(Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LabelId {
    Num(i64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

#[derive(Deserialize)]
struct UnusedLabelsRequest {
    labels: OneOrMany<LabelId>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/session", get(get_session))
        .route("/connect/todoist", get(connect_todoist))
        .route("/todoist-callback/", get(todoist_callback))
        .route("/logout/", get(logout))
        .route("/tasks/", get(get_tasks))
        .route("/items/:id/content", get(get_item_content))
        // `btoa` output may contain `/`, so these capture the rest of the path.
        .route("/tweet/*url", get(get_tweet))
        .route("/unshorten/*url", get(get_unshorten))
        .route("/unused-labels/", post(post_unused_labels))
        .with_state(state)
}

fn err(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrResponse { ok: false, error })).into_response()
}

fn upstream_failure(context: &str, e: &UpstreamError) -> Response {
    error!("{context} failed: {e}");
    match e {
        UpstreamError::Status(401 | 403) => err(StatusCode::UNAUTHORIZED, "upstream_unauthorized"),
        _ => err(StatusCode::BAD_GATEWAY, "upstream_error"),
    }
}

async fn require_token(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    state
        .sessions
        .token_for(headers)
        .await
        .ok_or_else(|| err(StatusCode::UNAUTHORIZED, "unauthorized"))
}

fn normalize_tz_offset_minutes(v: Option<i32>, default: i32) -> i32 {
    v.unwrap_or(default)
        .clamp(TZ_OFFSET_MINUTES_MIN, TZ_OFFSET_MINUTES_MAX)
}

fn tz_offset_from_minutes(minutes: i32) -> time::UtcOffset {
    time::UtcOffset::from_whole_seconds(minutes.saturating_mul(60))
        .unwrap_or(time::UtcOffset::UTC)
}

async fn health() -> impl IntoResponse {
    Json(OkResponse {
        ok: true,
        data: Some(HealthInfo {
            service: "conveyor_core",
            version: env!("CARGO_PKG_VERSION"),
        }),
    })
}

async fn get_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let logged_in = state.sessions.token_for(&headers).await.is_some();
    Json(OkResponse {
        ok: true,
        data: Some(SessionInfo { logged_in }),
    })
    .into_response()
}

async fn connect_todoist(State(state): State<AppState>) -> Response {
    let Some(oauth) = state.oauth.as_ref() else {
        return err(StatusCode::SERVICE_UNAVAILABLE, "oauth_not_configured");
    };

    let oauth_state = uuid::Uuid::new_v4().simple().to_string();
    let url = match oauth.authorize_url(&oauth_state) {
        Ok(url) => url,
        Err(e) => {
            error!("authorize_url failed: {e}");
            return err(StatusCode::INTERNAL_SERVER_ERROR, "oauth_not_configured");
        }
    };
    let id = state
        .sessions
        .create(Session {
            token: None,
            oauth_state: Some(oauth_state),
        })
        .await;

    (
        [(header::SET_COOKIE, session::session_cookie(&id))],
        Redirect::to(&url),
    )
        .into_response()
}

async fn todoist_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<CallbackQuery>,
) -> Response {
    let Some(oauth) = state.oauth.as_ref() else {
        return err(StatusCode::SERVICE_UNAVAILABLE, "oauth_not_configured");
    };
    let Some(id) = session::session_id(&headers) else {
        return err(StatusCode::BAD_REQUEST, "invalid_state");
    };
    let expected = state.sessions.get(&id).await.and_then(|s| s.oauth_state);
    if expected.is_none() || expected != q.state {
        return err(StatusCode::BAD_REQUEST, "invalid_state");
    }
    let Some(code) = q.code.filter(|c| !c.is_empty()) else {
        return err(StatusCode::BAD_REQUEST, "missing_code");
    };

    let token = match oauth.exchange_code(&code).await {
        Ok(token) => token,
        Err(e) => {
            error!("oauth code exchange failed: {e}");
            return err(StatusCode::BAD_GATEWAY, "oauth_failed");
        }
    };
    state
        .sessions
        .update(&id, |s| {
            s.token = Some(token);
            s.oauth_state = None;
        })
        .await;
    info!("session logged in");

    Redirect::to("/").into_response()
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(id) = session::session_id(&headers) {
        state.sessions.remove(&id).await;
    }
    (
        [(header::SET_COOKIE, session::clear_cookie())],
        Redirect::to("/"),
    )
        .into_response()
}

async fn get_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<TasksQuery>,
) -> Response {
    let token = match require_token(&state, &headers).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let snapshot = match state.tasks.snapshot(&token).await {
        Ok(s) => s,
        Err(e) => return upstream_failure("snapshot fetch", &e),
    };

    let tz_offset = tz_offset_from_minutes(normalize_tz_offset_minutes(
        q.tz_offset_minutes,
        state.tz_offset_minutes,
    ));
    let now = state.clock.now().to_offset(tz_offset);

    match aggregate(&snapshot, now) {
        Ok(view) => Json(view).into_response(),
        Err(AggregateError::MissingInbox) => {
            error!("snapshot has no inbox project");
            err(StatusCode::BAD_GATEWAY, "missing_inbox_project")
        }
    }
}

async fn get_item_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let token = match require_token(&state, &headers).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let snapshot = match state.tasks.snapshot(&token).await {
        Ok(s) => s,
        Err(e) => return upstream_failure("snapshot fetch", &e),
    };
    let Some(item) = snapshot
        .items
        .iter()
        .find(|item| item.id == id && is_active(item))
    else {
        return err(StatusCode::NOT_FOUND, "item_not_found");
    };

    let rendered = resolve_content(&item.content, &*state.embeds, &*state.redirects).await;
    Json(OkResponse {
        ok: true,
        data: Some(ItemContent {
            id,
            kind: rendered.kind,
            html: rendered.html,
        }),
    })
    .into_response()
}

async fn get_tweet(State(state): State<AppState>, Path(encoded): Path<String>) -> Response {
    let Some(url) = decode_url_param(&encoded) else {
        return err(StatusCode::BAD_REQUEST, "invalid_url");
    };
    match state.embeds.fetch_embed(&url).await {
        Ok(fragment) => Json(fragment).into_response(),
        Err(e) => upstream_failure("embed fetch", &e),
    }
}

async fn get_unshorten(State(state): State<AppState>, Path(encoded): Path<String>) -> Response {
    let Some(url) = decode_url_param(&encoded) else {
        return err(StatusCode::BAD_REQUEST, "invalid_url");
    };
    match state.redirects.resolve_redirect(&url).await {
        Ok(resolved) => Json(resolved).into_response(),
        Err(e) => upstream_failure("redirect resolution", &e),
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            ct.trim()
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
        })
}

/// Label ids from a JSON body or a checkbox form, where each ticked box adds
/// one `labels=` pair.
fn label_ids_from_body(headers: &HeaderMap, body: &[u8]) -> Option<Vec<i64>> {
    let ids = if is_form(headers) {
        form_urlencoded::parse(body)
            .filter(|(key, _)| key == "labels" || key == "labels[]")
            .map(|(_, value)| LabelId::Text(value.into_owned()))
            .collect()
    } else {
        match serde_json::from_slice::<UnusedLabelsRequest>(body).ok()?.labels {
            OneOrMany::Many(v) => v,
            OneOrMany::One(v) => vec![v],
        }
    };
    parse_label_ids(ids)
}

fn parse_label_ids(ids: Vec<LabelId>) -> Option<Vec<i64>> {
    let ids: Option<Vec<i64>> = ids
        .into_iter()
        .map(|id| match id {
            LabelId::Num(n) => Some(n),
            LabelId::Text(s) => s.trim().parse().ok(),
        })
        .collect();
    ids.filter(|v| !v.is_empty())
}

async fn post_unused_labels(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = match require_token(&state, &headers).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let Some(ids) = label_ids_from_body(&headers, &body) else {
        return err(StatusCode::BAD_REQUEST, "invalid_labels");
    };

    // Best effort: the snapshot is invalidated and the client redirected even
    // if the upstream rejected some deletions.
    if let Err(e) = state.tasks.delete_labels(&token, &ids).await {
        warn!("unused label cleanup incomplete: {e}");
    }
    Redirect::to("/").into_response()
}
