use std::collections::HashMap;

use axum::http::{header, HeaderMap};
use tokio::sync::Mutex;

pub const SESSION_COOKIE: &str = "task-conveyor";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    pub token: Option<String>,
    /// Pending OAuth `state`, set between `/connect/todoist` and the callback.
    pub oauth_state: Option<String>,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub async fn create(&self, session: Session) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.sessions.lock().await.insert(id.clone(), session);
        id
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Applies `f` to an existing session. Returns false if the id is unknown.
    pub async fn update(&self, id: &str, f: impl FnOnce(&mut Session)) -> bool {
        match self.sessions.lock().await.get_mut(id) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &str) {
        self.sessions.lock().await.remove(id);
    }

    /// API token for a request: a bearer header wins over the session cookie.
    pub async fn token_for(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(token) = bearer_token(headers) {
            return Some(token);
        }
        let id = session_id(headers)?;
        self.get(&id).await?.token.filter(|t| !t.is_empty())
    }
}

pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

pub fn session_cookie(id: &str) -> String {
    format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly; SameSite=Lax")
}

pub fn clear_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}
