use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::nav::{Task, ViewState};

/// The parts of `GET /tasks/` the terminal shows.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub overdue: Vec<Task>,
    pub inbox: Vec<Task>,
    pub unused_labels: Vec<Value>,
    pub todoist: TodoistPart,
}

#[derive(Debug, Deserialize)]
pub struct TodoistPart {
    pub items: Vec<Task>,
}

pub fn summary(d: &Dashboard) -> String {
    let mut parts = vec![format!("{} tasks", d.todoist.items.len())];
    if !d.overdue.is_empty() {
        parts.push(format!("{} overdue", d.overdue.len()));
    }
    if !d.inbox.is_empty() {
        parts.push(format!("{} in inbox", d.inbox.len()));
    }
    if !d.unused_labels.is_empty() {
        parts.push(format!("{} unused labels", d.unused_labels.len()));
    }
    parts.join(" | ")
}

fn anchor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<a\b[^>]*\bhref="([^"]*)"[^>]*>(.*?)</a>"#).expect("anchor regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex"))
}

/// Flattens resolved HTML for a terminal: anchors become `text <href>`, other
/// tags are dropped, and the basic entities are decoded.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    for caps in anchor_re().captures_iter(html) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&strip_tags(&html[last..whole.start()]));
        let href = decode_entities(&caps[1]);
        let text = strip_tags(&caps[2]);
        let text = text.trim();
        if text.is_empty() || text == href {
            out.push_str(&href);
        } else {
            out.push_str(&format!("{text} <{href}>"));
        }
        last = whole.end();
    }
    out.push_str(&strip_tags(&html[last..]));
    out.trim().to_string()
}

fn strip_tags(html: &str) -> String {
    decode_entities(&tag_re().replace_all(html, ""))
}

fn decode_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// One screen: position, then resolved content or the raw text while it loads.
pub fn render(state: &ViewState) -> String {
    let Some(task) = state.current_task() else {
        return "Nothing to triage.".to_string();
    };
    let body = match state.current_html() {
        Some(html) => html_to_text(html),
        None => task.content.clone(),
    };
    format!("[{}/{}] {}", state.current + 1, state.tasks.len(), body)
}
