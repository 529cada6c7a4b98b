use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::upstream::{EmbedFetcher, RedirectResolver};

const SHORTENER_HOSTS: &[&str] = &[
    "t.co",
    "bit.ly",
    "buff.ly",
    "goo.gl",
    "ow.ly",
    "tinyurl.com",
    "is.gd",
    "lnkd.in",
    "dlvr.it",
    "fb.me",
];

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    StatusUrl,
    MarkupLink,
    PlainText,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classified {
    StatusUrl { url: String },
    MarkupLink { html: String },
    PlainText { html: String },
}

impl Classified {
    pub fn kind(&self) -> ContentKind {
        match self {
            Classified::StatusUrl { .. } => ContentKind::StatusUrl,
            Classified::MarkupLink { .. } => ContentKind::MarkupLink,
            Classified::PlainText { .. } => ContentKind::PlainText,
        }
    }

    /// Embed fragments are final; rewritten text still gets shortened URLs expanded.
    pub fn needs_unshorten(&self) -> bool {
        !matches!(self, Classified::StatusUrl { .. })
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Rendered {
    pub kind: ContentKind,
    pub html: String,
}

type Matcher = fn(&str) -> Option<Classified>;

const MATCHERS: &[Matcher] = &[match_status_url, match_markup_link, match_plain_text];

pub fn classify(text: &str) -> Classified {
    MATCHERS
        .iter()
        .find_map(|matcher| matcher(text))
        .unwrap_or_else(|| Classified::PlainText {
            html: text.to_string(),
        })
}

pub async fn resolve_content(
    text: &str,
    embeds: &dyn EmbedFetcher,
    redirects: &dyn RedirectResolver,
) -> Rendered {
    let classified = classify(text);
    let kind = classified.kind();
    let unshorten_after = classified.needs_unshorten();

    let html = match classified {
        Classified::StatusUrl { url } => match embeds.fetch_embed(&url).await {
            Ok(fragment) => fragment.html,
            Err(err) => {
                warn!(%url, "embed fetch failed, keeping raw text: {err}");
                text.to_string()
            }
        },
        Classified::MarkupLink { html } | Classified::PlainText { html } => html,
    };

    let html = if unshorten_after {
        unshorten(html, redirects).await
    } else {
        html
    };
    Rendered { kind, html }
}

fn status_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^https?://(?:www\.|mobile\.)?(?:twitter\.com|x\.com)/[a-z0-9_]+/status/\d+/?$")
            .expect("status url regex")
    })
}

fn markup_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^((?:https?://)?[^\s()<>"]+\.[^\s()<>"]+) \(([^()]+)\)"#)
            .expect("markup link regex")
    })
}

fn bare_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)\b(?:https?://[^\s<>"]+|www\.[^\s<>"]+|(?:[a-z0-9-]+\.)+[a-z]{2,}/[^\s<>"]*)"#,
        )
        .expect("bare url regex")
    })
}

/// Tags and whole anchor elements; linkification never looks inside these.
fn protected_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<a\b[^>]*>.*?</a>|<[^>]*>").expect("protected regex"))
}

fn shortener_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let hosts: Vec<String> = SHORTENER_HOSTS.iter().map(|h| regex::escape(h)).collect();
        Regex::new(&format!(
            r#"(?i)(?:https?://)?\b(?:{})/[^\s"<>”]+"#,
            hosts.join("|")
        ))
        .expect("shortener regex")
    })
}

fn match_status_url(text: &str) -> Option<Classified> {
    let trimmed = text.trim();
    status_url_re().is_match(trimmed).then(|| Classified::StatusUrl {
        url: trimmed.to_string(),
    })
}

fn match_markup_link(text: &str) -> Option<Classified> {
    let trimmed = text.trim();
    let caps = markup_link_re().captures(trimmed)?;
    let whole = caps.get(0)?;
    let url = caps.get(1)?.as_str();
    let title = caps.get(2)?.as_str();
    let html = format!(
        "{}{}",
        anchor(&with_scheme(url), &escape_html(title)),
        linkify(&trimmed[whole.end()..])
    );
    Some(Classified::MarkupLink { html })
}

fn match_plain_text(text: &str) -> Option<Classified> {
    Some(Classified::PlainText { html: linkify(text) })
}

fn linkify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for tag in protected_re().find_iter(text) {
        out.push_str(&linkify_segment(&text[last..tag.start()]));
        out.push_str(tag.as_str());
        last = tag.end();
    }
    out.push_str(&linkify_segment(&text[last..]));
    out
}

fn linkify_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut last = 0;
    for m in bare_url_re().find_iter(segment) {
        let url = trim_url_end(m.as_str());
        if url.is_empty() {
            continue;
        }
        out.push_str(&segment[last..m.start()]);
        out.push_str(&anchor(&with_scheme(url), &escape_html(url)));
        last = m.start() + url.len();
    }
    out.push_str(&segment[last..]);
    out
}

/// Drops sentence punctuation a URL scan swallows, and a closing paren with no
/// opening partner inside the URL.
fn trim_url_end(candidate: &str) -> &str {
    let mut url = candidate;
    loop {
        let Some(last) = url.chars().last() else {
            return url;
        };
        let strip = match last {
            '.' | ',' | ';' | ':' | '!' | '?' | '\'' | '"' => true,
            ')' => url.matches('(').count() < url.matches(')').count(),
            _ => false,
        };
        if !strip {
            return url;
        }
        url = &url[..url.len() - last.len_utf8()];
    }
}

fn has_scheme(url: &str) -> bool {
    let lower = url.get(..8).unwrap_or(url).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn with_scheme(url: &str) -> String {
    if has_scheme(url) {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

fn strip_scheme(url: &str) -> &str {
    if !has_scheme(url) {
        return url;
    }
    url.split_once("://").map(|(_, rest)| rest).unwrap_or(url)
}

fn anchor(href: &str, text: &str) -> String {
    format!(r#"<a href="{}">{}</a>"#, escape_html(href), text)
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_html(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Byte spans of shortened URLs, in order of appearance.
fn short_url_spans(text: &str) -> Vec<(usize, usize)> {
    shortener_re()
        .find_iter(text)
        .filter(|m| {
            // "example.com/t.co/x" is a path, not a shortened link.
            has_scheme(m.as_str())
                || !text[..m.start()]
                    .chars()
                    .last()
                    .is_some_and(|c| matches!(c, '/' | '.' | '-' | '@'))
        })
        .map(|m| (m.start(), m.start() + trim_url_end(m.as_str()).len()))
        .collect()
}

/// Expands the first shortened URL and replaces every spelling of it (with or
/// without scheme) by the resolved target. Resolution failure is not an error.
async fn unshorten(html: String, redirects: &dyn RedirectResolver) -> String {
    let spans = short_url_spans(&html);
    let Some(&(start, end)) = spans.first() else {
        return html;
    };
    let short = html[start..end].to_string();

    // Spans come from rendered HTML, so hrefs carry `&amp;`.
    let resolved = match redirects
        .resolve_redirect(&with_scheme(&unescape_html(&short)))
        .await
    {
        Ok(resolved) => resolved,
        Err(err) => {
            warn!(url = %short, "redirect resolution failed: {err}");
            return html;
        }
    };

    let wanted = strip_scheme(&short).to_ascii_lowercase();
    let replacement = escape_html(&resolved);
    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    for (s, e) in spans {
        if strip_scheme(&html[s..e]).to_ascii_lowercase() != wanted {
            continue;
        }
        out.push_str(&html[last..s]);
        out.push_str(&replacement);
        last = e;
    }
    out.push_str(&html[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::fakes::{FakeEmbeds, FakeRedirects};

    const STATUS: &str = "https://twitter.com/user/status/12345";

    async fn render(text: &str, embeds: &FakeEmbeds, redirects: &FakeRedirects) -> Rendered {
        resolve_content(text, embeds, redirects).await
    }

    #[test]
    fn classify_picks_first_matching_variant() {
        assert_eq!(classify(&format!("  {STATUS}\n")).kind(), ContentKind::StatusUrl);
        assert_eq!(classify("https://x.com/someone/status/9/").kind(), ContentKind::StatusUrl);
        assert_eq!(
            classify(&format!("{STATUS} wow")).kind(),
            ContentKind::PlainText,
            "status url must be the whole text"
        );
        assert_eq!(
            classify("https://example.com/post (Great post)").kind(),
            ContentKind::MarkupLink
        );
        assert_eq!(classify("buy milk").kind(), ContentKind::PlainText);
        assert!(!classify(STATUS).needs_unshorten());
        assert!(classify("buy milk").needs_unshorten());
    }

    #[tokio::test]
    async fn plain_text_is_linkified_then_unshortened() {
        let embeds = FakeEmbeds::default();
        let redirects = FakeRedirects::with("https://t.co/abc", "https://example.com/final");

        let out = render("Check this out https://t.co/abc (great read)", &embeds, &redirects).await;

        assert_eq!(out.kind, ContentKind::PlainText);
        assert_eq!(
            out.html,
            r#"Check this out <a href="https://example.com/final">https://example.com/final</a> (great read)"#
        );
        assert_eq!(redirects.calls(), 1);
        assert_eq!(embeds.calls(), 0);
    }

    #[tokio::test]
    async fn status_url_returns_fragment_verbatim() {
        let fragment = r#"<blockquote class="twitter-tweet"><p>see https://t.co/zzz</p></blockquote>"#;
        let embeds = FakeEmbeds::with(STATUS, fragment);
        let redirects = FakeRedirects::with("https://t.co/zzz", "https://example.com/");

        let out = render(STATUS, &embeds, &redirects).await;

        assert_eq!(out.kind, ContentKind::StatusUrl);
        assert_eq!(out.html, fragment);
        assert_eq!(embeds.calls(), 1);
        assert_eq!(redirects.calls(), 0);
    }

    #[tokio::test]
    async fn embed_failure_falls_back_to_raw_text() {
        let embeds = FakeEmbeds::default();
        let redirects = FakeRedirects::default();
        let text = format!("{STATUS} ");

        let out = render(&text, &embeds, &redirects).await;

        assert_eq!(out.kind, ContentKind::StatusUrl);
        assert_eq!(out.html, text);
    }

    #[tokio::test]
    async fn markup_link_becomes_anchor() {
        let embeds = FakeEmbeds::default();
        let redirects = FakeRedirects::default();

        let out = render("example.com/post (Read <me>) later", &embeds, &redirects).await;
        assert_eq!(out.kind, ContentKind::MarkupLink);
        assert_eq!(
            out.html,
            r#"<a href="https://example.com/post">Read &lt;me&gt;</a> later"#
        );

        let out = render("http://example.com/a (A)", &embeds, &redirects).await;
        assert_eq!(out.html, r#"<a href="http://example.com/a">A</a>"#);

        let out = render("a.com/x (T) see b.com/y", &embeds, &redirects).await;
        assert_eq!(
            out.html,
            r#"<a href="https://a.com/x">T</a> see <a href="https://b.com/y">b.com/y</a>"#
        );
    }

    #[tokio::test]
    async fn markup_link_gets_unshortened() {
        let embeds = FakeEmbeds::default();
        let redirects = FakeRedirects::with("https://bit.ly/xyz", "https://example.com/long?a=1&b=2");

        let out = render("bit.ly/xyz (Article)", &embeds, &redirects).await;
        assert_eq!(
            out.html,
            r#"<a href="https://example.com/long?a=1&amp;b=2">Article</a>"#
        );
    }

    #[tokio::test]
    async fn plain_text_normalizes_schemes_and_trims_punctuation() {
        let embeds = FakeEmbeds::default();
        let redirects = FakeRedirects::default();

        let out = render("see www.rust-lang.org, and docs.rs/regex.", &embeds, &redirects).await;
        assert_eq!(
            out.html,
            r#"see <a href="https://www.rust-lang.org">www.rust-lang.org</a>, and <a href="https://docs.rs/regex">docs.rs/regex</a>."#
        );
        assert_eq!(redirects.calls(), 0);
    }

    #[tokio::test]
    async fn unresolvable_short_url_is_left_alone() {
        let embeds = FakeEmbeds::default();
        let redirects = FakeRedirects::default();

        let out = render("read bit.ly/nope", &embeds, &redirects).await;
        assert_eq!(out.html, r#"read <a href="https://bit.ly/nope">bit.ly/nope</a>"#);
        assert_eq!(redirects.calls(), 1);
    }

    #[tokio::test]
    async fn scheme_less_short_url_is_replaced_in_href_and_text() {
        let embeds = FakeEmbeds::default();
        let redirects = FakeRedirects::with("https://t.co/abc", "https://example.com/final");

        let out = render("see t.co/abc", &embeds, &redirects).await;
        assert_eq!(
            out.html,
            r#"see <a href="https://example.com/final">https://example.com/final</a>"#
        );
    }

    #[tokio::test]
    async fn short_url_with_query_is_resolved_unescaped() {
        let embeds = FakeEmbeds::default();
        let redirects = FakeRedirects::with("https://t.co/abc?x=1&y=2", "https://example.com/final");

        let out = render("read t.co/abc?x=1&y=2", &embeds, &redirects).await;
        assert_eq!(
            out.html,
            r#"read <a href="https://example.com/final">https://example.com/final</a>"#
        );
        assert_eq!(redirects.calls(), 1);
    }

    #[tokio::test]
    async fn resolution_is_idempotent() {
        let embeds = FakeEmbeds::default();
        let redirects = FakeRedirects::with("https://t.co/abc", "https://example.com/final");

        for text in [
            "Check this out https://t.co/abc (great read)",
            "https://example.com/post (Great post) and more",
            "mixed www.example.org/x and <b>bold</b>",
            "a.com/x (T) see b.com/y",
        ] {
            let once = render(text, &embeds, &redirects).await.html;
            let twice = render(&once, &embeds, &redirects).await.html;
            assert_eq!(once, twice, "input: {text}");
            assert_eq!(once.matches("<a ").count(), twice.matches("<a ").count());
        }
    }

    #[tokio::test]
    async fn existing_anchors_are_not_rewrapped() {
        let embeds = FakeEmbeds::default();
        let redirects = FakeRedirects::default();

        let out = render(
            r#"<a href="https://a.com/x">https://a.com/x</a> and https://b.com/y"#,
            &embeds,
            &redirects,
        )
        .await;
        assert_eq!(
            out.html,
            r#"<a href="https://a.com/x">https://a.com/x</a> and <a href="https://b.com/y">https://b.com/y</a>"#
        );
    }

    #[test]
    fn short_url_spans_respect_host_boundaries() {
        assert!(short_url_spans("fat.co/x").is_empty());
        assert!(short_url_spans("https://example.com/t.co/x").is_empty());

        let text = "a https://t.co/abc. then T.CO/def)";
        let spans: Vec<&str> = short_url_spans(text).iter().map(|&(s, e)| &text[s..e]).collect();
        assert_eq!(spans, vec!["https://t.co/abc", "T.CO/def"]);
    }

    #[test]
    fn trim_url_end_keeps_balanced_parens() {
        assert_eq!(trim_url_end("https://en.wikipedia.org/wiki/Rust_(language)"), "https://en.wikipedia.org/wiki/Rust_(language)");
        assert_eq!(trim_url_end("https://example.com/a)."), "https://example.com/a");
        assert_eq!(trim_url_end("..."), "");
    }
}
