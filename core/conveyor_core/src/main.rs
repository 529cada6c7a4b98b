use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod aggregate;
mod cache;
mod model;
mod resolve;
mod routes;
mod session;
mod upstream;

use cache::{Clock, SystemClock};
use routes::AppState;
use session::SessionStore;
use upstream::{
    CachedEmbeds, CachedRedirects, CachedTaskStore, OauthProvider, OembedClient, RedirectClient,
    TodoistClient, TodoistOauth,
};

const DEFAULT_PORT: u16 = 10071;

#[derive(Parser, Debug)]
#[command(name = "conveyor_core", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:10071
    /// - ip (implies port 10071), e.g. 127.0.0.1
    /// - localhost or localhost:port
    #[arg(long, default_value = "127.0.0.1:10071")]
    listen: String,

    /// Todoist sync endpoint.
    #[arg(long, default_value = "https://todoist.com/API/v7/sync")]
    todoist_api_url: String,

    #[arg(long, default_value = "https://todoist.com/oauth/authorize")]
    oauth_authorize_url: String,

    #[arg(long, default_value = "https://todoist.com/oauth/access_token")]
    oauth_token_url: String,

    /// OAuth client id. Login routes are disabled without it.
    #[arg(long, env = "TODOIST_CLIENT_ID")]
    client_id: Option<String>,

    #[arg(long, env = "TODOIST_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// oEmbed endpoint used to render status links.
    #[arg(long, default_value = "https://publish.twitter.com/oembed")]
    oembed_url: String,

    /// Day boundary for overdue tasks when the client doesn't send one
    /// (minutes east of UTC, e.g. 480 for UTC+8).
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    tz_offset_minutes: i32,

    /// Timeout for every upstream request (seconds).
    #[arg(long, default_value_t = 15)]
    upstream_timeout_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.upstream_timeout_seconds))
        .user_agent(concat!("conveyor_core/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let oauth: Option<Arc<dyn OauthProvider>> = match (&args.client_id, &args.client_secret) {
        (Some(id), Some(secret)) => Some(Arc::new(TodoistOauth::new(
            http.clone(),
            &args.oauth_authorize_url,
            &args.oauth_token_url,
            id,
            secret,
        ))),
        _ => {
            warn!("TODOIST_CLIENT_ID/TODOIST_CLIENT_SECRET not set; OAuth login disabled");
            None
        }
    };

    let state = AppState {
        tasks: Arc::new(CachedTaskStore::new(
            Arc::new(TodoistClient::new(http.clone(), &args.todoist_api_url)),
            clock.clone(),
        )),
        embeds: Arc::new(CachedEmbeds::new(
            Arc::new(OembedClient::new(http.clone(), &args.oembed_url)),
            clock.clone(),
        )),
        redirects: Arc::new(CachedRedirects::new(
            Arc::new(RedirectClient::new(http)),
            clock.clone(),
        )),
        oauth,
        sessions: Arc::new(SessionStore::default()),
        clock,
        tz_offset_minutes: args.tz_offset_minutes,
    };

    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let addr = parse_listen(&args.listen)?;
    info!("Conveyor listening on http://{addr}");
    info!("Upstream: {}", args.todoist_api_url);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    if let Some(("localhost", port_str)) = input.rsplit_once(':') {
        let port: u16 = port_str.parse().map_err(|_| {
            anyhow::anyhow!(
                "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                input,
                DEFAULT_PORT
            )
        })?;
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listen_accepts_common_forms() {
        assert_eq!(parse_listen("0.0.0.0:8080").unwrap().port(), 8080);
        assert_eq!(parse_listen("127.0.0.1").unwrap().port(), DEFAULT_PORT);
        assert_eq!(
            parse_listen("localhost:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(parse_listen("localhost").unwrap().port(), DEFAULT_PORT);
        assert!(parse_listen("localhost:http").is_err());
        assert!(parse_listen("example.com:80").is_err());
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::try_parse_from(["conveyor_core", "--tz-offset-minutes", "-300"]).unwrap();
        assert_eq!(args.tz_offset_minutes, -300);
        assert_eq!(args.upstream_timeout_seconds, 15);
        assert_eq!(args.todoist_api_url, "https://todoist.com/API/v7/sync");
    }
}
