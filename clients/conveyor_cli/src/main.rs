use std::future::Future;

use clap::Parser;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

mod nav;
mod view;

use nav::{key_from_input, reduce, Action, Key, ViewState};
use view::Dashboard;

#[derive(Parser, Debug)]
#[command(name = "conveyor_cli", version)]
struct Args {
    /// Core base URL, e.g. http://127.0.0.1:10071
    #[arg(long, default_value = "http://127.0.0.1:10071")]
    core_url: String,

    /// Todoist API token, sent to the core as a bearer token.
    #[arg(long, env = "TODOIST_TOKEN", hide_env_values = true)]
    token: String,

    /// Local offset for "due today" (minutes east of UTC). Defaults to this
    /// machine's offset.
    #[arg(long, allow_hyphen_values = true)]
    tz_offset_minutes: Option<i32>,
}

struct Core {
    client: reqwest::Client,
    base: String,
    token: String,
}

impl Core {
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let res = self
            .client
            .get(format!("{}{}", self.base, path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !res.status().is_success() {
            anyhow::bail!("http_{}", res.status().as_u16());
        }
        Ok(res.json().await?)
    }

    async fn get_ok<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        #[derive(serde::Deserialize)]
        struct OkResponse<T> {
            ok: bool,
            data: Option<T>,
        }

        let body: OkResponse<T> = self.get_json(path).await?;
        if !body.ok {
            anyhow::bail!("not_ok");
        }
        body.data.ok_or_else(|| anyhow::anyhow!("missing_data"))
    }

    async fn dashboard(&self, tz_offset_minutes: i32) -> anyhow::Result<Dashboard> {
        self.get_json(&format!("/tasks/?tz_offset_minutes={tz_offset_minutes}"))
            .await
    }

    async fn content(&self, id: i64) -> anyhow::Result<String> {
        #[derive(serde::Deserialize)]
        struct ItemContent {
            html: String,
        }

        let item: ItemContent = self.get_ok(&format!("/items/{id}/content")).await?;
        Ok(item.html)
    }
}

/// Fetches resolved content for the current task. On failure the state is
/// returned untouched so the last good screen stays up.
async fn load_current<F, Fut>(state: ViewState, fetch: F) -> ViewState
where
    F: FnOnce(i64) -> Fut,
    Fut: Future<Output = anyhow::Result<String>>,
{
    let Some(id) = state.current_task().map(|t| t.id) else {
        return state;
    };
    if state.current_html().is_some() {
        return state;
    }
    match fetch(id).await {
        Ok(html) => reduce(state, Action::Rendered { id, html }),
        Err(e) => {
            error!("content fetch for task {id} failed: {e}");
            state
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let tz_offset_minutes = args
        .tz_offset_minutes
        .unwrap_or_else(|| chrono::Local::now().offset().local_minus_utc() / 60);

    let core = Core {
        client: reqwest::Client::new(),
        base: args.core_url.trim_end_matches('/').to_string(),
        token: args.token,
    };
    info!("Using core at {}", core.base);

    let dashboard = core.dashboard(tz_offset_minutes).await?;
    println!("{}", view::summary(&dashboard));

    let mut state = reduce(ViewState::default(), Action::Loaded(dashboard.todoist.items));
    if state.tasks.is_empty() {
        println!("{}", view::render(&state));
        return Ok(());
    }
    state = load_current(state, |id| core.content(id)).await;
    println!("{}", view::render(&state));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let action = match key_from_input(&line) {
            Some(Key::Quit) => break,
            Some(Key::Prev) => Action::Prev,
            Some(Key::Next) => Action::Next,
            None => {
                println!("keys: j/down/right/enter = next, k/up/left = previous, q = quit");
                continue;
            }
        };
        let before = state.current;
        state = reduce(state, action);
        if state.current == before {
            continue;
        }
        state = load_current(state, |id| core.content(id)).await;
        println!("{}", view::render(&state));
    }
    Ok(())
}
