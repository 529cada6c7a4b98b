use serde::Deserialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Prev,
    Next,
    Quit,
}

/// Maps one line of terminal input to a key. An empty line is Enter.
pub fn key_from_input(input: &str) -> Option<Key> {
    let trimmed = input.trim_end_matches(['\r', '\n']);
    match trimmed {
        "" => return Some(Key::Next),
        "\x1b[A" | "\x1b[D" => return Some(Key::Prev),
        "\x1b[B" | "\x1b[C" => return Some(Key::Next),
        _ => {}
    }
    match trimmed.trim().to_ascii_lowercase().as_str() {
        "k" | "up" | "left" => Some(Key::Prev),
        "j" | "down" | "right" | "enter" => Some(Key::Next),
        "q" | "quit" => Some(Key::Quit),
        _ => None,
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: i64,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedTask {
    pub id: i64,
    pub html: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewState {
    pub current: usize,
    pub tasks: Vec<Task>,
    pub rendered: Option<RenderedTask>,
}

#[derive(Clone, Debug)]
pub enum Action {
    Loaded(Vec<Task>),
    Prev,
    Next,
    Rendered { id: i64, html: String },
}

impl ViewState {
    pub fn current_task(&self) -> Option<&Task> {
        self.tasks.get(self.current)
    }

    /// Resolved HTML for the current task, if it has arrived.
    pub fn current_html(&self) -> Option<&str> {
        let task = self.current_task()?;
        self.rendered
            .as_ref()
            .filter(|r| r.id == task.id)
            .map(|r| r.html.as_str())
    }
}

pub fn reduce(state: ViewState, action: Action) -> ViewState {
    match action {
        Action::Loaded(tasks) => {
            let current = state.current.min(tasks.len().saturating_sub(1));
            ViewState {
                current,
                tasks,
                rendered: state.rendered,
            }
        }
        Action::Prev => ViewState {
            current: state.current.saturating_sub(1),
            ..state
        },
        Action::Next => {
            let last = state.tasks.len().saturating_sub(1);
            ViewState {
                current: (state.current + 1).min(last),
                ..state
            }
        }
        Action::Rendered { id, html } => {
            // Late responses for a task we already moved away from are dropped.
            if state.current_task().map(|t| t.id) != Some(id) {
                return state;
            }
            ViewState {
                rendered: Some(RenderedTask { id, html }),
                ..state
            }
        }
    }
}
