use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Snapshot {
    pub items: Vec<Item>,
    pub labels: Vec<Label>,
    pub projects: Vec<Project>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub sync_token: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Item {
    pub id: i64,
    pub content: String,
    pub project_id: i64,
    #[serde(default)]
    pub labels: Vec<i64>,
    #[serde(rename = "due_date_utc", alias = "due_date", default)]
    pub due_date: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub checked: bool,
    #[serde(default, deserialize_with = "flag")]
    pub in_history: bool,
    #[serde(default, deserialize_with = "flag")]
    pub is_deleted: bool,
    #[serde(default, deserialize_with = "flag")]
    pub is_archived: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Label {
    pub id: i64,
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub name: String,
    #[serde(default, deserialize_with = "flag")]
    pub inbox_project: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Filter {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub query: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct User {
    pub id: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Todoist encodes lifecycle flags as `0/1`; newer payloads use booleans.
/// Null counts as unset.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        None => false,
        Some(Flag::Bool(b)) => b,
        Some(Flag::Int(n)) => n != 0,
    })
}
