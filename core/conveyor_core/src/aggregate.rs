use std::collections::{HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;
use time::{
    format_description::well_known::Rfc3339, macros::format_description, Duration, OffsetDateTime,
    Time,
};

use crate::model::{Filter, Item, Label, Project, Snapshot, User};

/// Display name used when an item references an id the snapshot doesn't declare.
pub const UNKNOWN_NAME: &str = "UNKNOWN";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    /// The account has no project flagged as inbox. This is malformed upstream
    /// state, not an empty result.
    #[error("snapshot has no inbox project")]
    MissingInbox,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct NameCount {
    pub name: String,
    pub count: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedView {
    pub label_counts: Vec<NameCount>,
    pub project_counts: Vec<NameCount>,
    pub inbox: Vec<Item>,
    pub overdue: Vec<Item>,
    pub unused_labels: Vec<Label>,
    pub todoist: TodoistData,
}

#[derive(Clone, Debug, Serialize)]
pub struct TodoistData {
    pub items: Vec<Item>,
    pub labels: Vec<Label>,
    pub user: Option<User>,
    pub filters: Vec<Filter>,
    pub projects: Vec<Project>,
}

pub fn aggregate(snapshot: &Snapshot, now: OffsetDateTime) -> Result<AggregatedView, AggregateError> {
    let active = only_active(&snapshot.items);

    Ok(AggregatedView {
        label_counts: label_counts(&active, &snapshot.labels),
        project_counts: project_counts(&active, &snapshot.projects),
        inbox: inbox(&active, &snapshot.projects)?,
        overdue: overdue(&active, now),
        unused_labels: unused_labels(&active, &snapshot.labels),
        todoist: TodoistData {
            items: active,
            labels: snapshot.labels.clone(),
            user: snapshot.user.clone(),
            filters: snapshot.filters.clone(),
            projects: snapshot.projects.clone(),
        },
    })
}

pub fn is_active(item: &Item) -> bool {
    !(item.checked || item.in_history || item.is_deleted || item.is_archived)
}

pub fn only_active(items: &[Item]) -> Vec<Item> {
    items.iter().filter(|item| is_active(item)).cloned().collect()
}

/// Parses a Todoist due timestamp (`Fri 20 Feb 2026 23:59:59 +0000`), falling
/// back to RFC 3339.
pub fn parse_due_date(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    let todoist = format_description!(
        "[weekday repr:short] [day padding:none] [month repr:short] [year] [hour]:[minute]:[second] [offset_hour sign:mandatory][offset_minute]"
    );
    OffsetDateTime::parse(raw, todoist)
        .or_else(|_| OffsetDateTime::parse(raw, &Rfc3339))
        .ok()
}

/// Start and end (inclusive) of the calendar day containing `now`, in `now`'s offset.
fn day_window(now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let start = now.replace_time(Time::MIDNIGHT);
    let end = start + Duration::days(1) - Duration::nanoseconds(1);
    (start, end)
}

pub fn is_overdue(item: &Item, now: OffsetDateTime) -> bool {
    let Some(due) = item.due_date.as_deref().and_then(parse_due_date) else {
        return false;
    };
    let (start, end) = day_window(now);
    due < now || (start <= due && due <= end)
}

pub fn overdue(items: &[Item], now: OffsetDateTime) -> Vec<Item> {
    items
        .iter()
        .filter(|item| is_overdue(item, now))
        .cloned()
        .collect()
}

pub fn inbox(items: &[Item], projects: &[Project]) -> Result<Vec<Item>, AggregateError> {
    let inbox_id = projects
        .iter()
        .find(|p| p.inbox_project)
        .map(|p| p.id)
        .ok_or(AggregateError::MissingInbox)?;

    Ok(items
        .iter()
        .filter(|item| item.project_id == inbox_id)
        .cloned()
        .collect())
}

pub fn label_counts(items: &[Item], labels: &[Label]) -> Vec<NameCount> {
    let names = names_by_id(labels.iter().map(|l| (l.id, l.name.as_str())));
    count_names(
        items
            .iter()
            .flat_map(|item| item.labels.iter())
            .map(|id| names.get(id).copied().unwrap_or(UNKNOWN_NAME)),
    )
}

pub fn project_counts(items: &[Item], projects: &[Project]) -> Vec<NameCount> {
    let names = names_by_id(projects.iter().map(|p| (p.id, p.name.as_str())));
    count_names(
        items
            .iter()
            .map(|item| names.get(&item.project_id).copied().unwrap_or(UNKNOWN_NAME)),
    )
}

/// Declared labels whose name no item references.
pub fn unused_labels(items: &[Item], labels: &[Label]) -> Vec<Label> {
    let names = names_by_id(labels.iter().map(|l| (l.id, l.name.as_str())));
    let in_use: HashSet<&str> = items
        .iter()
        .flat_map(|item| item.labels.iter())
        .filter_map(|id| names.get(id).copied())
        .collect();

    labels
        .iter()
        .filter(|label| !in_use.contains(label.name.as_str()))
        .cloned()
        .collect()
}

fn names_by_id<'a>(pairs: impl Iterator<Item = (i64, &'a str)>) -> HashMap<i64, &'a str> {
    let mut out = HashMap::new();
    for (id, name) in pairs {
        out.entry(id).or_insert(name);
    }
    out
}

/// Counts per name, descending; equal counts keep first-seen order.
fn count_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<NameCount> {
    let mut counts: Vec<NameCount> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for name in names {
        match index.get(name) {
            Some(&i) => counts[i].count += 1,
            None => {
                index.insert(name, counts.len());
                counts.push(NameCount {
                    name: name.to_string(),
                    count: 1,
                });
            }
        }
    }
    counts.sort_by(|a, b| b.count.cmp(&a.count));
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{item, label, project, snapshot};

    fn at(rfc3339: &str) -> OffsetDateTime {
        OffsetDateTime::parse(rfc3339, &Rfc3339).unwrap()
    }

    fn due(mut it: Item, raw: &str) -> Item {
        it.due_date = Some(raw.to_string());
        it
    }

    #[test]
    fn is_active_matches_four_flag_rule() {
        for mask in 0u8..16 {
            let mut it = item(1, 1, &[]);
            it.checked = mask & 1 != 0;
            it.in_history = mask & 2 != 0;
            it.is_deleted = mask & 4 != 0;
            it.is_archived = mask & 8 != 0;
            assert_eq!(is_active(&it), mask == 0, "mask {mask:04b}");
        }
    }

    #[test]
    fn parse_due_date_accepts_todoist_and_rfc3339() {
        let a = parse_due_date("Fri 20 Feb 2026 23:59:59 +0000").unwrap();
        assert_eq!(a, at("2026-02-20T23:59:59Z"));

        let b = parse_due_date("Mon 2 Mar 2026 08:30:00 +0100").unwrap();
        assert_eq!(b, at("2026-03-02T07:30:00Z"));

        assert_eq!(parse_due_date("2026-02-20T12:00:00Z"), Some(at("2026-02-20T12:00:00Z")));
        assert_eq!(parse_due_date("next tuesday"), None);
        assert_eq!(parse_due_date(""), None);
    }

    #[test]
    fn overdue_uses_past_or_today_window() {
        let now = at("2026-02-20T10:00:00Z");
        let items = vec![
            due(item(1, 1, &[]), "Thu 19 Feb 2026 23:59:59 +0000"),
            due(item(2, 1, &[]), "Fri 20 Feb 2026 23:59:59 +0000"),
            due(item(3, 1, &[]), "Sat 21 Feb 2026 09:00:00 +0000"),
            item(4, 1, &[]),
            due(item(5, 1, &[]), "whenever"),
            due(item(6, 1, &[]), "2026-02-20T00:00:00Z"),
        ];

        let ids: Vec<i64> = overdue(&items, now).iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 6]);
    }

    #[test]
    fn overdue_day_follows_now_offset() {
        let now = at("2026-02-20T10:00:00+08:00");
        let items = vec![
            // 23:00 local, still today.
            due(item(1, 1, &[]), "Fri 20 Feb 2026 15:00:00 +0000"),
            // 04:00 local tomorrow.
            due(item(2, 1, &[]), "Fri 20 Feb 2026 20:00:00 +0000"),
        ];

        let ids: Vec<i64> = overdue(&items, now).iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn overdue_never_includes_items_outside_window() {
        let now = at("2026-02-20T10:00:00Z");
        let (_, end) = day_window(now);
        let items: Vec<Item> = (0..48)
            .map(|h| {
                let when = now + Duration::hours(h - 24);
                due(item(h, 1, &[]), &when.format(&Rfc3339).unwrap())
            })
            .collect();

        for it in overdue(&items, now) {
            let when = parse_due_date(it.due_date.as_deref().unwrap()).unwrap();
            assert!(when < now || when <= end);
        }
        assert_eq!(overdue(&items, now).len(), 38);
    }

    #[test]
    fn inbox_requires_inbox_project() {
        let items = vec![item(1, 10, &[]), item(2, 20, &[])];
        let projects = vec![project(10, "Work", false), project(20, "Inbox", true)];

        let ids: Vec<i64> = inbox(&items, &projects).unwrap().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![2]);

        let err = inbox(&items, &[project(10, "Work", false)]).unwrap_err();
        assert_eq!(err, AggregateError::MissingInbox);
    }

    #[test]
    fn label_counts_sort_desc_with_first_seen_ties() {
        let labels = vec![label(1, "urgent"), label(2, "waiting"), label(3, "home")];
        let items = vec![
            item(1, 1, &[2]),
            item(2, 1, &[1, 99]),
            item(3, 1, &[1]),
            item(4, 1, &[3]),
        ];

        let counts = label_counts(&items, &labels);
        let pairs: Vec<(&str, usize)> = counts.iter().map(|c| (c.name.as_str(), c.count)).collect();
        assert_eq!(
            pairs,
            vec![("urgent", 2), ("waiting", 1), (UNKNOWN_NAME, 1), ("home", 1)]
        );
    }

    #[test]
    fn project_counts_use_sentinel_for_unknown_projects() {
        let projects = vec![project(10, "Work", false), project(20, "Inbox", true)];
        let items = vec![item(1, 20, &[]), item(2, 10, &[]), item(3, 10, &[]), item(4, 77, &[])];

        let counts = project_counts(&items, &projects);
        assert_eq!(
            counts,
            vec![
                NameCount { name: "Work".into(), count: 2 },
                NameCount { name: "Inbox".into(), count: 1 },
                NameCount { name: UNKNOWN_NAME.into(), count: 1 },
            ]
        );
    }

    #[test]
    fn unused_labels_returns_full_records() {
        let labels = vec![label(1, "urgent"), label(2, "waiting")];
        let items = vec![item(1, 1, &[1])];

        assert_eq!(unused_labels(&items, &labels), vec![label(2, "waiting")]);
    }

    #[test]
    fn unused_and_active_labels_partition_all_names() {
        let labels = vec![label(1, "a"), label(2, "b"), label(3, "c"), label(4, "d")];
        let items = vec![item(1, 1, &[1, 3]), item(2, 1, &[3, 42])];

        let unused: HashSet<String> = unused_labels(&items, &labels)
            .into_iter()
            .map(|l| l.name)
            .collect();
        let active: HashSet<String> = label_counts(&items, &labels)
            .into_iter()
            .map(|c| c.name)
            .filter(|n| n != UNKNOWN_NAME)
            .collect();
        let all: HashSet<String> = labels.iter().map(|l| l.name.clone()).collect();

        assert!(unused.is_disjoint(&active));
        assert_eq!(&unused | &active, all);
    }

    #[test]
    fn aggregate_only_counts_active_items() {
        let mut done = item(2, 20, &[2]);
        done.checked = true;
        let mut archived = item(3, 20, &[2]);
        archived.is_archived = true;

        let snap = snapshot(
            vec![item(1, 20, &[1]), done, archived],
            vec![label(1, "urgent"), label(2, "waiting")],
            vec![project(20, "Inbox", true)],
        );

        let view = aggregate(&snap, at("2026-02-20T10:00:00Z")).unwrap();
        assert_eq!(view.todoist.items.len(), 1);
        assert_eq!(view.inbox.len(), 1);
        assert_eq!(view.unused_labels, vec![label(2, "waiting")]);
        assert_eq!(view.project_counts, vec![NameCount { name: "Inbox".into(), count: 1 }]);

        let json = serde_json::to_value(&view).unwrap();
        for key in ["labelCounts", "projectCounts", "inbox", "overdue", "unusedLabels", "todoist"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert!(json["todoist"].get("filters").is_some());
    }

    #[test]
    fn aggregate_surfaces_missing_inbox() {
        let snap = snapshot(vec![item(1, 1, &[])], vec![], vec![project(1, "Work", false)]);
        assert_eq!(
            aggregate(&snap, at("2026-02-20T10:00:00Z")).unwrap_err(),
            AggregateError::MissingInbox
        );
    }
}
