use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, stable identifier assigned by the issue tracker.
pub type TaskId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityLabel {
    P0,
    P1,
    P2,
    P3,
}

impl PriorityLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            PriorityLabel::P0 => "P0",
            PriorityLabel::P1 => "P1",
            PriorityLabel::P2 => "P2",
            PriorityLabel::P3 => "P3",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "P0" => Some(Self::P0),
            "P1" => Some(Self::P1),
            "P2" => Some(Self::P2),
            "P3" => Some(Self::P3),
            _ => None,
        }
    }

    /// Legacy `priority-*` labels used before the Priority board field existed.
    pub fn from_legacy_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "priority-critical" => Some(Self::P0),
            "priority-high" => Some(Self::P1),
            "priority-medium" => Some(Self::P2),
            "priority-low" => Some(Self::P3),
            _ => None,
        }
    }

    pub fn all() -> [PriorityLabel; 4] {
        [Self::P0, Self::P1, Self::P2, Self::P3]
    }
}

impl fmt::Display for PriorityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Open,
    Closed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Open => "open",
            TaskState::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Read-through copy of one issue. The issue tracker owns the data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority_label: Option<PriorityLabel>,
    #[serde(default)]
    pub sprint: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    #[serde(default)]
    pub child_ids: Vec<TaskId>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_open(&self) -> bool {
        self.state == TaskState::Open
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels
            .iter()
            .any(|have| have.eq_ignore_ascii_case(label))
    }

    /// Priority from the board field, falling back to legacy labels.
    /// The flag is true when the value came from a label.
    pub fn effective_priority(&self) -> Option<(PriorityLabel, bool)> {
        if let Some(priority) = self.priority_label {
            return Some((priority, false));
        }
        self.labels
            .iter()
            .filter_map(|label| PriorityLabel::from_legacy_label(label))
            .min()
            .map(|priority| (priority, true))
    }

    pub fn checklist_items(&self) -> usize {
        checklist_count(&self.body)
    }

    pub fn display_ref(&self) -> String {
        format!("#{} {}", self.number, self.title.trim())
    }

    pub fn get_field(&self, field: TaskField) -> FieldValue {
        match field {
            TaskField::State => FieldValue::Text(self.state.as_str().to_string()),
            TaskField::Title => FieldValue::Text(self.title.clone()),
            TaskField::Body => FieldValue::Text(self.body.clone()),
            TaskField::Labels => FieldValue::List(self.labels.iter().cloned().collect()),
            TaskField::Assignee => FieldValue::from_option(self.assignee.clone()),
            TaskField::Priority => {
                FieldValue::from_option(self.priority_label.map(|p| p.as_str().to_string()))
            }
            TaskField::Sprint => FieldValue::from_option(self.sprint.clone()),
            TaskField::Pinned => FieldValue::Flag(self.pinned),
            TaskField::Blocked => FieldValue::Flag(self.blocked),
            TaskField::Parent => FieldValue::from_option(self.parent_id.clone()),
            TaskField::Notes => FieldValue::from_option(self.notes.clone()),
        }
    }

    /// Assign one field. `parent` is written as-is; keeping `child_ids`
    /// consistent is the store's job.
    pub fn set_field(&mut self, field: TaskField, value: &FieldValue) -> Result<(), String> {
        match field {
            TaskField::State => {
                let text = value.as_text().ok_or_else(|| type_error(field, value))?;
                self.state = TaskState::parse(text)
                    .ok_or_else(|| format!("invalid state value: {}", text))?;
            }
            TaskField::Title => {
                self.title = value
                    .as_text()
                    .ok_or_else(|| type_error(field, value))?
                    .to_string();
            }
            TaskField::Body => {
                self.body = value
                    .as_text()
                    .ok_or_else(|| type_error(field, value))?
                    .to_string();
            }
            TaskField::Labels => {
                let list = value.as_list().ok_or_else(|| type_error(field, value))?;
                self.labels = list.iter().cloned().collect();
            }
            TaskField::Assignee => self.assignee = optional_text(field, value)?,
            TaskField::Priority => {
                self.priority_label = match optional_text(field, value)? {
                    Some(text) => Some(
                        PriorityLabel::parse(&text)
                            .ok_or_else(|| format!("invalid priority value: {}", text))?,
                    ),
                    None => None,
                };
            }
            TaskField::Sprint => self.sprint = optional_text(field, value)?,
            TaskField::Pinned => {
                self.pinned = value.as_flag().ok_or_else(|| type_error(field, value))?;
            }
            TaskField::Blocked => {
                self.blocked = value.as_flag().ok_or_else(|| type_error(field, value))?;
            }
            TaskField::Parent => self.parent_id = optional_text(field, value)?,
            TaskField::Notes => self.notes = optional_text(field, value)?,
        }
        Ok(())
    }
}

fn optional_text(field: TaskField, value: &FieldValue) -> Result<Option<String>, String> {
    match value {
        FieldValue::Absent => Ok(None),
        FieldValue::Text(text) => Ok(Some(text.clone())),
        other => Err(type_error(field, other)),
    }
}

fn type_error(field: TaskField, value: &FieldValue) -> String {
    format!(
        "field {} does not accept value {}",
        field.as_str(),
        value.as_formatted()
    )
}

pub fn checklist_count(body: &str) -> usize {
    body.lines()
        .filter(|line| {
            let line = line.trim_start();
            ["- [ ]", "- [x]", "- [X]"]
                .iter()
                .any(|marker| line.starts_with(marker))
        })
        .count()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskField {
    State,
    Title,
    Body,
    Labels,
    Assignee,
    Priority,
    Sprint,
    Pinned,
    Blocked,
    Parent,
    Notes,
}

impl TaskField {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskField::State => "state",
            TaskField::Title => "title",
            TaskField::Body => "body",
            TaskField::Labels => "labels",
            TaskField::Assignee => "assignee",
            TaskField::Priority => "priority",
            TaskField::Sprint => "sprint",
            TaskField::Pinned => "pinned",
            TaskField::Blocked => "blocked",
            TaskField::Parent => "parent",
            TaskField::Notes => "notes",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "state" => Some(Self::State),
            "title" => Some(Self::Title),
            "body" => Some(Self::Body),
            "labels" => Some(Self::Labels),
            "assignee" => Some(Self::Assignee),
            "priority" => Some(Self::Priority),
            "sprint" => Some(Self::Sprint),
            "pinned" => Some(Self::Pinned),
            "blocked" => Some(Self::Blocked),
            "parent" => Some(Self::Parent),
            "notes" => Some(Self::Notes),
            _ => None,
        }
    }
}

impl fmt::Display for TaskField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum FieldValue {
    Absent,
    Flag(bool),
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn from_option(value: Option<String>) -> Self {
        value.map(FieldValue::Text).unwrap_or(FieldValue::Absent)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            FieldValue::Flag(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            FieldValue::List(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_formatted(&self) -> String {
        match self {
            FieldValue::Absent => "(none)".to_string(),
            FieldValue::Flag(flag) => flag.to_string(),
            FieldValue::Text(value) => value.to_string(),
            FieldValue::List(values) => format!("[{}]", values.join(", ")),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Flag(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Task {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Task {
            id: "issue-1".to_string(),
            number: 1,
            title: "Sample".to_string(),
            body: "- [ ] one\n- [x] two\ntext".to_string(),
            state: TaskState::Open,
            labels: BTreeSet::new(),
            assignee: None,
            priority_label: None,
            sprint: None,
            pinned: false,
            blocked: false,
            parent_id: None,
            child_ids: Vec::new(),
            notes: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn field_values_round_trip_through_set_field() {
        let mut task = sample();
        task.set_field(TaskField::State, &FieldValue::from("closed"))
            .expect("state");
        task.set_field(TaskField::Priority, &FieldValue::from("p1"))
            .expect("priority");
        task.set_field(TaskField::Notes, &FieldValue::from("shipped"))
            .expect("notes");
        assert_eq!(task.state, TaskState::Closed);
        assert_eq!(task.get_field(TaskField::Priority), FieldValue::from("P1"));
        assert_eq!(task.get_field(TaskField::Notes), FieldValue::from("shipped"));

        task.set_field(TaskField::Notes, &FieldValue::Absent).expect("clear");
        assert_eq!(task.notes, None);
    }

    #[test]
    fn set_field_rejects_mismatched_types() {
        let mut task = sample();
        let err = task
            .set_field(TaskField::Pinned, &FieldValue::from("yes"))
            .expect_err("type mismatch");
        assert!(err.contains("pinned"));
        assert!(task.set_field(TaskField::Priority, &FieldValue::from("P9")).is_err());
    }

    #[test]
    fn legacy_priority_labels_are_a_fallback() {
        let mut task = sample();
        task.labels.insert("priority-high".to_string());
        task.labels.insert("priority-low".to_string());
        assert_eq!(task.effective_priority(), Some((PriorityLabel::P1, true)));
        task.priority_label = Some(PriorityLabel::P3);
        assert_eq!(task.effective_priority(), Some((PriorityLabel::P3, false)));
    }

    #[test]
    fn checklist_counts_only_checkbox_lines() {
        assert_eq!(sample().checklist_items(), 2);
        let body = "- [docs](docs/setup.md)\n- [ ] todo\n  - [X] nested\n- [-] dropped";
        assert_eq!(checklist_count(body), 2);
    }

    #[test]
    fn field_value_serializes_untagged() {
        let values = vec![
            FieldValue::Absent,
            FieldValue::Flag(true),
            FieldValue::from("x"),
            FieldValue::List(vec!["a".to_string()]),
        ];
        let json = serde_json::to_string(&values).expect("serialize");
        assert_eq!(json, r#"[null,true,"x",["a"]]"#);
        let back: Vec<FieldValue> = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, values);
    }
}
