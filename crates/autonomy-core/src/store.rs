//! The issue tracker boundary.
//!
//! `IssueStore` is the only way the engine reads or writes tasks. Each call is
//! individually atomic; atomicity across tasks is the mutation log's job.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use ulid::Ulid;

use crate::field_cache::FieldCache;
use crate::task::{FieldValue, PriorityLabel, Task, TaskField, TaskId, TaskState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),
    #[error("Transient store error: {0}")]
    Transient(String),
    #[error("Timed out during {0}")]
    Timeout(String),
    #[error("Store rejected write to {task_id}: {reason}")]
    Rejected { task_id: TaskId, reason: String },
    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn rejected(task_id: impl Into<TaskId>, reason: impl Into<String>) -> Self {
        StoreError::Rejected {
            task_id: task_id.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub assignee: Option<String>,
    pub labels: Vec<String>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn open() -> Self {
        Self {
            state: Some(TaskState::Open),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(state) = self.state {
            if task.state != state {
                return false;
            }
        }
        if let Some(assignee) = self.assignee.as_deref() {
            let matches = task
                .assignee
                .as_deref()
                .map(|have| have.eq_ignore_ascii_case(assignee))
                .unwrap_or(false);
            if !matches {
                return false;
            }
        }
        if !self.labels.is_empty() && !self.labels.iter().any(|label| task.has_label(label)) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub priority_label: Option<PriorityLabel>,
    #[serde(default)]
    pub assignee: Option<String>,
}

pub trait IssueStore {
    /// Tasks in board order.
    fn get_tasks(&self, repo: &str, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;
    fn get_task(&self, repo: &str, task_id: &str) -> Result<Task, StoreError>;
    fn update_task_field(
        &self,
        task_id: &str,
        field: TaskField,
        value: &FieldValue,
    ) -> Result<Task, StoreError>;
    fn create_task(&self, repo: &str, fields: NewTask) -> Result<Task, StoreError>;
    fn link_parent(&self, child_id: &str, parent_id: &str) -> Result<bool, StoreError>;
    fn reorder(&self, task_id: &str, after_id: Option<&str>) -> Result<bool, StoreError>;
}

/// Board fields stored on the project rather than on the issue itself.
const BOARD_FIELDS: [(&str, TaskField); 3] = [
    ("Priority", TaskField::Priority),
    ("Pinned", TaskField::Pinned),
    ("Sprint", TaskField::Sprint),
];

fn board_field_name(field: TaskField) -> Option<&'static str> {
    BOARD_FIELDS
        .iter()
        .find(|(_, candidate)| *candidate == field)
        .map(|(name, _)| *name)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    next_number: u64,
    #[serde(default)]
    tasks: Vec<Task>,
    /// Board field name -> field id.
    #[serde(default)]
    board_fields: BTreeMap<String, String>,
    /// Field id -> task id -> value.
    #[serde(default)]
    board_values: BTreeMap<String, BTreeMap<TaskId, FieldValue>>,
}

impl Snapshot {
    fn position(&self, task_id: &str) -> Option<usize> {
        self.tasks.iter().position(|task| task.id == task_id)
    }

    /// Returns true when a missing field had to be created.
    fn ensure_board_fields(&mut self) -> bool {
        let mut created = false;
        for (name, _) in BOARD_FIELDS {
            if !self.board_fields.contains_key(name) {
                self.board_fields.insert(name.to_string(), new_field_id());
                created = true;
            }
        }
        created
    }

    fn materialize(&self, task: &Task) -> Task {
        let mut task = task.clone();
        for (name, field) in BOARD_FIELDS {
            let value = self
                .board_fields
                .get(name)
                .and_then(|id| self.board_values.get(id))
                .and_then(|values| values.get(&task.id));
            let value = match (value, field) {
                (Some(value), _) => value.clone(),
                (None, TaskField::Pinned) => FieldValue::Flag(false),
                (None, _) => FieldValue::Absent,
            };
            // Values were type checked on write.
            let _ = task.set_field(field, &value);
        }
        task
    }

    fn move_board_values_out(&mut self, task: &Task) {
        for (name, field) in BOARD_FIELDS {
            let value = task.get_field(field);
            if value == FieldValue::Absent || value == FieldValue::Flag(false) {
                continue;
            }
            if let Some(id) = self.board_fields.get(name).cloned() {
                self.board_values
                    .entry(id)
                    .or_default()
                    .insert(task.id.clone(), value);
            }
        }
    }
}

fn new_field_id() -> String {
    format!("PVTF_{}", Ulid::new().to_string().to_lowercase())
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// File-backed store holding one repository's issues and project board.
///
/// Every call re-reads the snapshot under a file lock, so several processes
/// can share one state dir. Writes hold the lock exclusively through the
/// atomic rewrite.
pub struct LocalIssueStore {
    repo: String,
    path: PathBuf,
    field_cache: Arc<FieldCache>,
    clock: Clock,
}

struct SnapshotLock {
    file: File,
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub fn issues_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("issues")
}

pub fn repo_key(repo: &str) -> String {
    repo.trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '.' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

pub fn issues_path(state_dir: &Path, repo: &str) -> PathBuf {
    issues_dir(state_dir).join(format!("{}.json", repo_key(repo)))
}

impl LocalIssueStore {
    pub fn open(
        state_dir: &Path,
        repo: &str,
        field_cache: Arc<FieldCache>,
    ) -> Result<Self, StoreError> {
        let store = Self {
            repo: repo.to_string(),
            path: issues_path(state_dir, repo),
            field_cache,
            clock: Box::new(Utc::now),
        };
        // Board field ids must be stable across processes, so they are
        // written out once rather than minted per load.
        let _guard = store.file_lock(true)?;
        let mut snapshot = store.load()?;
        if snapshot.ensure_board_fields() {
            store.persist(&snapshot)?;
        }
        Ok(store)
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Replace or insert tasks verbatim, keeping given ids, numbers and
    /// timestamps. New tasks are appended to the board in the given order.
    pub fn import(&self, tasks: Vec<Task>) -> Result<usize, StoreError> {
        self.write(|snapshot| Self::import_into(snapshot, tasks))
    }

    fn import_into(snapshot: &mut Snapshot, tasks: Vec<Task>) -> Result<usize, StoreError> {
        let count = tasks.len();
        for mut task in tasks {
            snapshot.next_number = snapshot.next_number.max(task.number);
            snapshot.move_board_values_out(&task);
            task.pinned = false;
            task.priority_label = None;
            task.sprint = None;
            match snapshot.position(&task.id) {
                Some(idx) => snapshot.tasks[idx] = task,
                None => snapshot.tasks.push(task),
            }
        }
        rebuild_child_links(snapshot);
        Ok(count)
    }

    /// Recreate a board field under a new id, as happens when a project
    /// field is deleted and added again. Cached ids become stale.
    pub fn recreate_board_field(&self, name: &str) -> Result<String, StoreError> {
        self.write(|snapshot| {
            let new_id = new_field_id();
            let old_id = snapshot
                .board_fields
                .insert(name.to_string(), new_id.clone());
            if let Some(old_id) = old_id {
                if let Some(values) = snapshot.board_values.remove(&old_id) {
                    snapshot.board_values.insert(new_id.clone(), values);
                }
            }
            Ok(new_id)
        })
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }

    fn file_lock(&self, exclusive: bool) -> Result<SnapshotLock, StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.lock_path())?;
        if exclusive {
            file.lock_exclusive()?;
        } else {
            file.lock_shared()?;
        }
        Ok(SnapshotLock { file })
    }

    fn load(&self) -> Result<Snapshot, StoreError> {
        if !self.path.is_file() {
            return Ok(Snapshot::default());
        }
        let text = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str::<Snapshot>(&text)?)
    }

    /// Run `f` against the current on-disk snapshot.
    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _guard = self.file_lock(false)?;
        let mut snapshot = self.load()?;
        snapshot.ensure_board_fields();
        f(&snapshot)
    }

    /// Load, modify and rewrite the snapshot under the exclusive lock.
    /// Nothing is written when `f` fails.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut Snapshot) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.file_lock(true)?;
        let mut snapshot = self.load()?;
        snapshot.ensure_board_fields();
        let value = f(&mut snapshot)?;
        self.persist(&snapshot)?;
        Ok(value)
    }

    fn check_repo(&self, repo: &str) -> Result<(), StoreError> {
        if repo.eq_ignore_ascii_case(&self.repo) {
            Ok(())
        } else {
            Err(StoreError::rejected(
                repo,
                format!("store is bound to {}", self.repo),
            ))
        }
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(snapshot)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn resolve_field_id(&self, snapshot: &Snapshot, name: &str) -> Result<String, StoreError> {
        let lookup = || {
            snapshot
                .board_fields
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::rejected(name, "board field missing"))
        };
        let cached = self.field_cache.resolve(&self.repo, name, lookup)?;
        if snapshot.board_values.contains_key(&cached)
            || snapshot.board_fields.values().any(|id| *id == cached)
        {
            return Ok(cached);
        }
        debug!(field = name, stale_id = %cached, "cached field id no longer resolves");
        self.field_cache.invalidate(&self.repo, name);
        self.field_cache.resolve(&self.repo, name, lookup)
    }

    fn write_parent(
        &self,
        snapshot: &mut Snapshot,
        task_id: &str,
        parent: Option<&str>,
    ) -> Result<(), StoreError> {
        let idx = snapshot
            .position(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        if let Some(parent_id) = parent {
            if parent_id == task_id {
                return Err(StoreError::rejected(task_id, "task cannot be its own parent"));
            }
            if snapshot.position(parent_id).is_none() {
                return Err(StoreError::NotFound(parent_id.to_string()));
            }
            let mut cursor = Some(parent_id.to_string());
            while let Some(current) = cursor {
                if current == task_id {
                    return Err(StoreError::rejected(
                        task_id,
                        format!("linking under {} would create a cycle", parent_id),
                    ));
                }
                cursor = snapshot
                    .position(&current)
                    .and_then(|pos| snapshot.tasks[pos].parent_id.clone());
            }
        }

        let previous = snapshot.tasks[idx].parent_id.clone();
        if let Some(previous) = previous {
            if let Some(pos) = snapshot.position(&previous) {
                snapshot.tasks[pos].child_ids.retain(|child| child != task_id);
            }
        }
        if let Some(parent_id) = parent {
            if let Some(pos) = snapshot.position(parent_id) {
                let children = &mut snapshot.tasks[pos].child_ids;
                if !children.iter().any(|child| child == task_id) {
                    children.push(task_id.to_string());
                }
            }
        }
        snapshot.tasks[idx].parent_id = parent.map(ToString::to_string);
        Ok(())
    }
}

fn rebuild_child_links(snapshot: &mut Snapshot) {
    let mut children: BTreeMap<TaskId, Vec<TaskId>> = BTreeMap::new();
    for task in &snapshot.tasks {
        if let Some(parent) = task.parent_id.as_ref() {
            children.entry(parent.clone()).or_default().push(task.id.clone());
        }
    }
    for task in snapshot.tasks.iter_mut() {
        let mut merged = task.child_ids.clone();
        for child in children.remove(&task.id).unwrap_or_default() {
            if !merged.contains(&child) {
                merged.push(child);
            }
        }
        task.child_ids = merged;
    }
}

impl IssueStore for LocalIssueStore {
    fn get_tasks(&self, repo: &str, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.check_repo(repo)?;
        self.read(|snapshot| {
            Ok(snapshot
                .tasks
                .iter()
                .map(|task| snapshot.materialize(task))
                .filter(|task| filter.matches(task))
                .collect())
        })
    }

    fn get_task(&self, repo: &str, task_id: &str) -> Result<Task, StoreError> {
        self.check_repo(repo)?;
        self.read(|snapshot| {
            snapshot
                .position(task_id)
                .map(|idx| snapshot.materialize(&snapshot.tasks[idx]))
                .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
        })
    }

    fn update_task_field(
        &self,
        task_id: &str,
        field: TaskField,
        value: &FieldValue,
    ) -> Result<Task, StoreError> {
        let updated = self.write(|snapshot| {
            let idx = snapshot
                .position(task_id)
                .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;

            if let Some(name) = board_field_name(field) {
                // Type check against a scratch copy before storing the value.
                let mut scratch = snapshot.tasks[idx].clone();
                scratch
                    .set_field(field, value)
                    .map_err(|reason| StoreError::rejected(task_id, reason))?;
                let field_id = self.resolve_field_id(snapshot, name)?;
                let values = snapshot.board_values.entry(field_id).or_default();
                match value {
                    FieldValue::Absent | FieldValue::Flag(false) => {
                        values.remove(task_id);
                    }
                    other => {
                        values.insert(task_id.to_string(), other.clone());
                    }
                }
            } else if field == TaskField::Parent {
                let parent = match value {
                    FieldValue::Absent => None,
                    FieldValue::Text(parent) => Some(parent.as_str()),
                    other => {
                        return Err(StoreError::rejected(
                            task_id,
                            format!("parent does not accept {}", other.as_formatted()),
                        ))
                    }
                };
                self.write_parent(snapshot, task_id, parent)?;
            } else {
                snapshot.tasks[idx]
                    .set_field(field, value)
                    .map_err(|reason| StoreError::rejected(task_id, reason))?;
            }

            snapshot.tasks[idx].updated_at = (self.clock)();
            Ok(snapshot.materialize(&snapshot.tasks[idx]))
        })?;
        debug!(task_id, field = %field, value = %value.as_formatted(), "task field updated");
        Ok(updated)
    }

    fn create_task(&self, repo: &str, fields: NewTask) -> Result<Task, StoreError> {
        self.check_repo(repo)?;
        let title = fields.title.trim().to_string();
        if title.is_empty() {
            return Err(StoreError::rejected("(new)", "title is required"));
        }
        let task = self.write(|snapshot| {
            snapshot.next_number += 1;
            let number = snapshot.next_number;
            let now = (self.clock)();
            let task = Task {
                id: format!("issue-{}", number),
                number,
                title,
                body: fields.body,
                state: TaskState::Open,
                labels: fields.labels,
                assignee: fields.assignee,
                priority_label: fields.priority_label,
                sprint: None,
                pinned: false,
                blocked: false,
                parent_id: None,
                child_ids: Vec::new(),
                notes: None,
                created_at: now,
                updated_at: now,
            };
            snapshot.move_board_values_out(&task);
            let mut stored = task.clone();
            stored.priority_label = None;
            snapshot.tasks.push(stored);
            Ok(task)
        })?;
        debug!(task_id = %task.id, number = task.number, "task created");
        Ok(task)
    }

    fn link_parent(&self, child_id: &str, parent_id: &str) -> Result<bool, StoreError> {
        let current = self.read(|snapshot| {
            let idx = snapshot
                .position(child_id)
                .ok_or_else(|| StoreError::NotFound(child_id.to_string()))?;
            Ok(snapshot.tasks[idx].parent_id.clone())
        })?;
        if current.as_deref() == Some(parent_id) {
            return Ok(false);
        }
        self.update_task_field(child_id, TaskField::Parent, &FieldValue::from(parent_id))?;
        Ok(true)
    }

    fn reorder(&self, task_id: &str, after_id: Option<&str>) -> Result<bool, StoreError> {
        if after_id == Some(task_id) {
            return Ok(false);
        }
        self.write(|snapshot| {
            let from = snapshot
                .position(task_id)
                .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
            let task = snapshot.tasks.remove(from);
            let insert_at = match after_id {
                None => 0,
                Some(after) => snapshot
                    .position(after)
                    .map(|pos| pos + 1)
                    .ok_or_else(|| StoreError::NotFound(after.to_string()))?,
            };
            snapshot.tasks.insert(insert_at, task);
            Ok(insert_at != from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, day, 9, 0, 0).unwrap()
    }

    fn task(number: u64) -> Task {
        Task {
            id: format!("issue-{}", number),
            number,
            title: format!("Task {}", number),
            body: String::new(),
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
            created_at: at(1),
            updated_at: at(1),
        }
    }

    fn open_store(dir: &Path, cache: Arc<FieldCache>) -> LocalIssueStore {
        LocalIssueStore::open(dir, "acme/app", cache)
            .expect("open")
            .with_clock(|| at(19))
    }

    #[test]
    fn board_fields_survive_reopen() {
        let temp = TempDir::new().expect("tempdir");
        let cache = Arc::new(FieldCache::new(Duration::from_secs(60)));
        let store = open_store(temp.path(), cache.clone());
        let mut seeded = task(1);
        seeded.priority_label = Some(PriorityLabel::P1);
        store.import(vec![seeded, task(2)]).expect("import");
        store
            .update_task_field("issue-2", TaskField::Pinned, &FieldValue::Flag(true))
            .expect("pin");

        let reopened = open_store(temp.path(), cache);
        let one = reopened.get_task("acme/app", "issue-1").expect("one");
        let two = reopened.get_task("acme/app", "issue-2").expect("two");
        assert_eq!(one.priority_label, Some(PriorityLabel::P1));
        assert!(two.pinned);
        assert_eq!(two.updated_at, at(19));
    }

    #[test]
    fn two_stores_on_one_state_dir_see_each_others_writes() {
        let temp = TempDir::new().expect("tempdir");
        let cache = Arc::new(FieldCache::new(Duration::from_secs(60)));
        let cli = open_store(temp.path(), cache.clone());
        cli.import(vec![task(1), task(2)]).expect("import");
        let cron = open_store(temp.path(), Arc::new(FieldCache::new(Duration::from_secs(60))));

        cli
            .update_task_field("issue-1", TaskField::State, &FieldValue::from("closed"))
            .expect("close");
        assert_eq!(
            cron.get_task("acme/app", "issue-1").expect("seen").state,
            TaskState::Closed
        );
        cron
            .update_task_field("issue-2", TaskField::Notes, &FieldValue::from("later"))
            .expect("notes");
        cron
            .update_task_field("issue-2", TaskField::Pinned, &FieldValue::Flag(true))
            .expect("pin");

        let reopened = open_store(temp.path(), cache);
        let one = reopened.get_task("acme/app", "issue-1").expect("one");
        let two = reopened.get_task("acme/app", "issue-2").expect("two");
        assert_eq!(one.state, TaskState::Closed);
        assert_eq!(two.notes.as_deref(), Some("later"));
        assert!(two.pinned);
        assert!(cli.get_task("acme/app", "issue-2").expect("cli view").pinned);
    }

    #[test]
    fn stale_field_id_is_revalidated() {
        let temp = TempDir::new().expect("tempdir");
        let cache = Arc::new(FieldCache::new(Duration::from_secs(3600)));
        let store = open_store(temp.path(), cache.clone());
        store.import(vec![task(1)]).expect("import");
        store
            .update_task_field("issue-1", TaskField::Sprint, &FieldValue::from("Sprint 1"))
            .expect("first write caches id");

        store.recreate_board_field("Sprint").expect("recreate");
        store
            .update_task_field("issue-1", TaskField::Sprint, &FieldValue::from("Sprint 2"))
            .expect("write after recreate");
        let loaded = store.get_task("acme/app", "issue-1").expect("load");
        assert_eq!(loaded.sprint.as_deref(), Some("Sprint 2"));
        assert!(cache.stats().misses >= 2);
    }

    #[test]
    fn parent_links_maintain_children_and_reject_cycles() {
        let temp = TempDir::new().expect("tempdir");
        let store = open_store(temp.path(), Arc::new(FieldCache::new(Duration::from_secs(60))));
        store.import(vec![task(1), task(2), task(3)]).expect("import");

        assert!(store.link_parent("issue-2", "issue-1").expect("link"));
        assert!(!store.link_parent("issue-2", "issue-1").expect("relink"));
        store.link_parent("issue-3", "issue-2").expect("link grandchild");
        let err = store
            .link_parent("issue-1", "issue-3")
            .expect_err("cycle");
        assert!(matches!(err, StoreError::Rejected { .. }));

        store
            .update_task_field("issue-2", TaskField::Parent, &FieldValue::Absent)
            .expect("unlink");
        let root = store.get_task("acme/app", "issue-1").expect("root");
        assert!(root.child_ids.is_empty());
        let middle = store.get_task("acme/app", "issue-2").expect("middle");
        assert_eq!(middle.child_ids, vec!["issue-3".to_string()]);
    }

    #[test]
    fn reorder_moves_task_after_anchor() {
        let temp = TempDir::new().expect("tempdir");
        let store = open_store(temp.path(), Arc::new(FieldCache::new(Duration::from_secs(60))));
        store.import(vec![task(1), task(2), task(3)]).expect("import");
        assert!(store.reorder("issue-3", None).expect("to front"));
        assert!(store.reorder("issue-1", Some("issue-2")).expect("after 2"));
        let order: Vec<u64> = store
            .get_tasks("acme/app", &TaskFilter::all())
            .expect("tasks")
            .iter()
            .map(|t| t.number)
            .collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn create_task_assigns_next_number_and_filters_apply() {
        let temp = TempDir::new().expect("tempdir");
        let store = open_store(temp.path(), Arc::new(FieldCache::new(Duration::from_secs(60))));
        store.import(vec![task(7)]).expect("import");
        let created = store
            .create_task(
                "acme/app",
                NewTask {
                    title: "Auth".to_string(),
                    labels: BTreeSet::from(["epic".to_string()]),
                    priority_label: Some(PriorityLabel::P2),
                    ..NewTask::default()
                },
            )
            .expect("create");
        assert_eq!(created.number, 8);
        let stored = store.get_task("acme/app", &created.id).expect("stored");
        assert_eq!(stored.priority_label, Some(PriorityLabel::P2));

        let epics = store
            .get_tasks(
                "acme/app",
                &TaskFilter {
                    labels: vec!["EPIC".to_string()],
                    ..TaskFilter::open()
                },
            )
            .expect("filter");
        assert_eq!(epics.len(), 1);
        assert!(store.get_tasks("acme/other", &TaskFilter::all()).is_err());
    }
}
